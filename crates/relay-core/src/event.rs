//! Append-only audit Event row and the in-process notification payloads
//! carried over the Event Bus (spec.md §3, §4.8).

use crate::answer::Answer;
use crate::ask::Ask;
use crate::ids::JobId;
use crate::job::{JobState, ReasonCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted, append-only audit row (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotonic row id (assigned by the Storage Kernel).
    pub id: i64,
    /// Owning job.
    pub job_id: JobId,
    /// Timestamp, ms since epoch.
    pub ts: i64,
    /// Dotted event type, e.g. `"job.submitted"`, `"ask.created"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Structured payload, shape depends on `event_type`.
    pub payload: Value,
}

/// Typed notifications published on the in-process Event Bus (C8).
///
/// Distinct from [`Event`]: this is the live pub/sub payload; [`Event`] is
/// its durable audit-log counterpart, written by the Job Manager alongside
/// publishing. Every variant carries its own `job_id` since `Answer` (being
/// keyed only by `ask_id`, spec.md §3) does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A new Ask was created and the job moved to `WAITING_ON_ANSWER`.
    AskCreated {
        /// The full Ask record.
        ask: Box<Ask>,
    },
    /// An Answer was recorded for some Ask.
    AnswerRecorded {
        /// Owning job (the Ask's `job_id`, carried alongside since
        /// `Answer` itself only keys on `ask_id`).
        job_id: JobId,
        /// The full Answer record.
        answer: Box<Answer>,
    },
    /// A job transitioned to a new state.
    JobState {
        /// The job whose state changed.
        job_id: JobId,
        /// New state.
        state: JobState,
        /// New `state_version` after the transition.
        state_version: u64,
        /// Summary attached to the transition, if any.
        summary: Option<String>,
        /// Reason code attached to the transition, if any.
        reason_code: Option<ReasonCode>,
    },
}

impl RelayEvent {
    /// The job id this event concerns.
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::AskCreated { ask } => &ask.job_id,
            Self::AnswerRecorded { job_id, .. } | Self::JobState { job_id, .. } => job_id,
        }
    }

    /// Dotted event-type string matching the corresponding [`Event::event_type`].
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AskCreated { .. } => "ask.created",
            Self::AnswerRecorded { .. } => "answer.recorded",
            Self::JobState { .. } => "job.state",
        }
    }
}
