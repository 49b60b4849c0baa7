//! ArtifactMeta: the durable record of a worker-written output blob
//! (spec.md §3, §4.4 step 5).

use crate::ids::JobId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The fixed set of artifact kinds a job may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Unified diff produced by the executor.
    #[serde(rename = "patch.diff")]
    PatchDiff,
    /// Test plan + notes, rendered as markdown.
    #[serde(rename = "out.md")]
    OutMd,
    /// Raw executor stdout/stderr.
    #[serde(rename = "logs.txt")]
    LogsTxt,
    /// Optional pull-request metadata.
    #[serde(rename = "pr.json")]
    PrJson,
}

impl ArtifactKind {
    /// The MIME type to serve this kind as over MCP resource reads
    /// (spec.md §4.7).
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::PatchDiff => "text/x-diff",
            Self::OutMd => "text/markdown",
            Self::LogsTxt => "text/plain",
            Self::PrJson => "application/json",
        }
    }

    /// The on-disk/storage file name for this kind.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::PatchDiff => "patch.diff",
            Self::OutMd => "out.md",
            Self::LogsTxt => "logs.txt",
            Self::PrJson => "pr.json",
        }
    }
}

/// Durable record of one artifact written for a job; `(job_id, kind)` is
/// unique (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    /// Owning job.
    pub job_id: JobId,
    /// Which of the fixed artifact kinds this is.
    pub kind: ArtifactKind,
    /// Storage URI (e.g. `file:///.../job_1/patch.diff`).
    pub uri: String,
    /// Hex-encoded SHA-256 digest of the artifact bytes.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    /// Creation timestamp, ms since epoch.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_match_kind() {
        assert_eq!(ArtifactKind::PatchDiff.mime_type(), "text/x-diff");
        assert_eq!(ArtifactKind::OutMd.mime_type(), "text/markdown");
        assert_eq!(ArtifactKind::LogsTxt.mime_type(), "text/plain");
        assert_eq!(ArtifactKind::PrJson.mime_type(), "application/json");
    }

    #[test]
    fn wire_format_uses_dotted_names() {
        let json = serde_json::to_string(&ArtifactKind::PatchDiff).unwrap();
        assert_eq!(json, r#""patch.diff""#);
    }

    #[test]
    fn kinds_sort_deterministically() {
        let mut kinds = vec![
            ArtifactKind::PrJson,
            ArtifactKind::PatchDiff,
            ArtifactKind::LogsTxt,
            ArtifactKind::OutMd,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ArtifactKind::PatchDiff,
                ArtifactKind::OutMd,
                ArtifactKind::LogsTxt,
                ArtifactKind::PrJson,
            ]
        );
    }
}
