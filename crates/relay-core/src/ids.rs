//! Branded id newtypes.
//!
//! `JobId`, `AskId`, `LeaseOwner`, and `CommitHash` wrap plain strings so the
//! compiler rejects accidentally passing one id family where another is
//! expected, matching spec.md §9's "branded ids" design note.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! branded_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a plain string as this id type.
            #[must_use]
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the underlying string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the underlying string.
            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

branded_id!(JobId, "Opaque identifier for a Job row.");
branded_id!(AskId, "Opaque identifier for an Ask row (a UUID string).");
branded_id!(LeaseOwner, "Opaque identifier for a worker holding a lease.");
branded_id!(CommitHash, "A git commit sha, kept distinct from other hex strings.");

/// Generate a new job id in the scheme fixed by spec.md §4.2:
/// `"job_" + base36(now_ms) + "_" + random8`.
#[must_use]
pub fn generate_job_id(now_ms: i64, random8: &str) -> JobId {
    JobId::new(format!("job_{}_{}", to_base36(now_ms.max(0) as u128), random8))
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).expect("base36 digits are ascii")
}
