//! Wire protocol types for parent-worker communication.
//!
//! Two channels:
//! - **Unit socket** (one per permanent worker): framed job envelopes, parent to child
//! - **Result channel** (pool-wide): fixed-size completion records, child to parent

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Every frame on either channel is a multiple of this many bytes.
pub const PACKET_SIZE: usize = 512;

/// `[packet_count: u32be][payload_length: u32be]` at the start of the first packet.
pub const HEADER_SIZE: usize = 8;

/// Pads the final packet of a job frame and the tail of every completion record.
pub const FILLER: u8 = 0x00;

/// A completion record is exactly one packet.
pub const RECORD_SIZE: usize = PACKET_SIZE;

/// Version stamped into every job envelope.
pub const WIRE_VERSION: u32 = 1;

/// Unique identifier for a worker unit.
///
/// Pids are reused by the OS and are unset before fork, so units carry their own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(uuid::Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome code carried in the second header field of a completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// `perform()` returned successfully.
    Success,
    /// `perform()` failed or panicked; `fail()` has been called on the job.
    Failed,
    /// The worker could not decode the job frame it was sent.
    DecodeError,
    /// Code this build does not know. Treated as a failure.
    Other(u32),
}

impl CompletionStatus {
    pub const SUCCESS: u32 = 0;
    pub const FAILED: u32 = 1;
    pub const DECODE_ERROR: u32 = 2;

    pub fn from_code(code: u32) -> Self {
        match code {
            Self::SUCCESS => Self::Success,
            Self::FAILED => Self::Failed,
            Self::DECODE_ERROR => Self::DecodeError,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Success => Self::SUCCESS,
            Self::Failed => Self::FAILED,
            Self::DecodeError => Self::DECODE_ERROR,
            Self::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether the worker actually ran a job, and so spent one unit of TTL.
    pub fn consumed_job(&self) -> bool {
        !matches!(self, Self::DecodeError)
    }
}

/// Fixed-size message a permanent worker writes after each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub pid: u32,
    pub status: CompletionStatus,
}

impl CompletionRecord {
    pub fn new(pid: u32, status: CompletionStatus) -> Self {
        Self { pid, status }
    }

    pub fn success(pid: u32) -> Self {
        Self::new(pid, CompletionStatus::Success)
    }

    pub fn failed(pid: u32) -> Self {
        Self::new(pid, CompletionStatus::Failed)
    }

    pub fn decode_error(pid: u32) -> Self {
        Self::new(pid, CompletionStatus::DecodeError)
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}

/// Versioned wrapper around a serialized job.
///
/// The version lets parent and worker refuse frames produced by an incompatible
/// build instead of misinterpreting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope<J> {
    pub version: u32,
    pub job: J,
}

impl<J> JobEnvelope<J> {
    pub fn new(job: J) -> Self {
        Self {
            version: WIRE_VERSION,
            job,
        }
    }

    pub fn into_job(self) -> Result<J, EnvelopeError> {
        if self.version != WIRE_VERSION {
            return Err(EnvelopeError::Version {
                found: self.version,
                expected: WIRE_VERSION,
            });
        }
        Ok(self.job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_codes_map_both_ways() {
        for code in [0, 1, 2, 7] {
            assert_eq!(CompletionStatus::from_code(code).code(), code);
        }
        assert_eq!(CompletionStatus::from_code(0), CompletionStatus::Success);
        assert_eq!(CompletionStatus::from_code(9), CompletionStatus::Other(9));
        assert!(!CompletionStatus::Other(9).is_success());
    }

    #[test]
    fn decode_errors_do_not_consume_ttl() {
        assert!(CompletionStatus::Success.consumed_job());
        assert!(CompletionStatus::Failed.consumed_job());
        assert!(!CompletionStatus::DecodeError.consumed_job());
    }

    #[test]
    fn record_pid_converts_to_nix_pid() {
        let record = CompletionRecord::success(4242);
        assert_eq!(record.pid(), Pid::from_raw(4242));
    }

    #[test]
    fn envelope_serializes() {
        let envelope = JobEnvelope::new(json!({"id": "j1", "queue": "default"}));
        insta::assert_json_snapshot!(envelope, @r#"
        {
          "version": 1,
          "job": {
            "id": "j1",
            "queue": "default"
          }
        }
        "#);
    }

    #[test]
    fn envelope_rejects_unknown_version() {
        let envelope = JobEnvelope {
            version: 99,
            job: json!({}),
        };
        let err = envelope.into_job().unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Version {
                found: 99,
                expected: WIRE_VERSION
            }
        ));
    }
}
