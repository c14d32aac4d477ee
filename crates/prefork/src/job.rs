//! The job capability the pool executes.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Identifying data every job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
}

impl JobPayload {
    pub fn new(id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// A job without an id or source queue cannot be reported on, so it is not run.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id.trim().is_empty() {
            return Err(JobError::contract("job payload has no id"));
        }
        if self.queue.trim().is_empty() {
            return Err(JobError::contract(format!(
                "job {} has no source queue",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Running,
    Failed,
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }
}

/// Why a job attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("job contract violated: {0}")]
    Contract(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked(message.into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }
}

/// A unit of work the pool can ship to a worker process.
///
/// Jobs cross the process boundary inside a versioned JSON envelope, so the
/// concrete type must round-trip through serde.
pub trait Job: Serialize + DeserializeOwned + Send + 'static {
    fn payload(&self) -> &JobPayload;

    /// Run the job. Errors and panics are both caught by the worker.
    fn perform(&mut self) -> Result<(), JobError>;

    /// Called once after a failed attempt, before the final status update.
    fn fail(&mut self, error: &JobError);

    fn update_status(&mut self, status: JobStatus);
}
