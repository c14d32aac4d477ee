//! Error types, one enum per failure domain.

use std::io;

use nix::unistd::Pid;

/// Creating a worker process failed. Fatal to that unit only.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("fork failed: {0}")]
    Fork(#[from] nix::errno::Errno),
    #[error("failed to set up worker socket: {0}")]
    Io(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Errors surfaced to callers of the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("failed to encode job {job_id}: {source}")]
    Encode {
        job_id: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to dispatch job to worker {pid}: {source}")]
    Dispatch {
        pid: Pid,
        #[source]
        source: io::Error,
    },
    #[error("worker unit has no job channel")]
    Unusable,
    #[error("failed to set up pool: {0}")]
    Setup(#[source] io::Error),
    #[error("pool event loop has stopped")]
    Closed,
}

/// A job frame arrived intact but its contents could not be turned into a job.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported wire version {found}, expected {expected}")]
    Version { found: u32, expected: u32 },
}

/// Invalid pool configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("prefork factor must be a positive finite number, got {0}")]
    InvalidFactor(f64),
    #[error("malformed pool configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no tokio runtime available to drive the pool")]
    NoRuntime,
}
