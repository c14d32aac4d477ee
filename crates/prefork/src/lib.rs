//! prefork: preforking process pool for queued jobs.
//!
//! Jobs run in forked worker processes. With a TTL of more than one job (or
//! unlimited) the pool keeps long-lived workers fed over Unix sockets;
//! otherwise every job gets its own fork.

#[cfg(not(unix))]
compile_error!("prefork relies on fork(2) and only builds on unix targets");

pub mod bridge;
pub mod context;
pub mod error;
pub mod events;
pub mod job;
pub mod lifecycle;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod spawn;
pub mod unit;
pub mod worker;

#[cfg(test)]
mod testing;

pub use context::{PoolConfig, PoolContext, QueueConfig, Ttl};
pub use error::{ConfigError, EnvelopeError, PoolError, SpawnError};
pub use events::{EventSink, PoolEvent};
pub use job::{Job, JobError, JobPayload, JobStatus};
pub use lifecycle::{ChannelLifecycle, ExitOutcome, LifecycleEvent, LifecycleSource, SignalLifecycle};
pub use orchestrator::{PoolHandle, spawn_pool, start};
pub use pool::{PoolSnapshot, WorkerPool};
pub use spawn::{ForkSpawner, ProcessSpawner};
pub use unit::UnitInfo;
