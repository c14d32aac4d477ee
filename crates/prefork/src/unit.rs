//! Parent-side handle of one worker process.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use futures::SinkExt;
use nix::unistd::Pid;
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::{JobCodec, PacketCodec};
use crate::bridge::protocol::UnitId;
use crate::bridge::transport::JobChannel;
use crate::context::Ttl;
use crate::error::{PoolError, SpawnError};
use crate::events::{EventSink, PoolEvent};
use crate::job::{Job, JobPayload};
use crate::spawn::ProcessSpawner;

/// Point-in-time description of a unit, for callers and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: UnitId,
    pub pid: Option<Pid>,
    pub permanent: bool,
    pub ttl: Ttl,
    pub job_id: Option<String>,
}

impl std::fmt::Display for UnitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid={pid}")?,
            None => write!(f, "pid=-")?,
        }
        write!(
            f,
            " {} ttl={}",
            if self.permanent { "permanent" } else { "ephemeral" },
            self.ttl
        )?;
        if let Some(job_id) = &self.job_id {
            write!(f, " job={job_id}")?;
        }
        Ok(())
    }
}

/// One worker process as the pool sees it.
///
/// A permanent unit forks once at construction and keeps the parent end of
/// its job socket. An ephemeral unit forks on every `run`.
pub struct WorkerUnit<J> {
    id: UnitId,
    pid: Option<Pid>,
    permanent: bool,
    ttl: Ttl,
    job: Option<JobPayload>,
    start: Option<Instant>,
    writer: Option<FramedWrite<JobChannel, PacketCodec>>,
    overdue: bool,
    _job: PhantomData<fn() -> J>,
}

impl<J: Job> WorkerUnit<J> {
    /// Fork a permanent worker. On failure an `error` event is emitted and the
    /// unit is not created.
    pub fn permanent<S: ProcessSpawner<J>>(
        spawner: &S,
        ttl: Ttl,
        events: &EventSink,
    ) -> Result<Self, SpawnError> {
        let id = UnitId::new();
        match spawner.spawn_permanent(ttl) {
            Ok(channel) => {
                events.emit(PoolEvent::Forked {
                    unit: id,
                    pid: channel.pid,
                    permanent: true,
                });
                Ok(Self {
                    id,
                    pid: Some(channel.pid),
                    permanent: true,
                    ttl,
                    job: None,
                    start: None,
                    writer: Some(FramedWrite::new(channel.writer, PacketCodec::new())),
                    overdue: false,
                    _job: PhantomData,
                })
            }
            Err(e) => {
                tracing::error!(unit = %id, error = %e, "Failed to fork permanent worker");
                events.emit(PoolEvent::Error {
                    unit: Some(id),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn ephemeral(ttl: Ttl) -> Self {
        Self {
            id: UnitId::new(),
            pid: None,
            permanent: false,
            ttl,
            job: None,
            start: None,
            writer: None,
            overdue: false,
            _job: PhantomData,
        }
    }

    /// Hand `job` to the worker without waiting for it to finish.
    ///
    /// A permanent unit is left untouched if the job cannot be encoded.
    pub async fn run<S: ProcessSpawner<J>>(
        &mut self,
        spawner: &S,
        job: J,
        events: &EventSink,
    ) -> Result<(), PoolError> {
        if self.permanent {
            let frame = seal(&job)?;
            return self.dispatch(job.payload().clone(), frame).await;
        }

        let payload = job.payload().clone();
        let job_id = payload.id.clone();
        self.job = Some(payload);
        self.start = Some(Instant::now());
        self.overdue = false;

        match spawner.spawn_ephemeral(job) {
            Ok(pid) => {
                self.pid = Some(pid);
                events.emit(PoolEvent::Forked {
                    unit: self.id,
                    pid,
                    permanent: false,
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!(unit = %self.id, %job_id, error = %e, "Failed to fork worker");
                events.emit(PoolEvent::Error {
                    unit: Some(self.id),
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}

/// Encode `job` into a frame for a permanent worker.
pub fn seal<J: Job>(job: &J) -> Result<Bytes, PoolError> {
    JobCodec::<J>::seal(job).map_err(|source| {
        let job_id = job.payload().id.clone();
        tracing::warn!(%job_id, error = %source, "Failed to encode job");
        PoolError::Encode { job_id, source }
    })
}

impl<J> WorkerUnit<J> {
    /// Write an encoded job frame to a permanent worker's socket.
    ///
    /// The job counts as in flight even if the write fails, since part of the
    /// frame may already have reached the worker.
    pub async fn dispatch(&mut self, payload: JobPayload, frame: Bytes) -> Result<(), PoolError> {
        let (Some(pid), Some(writer)) = (self.pid, self.writer.as_mut()) else {
            return Err(PoolError::Unusable);
        };
        let job_id = payload.id.clone();
        self.job = Some(payload);
        self.start = Some(Instant::now());
        self.overdue = false;

        writer.send(frame).await.map_err(|source| {
            tracing::warn!(%pid, %job_id, error = %source, "Failed to dispatch job");
            PoolError::Dispatch { pid, source }
        })
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn decrement_ttl(&mut self) {
        self.ttl.decrement();
    }

    pub fn job(&self) -> Option<&JobPayload> {
        self.job.as_ref()
    }

    /// Time the in-flight job has been running.
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.start.map(|start| now.saturating_duration_since(start))
    }

    /// Clear the in-flight job, returning it with its run time.
    pub fn finish(&mut self, now: Instant) -> (Option<JobPayload>, Duration) {
        let elapsed = self.elapsed(now).unwrap_or_default();
        self.start = None;
        (self.job.take(), elapsed)
    }

    pub fn is_overdue(&self) -> bool {
        self.overdue
    }

    pub fn mark_overdue(&mut self) {
        self.overdue = true;
    }

    pub fn info(&self) -> UnitInfo {
        UnitInfo {
            id: self.id,
            pid: self.pid,
            permanent: self.permanent,
            ttl: self.ttl,
            job_id: self.job.as_ref().map(|job| job.id.clone()),
        }
    }
}
