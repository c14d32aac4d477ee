//! Worker process side.
//!
//! Runs inside forked children. The parent side (dispatch, completion
//! handling, reaping) lives in pool.rs and orchestrator.rs.
//!
//! Architecture:
//! - Ephemeral child: runs one job on the forked thread, exit status is the result
//! - Permanent child: private current-thread runtime reading job frames from its
//!   unit socket, one completion record per job on the result channel
//!
//! Either way every job passes through [`execute`], so failures and panics stay
//! inside the child.

use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::panic::{self, AssertUnwindSafe};

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JobCodec;
use crate::bridge::protocol::CompletionRecord;
use crate::bridge::transport::{CompletionSink, ResultWriter, into_async};
use crate::context::Ttl;
use crate::job::{Job, JobError, JobStatus};

/// Run one job attempt.
///
/// Validates the payload, runs `perform` with panics caught, calls `fail` on
/// any error and always finishes with `update_status(Complete)`.
pub fn execute<J: Job>(job: &mut J) -> Result<(), JobError> {
    let outcome = job.payload().validate().and_then(|()| {
        job.update_status(JobStatus::Running);
        panic::catch_unwind(AssertUnwindSafe(|| job.perform()))
            .unwrap_or_else(|payload| Err(JobError::panicked(panic_message(payload.as_ref()))))
    });

    match &outcome {
        Ok(()) => tracing::debug!(job_id = %job.payload().id, "Job succeeded"),
        Err(error) => {
            tracing::warn!(job_id = %job.payload().id, %error, "Job failed");
            job.fail(error);
        }
    }
    job.update_status(JobStatus::Complete);
    outcome
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Why a permanent worker stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    TtlExpired { served: u64 },
    /// The parent closed the job socket.
    Disconnected { served: u64 },
}

/// Serve jobs from `reader` until the TTL runs out or the parent goes away.
///
/// A frame that cannot be decoded is answered with a decode-error record and
/// does not count against the TTL.
pub async fn serve_jobs<J, R, C>(reader: R, sink: &mut C, mut ttl: Ttl, pid: u32) -> io::Result<WorkerExit>
where
    J: Job,
    R: AsyncRead + Unpin,
    C: CompletionSink,
{
    let mut frames = FramedRead::new(reader, JobCodec::<J>::new());
    let mut served = 0;

    while let Some(frame) = frames.next().await {
        let record = match frame? {
            Ok(mut job) => {
                let outcome = execute(&mut job);
                ttl.decrement();
                served += 1;
                match outcome {
                    Ok(()) => CompletionRecord::success(pid),
                    Err(_) => CompletionRecord::failed(pid),
                }
            }
            Err(error) => {
                tracing::warn!(pid, %error, "Discarding undecodable job frame");
                CompletionRecord::decode_error(pid)
            }
        };
        sink.send(record)?;

        if ttl.is_expired() {
            tracing::debug!(pid, served, "Worker TTL expired");
            return Ok(WorkerExit::TtlExpired { served });
        }
    }

    tracing::debug!(pid, served, "Job socket closed");
    Ok(WorkerExit::Disconnected { served })
}

/// Body of a freshly forked permanent worker. Returns the process exit code.
///
/// The forked thread still carries the parent's runtime context, so the
/// worker's own runtime is built on a new thread.
pub fn run_permanent_process<J: Job>(socket: StdUnixStream, results: ResultWriter, ttl: Ttl) -> i32 {
    let pid = std::process::id();
    let worker = std::thread::Builder::new()
        .name("prefork-worker".to_string())
        .spawn(move || -> io::Result<WorkerExit> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let socket = into_async(socket)?;
                let mut results = results;
                serve_jobs::<J, _, _>(socket, &mut results, ttl, pid).await
            })
        });

    match worker.map(|handle| handle.join()) {
        Ok(Ok(Ok(exit))) => {
            tracing::debug!(pid, ?exit, "Worker exiting");
            0
        }
        Ok(Ok(Err(e))) => {
            tracing::error!(pid, error = %e, "Worker I/O failure");
            1
        }
        Ok(Err(_)) => {
            tracing::error!(pid, "Worker thread panicked");
            1
        }
        Err(e) => {
            tracing::error!(pid, error = %e, "Failed to start worker thread");
            1
        }
    }
}

/// Body of a freshly forked ephemeral worker. Returns the process exit code.
pub fn run_ephemeral<J: Job>(mut job: J) -> i32 {
    match execute(&mut job) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
