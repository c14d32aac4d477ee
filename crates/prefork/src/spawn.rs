//! Process creation.
//!
//! [`ProcessSpawner`] is the seam between the pool's bookkeeping and the OS.
//! [`ForkSpawner`] is the real implementation: it forks the current process,
//! so the child starts with the parent's code and memory image and needs no
//! re-initialisation before running a job.

use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{self, ForkResult, Pid, SysconfVar, fork};

use crate::bridge::transport::{JobChannel, ResultWriter, unit_socket_pair};
use crate::context::Ttl;
use crate::error::SpawnError;
use crate::job::Job;
use crate::lifecycle::ExitOutcome;
use crate::worker;

/// Highest descriptor number a child bothers closing.
const MAX_INHERITED_FD: RawFd = 65_536;

/// Parent-side result of forking a permanent worker.
pub struct PermanentChannel {
    pub pid: Pid,
    pub writer: JobChannel,
}

impl std::fmt::Debug for PermanentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermanentChannel")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Extension point for how worker processes are created, reaped and signalled.
pub trait ProcessSpawner<J: Job>: Send + Sync + 'static {
    /// Start a long-lived worker that serves jobs from its socket until `ttl` runs out.
    fn spawn_permanent(&self, ttl: Ttl) -> Result<PermanentChannel, SpawnError>;

    /// Start a worker that runs `job` once and exits with 0 on success, 1 on failure.
    fn spawn_ephemeral(&self, job: J) -> Result<Pid, SpawnError>;

    /// Non-blocking reap of one child. `None` while it is still running.
    fn try_reap(&self, pid: Pid) -> Option<ExitOutcome>;

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), SpawnError>;
}

/// Spawner backed by `fork(2)`.
pub struct ForkSpawner<J> {
    results: ResultWriter,
    _job: PhantomData<fn() -> J>,
}

impl<J> ForkSpawner<J> {
    /// `results` is the write end of the pool's result channel, inherited by
    /// every permanent worker.
    pub fn new(results: ResultWriter) -> Self {
        Self {
            results,
            _job: PhantomData,
        }
    }
}

impl<J: Job> ProcessSpawner<J> for ForkSpawner<J> {
    fn spawn_permanent(&self, ttl: Ttl) -> Result<PermanentChannel, SpawnError> {
        let (parent_end, child_end) = unit_socket_pair()?;
        parent_end.set_nonblocking(true)?;

        // SAFETY: the child only touches descriptors it owns and leaves via _exit.
        match unsafe { fork() }? {
            ForkResult::Child => {
                reset_child_signals();
                close_inherited_fds(&[child_end.as_raw_fd(), self.results.as_raw_fd()]);
                let code = worker::run_permanent_process::<J>(child_end, self.results.clone(), ttl);
                // SAFETY: skips the parent's atexit handlers and destructors.
                // nix has no wrapper for _exit.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                match tokio::net::UnixStream::from_std(parent_end) {
                    Ok(stream) => {
                        tracing::info!(pid = %child, %ttl, "Forked permanent worker");
                        Ok(PermanentChannel {
                            pid: child,
                            writer: Box::new(stream),
                        })
                    }
                    Err(e) => {
                        tracing::error!(pid = %child, error = %e, "Failed to register worker socket");
                        let _ = signal::kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        Err(e.into())
                    }
                }
            }
        }
    }

    fn spawn_ephemeral(&self, job: J) -> Result<Pid, SpawnError> {
        let job_id = job.payload().id.clone();

        // SAFETY: as above.
        match unsafe { fork() }? {
            ForkResult::Child => {
                reset_child_signals();
                close_inherited_fds(&[]);
                let code = worker::run_ephemeral(job);
                // SAFETY: as above.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, %job_id, "Forked ephemeral worker");
                Ok(child)
            }
        }
    }

    fn try_reap(&self, pid: Pid) -> Option<ExitOutcome> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => ExitOutcome::from_wait_status(status),
            Err(Errno::ECHILD) => Some(ExitOutcome::Lost),
            Err(Errno::EINTR) => None,
            Err(e) => {
                tracing::warn!(%pid, error = %e, "waitpid failed");
                None
            }
        }
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), SpawnError> {
        signal::kill(pid, signal)?;
        Ok(())
    }
}

/// Restore default dispositions for signals the parent's runtime handles.
fn reset_child_signals() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for sig in [Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: installs no handler code.
        let _ = unsafe { signal::sigaction(sig, &default) };
    }
    // SAFETY: as above.
    let _ = unsafe { signal::sigaction(Signal::SIGUSR1, &ignore) };
}

/// Close every descriptor above stderr except `keep`.
///
/// Siblings' job sockets must not stay open in a worker, or a parent-side
/// close would never reach that sibling as EOF.
fn close_inherited_fds(keep: &[RawFd]) {
    let limit = unistd::sysconf(SysconfVar::OPEN_MAX)
        .ok()
        .flatten()
        .and_then(|max| RawFd::try_from(max).ok())
        .filter(|max| *max > 0)
        .map_or(1024, |max| max.min(MAX_INHERITED_FD));
    for fd in (3..limit).filter(|fd| !keep.contains(fd)) {
        // EBADF for descriptors that were never open.
        let _ = unistd::close(fd);
    }
}
