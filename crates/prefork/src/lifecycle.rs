//! Worker process lifecycle: exit analysis and the sources that report it.
//!
//! The orchestrator owns exactly one [`LifecycleSource`]. In production that is
//! [`SignalLifecycle`], which turns SIGCHLD into a reap sweep and SIGUSR1 into a
//! diagnostic dump. Tests drive the pool with [`ChannelLifecycle`] instead.

use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(Signal),
    /// The process was already reaped elsewhere; its status is unknown.
    Lost,
}

impl ExitOutcome {
    /// Map a `waitpid` result. `None` while the process is still running.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Signaled(signal)),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal:?}"),
            Self::Lost => write!(f, "exit status lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// At least one child changed state; sweep tracked pids.
    ChildExited,
    /// A specific child has already been reaped.
    Exited { pid: Pid, outcome: ExitOutcome },
    /// Dump a snapshot of the pool.
    Diagnostic,
}

#[async_trait]
pub trait LifecycleSource: Send {
    /// Next lifecycle event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<LifecycleEvent>;
}

/// SIGCHLD and SIGUSR1 delivered through tokio's signal driver.
///
/// Register before forking the first worker so no SIGCHLD is missed. Repeated
/// signals coalesce, which is why SIGCHLD only triggers a sweep.
pub struct SignalLifecycle {
    child: tokio::signal::unix::Signal,
    diagnostic: tokio::signal::unix::Signal,
}

impl SignalLifecycle {
    pub fn register() -> std::io::Result<Self> {
        let child = signal(SignalKind::child())?;
        let diagnostic = signal(SignalKind::user_defined1())?;
        tracing::debug!("Registered SIGCHLD and SIGUSR1 handlers");
        Ok(Self { child, diagnostic })
    }
}

#[async_trait]
impl LifecycleSource for SignalLifecycle {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        tokio::select! {
            received = self.child.recv() => received.map(|_| LifecycleEvent::ChildExited),
            received = self.diagnostic.recv() => received.map(|_| LifecycleEvent::Diagnostic),
        }
    }
}

/// Lifecycle events pushed by hand.
pub struct ChannelLifecycle {
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl ChannelLifecycle {
    pub fn new() -> (Self, mpsc::UnboundedSender<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, tx)
    }
}

#[async_trait]
impl LifecycleSource for ChannelLifecycle {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }
}
