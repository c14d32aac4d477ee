//! Notifications the pool emits to its owner.
//!
//! Delivery is fire-and-forget over a broadcast channel. A slow subscriber
//! lags and loses events; the pool never waits on it.

use std::time::Duration;

use nix::unistd::Pid;
use tokio::sync::broadcast;

use crate::bridge::protocol::UnitId;
use crate::job::JobPayload;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// The event loop started with `target` units requested up front.
    Start { target: usize, permanent: bool },
    /// The event loop stopped and every tracked process was signalled.
    Stop,
    /// A worker process was created.
    Forked {
        unit: UnitId,
        pid: Pid,
        permanent: bool,
    },
    /// A job is about to be handed to a unit. Ephemeral units have no pid yet.
    Process {
        unit: UnitId,
        pid: Option<Pid>,
        job: JobPayload,
    },
    Done {
        pid: Pid,
        job: Option<JobPayload>,
        elapsed: Duration,
    },
    Fail {
        pid: Pid,
        job: Option<JobPayload>,
        elapsed: Duration,
        reason: String,
    },
    Error {
        unit: Option<UnitId>,
        message: String,
    },
    /// A worker received a job frame it could not decode.
    DecodeError { pid: Pid },
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop => "stop",
            Self::Forked { .. } => "forked",
            Self::Process { .. } => "process",
            Self::Done { .. } => "done",
            Self::Fail { .. } => "fail",
            Self::Error { .. } => "error",
            Self::DecodeError { .. } => "decode_error",
        }
    }
}

/// Sending side of the event broadcast.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: PoolEvent) {
        tracing::trace!(event = event.name(), "Emitting pool event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventSink::default().emit(PoolEvent::Stop);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();

        sink.emit(PoolEvent::Start {
            target: 2,
            permanent: true,
        });
        sink.emit(PoolEvent::DecodeError {
            pid: Pid::from_raw(10),
        });
        sink.emit(PoolEvent::Stop);

        let names: Vec<_> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(PoolEvent::name)
        .collect();
        assert_eq!(names, ["start", "decode_error", "stop"]);
    }
}
