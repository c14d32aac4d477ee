//! Orchestrator - owns the pool and drives its event loop.
//!
//! Flow:
//! 1. Create the result channel and register signal handlers
//! 2. Spawn the event loop, which pre-forks the permanent workers
//! 3. Route requests, completion records and lifecycle events to the pool
//! 4. On shutdown or when every handle is gone: signal and reap workers, emit stop
//!
//! The loop is the only code that touches the pool, so callers talk to it
//! through [`PoolHandle`].

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tracing::Instrument;

use crate::bridge::codec::CompletionCodec;
use crate::bridge::transport::{ResultChannel, ResultStream};
use crate::context::PoolContext;
use crate::error::PoolError;
use crate::events::{EventSink, PoolEvent};
use crate::job::Job;
use crate::lifecycle::{LifecycleEvent, LifecycleSource, SignalLifecycle};
use crate::pool::{PoolSnapshot, WorkerPool};
use crate::spawn::{ForkSpawner, ProcessSpawner};
use crate::unit::UnitInfo;

/// How often exited workers are swept for even without SIGCHLD, and overdue
/// jobs are checked.
pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

const REQUEST_BUFFER: usize = 64;

pub enum PoolRequest<J> {
    Run {
        job: J,
        reply: oneshot::Sender<Result<UnitInfo, PoolError>>,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running pool. Cheap to clone; the pool shuts down when the
/// last handle is dropped.
pub struct PoolHandle<J> {
    tx: mpsc::Sender<PoolRequest<J>>,
    events: EventSink,
}

impl<J> Clone for PoolHandle<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            events: self.events.clone(),
        }
    }
}

impl<J: Job> PoolHandle<J> {
    /// Hand `job` to a worker. Returns once it is dispatched, not when it finishes.
    pub async fn run(&self, job: J) -> Result<UnitInfo, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Run { job, reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Snapshot { reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Signal every worker and stop the event loop.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Shutdown { reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }
}

/// Start a fork-backed pool on the context's runtime.
///
/// Subscribe to `events` beforehand to observe the initial pre-fork.
pub fn start<J: Job>(ctx: PoolContext, events: EventSink) -> Result<PoolHandle<J>, PoolError> {
    let _guard = ctx.handle.enter();
    let channel = ResultChannel::new().map_err(PoolError::Setup)?;
    // Registered before the first fork so no SIGCHLD goes unnoticed.
    let lifecycle = SignalLifecycle::register().map_err(PoolError::Setup)?;
    let spawner = ForkSpawner::<J>::new(channel.writer());
    let results = channel.into_reader().map_err(PoolError::Setup)?;
    drop(_guard);
    Ok(spawn_pool(ctx, spawner, lifecycle, results, events))
}

/// Spawn the event loop for a pool built from explicit parts.
pub fn spawn_pool<J, S, L>(
    ctx: PoolContext,
    spawner: S,
    lifecycle: L,
    results: ResultStream,
    events: EventSink,
) -> PoolHandle<J>
where
    J: Job,
    S: ProcessSpawner<J>,
    L: LifecycleSource + 'static,
{
    let pool = WorkerPool::new(&ctx.config, spawner, events.clone());
    let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
    let span = tracing::info_span!("pool", owner = %ctx.owner);

    ctx.handle.spawn(
        run_event_loop(pool, lifecycle, results, rx, ctx.config.job_timeout).instrument(span),
    );

    PoolHandle { tx, events }
}

async fn run_event_loop<J, S, L>(
    mut pool: WorkerPool<J, S>,
    mut lifecycle: L,
    results: ResultStream,
    mut requests: mpsc::Receiver<PoolRequest<J>>,
    job_timeout: Option<Duration>,
) where
    J: Job,
    S: ProcessSpawner<J>,
    L: LifecycleSource,
{
    pool.events().emit(PoolEvent::Start {
        target: pool.target(),
        permanent: pool.is_permanent(),
    });
    pool.prefork();

    let mut records = FramedRead::new(results, CompletionCodec::new());
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lifecycle_open = true;
    let mut results_open = true;
    let mut shutdown_reply = None;

    loop {
        tokio::select! {
            biased;

            record = records.next(), if results_open => {
                match record {
                    Some(Ok(record)) => pool.handle_completion(record, Instant::now()),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Result channel failed");
                        results_open = false;
                    }
                    None => {
                        tracing::warn!("Result channel closed");
                        results_open = false;
                    }
                }
            }

            event = lifecycle.next_event(), if lifecycle_open => {
                match event {
                    Some(LifecycleEvent::ChildExited) => {
                        let reaped = pool.reap(Instant::now());
                        tracing::trace!(reaped, "Handled SIGCHLD");
                    }
                    Some(LifecycleEvent::Exited { pid, outcome }) => {
                        pool.handle_exit(pid, outcome, Instant::now());
                    }
                    Some(LifecycleEvent::Diagnostic) => {
                        tracing::info!(snapshot = %pool.snapshot(), "Worker pool status");
                    }
                    None => {
                        tracing::debug!("Lifecycle source exhausted");
                        lifecycle_open = false;
                    }
                }
            }

            request = requests.recv() => {
                match request {
                    Some(PoolRequest::Run { job, reply }) => {
                        let result = pool.run(job).await;
                        if reply.send(result).is_err() {
                            tracing::debug!("Caller went away before dispatch result");
                        }
                    }
                    Some(PoolRequest::Snapshot { reply }) => {
                        let _ = reply.send(pool.snapshot());
                    }
                    Some(PoolRequest::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    None => {
                        tracing::debug!("All pool handles dropped");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                let now = Instant::now();
                pool.reap(now);
                if let Some(deadline) = job_timeout {
                    pool.expire_overdue(now, deadline);
                }
            }
        }
    }

    pool.shutdown().await;
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
    tracing::info!("Event loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CompletionRecord;
    use crate::context::{PoolConfig, QueueConfig, Ttl};
    use crate::lifecycle::{ChannelLifecycle, ExitOutcome};
    use crate::testing::{FakeSpawner, TestJob};
    use futures::SinkExt;
    use tokio::io::DuplexStream;
    use tokio_util::codec::FramedWrite;

    struct Harness {
        handle: PoolHandle<TestJob>,
        spawner: FakeSpawner,
        lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
        results: FramedWrite<DuplexStream, CompletionCodec>,
        events: broadcast::Receiver<PoolEvent>,
    }

    fn harness(config: PoolConfig) -> Harness {
        let spawner = FakeSpawner::new();
        let (lifecycle, lifecycle_tx) = ChannelLifecycle::new();
        let (results_tx, results_rx) = tokio::io::duplex(64 * 1024);
        let events = EventSink::default();
        let rx = events.subscribe();
        let ctx = PoolContext::current(config, "test-worker").unwrap();
        let handle = spawn_pool(ctx, spawner.clone(), lifecycle, Box::new(results_rx), events);
        Harness {
            handle,
            spawner,
            lifecycle: lifecycle_tx,
            results: FramedWrite::new(results_tx, CompletionCodec::new()),
            events: rx,
        }
    }

    async fn next_named(rx: &mut broadcast::Receiver<PoolEvent>, name: &str) -> PoolEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.name() == name {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
    }

    fn config() -> PoolConfig {
        PoolConfig::new()
            .with_queue(QueueConfig::new("default", 2))
            .with_prefork_factor(1.0)
            .with_ttl(Ttl::UNLIMITED)
    }

    #[tokio::test]
    async fn run_and_complete_through_the_loop() {
        let mut h = harness(config());
        assert_eq!(
            next_named(&mut h.events, "start").await,
            PoolEvent::Start {
                target: 2,
                permanent: true
            }
        );

        let info = h.handle.run(TestJob::succeed("j1")).await.unwrap();
        let pid = info.pid.unwrap();
        assert_eq!(info.job_id.as_deref(), Some("j1"));

        h.results
            .send(CompletionRecord::success(pid.as_raw() as u32))
            .await
            .unwrap();
        let PoolEvent::Done { pid: done, job, .. } = next_named(&mut h.events, "done").await else {
            unreachable!()
        };
        assert_eq!(done, pid);
        assert_eq!(job.unwrap().id, "j1");

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.idle.len(), 2);
        assert!(snapshot.busy.is_empty());
    }

    #[tokio::test]
    async fn child_exit_triggers_replenish() {
        let mut h = harness(config());
        let snapshot = h.handle.snapshot().await.unwrap();
        let victim = snapshot.idle[0].pid.unwrap();

        h.spawner.exit(victim, ExitOutcome::Signaled(nix::sys::signal::Signal::SIGKILL));
        h.lifecycle.send(LifecycleEvent::ChildExited).unwrap();
        h.lifecycle.send(LifecycleEvent::Diagnostic).unwrap();

        // Two from pre-fork, one replacement.
        for _ in 0..3 {
            next_named(&mut h.events, "forked").await;
        }
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.idle.len(), 2);
        assert!(snapshot.idle.iter().all(|unit| unit.pid != Some(victim)));
    }

    #[tokio::test]
    async fn unknown_completion_is_ignored() {
        let mut h = harness(config());
        let pid = h.handle.run(TestJob::succeed("j1")).await.unwrap().pid.unwrap();

        h.results.send(CompletionRecord::failed(424_242)).await.unwrap();
        h.results
            .send(CompletionRecord::success(pid.as_raw() as u32))
            .await
            .unwrap();

        // Records are handled in order, so the stray one has been seen by now.
        next_named(&mut h.events, "done").await;
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.idle.len(), 2);
        assert!(snapshot.busy.is_empty() && snapshot.retiring.is_empty());
        assert_eq!(h.spawner.forks(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut h = harness(config());
        h.handle.shutdown().await.unwrap();
        next_named(&mut h.events, "stop").await;

        assert_eq!(h.spawner.signals().len(), 2);
        let err = h.handle.run(TestJob::succeed("late")).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test]
    async fn dropping_every_handle_shuts_down() {
        let mut h = harness(config());
        next_named(&mut h.events, "start").await;
        drop(h.handle);
        next_named(&mut h.events, "stop").await;
    }
}
