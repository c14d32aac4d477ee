//! Worker pool bookkeeping.
//!
//! Every tracked process lives in exactly one of three places:
//! - `pool`: idle units, reused oldest first
//! - `workers`: busy units keyed by pid
//! - `retiring`: units whose process is expected to exit on its own, or has
//!   exited before its last completion record was read
//!
//! The pool is owned by a single event loop (see orchestrator.rs), so none of
//! this is locked.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::bridge::protocol::{CompletionRecord, CompletionStatus};
use crate::context::{PoolConfig, Ttl};
use crate::error::PoolError;
use crate::events::{EventSink, PoolEvent};
use crate::job::Job;
use crate::lifecycle::ExitOutcome;
use crate::spawn::ProcessSpawner;
use crate::unit::{self, UnitInfo, WorkerUnit};

/// How long shutdown waits for workers to exit after each signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

struct Retiring<J> {
    unit: WorkerUnit<J>,
    /// Whether a replacement is still owed when the process exits.
    replenish: bool,
    /// Already reaped; only the final completion record is outstanding.
    exited: bool,
}

/// Units grouped by state, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub target: usize,
    pub idle: Vec<UnitInfo>,
    pub busy: Vec<UnitInfo>,
    pub retiring: Vec<UnitInfo>,
}

impl std::fmt::Display for PoolSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "target={} idle={} busy={} retiring={}",
            self.target,
            self.idle.len(),
            self.busy.len(),
            self.retiring.len()
        )?;
        for (state, units) in [
            ("idle", &self.idle),
            ("busy", &self.busy),
            ("retiring", &self.retiring),
        ] {
            for unit in units {
                writeln!(f, "  {state} {unit}")?;
            }
        }
        Ok(())
    }
}

pub struct WorkerPool<J, S> {
    workers: HashMap<Pid, WorkerUnit<J>>,
    pool: VecDeque<WorkerUnit<J>>,
    retiring: HashMap<Pid, Retiring<J>>,
    spawner: S,
    ttl: Ttl,
    target: usize,
    events: EventSink,
}

impl<J: Job, S: ProcessSpawner<J>> WorkerPool<J, S> {
    pub fn new(config: &PoolConfig, spawner: S, events: EventSink) -> Self {
        Self {
            workers: HashMap::new(),
            pool: VecDeque::new(),
            retiring: HashMap::new(),
            spawner,
            ttl: config.ttl,
            target: config.target_pool_size(),
            events,
        }
    }

    /// Whether units are long-lived processes rather than one fork per job.
    pub fn is_permanent(&self) -> bool {
        self.ttl.requires_permanent()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn idle_count(&self) -> usize {
        self.pool.len()
    }

    pub fn busy_count(&self) -> usize {
        self.workers.len()
    }

    pub fn retiring_count(&self) -> usize {
        self.retiring.len()
    }

    /// Fork the initial permanent workers. Ephemeral pools start empty.
    pub fn prefork(&mut self) {
        if !self.is_permanent() {
            tracing::info!(ttl = %self.ttl, "Ephemeral pool, workers fork per job");
            return;
        }
        for _ in 0..self.target {
            self.replenish();
        }
        tracing::info!(
            target_size = self.target,
            idle = self.pool.len(),
            ttl = %self.ttl,
            "Pre-forked permanent workers"
        );
    }

    /// Add one fresh permanent unit to the idle pool. Returns whether it was created.
    pub fn replenish(&mut self) -> bool {
        if !self.is_permanent() {
            return false;
        }
        match WorkerUnit::permanent(&self.spawner, self.ttl, &self.events) {
            Ok(unit) => {
                self.pool.push_back(unit);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, idle = self.pool.len(), "Pool running below target");
                false
            }
        }
    }

    /// Hand `job` to an idle unit, or a new one if none is idle.
    ///
    /// Jobs for permanent workers are encoded first, so one that cannot be
    /// encoded fails here without claiming a worker.
    pub async fn run(&mut self, job: J) -> Result<UnitInfo, PoolError> {
        let frame = if self.is_permanent() {
            Some(unit::seal(&job)?)
        } else {
            None
        };

        let mut unit = match self.pool.pop_front() {
            Some(unit) => unit,
            None if self.is_permanent() => {
                WorkerUnit::permanent(&self.spawner, self.ttl, &self.events)?
            }
            None => WorkerUnit::ephemeral(self.ttl),
        };

        let payload = job.payload().clone();
        self.events.emit(PoolEvent::Process {
            unit: unit.id(),
            pid: unit.pid(),
            job: payload.clone(),
        });

        let dispatched = match frame {
            Some(frame) => unit.dispatch(payload, frame).await,
            None => unit.run(&self.spawner, job, &self.events).await,
        };
        let info = unit.info();
        match unit.pid() {
            // A failed write may have delivered part of the frame, so the
            // worker's next record or its exit settles the job.
            Some(pid) => {
                tracing::debug!(%pid, job_id = ?info.job_id, "Job dispatched");
                self.workers.insert(pid, unit);
            }
            None => tracing::debug!(unit = %info.id, "Discarding unit that never forked"),
        }
        dispatched.map(|()| info)
    }

    /// Apply one completion record from the result channel.
    pub fn handle_completion(&mut self, record: CompletionRecord, now: Instant) {
        let pid = record.pid();

        if let Some(mut unit) = self.workers.remove(&pid) {
            self.report(pid, &mut unit, record.status, now);
            if unit.ttl().is_expired() {
                tracing::debug!(%pid, "Worker TTL expired, awaiting exit");
                self.retire(pid, unit, true, false);
            } else {
                self.pool.push_back(unit);
            }
            return;
        }

        if self.retiring.get(&pid).is_some_and(|retired| retired.exited) {
            if let Some(mut retired) = self.retiring.remove(&pid) {
                tracing::debug!(%pid, "Completion from worker that already exited");
                self.report(pid, &mut retired.unit, record.status, now);
            }
            return;
        }

        if let Some(unit) = self.take_idle(pid) {
            tracing::warn!(%pid, status = record.status.code(), "Completion from idle worker, replacing it");
            if let Err(e) = self.spawner.signal(pid, Signal::SIGTERM) {
                tracing::debug!(%pid, error = %e, "Failed to signal idle worker");
            }
            self.retire(pid, unit, false, false);
            self.replenish();
            return;
        }

        tracing::warn!(%pid, status = record.status.code(), "Completion for unknown worker, dropping");
    }

    /// Emit the outcome of a finished job and charge it against the unit's TTL.
    fn report(&self, pid: Pid, unit: &mut WorkerUnit<J>, status: CompletionStatus, now: Instant) {
        let (job, elapsed) = unit.finish(now);
        match status {
            CompletionStatus::Success => {
                self.events.emit(PoolEvent::Done { pid, job, elapsed });
            }
            CompletionStatus::DecodeError => {
                self.events.emit(PoolEvent::DecodeError { pid });
                self.events.emit(PoolEvent::Fail {
                    pid,
                    job,
                    elapsed,
                    reason: "worker could not decode the job".to_string(),
                });
            }
            status => {
                self.events.emit(PoolEvent::Fail {
                    pid,
                    job,
                    elapsed,
                    reason: format!("job failed with status {}", status.code()),
                });
            }
        }
        if status.consumed_job() {
            unit.decrement_ttl();
        }
    }

    fn retire(&mut self, pid: Pid, unit: WorkerUnit<J>, replenish: bool, exited: bool) {
        self.retiring.insert(
            pid,
            Retiring {
                unit,
                replenish,
                exited,
            },
        );
    }

    /// Settle a reaped process.
    pub fn handle_exit(&mut self, pid: Pid, outcome: ExitOutcome, now: Instant) {
        if let Some(mut unit) = self.workers.remove(&pid) {
            let overdue = unit.is_overdue();

            // A permanent worker only exits cleanly after writing its final
            // record, which may still be unread.
            if unit.is_permanent() && outcome.is_success() && !overdue {
                tracing::debug!(%pid, "Worker exited ahead of its completion record");
                self.retire(pid, unit, false, true);
                self.replenish();
                return;
            }

            let (job, elapsed) = unit.finish(now);
            let reason = if overdue {
                format!("job exceeded its deadline, worker {outcome}")
            } else {
                format!("worker {outcome}")
            };

            if unit.is_permanent() {
                tracing::warn!(%pid, %outcome, "Permanent worker died mid-job");
                self.events.emit(PoolEvent::Fail {
                    pid,
                    job,
                    elapsed,
                    reason,
                });
                self.replenish();
            } else if outcome.is_success() && !overdue {
                self.events.emit(PoolEvent::Done { pid, job, elapsed });
            } else {
                self.events.emit(PoolEvent::Fail {
                    pid,
                    job,
                    elapsed,
                    reason,
                });
            }
            return;
        }

        if self.take_idle(pid).is_some() {
            tracing::warn!(%pid, %outcome, "Idle worker exited, replacing it");
            self.replenish();
            return;
        }

        if let Some(retired) = self.retiring.remove(&pid) {
            tracing::debug!(%pid, %outcome, "Retired worker exited");
            if retired.replenish {
                self.replenish();
            }
            return;
        }

        tracing::debug!(%pid, %outcome, "Exit of untracked child, ignoring");
    }

    /// Reap every tracked process that has exited. Returns how many were reaped.
    pub fn reap(&mut self, now: Instant) -> usize {
        let exited: Vec<_> = self
            .live_pids()
            .into_iter()
            .filter_map(|pid| self.spawner.try_reap(pid).map(|outcome| (pid, outcome)))
            .collect();
        let count = exited.len();
        for (pid, outcome) in exited {
            self.handle_exit(pid, outcome, now);
        }
        count
    }

    /// SIGKILL busy workers whose job has run longer than `deadline`.
    pub fn expire_overdue(&mut self, now: Instant, deadline: Duration) -> usize {
        let mut killed = 0;
        for (pid, unit) in self.workers.iter_mut() {
            if unit.is_overdue() || unit.elapsed(now).is_none_or(|elapsed| elapsed <= deadline) {
                continue;
            }
            tracing::warn!(
                %pid,
                job_id = ?unit.job().map(|job| &job.id),
                deadline_secs = deadline.as_secs_f64(),
                "Job exceeded deadline, killing worker"
            );
            unit.mark_overdue();
            match self.spawner.signal(*pid, Signal::SIGKILL) {
                Ok(()) => killed += 1,
                Err(e) => tracing::warn!(%pid, error = %e, "Failed to kill overdue worker"),
            }
        }
        killed
    }

    /// Every pid the pool knows about, including exited workers whose final
    /// record is still unread.
    pub fn tracked_pids(&self) -> Vec<Pid> {
        self.workers
            .keys()
            .copied()
            .chain(self.pool.iter().filter_map(|unit| unit.pid()))
            .chain(self.retiring.keys().copied())
            .collect()
    }

    /// Tracked pids whose process has not been reaped yet.
    fn live_pids(&self) -> Vec<Pid> {
        self.workers
            .keys()
            .copied()
            .chain(self.pool.iter().filter_map(|unit| unit.pid()))
            .chain(
                self.retiring
                    .iter()
                    .filter(|(_, retired)| !retired.exited)
                    .map(|(pid, _)| *pid),
            )
            .collect()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let by_pid = |mut units: Vec<UnitInfo>| {
            units.sort_by_key(|unit| unit.pid.map(Pid::as_raw));
            units
        };
        PoolSnapshot {
            target: self.target,
            idle: self.pool.iter().map(WorkerUnit::info).collect(),
            busy: by_pid(self.workers.values().map(WorkerUnit::info).collect()),
            retiring: by_pid(self.retiring.values().map(|r| r.unit.info()).collect()),
        }
    }

    /// SIGTERM every tracked process, reap them and forget all units.
    pub async fn shutdown(&mut self) {
        self.shutdown_with_grace(SHUTDOWN_GRACE).await;
    }

    /// Like [`shutdown`](Self::shutdown), waiting at most `grace` for workers
    /// to exit after SIGTERM, and again after SIGKILL for any that did not.
    pub async fn shutdown_with_grace(&mut self, grace: Duration) {
        let pids = self.live_pids();
        tracing::info!(workers = pids.len(), "Shutting down worker pool");
        self.signal_all(&pids, Signal::SIGTERM);

        let mut pending = self.await_exits(pids, grace).await;
        if !pending.is_empty() {
            tracing::warn!(workers = pending.len(), "Workers still running after SIGTERM, killing");
            self.signal_all(&pending, Signal::SIGKILL);
            pending = self.await_exits(pending, grace).await;
        }
        if !pending.is_empty() {
            tracing::error!(pids = ?pending, "Leaving workers unreaped");
        }

        self.workers.clear();
        self.pool.clear();
        self.retiring.clear();
        self.events.emit(PoolEvent::Stop);
    }

    fn signal_all(&self, pids: &[Pid], signal: Signal) {
        for &pid in pids {
            if let Err(e) = self.spawner.signal(pid, signal) {
                tracing::debug!(%pid, %signal, error = %e, "Failed to signal worker");
            }
        }
    }

    /// Reap `pids` until all are gone or `grace` runs out. Returns the rest.
    async fn await_exits(&self, mut pids: Vec<Pid>, grace: Duration) -> Vec<Pid> {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            pids.retain(|pid| self.spawner.try_reap(*pid).is_none());
            if pids.is_empty() || tokio::time::Instant::now() >= deadline {
                return pids;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }

    fn take_idle(&mut self, pid: Pid) -> Option<WorkerUnit<J>> {
        let index = self.pool.iter().position(|unit| unit.pid() == Some(pid))?;
        self.pool.remove(index)
    }
}
