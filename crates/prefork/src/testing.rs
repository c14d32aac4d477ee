//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::DuplexStream;

use crate::context::Ttl;
use crate::error::SpawnError;
use crate::job::{Job, JobError, JobPayload, JobStatus};
use crate::lifecycle::ExitOutcome;
use crate::spawn::{PermanentChannel, ProcessSpawner};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Behavior {
    Succeed,
    Fail(String),
    Panic(String),
    Unencodable(Unencodable),
}

/// Marker that always fails to serialize.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Unencodable;

impl Serialize for Unencodable {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("job cannot be serialized"))
    }
}

/// Job whose outcome is scripted, recording every callback it receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestJob {
    pub payload: JobPayload,
    pub behavior: Behavior,
    #[serde(skip)]
    pub failures: Vec<String>,
    #[serde(skip)]
    pub statuses: Vec<JobStatus>,
}

impl TestJob {
    fn with_behavior(id: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            payload: JobPayload::new(id, "default"),
            behavior,
            failures: Vec::new(),
            statuses: Vec::new(),
        }
    }

    pub fn succeed(id: impl Into<String>) -> Self {
        Self::with_behavior(id, Behavior::Succeed)
    }

    pub fn fail(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_behavior(id, Behavior::Fail(message.into()))
    }

    pub fn panic(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_behavior(id, Behavior::Panic(message.into()))
    }

    pub fn unencodable(id: impl Into<String>) -> Self {
        Self::with_behavior(id, Behavior::Unencodable(Unencodable))
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.payload.queue = queue.into();
        self
    }
}

impl Job for TestJob {
    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    fn perform(&mut self) -> Result<(), JobError> {
        match &self.behavior {
            Behavior::Succeed | Behavior::Unencodable(_) => Ok(()),
            Behavior::Fail(message) => Err(JobError::failed(message.clone())),
            Behavior::Panic(message) => panic!("{message}"),
        }
    }

    fn fail(&mut self, error: &JobError) {
        self.failures.push(error.to_string());
    }

    fn update_status(&mut self, status: JobStatus) {
        self.statuses.push(status);
    }
}

#[derive(Default)]
struct FakeState {
    next_pid: i32,
    children: HashMap<Pid, DuplexStream>,
    ephemeral: Vec<(Pid, TestJob)>,
    exits: HashMap<Pid, ExitOutcome>,
    signals: Vec<(Pid, Signal)>,
    ignores_sigterm: Vec<Pid>,
    fail_forks: bool,
}

/// Spawner that hands out in-memory pipes instead of forking.
///
/// Processes "exit" when a test says so or when they receive SIGTERM/SIGKILL,
/// unless told to ignore SIGTERM.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn allocate_pid(state: &mut FakeState) -> Pid {
        state.next_pid += 1;
        Pid::from_raw(1000 + state.next_pid)
    }

    pub fn fail_forks(&self, fail: bool) {
        self.state().fail_forks = fail;
    }

    /// Mark `pid` as exited so the next reap sees it.
    pub fn exit(&self, pid: Pid, outcome: ExitOutcome) {
        self.state().exits.insert(pid, outcome);
    }

    /// Make `pid` survive SIGTERM, as a worker stuck in a job would.
    pub fn ignore_sigterm(&self, pid: Pid) {
        self.state().ignores_sigterm.push(pid);
    }

    /// Child end of a permanent unit's job socket.
    pub fn take_child(&self, pid: Pid) -> Option<DuplexStream> {
        self.state().children.remove(&pid)
    }

    pub fn signals(&self) -> Vec<(Pid, Signal)> {
        self.state().signals.clone()
    }

    pub fn ephemeral_jobs(&self) -> Vec<(Pid, String)> {
        self.state()
            .ephemeral
            .iter()
            .map(|(pid, job)| (*pid, job.payload.id.clone()))
            .collect()
    }

    pub fn forks(&self) -> i32 {
        self.state().next_pid
    }
}

impl ProcessSpawner<TestJob> for FakeSpawner {
    fn spawn_permanent(&self, _ttl: Ttl) -> Result<PermanentChannel, SpawnError> {
        let mut state = self.state();
        if state.fail_forks {
            return Err(SpawnError::Other("fork refused".to_string()));
        }
        let pid = Self::allocate_pid(&mut state);
        let (parent, child) = tokio::io::duplex(64 * 1024);
        state.children.insert(pid, child);
        Ok(PermanentChannel {
            pid,
            writer: Box::new(parent),
        })
    }

    fn spawn_ephemeral(&self, job: TestJob) -> Result<Pid, SpawnError> {
        let mut state = self.state();
        if state.fail_forks {
            return Err(SpawnError::Other("fork refused".to_string()));
        }
        let pid = Self::allocate_pid(&mut state);
        state.ephemeral.push((pid, job));
        Ok(pid)
    }

    fn try_reap(&self, pid: Pid) -> Option<ExitOutcome> {
        self.state().exits.remove(&pid)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), SpawnError> {
        let mut state = self.state();
        state.signals.push((pid, signal));
        let ignored = signal == Signal::SIGTERM && state.ignores_sigterm.contains(&pid);
        if matches!(signal, Signal::SIGTERM | Signal::SIGKILL) && !ignored {
            state.exits.insert(pid, ExitOutcome::Signaled(signal));
        }
        Ok(())
    }
}
