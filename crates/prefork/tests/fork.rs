//! End-to-end tests against real forked workers.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use prefork::{
    EventSink, Job, JobError, JobPayload, JobStatus, PoolConfig, PoolContext, PoolEvent,
    QueueConfig, Ttl,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Appends a line per callback to a file, so the parent can see what ran in the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarkerJob {
    payload: JobPayload,
    path: PathBuf,
    fail: bool,
}

impl MarkerJob {
    fn new(id: &str, path: &Path) -> Self {
        Self {
            payload: JobPayload::new(id, "default"),
            path: path.to_path_buf(),
            fail: false,
        }
    }

    fn failing(id: &str, path: &Path) -> Self {
        Self {
            fail: true,
            ..Self::new(id, path)
        }
    }

    fn mark(&self, what: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .unwrap();
        writeln!(file, "{what}:{}", self.payload.id).unwrap();
    }
}

impl Job for MarkerJob {
    fn payload(&self) -> &JobPayload {
        &self.payload
    }

    fn perform(&mut self) -> Result<(), JobError> {
        self.mark("perform");
        if self.fail {
            return Err(JobError::failed("asked to fail"));
        }
        Ok(())
    }

    fn fail(&mut self, _error: &JobError) {
        self.mark("fail");
    }

    fn update_status(&mut self, status: JobStatus) {
        if status == JobStatus::Complete {
            self.mark("complete");
        }
    }
}

async fn next_outcome(rx: &mut broadcast::Receiver<PoolEvent>) -> PoolEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await.unwrap() {
                event @ (PoolEvent::Done { .. } | PoolEvent::Fail { .. }) => return event,
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for a job outcome")
}

fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_worker_recycles_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");

    let config = PoolConfig::new()
        .with_queue(QueueConfig::new("default", 1))
        .with_prefork_factor(1.0)
        .with_ttl(Ttl::new(2));
    let events = EventSink::default();
    let mut rx = events.subscribe();
    let ctx = PoolContext::current(config, "fork-test").unwrap();
    let pool = prefork::start::<MarkerJob>(ctx, events).unwrap();

    let mut pids = Vec::new();
    for id in ["one", "two", "three"] {
        pool.run(MarkerJob::new(id, &marker)).await.unwrap();
        match next_outcome(&mut rx).await {
            PoolEvent::Done { pid, job, .. } => {
                assert_eq!(job.unwrap().id, id);
                pids.push(pid);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    // Two jobs on the first worker, then its TTL ran out.
    assert_eq!(pids[0], pids[1]);
    assert_ne!(pids[1], pids[2]);
    assert_eq!(
        lines(&marker),
        [
            "perform:one",
            "complete:one",
            "perform:two",
            "complete:two",
            "perform:three",
            "complete:three"
        ]
    );

    pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ephemeral_workers_report_by_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good");
    let bad = dir.path().join("bad");

    let config = PoolConfig::new()
        .with_queue(QueueConfig::new("default", 2))
        .with_ttl(Ttl::new(1));
    let events = EventSink::default();
    let mut rx = events.subscribe();
    let ctx = PoolContext::current(config, "fork-test").unwrap();
    let pool = prefork::start::<MarkerJob>(ctx, events).unwrap();

    let ok = pool.run(MarkerJob::new("ok", &good)).await.unwrap();
    assert!(!ok.permanent);
    pool.run(MarkerJob::failing("nope", &bad)).await.unwrap();

    let mut done = 0;
    let mut failed = 0;
    for _ in 0..2 {
        match next_outcome(&mut rx).await {
            PoolEvent::Done { pid, .. } => {
                assert_eq!(Some(pid), ok.pid);
                done += 1;
            }
            PoolEvent::Fail { .. } => failed += 1,
            _ => unreachable!(),
        }
    }
    assert_eq!((done, failed), (1, 1));

    assert_eq!(lines(&good), ["perform:ok", "complete:ok"]);
    assert_eq!(lines(&bad), ["perform:nope", "fail:nope", "complete:nope"]);

    let snapshot = pool.snapshot().await.unwrap();
    assert!(snapshot.busy.is_empty() && snapshot.idle.is_empty());

    pool.shutdown().await.unwrap();
}
