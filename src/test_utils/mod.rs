//! Shared helpers for pool tests: canned handlers and an observed-order
//! recorder.

use crate::pool::{Builder, Pool};
use crate::task::{SENT_TO_WORKER, Task};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Payload for the canned test handlers; unused fields stay zero.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TestJob {
    pub(crate) a: i64,
    pub(crate) b: i64,
    pub(crate) sleep_ms: u64,
}

pub(crate) fn ping() -> Task<TestJob> {
    Task::new("ping", TestJob::default())
}

pub(crate) fn add(a: i64, b: i64) -> Task<TestJob> {
    Task::new(
        "add",
        TestJob {
            a,
            b,
            ..TestJob::default()
        },
    )
}

pub(crate) fn sleep(sleep_ms: u64) -> Task<TestJob> {
    Task::new(
        "sleep",
        TestJob {
            sleep_ms,
            ..TestJob::default()
        },
    )
}

/// Builder preloaded with every canned handler.
pub(crate) fn test_builder() -> Builder<TestJob, i64> {
    Pool::<TestJob, i64>::builder()
        .handler("ping", |_job, _scope| -> Result<i64> { Ok(0) })
        .handler("add", |job: TestJob, _scope| -> Result<i64> {
            Ok(job.a + job.b)
        })
        .handler("sleep", |job: TestJob, _scope| -> Result<i64> {
            thread::sleep(Duration::from_millis(job.sleep_ms));
            Ok(0)
        })
        .handler("spin", |_job, scope| -> Result<i64> {
            // Busy body that only ever leaves through cooperative abort.
            loop {
                scope.throw_if_aborted()?;
                thread::sleep(Duration::from_millis(1));
            }
        })
        .handler("crash", |_job, _scope| -> Result<i64> {
            panic!("worker blew up")
        })
        .handler("fail", |_job, _scope| -> Result<i64> {
            Err(anyhow!("task says no"))
        })
}

/// Observed-order recorder shared between callbacks and the test body.
#[derive(Clone, Default)]
pub(crate) struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, label: impl Into<String>) {
        self.0.lock().push(label.into());
    }

    pub(crate) fn labels(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Event callback recording `label` when the task is handed to a worker.
pub(crate) fn sent_marker(
    recorder: &Recorder,
    label: &str,
) -> Box<dyn FnMut(&str, Option<&str>) + Send> {
    let recorder = recorder.clone();
    let label = label.to_string();
    Box::new(move |name, _payload| {
        if name == SENT_TO_WORKER {
            recorder.push(label.clone());
        }
    })
}
