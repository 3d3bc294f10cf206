//! Cooperative per-task scheduler.
//!
//! Each registered task loops `Idle → Running → Sleeping → Running → …` until
//! [`Scheduler::stop_all`] moves it to `Stopped`. The stop flag is only checked
//! between cycles, and stopping waits for in-flight cycles to finish.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Sleeping,
    Stopped,
}

/// Handed to the cycle function on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task: String,
    /// Stamped once by [`Scheduler::start_all`] and shared by every task.
    pub started_at: DateTime<Utc>,
    /// 1 for the first cycle of the task.
    pub cycle: u64,
}

pub type CycleFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type CycleFn = Arc<dyn Fn(TaskContext) -> CycleFuture + Send + Sync>;

struct RegisteredTask {
    cycle_fn: CycleFn,
    interval: Duration,
    state: Arc<watch::Sender<TaskState>>,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RegisteredTask {
    fn new(cycle_fn: CycleFn, interval: Duration) -> Self {
        let (state, _) = watch::channel(TaskState::Idle);
        let (stop, _) = watch::channel(false);
        Self {
            cycle_fn,
            interval,
            state: Arc::new(state),
            stop,
            handle: None,
        }
    }

    fn spawn(&mut self, name: &str, started_at: DateTime<Utc>) {
        let runner = TaskRunner {
            name: name.to_string(),
            cycle_fn: Arc::clone(&self.cycle_fn),
            interval: self.interval,
            started_at,
            state: Arc::clone(&self.state),
            stop_rx: self.stop.subscribe(),
        };
        self.handle = Some(tokio::spawn(runner.run()));
    }
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    tasks: BTreeMap<String, RegisteredTask>,
    /// Loops of replaced tasks, still awaited on shutdown.
    retired: Vec<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: BTreeMap::new(),
            retired: Vec::new(),
            started_at: None,
        }
    }

    /// Register `cycle_fn` to run every `interval`, measured from the end of
    /// the previous cycle. An existing task with the same name is replaced;
    /// when the scheduler is already running the new task starts right away.
    pub fn register_task(&mut self, name: impl Into<String>, cycle_fn: CycleFn, interval: Duration) {
        let name = name.into();
        let mut task = RegisteredTask::new(cycle_fn, interval);

        if let Some(mut previous) = self.tasks.remove(&name) {
            warn!(task = %name, "replacing registered task");
            previous.stop.send_replace(true);
            if let Some(handle) = previous.handle.take() {
                self.retired.push(handle);
            }
        }

        if let Some(started_at) = self.started_at {
            task.spawn(&name, started_at);
        }
        info!(task = %name, interval_secs = interval.as_secs(), "registered task");
        self.tasks.insert(name, task);
    }

    /// Start every registered task and return the shared start timestamp.
    /// Calling it again while running is a no-op.
    pub fn start_all(&mut self) -> DateTime<Utc> {
        if let Some(started_at) = self.started_at {
            warn!("scheduler already started");
            return started_at;
        }

        let started_at = self.clock.now();
        self.started_at = Some(started_at);
        for (name, task) in &mut self.tasks {
            task.stop.send_replace(false);
            task.spawn(name, started_at);
        }
        info!(%started_at, tasks = self.tasks.len(), "scheduler started");
        started_at
    }

    /// Ask every task to stop and wait for in-flight cycles to finish.
    pub async fn stop_all(&mut self) {
        for task in self.tasks.values() {
            task.stop.send_replace(true);
        }

        let mut handles = std::mem::take(&mut self.retired);
        for task in self.tasks.values_mut() {
            handles.extend(task.handle.take());
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "task loop ended abnormally");
            }
        }

        self.started_at = None;
        info!("scheduler stopped");
    }

    pub fn list_task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.tasks.get(name).map(|task| *task.state.borrow())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }
}

struct TaskRunner {
    name: String,
    cycle_fn: CycleFn,
    interval: Duration,
    started_at: DateTime<Utc>,
    state: Arc<watch::Sender<TaskState>>,
    stop_rx: watch::Receiver<bool>,
}

impl TaskRunner {
    async fn run(mut self) {
        let mut cycle = 0u64;
        loop {
            if *self.stop_rx.borrow_and_update() {
                break;
            }

            cycle += 1;
            self.state.send_replace(TaskState::Running);
            let ctx = TaskContext {
                task: self.name.clone(),
                started_at: self.started_at,
                cycle,
            };
            // A separate task so a panicking cycle surfaces as a JoinError.
            match tokio::spawn((self.cycle_fn)(ctx)).await {
                Ok(Ok(())) => debug!(task = %self.name, cycle, "cycle completed"),
                Ok(Err(err)) => error!(task = %self.name, cycle, error = ?err, "cycle failed"),
                Err(err) => error!(task = %self.name, cycle, error = %err, "cycle panicked"),
            }

            self.state.send_replace(TaskState::Sleeping);
            let stop_requested = tokio::select! {
                _ = tokio::time::sleep(self.interval) => false,
                // Err means the scheduler is gone, which also ends the loop.
                _ = self.stop_rx.wait_for(|stop| *stop) => true,
            };
            if stop_requested {
                break;
            }
        }

        self.state.send_replace(TaskState::Stopped);
        debug!(task = %self.name, "task stopped");
    }
}
