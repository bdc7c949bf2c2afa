//! Task scheduler
//!
//! Each enabled task gets one runner loop: sleep until the next fire,
//! run the action to completion, then compute the next delay. Stopping or
//! disabling a task flips its watch channel, which ends the sleep early.
//! An action that is already running is left to finish.

#[cfg(test)]
mod tests;

use crate::error::{DaemonError, Result};
use crate::schedule::{parse_schedule, Schedule};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors kept per task
pub const MAX_TASK_ERRORS: usize = 10;

/// Async body of a task
pub type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Definition passed to [`Scheduler::add_task`]
pub struct TaskSpec {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub run_immediately: bool,
    action: TaskAction,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: impl Into<String>, schedule: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            enabled: true,
            run_immediately: false,
            action: Arc::new(move || action().boxed()),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn run_immediately(mut self, run_immediately: bool) -> Self {
        self.run_immediately = run_immediately;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Scheduled,
    Running,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Read-only copy of a task's bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub state: TaskState,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub recent_errors: Vec<TaskError>,
}

struct Timer {
    cancel: watch::Sender<bool>,
    // Detached on cancel so an in-flight action can finish
    _handle: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        let _ = self.cancel.send(true);
    }
}

struct TaskEntry {
    schedule: Schedule,
    enabled: bool,
    run_immediately: bool,
    running: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    run_count: u64,
    errors: VecDeque<TaskError>,
    action: TaskAction,
    timer: Option<Timer>,
}

impl TaskEntry {
    fn state(&self) -> TaskState {
        if !self.enabled {
            TaskState::Disabled
        } else if self.running {
            TaskState::Running
        } else if self.timer.is_some() {
            TaskState::Scheduled
        } else {
            TaskState::Idle
        }
    }

    fn snapshot(&self, name: &str) -> TaskSnapshot {
        TaskSnapshot {
            name: name.to_string(),
            schedule: self.schedule.to_string(),
            enabled: self.enabled,
            state: self.state(),
            last_run: self.last_run,
            next_run: self.next_run,
            run_count: self.run_count,
            recent_errors: self.errors.iter().cloned().collect(),
        }
    }

    fn record_error(&mut self, message: String) {
        if self.errors.len() >= MAX_TASK_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(TaskError {
            at: Utc::now(),
            message,
        });
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.next_run = None;
    }
}

struct SchedulerInner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    running: AtomicBool,
}

/// Named tasks on interval or cron schedules
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a task. Armed at once when the scheduler is already running.
    pub fn add_task(&self, spec: TaskSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(DaemonError::InvalidTask("task name is required".into()));
        }
        if spec.schedule.trim().is_empty() {
            return Err(DaemonError::InvalidTask(format!(
                "task '{}' has no schedule",
                spec.name
            )));
        }
        let schedule = parse_schedule(&spec.schedule)?;

        {
            let mut tasks = self.inner.tasks.lock();
            if tasks.contains_key(&spec.name) {
                return Err(DaemonError::InvalidTask(format!(
                    "task '{}' already exists",
                    spec.name
                )));
            }
            tasks.insert(
                spec.name.clone(),
                TaskEntry {
                    schedule,
                    enabled: spec.enabled,
                    run_immediately: spec.run_immediately,
                    running: false,
                    last_run: None,
                    next_run: None,
                    run_count: 0,
                    errors: VecDeque::new(),
                    action: spec.action,
                    timer: None,
                },
            );
        }

        debug!("Task '{}' added ({})", spec.name, spec.schedule);
        if spec.enabled && self.is_running() {
            arm(&self.inner, &spec.name);
        }
        Ok(())
    }

    /// Remove a task and cancel its timer
    pub fn remove_task(&self, name: &str) -> Result<()> {
        let mut entry = self
            .inner
            .tasks
            .lock()
            .remove(name)
            .ok_or_else(|| DaemonError::TaskNotFound(name.to_string()))?;
        entry.disarm();
        debug!("Task '{}' removed", name);
        Ok(())
    }

    pub fn enable_task(&self, name: &str) -> Result<()> {
        {
            let mut tasks = self.inner.tasks.lock();
            let task = tasks
                .get_mut(name)
                .ok_or_else(|| DaemonError::TaskNotFound(name.to_string()))?;
            if task.enabled {
                return Ok(());
            }
            task.enabled = true;
        }
        if self.is_running() {
            arm(&self.inner, name);
        }
        Ok(())
    }

    pub fn disable_task(&self, name: &str) -> Result<()> {
        let mut tasks = self.inner.tasks.lock();
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| DaemonError::TaskNotFound(name.to_string()))?;
        task.enabled = false;
        task.disarm();
        Ok(())
    }

    pub fn get_task(&self, name: &str) -> Option<TaskSnapshot> {
        self.inner.tasks.lock().get(name).map(|t| t.snapshot(name))
    }

    /// Snapshots sorted by name
    pub fn get_all_tasks(&self) -> Vec<TaskSnapshot> {
        let tasks = self.inner.tasks.lock();
        let mut snapshots: Vec<TaskSnapshot> =
            tasks.iter().map(|(name, t)| t.snapshot(name)).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Run immediate tasks, then arm a timer for every enabled task
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut immediate: Vec<String> = self
            .inner
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.enabled && t.run_immediately)
            .map(|(name, _)| name.clone())
            .collect();
        immediate.sort();

        for name in &immediate {
            // Failures are already recorded on the task
            let _ = fire(&self.inner, name).await;
        }

        // An immediate run may have stopped us
        if !self.is_running() {
            return Ok(());
        }

        let names: Vec<String> = self
            .inner
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.enabled && t.timer.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            arm(&self.inner, name);
        }

        info!("Scheduler started with {} active task(s)", names.len());
        Ok(())
    }

    /// Cancel every timer. Task bookkeeping is kept.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().values_mut() {
            task.disarm();
        }
        info!("Scheduler stopped");
    }

    /// Run a task now, outside its timer, and return the action's result
    pub async fn run_now(&self, name: &str) -> Result<()> {
        fire(&self.inner, name).await
    }
}

/// Compute the first delay, record `next_run` and spawn the runner loop.
///
/// A task whose action is still in flight is re-armed by `fire` once the
/// action settles, so two loops never drive the same task.
fn arm(inner: &Arc<SchedulerInner>, name: &str) {
    let mut tasks = inner.tasks.lock();
    let Some(task) = tasks.get_mut(name) else {
        return;
    };
    if !task.enabled || task.running {
        return;
    }
    task.disarm();

    let Some(delay) = next_delay(task, name) else {
        return;
    };
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(run_loop(inner.clone(), name.to_string(), rx, delay));
    task.timer = Some(Timer {
        cancel: tx,
        _handle: handle,
    });
}

/// Next delay for `task`, with `next_run` updated. A schedule that cannot be
/// evaluated is recorded as an error and leaves the task unarmed.
fn next_delay(task: &mut TaskEntry, name: &str) -> Option<Duration> {
    let now = Utc::now();
    match task.schedule.next_delay(now) {
        Ok(delay) => {
            task.next_run = chrono::Duration::from_std(delay).ok().map(|d| now + d);
            Some(delay)
        }
        Err(e) => {
            warn!("Task '{}' cannot be scheduled: {}", name, e);
            task.record_error(e.to_string());
            task.next_run = None;
            task.timer = None;
            None
        }
    }
}

async fn run_loop(
    inner: Arc<SchedulerInner>,
    name: String,
    mut cancel: watch::Receiver<bool>,
    mut delay: Duration,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // Either a cancel signal or the sender was dropped
            _ = cancel.changed() => return,
        }

        if *cancel.borrow() {
            return;
        }
        let _ = fire(&inner, &name).await;
        if *cancel.borrow() {
            return;
        }

        delay = {
            let mut tasks = inner.tasks.lock();
            let Some(task) = tasks.get_mut(&name) else {
                return;
            };
            match next_delay(task, &name) {
                Some(next) => next,
                None => return,
            }
        };
    }
}

async fn fire(inner: &Arc<SchedulerInner>, name: &str) -> Result<()> {
    let action = {
        let mut tasks = inner.tasks.lock();
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| DaemonError::TaskNotFound(name.to_string()))?;
        task.last_run = Some(Utc::now());
        task.run_count += 1;
        task.running = true;
        task.action.clone()
    };

    let result = action().await;

    let rearm = match inner.tasks.lock().get_mut(name) {
        Some(task) => {
            task.running = false;
            if let Err(e) = &result {
                task.record_error(e.to_string());
            }
            task.enabled && task.timer.is_none()
        }
        None => false,
    };
    // Re-enabled while this run was in flight
    if rearm && inner.running.load(Ordering::SeqCst) {
        arm(inner, name);
    }
    if let Err(e) = &result {
        warn!("Task '{}' failed: {}", name, e);
    }
    result
}
