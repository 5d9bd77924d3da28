//! Daily schedule driving the background jobs.
//!
//! Each [`ScheduledTask`] cycles `waiting → due → dispatched → waiting`.
//! A periodic tick compares the wall clock with every task's `next_run_at`;
//! a due task is dispatched to the [`JobManager`] and its `next_run_at`
//! moves to the first occurrence after the tick, so missed occurrences are
//! never backfilled. The tick does not wait for the job: the outcome is
//! appended to the execution log by a completion hook once the run is
//! terminal. A dispatch rejected because the job is already running is
//! logged as a skip and is not an error.
//!
//! Schedule state lives in memory only; on restart `next_run_at` is derived
//! again from the cron expressions.

use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ScheduleEntry;
use crate::error::{AppError, AppResult};
use crate::jobs::{CompletionHook, JobManager};
use crate::models::{ExecutionLogEntry, JobName, JobRecord, JobState, StartOutcome};
use crate::utils::truncate_for_log;

/// A task as shown to clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub cron_spec: String,
    pub job: JobName,
    /// `None` once the cron expression has no future occurrence.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<ExecutionLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub tasks: Vec<ScheduledTask>,
    /// Most recent entries, oldest first.
    pub history: Vec<ExecutionLogEntry>,
}

/// Bounded execution history; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct ExecutionLog {
    entries: VecDeque<ExecutionLogEntry>,
    capacity: usize,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: ExecutionLogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<ExecutionLogEntry> {
        self.entries.iter().cloned().collect()
    }
}

struct TaskSlot {
    task: ScheduledTask,
    schedule: Schedule,
}

struct SchedulerState {
    tasks: Mutex<Vec<TaskSlot>>,
    log: Mutex<ExecutionLog>,
}

impl SchedulerState {
    fn record(&self, task_id: &str, entry: ExecutionLogEntry) {
        if let Some(slot) = self.tasks.lock().iter_mut().find(|slot| slot.task.id == task_id) {
            slot.task.last_run = Some(entry.clone());
        }
        self.log.lock().push(entry);
    }
}

pub struct Scheduler {
    jobs: Arc<JobManager>,
    state: Arc<SchedulerState>,
    tick_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_interval", &self.tick_interval)
            .field("tasks", &self.state.tasks.lock().len())
            .finish()
    }
}

impl Scheduler {
    /// Register `entries` and derive each task's first `next_run_at`.
    pub fn new(
        jobs: Arc<JobManager>,
        entries: &[ScheduleEntry],
        history_capacity: usize,
        tick_interval: Duration,
    ) -> AppResult<Self> {
        Self::new_at(jobs, entries, history_capacity, tick_interval, Utc::now())
    }

    fn new_at(
        jobs: Arc<JobManager>,
        entries: &[ScheduleEntry],
        history_capacity: usize,
        tick_interval: Duration,
        now: DateTime<Utc>,
    ) -> AppResult<Self> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(AppError::validation(format!("duplicate task id '{}'", entry.id)));
            }
            let schedule = Schedule::from_str(&entry.cron).map_err(|e| {
                AppError::validation(format!("task '{}': invalid cron '{}': {e}", entry.id, entry.cron))
            })?;
            let next_run_at = next_after(&schedule, now);
            info!(task = %entry.id, job = %entry.job, cron = %entry.cron, ?next_run_at, "Registered scheduled task");
            tasks.push(TaskSlot {
                task: ScheduledTask {
                    id: entry.id.clone(),
                    name: entry.name.clone(),
                    cron_spec: entry.cron.clone(),
                    job: entry.job,
                    next_run_at,
                    last_run: None,
                },
                schedule,
            });
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            jobs,
            state: Arc::new(SchedulerState {
                tasks: Mutex::new(tasks),
                log: Mutex::new(ExecutionLog::new(history_capacity)),
            }),
            tick_interval,
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    /// Spawn the tick loop. Calling `start` on a running scheduler is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Scheduler already running");
            return;
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let scheduler = Arc::clone(self);
        info!(tick_interval = ?self.tick_interval, "Scheduler started");

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.tick_at(Utc::now());
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        }));
    }

    /// Stop the tick loop and wait for it to exit. Running jobs are not
    /// affected.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Evaluate one tick at `now`.
    ///
    /// Every task whose `next_run_at` is at or before `now` is dispatched
    /// once, however many occurrences were missed, and its `next_run_at`
    /// moves to the first occurrence after `now`. A rejected dispatch is
    /// appended to the history as a skip; accepted runs are appended by their
    /// completion hook later.
    ///
    /// # Arguments
    ///
    /// * `now` - Wall-clock time of the tick
    ///
    /// # Returns
    ///
    /// The outcome of each dispatch, in task registration order.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let outcomes = scheduler.tick_at(Utc::now());
    /// let skipped = outcomes.iter().filter(|o| !o.accepted).count();
    /// ```
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<StartOutcome> {
        let due: Vec<(String, JobName)> = {
            let mut tasks = self.state.tasks.lock();
            tasks
                .iter_mut()
                .filter(|slot| slot.task.next_run_at.is_some_and(|next| next <= now))
                .map(|slot| {
                    slot.task.next_run_at = next_after(&slot.schedule, now);
                    debug!(task = %slot.task.id, next_run_at = ?slot.task.next_run_at, "Task due");
                    (slot.task.id.clone(), slot.task.job)
                })
                .collect()
        };

        due.into_iter()
            .map(|(task_id, job)| self.dispatch(&task_id, job))
            .collect()
    }

    /// Dispatch a task outside its schedule. Its `next_run_at` is unchanged.
    pub fn run_job_manually(&self, task_id: &str) -> AppResult<StartOutcome> {
        let job = self
            .state
            .tasks
            .lock()
            .iter()
            .find(|slot| slot.task.id == task_id)
            .map(|slot| slot.task.job)
            .ok_or_else(|| AppError::validation(format!("unknown scheduled task '{task_id}'")))?;

        info!(task = %task_id, %job, "Manual dispatch");
        Ok(self.dispatch(task_id, job))
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            tasks: self.tasks(),
            history: self.history(),
        }
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.state
            .tasks
            .lock()
            .iter()
            .map(|slot| slot.task.clone())
            .collect()
    }

    pub fn history(&self) -> Vec<ExecutionLogEntry> {
        self.state.log.lock().entries()
    }

    fn dispatch(&self, task_id: &str, job: JobName) -> StartOutcome {
        let state = Arc::clone(&self.state);
        let hook_task_id = task_id.to_string();
        let hook: CompletionHook = Box::new(move |record: &JobRecord| {
            let entry = ExecutionLogEntry {
                job,
                task_id: Some(hook_task_id.clone()),
                timestamp: record.finished_at.unwrap_or_else(Utc::now),
                success: record.state == JobState::Succeeded,
                skipped: false,
                details: describe_run(record),
            };
            state.record(&hook_task_id, entry);
        });

        let outcome = self.jobs.start_with_hook(job, Some(hook));
        if outcome.accepted {
            info!(task = %task_id, %job, "Dispatched scheduled job");
        } else {
            info!(task = %task_id, %job, reason = %outcome.message, "Skipped tick; job already running");
            self.state.record(
                task_id,
                ExecutionLogEntry {
                    job,
                    task_id: Some(task_id.to_string()),
                    timestamp: Utc::now(),
                    success: false,
                    skipped: true,
                    details: format!("skipped: {}", outcome.message),
                },
            );
        }
        outcome
    }
}

/// First occurrence of `schedule` strictly after `after`, evaluated in local
/// time.
fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&Local))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

fn describe_run(record: &JobRecord) -> String {
    match (&record.state, &record.error, &record.result) {
        (JobState::Failed, Some(error), _) => format!("run #{} failed: {error}", record.run),
        (_, _, Some(result)) => format!(
            "run #{} {}: {}",
            record.run,
            if record.state == JobState::Succeeded { "succeeded" } else { "finished" },
            truncate_for_log(&result.to_string(), 200)
        ),
        _ => format!("run #{} finished as {:?}", record.run, record.state),
    }
}
