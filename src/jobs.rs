//! Single-flight background jobs with pollable status.
//!
//! Each [`JobName`] has exactly one [`JobRecord`]. Starting a job flips its
//! record to `running` under the records lock, so two concurrent starts for
//! the same job can never both be accepted. The operation then runs on its
//! own tokio task; the caller of `start` gets an answer immediately and polls
//! [`JobManager::status`] afterwards.
//!
//! When an operation finishes (or panics, or overruns its soft deadline) the
//! manager first invalidates the cache prefixes that job feeds, then writes
//! the terminal state. A client that sees `succeeded` and re-reads at once
//! is therefore guaranteed a cache miss rather than stale data.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::cache::{CacheStore, keys};
use crate::error::{AppError, AppResult};
use crate::models::{JobName, JobRecord, JobState, StartOutcome};

/// Called once with the terminal record of the run it was attached to.
pub type CompletionHook = Box<dyn FnOnce(&JobRecord) + Send + 'static>;

/// The body of a background job.
#[async_trait]
pub trait JobOperation: Send + Sync {
    /// Run to completion. The returned value becomes the record's `result`.
    async fn run(&self) -> AppResult<Value>;
}

/// Cache prefixes that go stale when `job` finishes.
pub fn invalidated_prefixes(job: JobName) -> &'static [&'static str] {
    match job {
        JobName::ScrapeArticles => &[keys::ARTICLES_PREFIX, keys::DASHBOARD_PREFIX],
        JobName::CaptureRadio => &[keys::TRANSCRIPTIONS_PREFIX, keys::DASHBOARD_PREFIX],
        JobName::CreateDigest => &[keys::DIGEST_PREFIX, keys::DASHBOARD_PREFIX],
    }
}

pub struct JobManager {
    records: Mutex<HashMap<JobName, JobRecord>>,
    operations: HashMap<JobName, Arc<dyn JobOperation>>,
    cache: Arc<CacheStore>,
    deadline: Duration,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl JobManager {
    pub fn new(cache: Arc<CacheStore>, deadline: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            operations: HashMap::new(),
            cache,
            deadline,
        }
    }

    /// Register the operation run for `job`, replacing any previous one.
    pub fn register(&mut self, job: JobName, operation: Arc<dyn JobOperation>) {
        info!(%job, "Registered job operation");
        self.operations.insert(job, operation);
    }

    /// Start `job` unless a run is already in flight.
    pub fn start(self: &Arc<Self>, job: JobName) -> StartOutcome {
        self.start_with_hook(job, None)
    }

    /// Start `job` and attach a completion hook to the run.
    ///
    /// The check for a run in flight and the switch to `running` happen
    /// under one lock, so of any number of concurrent calls for the same job
    /// exactly one is accepted. The operation runs on its own task; this
    /// call never waits for it.
    ///
    /// # Arguments
    ///
    /// * `job` - The job to start
    /// * `hook` - Called once with the terminal record, after the job's cache
    ///   prefixes were invalidated. Dropped unused if the start is rejected.
    ///
    /// # Returns
    ///
    /// `accepted: true` with the new run number, or `accepted: false` with a
    /// message naming the run already in progress.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let outcome = manager.start_with_hook(JobName::CreateDigest, Some(Box::new(|record| {
    ///     info!(state = ?record.state, "digest finished");
    /// })));
    /// assert!(outcome.accepted);
    /// ```
    pub fn start_with_hook(self: &Arc<Self>, job: JobName, hook: Option<CompletionHook>) -> StartOutcome {
        let run = {
            let mut records = self.records.lock();
            let record = records.entry(job).or_insert_with(|| JobRecord::idle(job));
            if record.state == JobState::Running {
                let started = record
                    .started_at
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string());
                let message = format!("{job} is already running (run #{}, started {started})", record.run);
                info!(%job, run = record.run, "Start rejected; job already running");
                return StartOutcome {
                    accepted: false,
                    message,
                };
            }

            let run = record.run + 1;
            *record = JobRecord {
                job,
                state: JobState::Running,
                run,
                started_at: Some(Utc::now()),
                finished_at: None,
                result: None,
                error: None,
                result_consumed: false,
            };
            run
        };

        info!(%job, run, "Job started");
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.execute(job, run, hook).await });

        StartOutcome {
            accepted: true,
            message: format!("{job} started (run #{run})"),
        }
    }

    /// Current record of `job`; `idle` if it never ran. Never waits on a
    /// running operation.
    pub fn status(&self, job: JobName) -> JobRecord {
        self.records
            .lock()
            .get(&job)
            .cloned()
            .unwrap_or_else(|| JobRecord::idle(job))
    }

    /// Records of every job, in [`JobName::ALL`] order.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        JobName::ALL.into_iter().map(|job| self.status(job)).collect()
    }

    /// Hand out the result of a finished run once; later calls (and calls
    /// while running) return `None`.
    pub fn acknowledge(&self, job: JobName) -> Option<Value> {
        let mut records = self.records.lock();
        let record = records.get_mut(&job)?;
        if !record.state.is_terminal() || record.result_consumed {
            return None;
        }
        record.result_consumed = true;
        record.result.clone()
    }

    async fn execute(self: Arc<Self>, job: JobName, run: u64, hook: Option<CompletionHook>) {
        let t0 = Instant::now();
        let outcome = self.run_operation(job).await;

        for prefix in invalidated_prefixes(job) {
            self.cache.invalidate(prefix);
        }

        let record = {
            let mut records = self.records.lock();
            let record = records.entry(job).or_insert_with(|| JobRecord::idle(job));
            record.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    record.state = JobState::Succeeded;
                    record.result = Some(result);
                }
                Err(e) => {
                    record.state = JobState::Failed;
                    record.error = Some(e.to_string());
                }
            }
            record.clone()
        };

        let elapsed_ms = t0.elapsed().as_millis();
        match &record.error {
            None => info!(%job, run, elapsed_ms, "Job succeeded"),
            Some(e) => error!(%job, run, elapsed_ms, error = %e, "Job failed"),
        }

        if let Some(hook) = hook {
            hook(&record);
        }
    }

    /// Run the registered operation on its own task so a panic is reported
    /// as a failure, bounded by the soft deadline.
    async fn run_operation(&self, job: JobName) -> AppResult<Value> {
        let Some(operation) = self.operations.get(&job).cloned() else {
            return Err(AppError::collaborator(format!("no operation registered for {job}")));
        };

        let handle = tokio::spawn(async move { operation.run().await });
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AppError::collaborator(format!(
                "{job} operation aborted: {join_error}"
            ))),
            Err(_) => {
                abort.abort();
                warn!(%job, deadline = ?self.deadline, "Job exceeded its soft deadline");
                Err(AppError::Timeout(format!(
                    "{job} exceeded its soft deadline of {}s",
                    self.deadline.as_secs_f64()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Barrier, Notify};

    /// Blocks until released, then returns `result`.
    struct Gated {
        gate: Arc<Notify>,
        result: Value,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobOperation for Gated {
        async fn run(&self) -> AppResult<Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(self.result.clone())
        }
    }

    struct Failing(&'static str);

    #[async_trait]
    impl JobOperation for Failing {
        async fn run(&self) -> AppResult<Value> {
            Err(AppError::collaborator(self.0))
        }
    }

    struct Sleeping(Duration);

    #[async_trait]
    impl JobOperation for Sleeping {
        async fn run(&self) -> AppResult<Value> {
            tokio::time::sleep(self.0).await;
            Ok(json!({}))
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobOperation for Panicking {
        async fn run(&self) -> AppResult<Value> {
            panic!("parser blew up");
        }
    }

    fn manager_with(job: JobName, op: Arc<dyn JobOperation>, deadline: Duration) -> (Arc<JobManager>, Arc<CacheStore>) {
        let cache = Arc::new(CacheStore::new());
        let mut manager = JobManager::new(Arc::clone(&cache), deadline);
        manager.register(job, op);
        (Arc::new(manager), cache)
    }

    fn gated(result: Value) -> (Arc<Gated>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let op = Arc::new(Gated {
            gate: Arc::clone(&gate),
            result,
            runs: AtomicUsize::new(0),
        });
        (op, gate)
    }

    async fn wait_terminal(manager: &JobManager, job: JobName) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = manager.status(job);
                if record.state.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never reached a terminal state")
    }

    #[test]
    fn test_status_of_never_started_job_is_idle() {
        let manager = JobManager::new(Arc::new(CacheStore::new()), Duration::from_secs(1));
        let record = manager.status(JobName::CaptureRadio);
        assert_eq!(record, JobRecord::idle(JobName::CaptureRadio));
        assert_eq!(manager.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_scrape_run_is_single_flight_and_invalidates_articles() {
        let (op, gate) = gated(json!({ "total_articles": 12 }));
        let (manager, cache) = manager_with(JobName::ScrapeArticles, op.clone(), Duration::from_secs(60));
        let ttl = Duration::from_secs(300);
        cache.set("articles:2025-05-06", json!([]), ttl);
        cache.set("dashboard:stats", json!({}), ttl);
        cache.set("transcriptions:2025-05-06", json!([]), ttl);

        let first = manager.start(JobName::ScrapeArticles);
        assert!(first.accepted);

        let second = manager.start(JobName::ScrapeArticles);
        assert!(!second.accepted);
        assert!(second.message.contains("already running"));
        assert!(second.message.contains("run #1"));

        assert_eq!(manager.status(JobName::ScrapeArticles).state, JobState::Running);

        gate.notify_one();
        let record = wait_terminal(&manager, JobName::ScrapeArticles).await;

        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.result.as_ref().unwrap()["total_articles"], 12);
        assert!(record.finished_at.is_some());
        assert_eq!(cache.get("articles:2025-05-06"), None);
        assert_eq!(cache.get("dashboard:stats"), None);
        assert_eq!(cache.get("transcriptions:2025-05-06"), Some(json!([])));

        // The rejected start was not queued behind the first run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(op.runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(JobName::ScrapeArticles).run, 1);
    }

    #[tokio::test]
    async fn test_read_in_flight_during_job_does_not_recache_stale_value() {
        let (manager, cache) = manager_with(
            JobName::ScrapeArticles,
            Arc::new(Sleeping(Duration::ZERO)),
            Duration::from_secs(60),
        );
        let loading = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let reader = {
            let cache = Arc::clone(&cache);
            let loading = Arc::clone(&loading);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                cache
                    .get_or_load("articles:2025-05-06", Duration::from_secs(300), move || async move {
                        loading.notify_one();
                        release.notified().await;
                        Ok::<Value, AppError>(json!([]))
                    })
                    .await
            })
        };

        // The reader has missed and is reading the pre-job collection.
        loading.notified().await;
        assert!(manager.start(JobName::ScrapeArticles).accepted);
        let record = wait_terminal(&manager, JobName::ScrapeArticles).await;
        assert_eq!(record.state, JobState::Succeeded);

        release.notify_one();
        assert_eq!(reader.await.unwrap().unwrap(), json!([]));

        assert_eq!(cache.get("articles:2025-05-06"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_accept_exactly_one() {
        for job in JobName::ALL {
            let (op, gate) = gated(json!({}));
            let (manager, _cache) = manager_with(job, op, Duration::from_secs(60));
            let barrier = Arc::new(Barrier::new(16));

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        manager.start(job).accepted
                    })
                })
                .collect();

            let mut accepted = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 1, "{job}");
            gate.notify_one();
            wait_terminal(&manager, job).await;
        }
    }

    #[tokio::test]
    async fn test_restart_after_terminal_is_accepted() {
        let (op, gate) = gated(json!({ "n": 1 }));
        let (manager, _cache) = manager_with(JobName::CreateDigest, op, Duration::from_secs(60));

        assert!(manager.start(JobName::CreateDigest).accepted);
        gate.notify_one();
        wait_terminal(&manager, JobName::CreateDigest).await;

        let outcome = manager.start(JobName::CreateDigest);
        assert!(outcome.accepted);
        assert!(outcome.message.contains("run #2"));
        let record = manager.status(JobName::CreateDigest);
        assert_eq!(record.state, JobState::Running);
        assert!(record.result.is_none());
        gate.notify_one();
        assert_eq!(wait_terminal(&manager, JobName::CreateDigest).await.run, 2);
    }

    #[tokio::test]
    async fn test_collaborator_error_is_stored_verbatim() {
        let (manager, _cache) = manager_with(
            JobName::CaptureRadio,
            Arc::new(Failing("stream kxyz returned 502")),
            Duration::from_secs(60),
        );

        assert!(manager.start(JobName::CaptureRadio).accepted);
        let record = wait_terminal(&manager, JobName::CaptureRadio).await;

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("collaborator error: stream kxyz returned 502")
        );
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn test_soft_deadline_marks_job_failed() {
        let (manager, cache) = manager_with(
            JobName::ScrapeArticles,
            Arc::new(Sleeping(Duration::from_secs(60))),
            Duration::from_millis(50),
        );
        cache.set("articles:2025-05-06", json!([]), Duration::from_secs(300));

        assert!(manager.start(JobName::ScrapeArticles).accepted);
        let record = wait_terminal(&manager, JobName::ScrapeArticles).await;

        assert_eq!(record.state, JobState::Failed);
        assert!(record.error.unwrap().starts_with("timeout:"));
        assert_eq!(cache.get("articles:2025-05-06"), None);
    }

    #[tokio::test]
    async fn test_panicking_operation_is_a_failure() {
        let (manager, _cache) = manager_with(JobName::CreateDigest, Arc::new(Panicking), Duration::from_secs(60));

        assert!(manager.start(JobName::CreateDigest).accepted);
        let record = wait_terminal(&manager, JobName::CreateDigest).await;
        assert_eq!(record.state, JobState::Failed);

        // The job can run again afterwards.
        assert!(manager.start(JobName::CreateDigest).accepted);
    }

    #[tokio::test]
    async fn test_unregistered_job_fails_its_run() {
        let manager = Arc::new(JobManager::new(Arc::new(CacheStore::new()), Duration::from_secs(1)));
        assert!(manager.start(JobName::CaptureRadio).accepted);
        let record = wait_terminal(&manager, JobName::CaptureRadio).await;
        assert!(record.error.unwrap().contains("no operation registered"));
    }

    #[tokio::test]
    async fn test_hook_receives_terminal_record() {
        let (op, gate) = gated(json!({ "ok": true }));
        let (manager, _cache) = manager_with(JobName::CreateDigest, op, Duration::from_secs(60));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let hook: CompletionHook = Box::new(move |record: &JobRecord| {
            let _ = tx.send(record.clone());
        });
        assert!(manager.start_with_hook(JobName::CreateDigest, Some(hook)).accepted);
        gate.notify_one();

        let record = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.result, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_acknowledge_hands_out_result_once() {
        let (op, gate) = gated(json!({ "total_transcriptions": 4 }));
        let (manager, _cache) = manager_with(JobName::CaptureRadio, op, Duration::from_secs(60));

        assert!(manager.start(JobName::CaptureRadio).accepted);
        assert_eq!(manager.acknowledge(JobName::CaptureRadio), None);

        gate.notify_one();
        wait_terminal(&manager, JobName::CaptureRadio).await;

        assert_eq!(
            manager.acknowledge(JobName::CaptureRadio),
            Some(json!({ "total_transcriptions": 4 }))
        );
        assert_eq!(manager.acknowledge(JobName::CaptureRadio), None);
        assert!(manager.status(JobName::CaptureRadio).result_consumed);
    }
}
