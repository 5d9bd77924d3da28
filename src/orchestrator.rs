//! Wiring and the read surface used by clients.
//!
//! [`Orchestrator`] owns one of each component: the cache, the job manager,
//! the scheduler, the store and the digest builder. It is built once from a
//! [`DigestConfig`] and the three collaborators, then shared by reference.
//! Every read method returns serde-serializable values so a front end can
//! hand them out as JSON unchanged.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::cache::{CacheStats, CacheStore, keys};
use crate::config::{CacheTtls, DigestConfig};
use crate::digest::DigestBuilder;
use crate::error::AppResult;
use crate::jobs::JobManager;
use crate::models::{Article, DigestDocument, JobName, JobRecord, StartOutcome, Transcription};
use crate::operations::{CaptureRadioOp, CreateDigestOp, ScrapeArticlesOp};
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::scrapers::{ArticleSource, RadioSource};
use crate::store::{DigestStore, StoreTotals};
use crate::utils::{parse_date, today};

/// Headline numbers for the dashboard.
///
/// Everything except `cache` is served from the `dashboard:stats` entry;
/// `cache` is recomputed on every call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DashboardStats {
    pub date: NaiveDate,
    pub today_articles: usize,
    pub today_transcriptions: usize,
    pub digest_ready: bool,
    pub totals: StoreTotals,
    pub cache: CacheStats,
    pub generated_at: DateTime<Utc>,
}

/// Everything the `status` command prints.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusReport {
    pub dashboard: DashboardStats,
    pub jobs: Vec<JobRecord>,
    pub scheduler: SchedulerStatus,
}

pub struct Orchestrator {
    cache: Arc<CacheStore>,
    jobs: Arc<JobManager>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn DigestStore>,
    digest: Arc<DigestBuilder>,
    ttls: CacheTtls,
}

impl Orchestrator {
    /// Wire every component. The scheduler is registered but not started.
    pub fn init(
        config: &DigestConfig,
        store: Arc<dyn DigestStore>,
        articles: Arc<dyn ArticleSource>,
        radio: Arc<dyn RadioSource>,
    ) -> AppResult<Self> {
        let cache = Arc::new(CacheStore::new());
        let digest = Arc::new(DigestBuilder::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            config.cache.clone(),
        ));

        let mut jobs = JobManager::new(Arc::clone(&cache), config.job_deadline());
        jobs.register(
            JobName::ScrapeArticles,
            Arc::new(ScrapeArticlesOp::new(articles, Arc::clone(&store))),
        );
        jobs.register(
            JobName::CaptureRadio,
            Arc::new(CaptureRadioOp::new(radio, Arc::clone(&store))),
        );
        jobs.register(
            JobName::CreateDigest,
            Arc::new(CreateDigestOp::new(Arc::clone(&digest))),
        );
        let jobs = Arc::new(jobs);

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&jobs),
            &config.schedule,
            config.history_capacity,
            config.tick_interval(),
        )?);

        info!(
            tasks = config.schedule.len(),
            deadline = ?config.job_deadline(),
            "Orchestrator initialised"
        );
        Ok(Self {
            cache,
            jobs,
            scheduler,
            store,
            digest,
            ttls: config.cache.clone(),
        })
    }

    pub fn start_scheduler(&self) {
        self.scheduler.start();
    }

    /// Stop the scheduler loop. Jobs already running finish on their own.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        info!("Orchestrator shut down");
    }

    #[instrument(level = "info", skip_all)]
    pub async fn dashboard(&self) -> AppResult<DashboardStats> {
        let mut stats = self
            .cache
            .get_or_load(&keys::dashboard_stats(), self.ttls.dashboard(), || {
                self.compute_dashboard()
            })
            .await?;
        stats.cache = self.cache.stats();
        Ok(stats)
    }

    async fn compute_dashboard(&self) -> AppResult<DashboardStats> {
        let date = today();
        let (articles, transcriptions, digest, totals) = tokio::try_join!(
            self.digest.articles_for(date),
            self.digest.transcriptions_for(date),
            self.digest.digest_for(date),
            self.store.totals(),
        )?;
        Ok(DashboardStats {
            date,
            today_articles: articles.len(),
            today_transcriptions: transcriptions.len(),
            digest_ready: digest.is_some(),
            totals,
            cache: self.cache.stats(),
            generated_at: Utc::now(),
        })
    }

    /// Articles stored for a `YYYY-MM-DD` date.
    pub async fn articles_for(&self, date: &str) -> AppResult<Vec<Article>> {
        self.digest.articles_for(parse_date(date)?).await
    }

    pub async fn transcriptions_for(&self, date: &str) -> AppResult<Vec<Transcription>> {
        self.digest.transcriptions_for(parse_date(date)?).await
    }

    pub async fn digest_for(&self, date: &str) -> AppResult<Option<DigestDocument>> {
        self.digest.digest_for(parse_date(date)?).await
    }

    /// Build the digest for `date` in the foreground, bypassing the job
    /// manager. Used by the `digest --date` command.
    pub async fn build_digest(&self, date: NaiveDate) -> AppResult<DigestDocument> {
        let doc = self.digest.build_for_date(date).await?;
        self.cache.invalidate(keys::DASHBOARD_PREFIX);
        Ok(doc)
    }

    /// Start a job by name. An unknown name is a validation error; a job
    /// that is already running comes back as `accepted: false`.
    pub fn trigger(&self, job: &str) -> AppResult<StartOutcome> {
        let job: JobName = job.parse()?;
        Ok(self.jobs.start(job))
    }

    pub fn job_status(&self, job: &str) -> AppResult<JobRecord> {
        let job: JobName = job.parse()?;
        Ok(self.jobs.status(job))
    }

    /// The result of the job's last finished run, handed out once.
    pub fn acknowledge(&self, job: &str) -> AppResult<Option<Value>> {
        let job: JobName = job.parse()?;
        Ok(self.jobs.acknowledge(job))
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.snapshot()
    }

    pub fn run_task(&self, task_id: &str) -> AppResult<StartOutcome> {
        self.scheduler.run_job_manually(task_id)
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub async fn status_report(&self) -> AppResult<StatusReport> {
        Ok(StatusReport {
            dashboard: self.dashboard().await?,
            jobs: self.jobs(),
            scheduler: self.scheduler_status(),
        })
    }

    /// Drop every cached entry across all domains.
    pub fn invalidate_cache(&self) -> usize {
        let removed = self.cache.invalidate_all();
        info!(removed, "Cache cleared");
        removed
    }
}
