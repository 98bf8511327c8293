//! Job Manager
//!
//! Runs analyses on a bounded worker pool.
//!
//! # Admission
//! - A hash already in the [`ReportStore`] returns the stored report; nothing runs
//! - A hash already in flight attaches the caller to the running job
//! - Otherwise a job is created if fewer than `queue_capacity` jobs are in flight, and
//!   fails with `PoolSaturated` if not
//!
//! # Execution
//! Each job waits for a semaphore permit (`Queued`), then runs the pipeline on the
//! blocking pool (`Running{stage}`). The wall-clock budget starts when the permit is
//! granted. Cancellation and the budget are observed at stage boundaries; the waiting
//! task also stops waiting immediately, and no partial report is ever stored.

use crate::config::EngineConfig;
use crate::engine::compliance::RulesetStore;
use crate::engine::error::{AnalysisError, ErrorCategory};
use crate::engine::pipeline::{Checkpoint, Pipeline, Stage};
use crate::engine::report::{content_hash, AnalysisReport};
use crate::engine::store::ReportStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};

/// Finished jobs kept for status queries.
const RETAINED_JOBS: usize = 4096;

pub type JobId = u64;

/// Lifecycle state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running { stage: Stage },
    Completed { content_hash: String },
    Failed {
        code: String,
        category: ErrorCategory,
        message: String,
    },
    Cancelled,
}

impl JobStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    fn from_outcome(outcome: &Result<Arc<AnalysisReport>, AnalysisError>) -> Self {
        match outcome {
            Ok(report) => JobStatus::Completed {
                content_hash: report.content_hash.clone(),
            },
            Err(AnalysisError::Cancelled) => JobStatus::Cancelled,
            Err(err) => JobStatus::Failed {
                code: err.code().to_string(),
                category: err.category(),
                message: err.public_message(),
            },
        }
    }
}

/// Serializable view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub content_hash: String,
    pub file_name: Option<String>,
    pub status: JobStatus,
}

/// One submitted analysis.
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    pub content_hash: String,
    pub file_name: Option<String>,
    status: watch::Sender<JobStatus>,
    cancel: watch::Sender<bool>,
    deadline: Mutex<Option<(Instant, Duration)>>,
    /// Names of later submissions that attached to this job
    aliases: Mutex<Vec<String>>,
    outcome: OnceLock<Result<Arc<AnalysisReport>, AnalysisError>>,
}

impl JobHandle {
    fn new(id: JobId, content_hash: String, file_name: Option<String>) -> Self {
        Self {
            id,
            content_hash,
            file_name,
            status: watch::Sender::new(JobStatus::Queued),
            cancel: watch::Sender::new(false),
            deadline: Mutex::new(None),
            aliases: Mutex::new(Vec::new()),
            outcome: OnceLock::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            content_hash: self.content_hash.clone(),
            file_name: self.file_name.clone(),
            status: self.status(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Request cancellation. Returns `false` if the job has already finished.
    pub fn cancel(&self) -> bool {
        if self.status.borrow().is_terminal() {
            return false;
        }
        log::info!("Job {} cancellation requested", self.id);
        self.cancel.send_replace(true);
        true
    }

    /// Wait for the job to finish.
    ///
    /// # Errors
    /// The error that ended the job: `Cancelled`, `AnalysisTimeout`, or a pipeline error
    pub async fn wait(&self) -> Result<Arc<AnalysisReport>, AnalysisError> {
        let mut status = self.status.subscribe();
        if status.wait_for(JobStatus::is_terminal).await.is_err() {
            return Err(AnalysisError::internal(format!("job {} status channel closed", self.id)));
        }
        match self.outcome.get() {
            Some(outcome) => outcome.clone(),
            None => Err(AnalysisError::internal(format!("job {} finished without an outcome", self.id))),
        }
    }

    async fn cancelled(&self) {
        let mut cancel = self.cancel.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }

    fn start_clock(&self, budget: Duration) {
        *self.deadline.lock() = Some((Instant::now() + budget, budget));
    }

    fn add_alias(&self, name: Option<String>) {
        if let Some(name) = name {
            if self.file_name.as_ref() != Some(&name) {
                self.aliases.lock().push(name);
            }
        }
    }

    fn finish(&self, outcome: Result<Arc<AnalysisReport>, AnalysisError>) {
        let status: JobStatus = JobStatus::from_outcome(&outcome);
        let _ = self.outcome.set(outcome);
        log::info!("Job {} -> {:?}", self.id, status);
        self.status.send_replace(status);
    }
}

impl Checkpoint for JobHandle {
    fn enter(&self, stage: Stage) -> Result<(), AnalysisError> {
        if self.is_cancelled() {
            log::info!("Job {} cancelled before {} stage", self.id, stage);
            return Err(AnalysisError::Cancelled);
        }
        if let Some((deadline, budget)) = *self.deadline.lock() {
            if Instant::now() >= deadline {
                return Err(AnalysisError::AnalysisTimeout { budget });
            }
        }
        log::info!("Job {} entering {} stage", self.id, stage);
        self.status.send_replace(JobStatus::Running { stage });
        Ok(())
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Identical bytes were analyzed before
    Cached(Arc<AnalysisReport>),
    /// Identical bytes are being analyzed; the caller shares that job
    Attached(Arc<JobHandle>),
    Started(Arc<JobHandle>),
}

impl Submission {
    pub fn job(&self) -> Option<&Arc<JobHandle>> {
        match self {
            Submission::Cached(_) => None,
            Submission::Attached(job) | Submission::Started(job) => Some(job),
        }
    }

    /// Wait for the report.
    pub async fn report(&self) -> Result<Arc<AnalysisReport>, AnalysisError> {
        match self {
            Submission::Cached(report) => Ok(Arc::clone(report)),
            Submission::Attached(job) | Submission::Started(job) => job.wait().await,
        }
    }
}

/// Observer of newly completed reports.
pub trait ReportListener: Send + Sync {
    fn report_ready(&self, report: &Arc<AnalysisReport>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub timeout: Duration,
}

impl From<&EngineConfig> for JobOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            timeout: config.job_timeout(),
        }
    }
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Arc<JobHandle>>,
    /// Content hash → job currently analyzing it
    in_flight: HashMap<String, JobId>,
}

pub struct JobManager {
    pipeline: Arc<Pipeline>,
    rulesets: Arc<RulesetStore>,
    store: Arc<ReportStore>,
    permits: Arc<Semaphore>,
    options: JobOptions,
    next_id: AtomicU64,
    table: Mutex<JobTable>,
    listeners: Vec<Arc<dyn ReportListener>>,
}

impl JobManager {
    pub fn new(
        options: JobOptions,
        pipeline: Arc<Pipeline>,
        rulesets: Arc<RulesetStore>,
        store: Arc<ReportStore>,
    ) -> Self {
        let workers: usize = options.workers.max(1);
        log::info!(
            "Job pool: {} workers, queue capacity {}, timeout {}s",
            workers,
            options.queue_capacity,
            options.timeout.as_secs()
        );
        Self {
            pipeline,
            rulesets,
            store,
            permits: Arc::new(Semaphore::new(workers)),
            options: JobOptions { workers, ..options },
            next_id: AtomicU64::new(1),
            table: Mutex::new(JobTable::default()),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ReportListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn store(&self) -> &Arc<ReportStore> {
        &self.store
    }

    pub fn rulesets(&self) -> &Arc<RulesetStore> {
        &self.rulesets
    }

    /// Submit an image for analysis. Must be called within a tokio runtime.
    ///
    /// # Arguments
    /// * `data` - Complete input file
    /// * `file_name` - Optional name hint
    ///
    /// # Returns
    /// `Result<Submission, AnalysisError>` - cached report, attached job or new job
    ///
    /// # Errors
    /// Returns `PoolSaturated` when `queue_capacity` jobs are already in flight
    pub fn submit(self: &Arc<Self>, data: Arc<[u8]>, file_name: Option<String>) -> Result<Submission, AnalysisError> {
        let hash: String = content_hash(&data);
        self.submit_hashed(data, hash, file_name)
    }

    /// Submit an image whose content hash the caller already computed.
    ///
    /// `hash` must be [`content_hash`] of `data`.
    pub fn submit_hashed(
        self: &Arc<Self>,
        data: Arc<[u8]>,
        hash: String,
        file_name: Option<String>,
    ) -> Result<Submission, AnalysisError> {
        if let Some(report) = self.cached(&hash, file_name.as_deref()) {
            log::info!("Report {} served from store", hash);
            return Ok(Submission::Cached(report));
        }

        let job: Arc<JobHandle> = {
            let mut table = self.table.lock();
            // a job may have completed since the first lookup; completion stores the
            // report before leaving the in-flight map
            if let Some(report) = self.cached(&hash, file_name.as_deref()) {
                return Ok(Submission::Cached(report));
            }
            if let Some(job) = table.in_flight.get(&hash).and_then(|id| table.jobs.get(id)) {
                log::info!("Submission of {} attached to job {}", hash, job.id);
                job.add_alias(file_name);
                return Ok(Submission::Attached(Arc::clone(job)));
            }
            if table.in_flight.len() >= self.options.queue_capacity {
                log::warn!("Rejecting {}: {} jobs in flight", hash, table.in_flight.len());
                return Err(AnalysisError::PoolSaturated {
                    capacity: self.options.queue_capacity,
                });
            }

            let id: JobId = self.next_id.fetch_add(1, Ordering::Relaxed);
            let job = Arc::new(JobHandle::new(id, hash.clone(), file_name));
            table.in_flight.insert(hash, id);
            table.jobs.insert(id, Arc::clone(&job));
            Self::prune(&mut table);
            job
        };
        log::info!("Job {} queued for {}", job.id, job.content_hash);

        let manager: Arc<JobManager> = Arc::clone(self);
        let task_job: Arc<JobHandle> = Arc::clone(&job);
        tokio::spawn(async move {
            let outcome = manager.execute(&task_job, data).await;
            manager.complete(&task_job, outcome);
        });
        Ok(Submission::Started(job))
    }

    /// Stored report for `hash`, indexed under `file_name` as well.
    fn cached(&self, hash: &str, file_name: Option<&str>) -> Option<Arc<AnalysisReport>> {
        let report: Arc<AnalysisReport> = self.store.get(hash)?;
        if let Some(name) = file_name {
            self.store.alias(name, hash);
        }
        Some(report)
    }

    pub fn job(&self, id: JobId) -> Option<Arc<JobHandle>> {
        self.table.lock().jobs.get(&id).cloned()
    }

    /// Cancel a job. `None` if the id is unknown, `Some(false)` if it already finished.
    pub fn cancel(&self, id: JobId) -> Option<bool> {
        self.job(id).map(|job| job.cancel())
    }

    /// Jobs currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.table.lock().in_flight.len()
    }

    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    async fn execute(&self, job: &Arc<JobHandle>, data: Arc<[u8]>) -> Result<Arc<AnalysisReport>, AnalysisError> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| AnalysisError::internal("worker pool closed"))?
            }
            _ = job.cancelled() => return Err(AnalysisError::Cancelled),
        };
        if job.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let budget: Duration = self.options.timeout;
        job.start_clock(budget);
        let pipeline: Arc<Pipeline> = Arc::clone(&self.pipeline);
        let ruleset = self.rulesets.snapshot();
        let worker: Arc<JobHandle> = Arc::clone(job);
        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            pipeline.run(data, worker.file_name.as_deref(), &ruleset, worker.as_ref())
        });

        let report = tokio::select! {
            joined = tokio::time::timeout(budget, work) => match joined {
                Err(_) => {
                    log::warn!("Job {} exceeded its {}s budget", job.id, budget.as_secs());
                    return Err(AnalysisError::AnalysisTimeout { budget });
                }
                Ok(Err(join_error)) => {
                    log::error!("Job {} worker failed: {}", job.id, join_error);
                    return Err(AnalysisError::internal(join_error.to_string()));
                }
                Ok(Ok(result)) => result?,
            },
            _ = job.cancelled() => return Err(AnalysisError::Cancelled),
        };
        Ok(self.store.insert(report))
    }

    fn complete(&self, job: &Arc<JobHandle>, outcome: Result<Arc<AnalysisReport>, AnalysisError>) {
        if let Err(err) = &outcome {
            match err.category() {
                ErrorCategory::InternalFault => log::error!("Job {} failed: {}", job.id, err),
                ErrorCategory::Cancelled => {}
                _ => log::warn!("Job {} failed: {}", job.id, err),
            }
        }
        {
            let mut table = self.table.lock();
            if table.in_flight.get(&job.content_hash) == Some(&job.id) {
                table.in_flight.remove(&job.content_hash);
            }
            // no submission can attach once the job has left the in-flight map
            let aliases: Vec<String> = std::mem::take(&mut *job.aliases.lock());
            if outcome.is_ok() {
                for name in aliases.iter() {
                    self.store.alias(name, &job.content_hash);
                }
            }
        }
        if let Ok(report) = &outcome {
            for listener in self.listeners.iter() {
                listener.report_ready(report);
            }
        }
        job.finish(outcome);
    }

    /// Drop the oldest finished jobs beyond the retention limit.
    fn prune(table: &mut JobTable) {
        if table.jobs.len() <= RETAINED_JOBS {
            return;
        }
        let mut finished: Vec<JobId> = table
            .jobs
            .iter()
            .filter(|(_, job)| job.status.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        finished.sort_unstable();
        let excess: usize = table.jobs.len() - RETAINED_JOBS;
        for id in finished.into_iter().take(excess) {
            table.jobs.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compliance::Ruleset;

    fn manager(workers: usize, queue_capacity: usize, timeout: Duration) -> Arc<JobManager> {
        Arc::new(JobManager::new(
            JobOptions {
                workers,
                queue_capacity,
                timeout,
            },
            Arc::new(Pipeline::default()),
            Arc::new(RulesetStore::new(Ruleset::embedded().unwrap())),
            Arc::new(ReportStore::in_memory()),
        ))
    }

    fn zeros(len: usize) -> Arc<[u8]> {
        Arc::from(vec![0u8; len])
    }

    #[tokio::test]
    async fn test_failed_job_reports_code() {
        let jobs = manager(1, 4, Duration::from_secs(30));
        let submission = jobs.submit(zeros(64), Some("blank.bin".to_string())).unwrap();
        let err = submission.report().await.unwrap_err();
        assert_eq!(err.code(), "UnknownArchitecture");
        let job = submission.job().unwrap();
        match job.status() {
            JobStatus::Failed { code, category, .. } => {
                assert_eq!(code, "UnknownArchitecture");
                assert_eq!(category, ErrorCategory::InputError);
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(jobs.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_attaches_to_in_flight_job() {
        let jobs = manager(1, 4, Duration::from_secs(30));
        let first = jobs.submit(zeros(64), None).unwrap();
        let second = jobs.submit(zeros(64), None).unwrap();
        assert!(matches!(first, Submission::Started(_)));
        match &second {
            Submission::Attached(job) => assert_eq!(job.id, first.job().unwrap().id),
            other => panic!("expected attach, got {:?}", other),
        }
        let _ = second.report().await;
    }

    #[tokio::test]
    async fn test_queue_capacity() {
        let jobs = manager(1, 1, Duration::from_secs(30));
        let _first = jobs.submit(zeros(64), None).unwrap();
        let err = jobs.submit(zeros(65), None).unwrap_err();
        assert_eq!(err, AnalysisError::PoolSaturated { capacity: 1 });
        assert!(err.category().is_retryable());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let jobs = manager(1, 4, Duration::from_secs(30));
        let submission = jobs.submit(zeros(64), None).unwrap();
        let id = submission.job().unwrap().id;
        assert_eq!(jobs.cancel(id), Some(true));
        assert_eq!(submission.report().await.unwrap_err(), AnalysisError::Cancelled);
        assert_eq!(jobs.job(id).unwrap().status(), JobStatus::Cancelled);
        assert_eq!(jobs.cancel(id), Some(false));
        assert_eq!(jobs.cancel(999), None);
    }

    #[tokio::test]
    async fn test_zero_budget_times_out() {
        let jobs = manager(1, 4, Duration::ZERO);
        let submission = jobs.submit(zeros(64), None).unwrap();
        let err = submission.report().await.unwrap_err();
        assert_eq!(err.code(), "AnalysisTimeout");
        assert!(jobs.store().is_empty());
    }

    #[test]
    fn test_budget_expires_between_stages() {
        let jobs = manager(1, 4, Duration::from_secs(30));
        let job = Arc::new(JobHandle::new(7, "cafe".to_string(), None));
        job.start_clock(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(25));

        let err = job.enter(Stage::Match).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::AnalysisTimeout {
                budget: Duration::from_millis(5)
            }
        );
        jobs.complete(&job, Err(err));
        match job.status() {
            JobStatus::Failed { code, category, .. } => {
                assert_eq!(code, "AnalysisTimeout");
                assert_eq!(category, ErrorCategory::ResourceExhaustion);
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(jobs.store().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let jobs = manager(1, 4, Duration::from_secs(30));
        let job = Arc::new(JobHandle::new(8, "cafe".to_string(), None));
        job.start_clock(Duration::from_secs(30));
        job.enter(Stage::Load).unwrap();
        job.enter(Stage::Disassemble).unwrap();
        assert_eq!(job.status(), JobStatus::Running { stage: Stage::Disassemble });

        assert!(job.cancel());
        let err = job.enter(Stage::Match).unwrap_err();
        assert_eq!(err, AnalysisError::Cancelled);
        jobs.complete(&job, Err(err));

        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.wait().await.unwrap_err(), AnalysisError::Cancelled);
        assert!(!job.cancel());
        assert!(jobs.store().is_empty());
    }

    #[tokio::test]
    async fn test_precomputed_hash_matches_submit() {
        let jobs = manager(1, 4, Duration::from_secs(30));
        let data = zeros(64);
        let first = jobs.submit_hashed(Arc::clone(&data), content_hash(&data), None).unwrap();
        let second = jobs.submit(data, None).unwrap();
        assert!(matches!(second, Submission::Attached(_)));
        assert_eq!(first.job().unwrap().id, second.job().unwrap().id);
        let _ = first.report().await;
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(JobStatus::Running { stage: Stage::Match }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running", "stage": "Match"}));
    }
}
