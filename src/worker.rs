//! Source sync jobs and the worker pool.
//!
//! [`sync_source`] is one complete ingestion run: upsert the source row,
//! crawl with stored validators, persist change-aware, write a snapshot,
//! and send a change alert. [`run_worker`] drains the [`SyncQueue`] with
//! at most `worker.concurrency` jobs in flight, and enqueues configured
//! sources whose last snapshot is older than their poll interval.
//!
//! Jobs are independent. A crawl is sequential within a job, and every
//! document is persisted on its own, so an abandoned job leaves a
//! consistent document set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use docmirror_core::change::KeywordSectionClassifier;
use docmirror_core::embedding::Embedder;
use docmirror_core::models::{ChangeEvent, IngestRunResult, RunStatus, Snapshot};
use docmirror_core::persist::{PersistStats, Persister};
use docmirror_core::store::{ChangeFilter, Store};

use crate::config::Config;
use crate::crawl::{crawl_source, CrawlPlan};
use crate::embedding::create_embedder;
use crate::fetch::{HttpFetcher, PageFetcher};
use crate::notify::{ChangeNotifier, WebhookNotifier};
use crate::queue::{FailOutcome, SyncJob, SyncQueue};
use crate::sqlite_store::SqliteStore;

/// Recorded on every snapshot.
pub const PARSER_VERSION: &str = concat!("docmirror@", env!("CARGO_PKG_VERSION"));

const MAX_SNAPSHOT_ERRORS: usize = 10;
const MAX_RAW_REF_URLS: usize = 8;

/// Shared dependencies of sync jobs.
pub struct SyncContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub notifier: Option<Arc<dyn ChangeNotifier>>,
}

impl SyncContext {
    /// Production wiring: SQLite store, HTTP fetcher, configured embedder
    /// and webhook notifier.
    pub fn from_config(config: Config, pool: SqlitePool) -> Result<Self> {
        let fetcher = HttpFetcher::from_config(&config.crawl)?;
        let embedder = create_embedder(&config.embedding)?;
        let notifier = WebhookNotifier::from_config(&config.notifications)
            .map(|n| Arc::new(n) as Arc<dyn ChangeNotifier>);
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(SqliteStore::new(pool)),
            fetcher: Arc::new(fetcher),
            embedder,
            notifier,
        })
    }
}

/// Outcome of one [`sync_source`] run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub request_id: String,
    pub status: RunStatus,
    pub stats: PersistStats,
    pub fetched_urls: usize,
    pub not_modified: usize,
    pub failed_urls: usize,
    /// First run errors joined by ` | `, as stored on the snapshot.
    pub error: Option<String>,
    pub snapshot_id: String,
    pub ingested_at: DateTime<Utc>,
}

fn snapshot_error(run: &IngestRunResult) -> Option<String> {
    if run.errors.is_empty() {
        return None;
    }
    Some(
        run.errors
            .iter()
            .take(MAX_SNAPSHOT_ERRORS)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
    )
}

fn raw_ref(run: &IngestRunResult, request_id: &str) -> String {
    if run.fetched_urls.is_empty() {
        return format!("queue://source-sync/{}", request_id);
    }
    run.fetched_urls
        .iter()
        .take(MAX_RAW_REF_URLS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Run one complete ingestion of `source_id`.
///
/// # Errors
///
/// Unknown sources and store failures. Crawl problems are reported on the
/// returned [`SyncReport`] instead.
pub async fn sync_source(ctx: &SyncContext, source_id: &str, request_id: &str) -> Result<SyncReport> {
    let source = ctx
        .config
        .source(source_id)
        .with_context(|| format!("Unknown source: '{}'", source_id))?;

    ctx.store.upsert_source(&source.to_source()).await?;
    let conditions = ctx.store.fetch_conditions(source_id).await?;
    let plan = CrawlPlan::new(source, &ctx.config.crawl)?;

    tracing::info!(source = %source_id, request_id = %request_id, "sync started");
    let run = crawl_source(ctx.fetcher.as_ref(), &plan, &conditions).await;

    // Millisecond precision so events can be found again by detected_at.
    let ingested_at = Utc::now().trunc_subsecs(3);
    let classifier = KeywordSectionClassifier;
    let persister = Persister {
        store: ctx.store.as_ref(),
        classifier: &classifier,
        embedder: ctx.embedder.as_deref(),
    };
    let stats = persister.persist_run(source_id, &run, ingested_at).await?;

    let error = snapshot_error(&run);
    let snapshot = Snapshot {
        id: Uuid::new_v4().to_string(),
        source_id: source_id.to_string(),
        fetched_at: ingested_at,
        status: run.status,
        error: error.clone(),
        raw_ref: raw_ref(&run, request_id),
        parser_version: PARSER_VERSION.to_string(),
    };
    ctx.store.record_snapshot(&snapshot).await?;

    tracing::info!(
        source = %source_id,
        docs_inserted = stats.inserted_documents,
        docs_updated = stats.updated_documents,
        chunks_inserted = stats.inserted_chunks,
        change_events = stats.change_events,
        status = %run.status,
        "sync finished"
    );

    if stats.change_events > 0 {
        if let Some(notifier) = &ctx.notifier {
            let events = run_events(ctx.store.as_ref(), source_id, ingested_at, stats.change_events).await?;
            if let Err(e) = notifier.notify(source_id, &events).await {
                tracing::warn!(source = %source_id, error = %e, "change alert failed");
            }
        }
    }

    Ok(SyncReport {
        source: source_id.to_string(),
        request_id: request_id.to_string(),
        status: run.status,
        stats,
        fetched_urls: run.fetched_urls.len(),
        not_modified: run.not_modified_documents.len(),
        failed_urls: run.failed_urls.len(),
        error,
        snapshot_id: snapshot.id,
        ingested_at,
    })
}

/// Change events written by the run that ingested at `ingested_at`.
async fn run_events(
    store: &dyn Store,
    source_id: &str,
    ingested_at: DateTime<Utc>,
    count: usize,
) -> Result<Vec<ChangeEvent>> {
    let filter = ChangeFilter {
        source: Some(source_id.to_string()),
        limit: count as i64,
        ..Default::default()
    };
    Ok(store
        .list_changes(&filter)
        .await?
        .into_iter()
        .filter(|e| e.detected_at == ingested_at)
        .collect())
}

/// Handle one claimed job and record its outcome on the queue.
///
/// Returns `true` when the job completed. A `failed` run fails the job
/// so the queue's retry policy applies.
pub async fn process_job(ctx: &SyncContext, queue: &dyn SyncQueue, job: &SyncJob) -> Result<bool> {
    let outcome = sync_source(ctx, &job.source_id, &job.request_id).await;
    let now = Utc::now();

    let error = match outcome {
        Ok(report) if report.status != RunStatus::Failed => {
            queue
                .complete(&job.request_id, report.error.as_deref(), now)
                .await?;
            return Ok(true);
        }
        Ok(report) => report.error.unwrap_or_else(|| "ingestion_failed".to_string()),
        Err(e) => format!("{:#}", e),
    };

    match queue.fail(&job.request_id, &error, now).await? {
        FailOutcome::RetryAt(at) => tracing::warn!(
            source = %job.source_id,
            request_id = %job.request_id,
            attempt = job.attempts,
            retry_at = %at,
            error = %error,
            "sync job failed, will retry"
        ),
        FailOutcome::Exhausted => tracing::warn!(
            source = %job.source_id,
            request_id = %job.request_id,
            attempt = job.attempts,
            error = %error,
            "sync job failed permanently"
        ),
    }
    Ok(false)
}

/// Enqueue every configured source whose last snapshot is older than its
/// poll interval (or that was never synced). Returns the enqueued ids.
pub async fn enqueue_due_sources(
    ctx: &SyncContext,
    queue: &dyn SyncQueue,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut enqueued = Vec::new();
    for source in &ctx.config.sources {
        let due = match ctx.store.last_snapshot(&source.id).await? {
            None => true,
            Some(snapshot) => {
                now - snapshot.fetched_at >= chrono::Duration::minutes(source.poll_interval_minutes)
            }
        };
        if due && queue.enqueue(&source.id, now).await?.is_created() {
            enqueued.push(source.id.clone());
        }
    }
    if !enqueued.is_empty() {
        tracing::debug!(sources = ?enqueued, "enqueued due sources");
    }
    Ok(enqueued)
}

/// Totals for one [`run_worker`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: usize,
    pub failed: usize,
}

impl WorkerSummary {
    fn record(&mut self, joined: std::result::Result<Result<bool>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(true)) => self.completed += 1,
            Ok(Ok(false)) => self.failed += 1,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "queue bookkeeping failed");
                self.failed += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "sync task panicked");
                self.failed += 1;
            }
        }
    }
}

/// Run the worker pool.
///
/// With `once`, due sources are enqueued a single time and the worker
/// exits when no claimable job remains; otherwise it polls until Ctrl-C,
/// then waits for in-flight jobs.
pub async fn run_worker(
    ctx: Arc<SyncContext>,
    queue: Arc<dyn SyncQueue>,
    once: bool,
) -> Result<WorkerSummary> {
    let released = queue.release_in_flight().await?;
    if released > 0 {
        tracing::info!(released, "re-queued interrupted sync requests");
    }

    let concurrency = ctx.config.worker.concurrency.max(1);
    let poll = Duration::from_millis(ctx.config.worker.poll_interval_ms);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<Result<bool>> = JoinSet::new();
    let mut summary = WorkerSummary::default();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(concurrency, once, "worker started");
    if once {
        enqueue_due_sources(&ctx, queue.as_ref(), Utc::now()).await?;
    }

    loop {
        if !once {
            enqueue_due_sources(&ctx, queue.as_ref(), Utc::now()).await?;
        }

        while let Ok(permit) = semaphore.clone().try_acquire_owned() {
            let Some(job) = queue.claim(Utc::now()).await? else {
                break;
            };
            tracing::debug!(source = %job.source_id, request_id = %job.request_id, "claimed job");
            let ctx = ctx.clone();
            let queue = queue.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process_job(&ctx, queue.as_ref(), &job).await
            });
        }

        if tasks.is_empty() {
            if once {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => continue,
                _ = &mut shutdown => break,
            }
        }

        tokio::select! {
            Some(joined) = tasks.join_next() => summary.record(joined),
            _ = tokio::time::sleep(poll), if !once => {}
            _ = &mut shutdown => break,
        }
    }

    while let Some(joined) = tasks.join_next().await {
        summary.record(joined);
    }

    tracing::info!(
        completed = summary.completed,
        failed = summary.failed,
        "worker stopped"
    );
    Ok(summary)
}
