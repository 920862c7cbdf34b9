//! `sync` and `worker` commands.
//!
//! `sync` runs ingestion in the foreground for one source or `all`
//! configured sources, one after another. `worker` drains the persistent
//! sync queue with the bounded worker pool.

use std::sync::Arc;

use anyhow::{bail, Result};
use uuid::Uuid;

use docmirror_core::models::RunStatus;

use crate::config::Config;
use crate::db;
use crate::queue::{SqliteQueue, SyncQueue};
use crate::worker::{run_worker, sync_source, SyncContext, SyncReport};

/// Source ids selected by a `sync` target.
pub fn resolve_targets(config: &Config, target: &str) -> Result<Vec<String>> {
    if target == "all" {
        if config.sources.is_empty() {
            bail!("No sources configured");
        }
        return Ok(config.sources.iter().map(|s| s.id.clone()).collect());
    }
    if config.source(target).is_none() {
        let known: Vec<&str> = config.sources.iter().map(|s| s.id.as_str()).collect();
        bail!(
            "Unknown source: '{}'. Available: all, {}",
            target,
            known.join(", ")
        );
    }
    Ok(vec![target.to_string()])
}

fn print_report(report: &SyncReport) {
    println!("sync {}", report.source);
    println!("  status: {}", report.status);
    println!("  fetched: {} pages", report.fetched_urls);
    println!("  not modified: {}", report.not_modified);
    println!("  failed: {}", report.failed_urls);
    println!("  documents inserted: {}", report.stats.inserted_documents);
    println!("  documents updated: {}", report.stats.updated_documents);
    println!("  chunks written: {}", report.stats.inserted_chunks);
    println!("  change events: {}", report.stats.change_events);
    if let Some(error) = &report.error {
        println!("  errors: {}", error);
    }
    println!("  snapshot: {}", report.snapshot_id);
}

pub async fn run_sync(config: &Config, target: &str) -> Result<()> {
    let targets = resolve_targets(config, target)?;
    let pool = db::connect(config).await?;
    let ctx = SyncContext::from_config(config.clone(), pool.clone())?;

    let mut failed = 0usize;
    for source_id in &targets {
        let request_id = Uuid::new_v4().to_string();
        let report = sync_source(&ctx, source_id, &request_id).await?;
        if report.status == RunStatus::Failed {
            failed += 1;
        }
        print_report(&report);
    }
    pool.close().await;

    if failed > 0 {
        bail!("{} of {} source sync(s) failed", failed, targets.len());
    }
    println!("ok");
    Ok(())
}

pub async fn run_worker_command(config: &Config, once: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let queue: Arc<dyn SyncQueue> = Arc::new(SqliteQueue::new(pool.clone(), &config.worker));
    let ctx = Arc::new(SyncContext::from_config(config.clone(), pool.clone())?);

    let summary = run_worker(ctx, queue, once).await?;
    println!("worker");
    println!("  completed: {}", summary.completed);
    println!("  failed: {}", summary.failed);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
[db]
path = "./data/docmirror.sqlite"

[[sources]]
id = "stripe"
base_url = "https://docs.stripe.com"

[[sources]]
id = "plaid"
base_url = "https://plaid.com/docs"
"#;

    #[test]
    fn test_resolve_targets() {
        let config = parse_config(CONFIG).unwrap();
        assert_eq!(resolve_targets(&config, "all").unwrap(), vec!["stripe", "plaid"]);
        assert_eq!(resolve_targets(&config, "plaid").unwrap(), vec!["plaid"]);
        let err = resolve_targets(&config, "twilio").unwrap_err().to_string();
        assert!(err.contains("Unknown source: 'twilio'"));
    }
}
