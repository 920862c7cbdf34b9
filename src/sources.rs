//! Source listing with sync health.
//!
//! Health is derived from the age of a source's last snapshot: at most 60
//! minutes is `healthy`, at most 240 is `degraded`, anything older (or a
//! source that was never synced) is `failing`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use docmirror_core::models::RunStatus;
use docmirror_core::store::Store;

use crate::config::Config;

/// Lag reported for a source with no snapshot.
pub const NEVER_SYNCED_LAG_MINUTES: i64 = 1_000_000;

const HEALTHY_LAG_MINUTES: i64 = 60;
const DEGRADED_LAG_MINUTES: i64 = 240;

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub id: String,
    pub name: String,
    pub trust_score: f64,
    pub poll_interval_minutes: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub lag_minutes: i64,
    pub health: &'static str,
    pub last_sync_failed: bool,
}

pub fn health_label(lag_minutes: i64) -> &'static str {
    if lag_minutes <= HEALTHY_LAG_MINUTES {
        "healthy"
    } else if lag_minutes <= DEGRADED_LAG_MINUTES {
        "degraded"
    } else {
        "failing"
    }
}

/// Health of every configured source, in config order.
pub async fn source_health(
    config: &Config,
    store: &dyn Store,
    now: DateTime<Utc>,
) -> Result<Vec<SourceHealth>> {
    let mut rows = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let snapshot = store.last_snapshot(&source.id).await?;
        let lag_minutes = snapshot
            .as_ref()
            .map(|s| (now - s.fetched_at).num_minutes().max(0))
            .unwrap_or(NEVER_SYNCED_LAG_MINUTES);
        let last_status = snapshot.as_ref().map(|s| s.status);

        rows.push(SourceHealth {
            id: source.id.clone(),
            name: source.name.clone().unwrap_or_else(|| source.id.clone()),
            trust_score: source.trust_score,
            poll_interval_minutes: source.poll_interval_minutes,
            last_sync_at: snapshot.as_ref().map(|s| s.fetched_at),
            last_status,
            lag_minutes,
            health: health_label(lag_minutes),
            last_sync_failed: last_status == Some(RunStatus::Failed),
        });
    }
    Ok(rows)
}

/// Print the `sources` command table.
pub async fn list_sources(config: &Config, store: &dyn Store) -> Result<()> {
    let rows = source_health(config, store, Utc::now()).await?;
    if rows.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<10} {:<6} {:<9} {:<10} LAST SYNC",
        "SOURCE", "HEALTH", "TRUST", "STATUS", "LAG(MIN)"
    );
    for row in rows {
        let status = row.last_status.map(|s| s.as_str()).unwrap_or("-");
        let last_sync = row
            .last_sync_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        let lag = if row.last_sync_at.is_some() {
            row.lag_minutes.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<16} {:<10} {:<6.2} {:<9} {:<10} {}",
            row.id, row.health, row.trust_score, status, lag, last_sync
        );
    }
    Ok(())
}
