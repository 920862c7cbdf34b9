//! `changes` command: list detected change events, newest first.

use anyhow::{Context, Result};

use docmirror_core::models::{EventType, Severity};
use docmirror_core::store::{ChangeFilter, Store};

/// Default number of events listed.
pub const DEFAULT_CHANGE_LIMIT: i64 = 20;

/// Build a filter from command-line strings.
///
/// # Errors
///
/// Unknown event types or severities.
pub fn change_filter(
    source: Option<&str>,
    event_type: Option<&str>,
    severity: Option<&str>,
    limit: Option<i64>,
) -> Result<ChangeFilter> {
    let event_type = event_type
        .map(|s| {
            s.parse::<EventType>()
                .with_context(|| format!("Unknown event type: '{}'", s))
        })
        .transpose()?;
    let severity = severity
        .map(|s| {
            s.parse::<Severity>()
                .with_context(|| format!("Unknown severity: '{}'", s))
        })
        .transpose()?;

    Ok(ChangeFilter {
        source: source.map(str::to_string),
        event_type,
        severity,
        limit: limit.unwrap_or(DEFAULT_CHANGE_LIMIT).max(1),
    })
}

pub async fn run_changes(store: &dyn Store, filter: &ChangeFilter) -> Result<()> {
    let events = store.list_changes(filter).await?;
    if events.is_empty() {
        println!("No changes.");
        return Ok(());
    }

    for event in events {
        println!(
            "{} [{}] {} {}",
            event.detected_at.format("%Y-%m-%d %H:%M"),
            event.severity.as_str().to_uppercase(),
            event.event_type,
            event.title
        );
        println!("    source: {}", event.source_id);
        println!("    url: {}", event.canonical_url);
        println!("    summary: {}", event.summary);
        println!();
    }
    Ok(())
}
