//! Section-diff change classification.
//!
//! When a document's content hash changes, the previous and next texts are
//! compared section by section and the changed sections are scanned for
//! keyword families. A family only fires when it is *introduced*: present
//! in the changed sections and absent from the whole previous text.
//!
//! Classification sits behind [`ChangeClassifier`] so persistence does not
//! depend on the keyword heuristic.

use std::collections::HashMap;

use serde_json::json;

use crate::models::{EventType, Severity};

const BREAKING_KEYWORDS: &[&str] = &[
    "breaking change",
    "no longer supported",
    "sunset",
    "incompatible",
];

const DEPRECATION_KEYWORDS: &[&str] = &["deprecated", "deprecation", "will be removed"];

/// Headings reported in event details are capped at this many.
const MAX_REPORTED_SECTIONS: usize = 10;

/// A classified change, before it is given an id and persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChange {
    pub event_type: EventType,
    pub severity: Severity,
    pub summary: String,
    pub details: serde_json::Value,
}

/// Turns a (previous, next) text pair into change events.
pub trait ChangeClassifier: Send + Sync {
    /// Classify a content change. Must return at least one event.
    fn classify(&self, previous_text: &str, next_text: &str, title: &str) -> Vec<DetectedChange>;
}

/// A `## heading` keyed slice used for diffing.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub heading: String,
    pub body: String,
}

/// Lowercase and collapse all whitespace runs to single spaces.
pub fn normalize_for_diff(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn flush(heading: &str, body: &[&str], sections: &mut Vec<Section>) {
    let joined = body.join("\n");
    let joined = joined.trim();
    if !joined.is_empty() {
        sections.push(Section {
            heading: heading.to_string(),
            body: joined.to_string(),
        });
    }
}

/// Split text into heading-keyed sections.
///
/// Text before the first heading is keyed `"Document"`; an empty heading
/// is keyed `"Untitled"`. Heading lines are not part of the body, and
/// sections with an empty body are dropped.
pub fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut heading = "Document".to_string();
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("## ") {
            flush(&heading, &body, &mut sections);
            let rest = rest.trim();
            heading = if rest.is_empty() {
                "Untitled".to_string()
            } else {
                rest.to_string()
            };
            body.clear();
            continue;
        }
        body.push(line);
    }
    flush(&heading, &body, &mut sections);

    sections
}

/// Sections of `next_text` whose heading is new or whose normalized body
/// differs from the previous body under the same heading.
pub fn changed_sections(previous_text: &str, next_text: &str) -> Vec<Section> {
    let previous: HashMap<String, String> = split_sections(previous_text)
        .into_iter()
        .map(|s| (s.heading, normalize_for_diff(&s.body)))
        .collect();

    split_sections(next_text)
        .into_iter()
        .filter(|s| match previous.get(&s.heading) {
            Some(prev) => *prev != normalize_for_diff(&s.body),
            None => true,
        })
        .collect()
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// Keyword heuristic over changed sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordSectionClassifier;

impl ChangeClassifier for KeywordSectionClassifier {
    fn classify(&self, previous_text: &str, next_text: &str, title: &str) -> Vec<DetectedChange> {
        let previous_lower = normalize_for_diff(previous_text);
        let changed = changed_sections(previous_text, next_text);
        let window = normalize_for_diff(
            &changed
                .iter()
                .map(|s| s.body.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        );
        let headings: Vec<&str> = changed
            .iter()
            .take(MAX_REPORTED_SECTIONS)
            .map(|s| s.heading.as_str())
            .collect();

        let introduced = |keywords: &[&str]| {
            !contains_any(&previous_lower, keywords) && contains_any(&window, keywords)
        };

        let mut events = Vec::new();

        if introduced(BREAKING_KEYWORDS) {
            events.push(DetectedChange {
                event_type: EventType::BreakingChange,
                severity: Severity::Critical,
                summary: format!("Potential breaking change detected in {}", title),
                details: json!({
                    "detector": "section_diff_keyword",
                    "keyword_family": "breaking_or_removed",
                    "changed_sections": headings,
                    "changed_section_count": changed.len(),
                }),
            });
        }

        if introduced(DEPRECATION_KEYWORDS) {
            events.push(DetectedChange {
                event_type: EventType::Deprecation,
                severity: Severity::Medium,
                summary: format!("Deprecation language detected in {}", title),
                details: json!({
                    "detector": "section_diff_keyword",
                    "keyword_family": "deprecation",
                    "changed_sections": headings,
                    "changed_section_count": changed.len(),
                }),
            });
        }

        if events.is_empty() {
            events.push(DetectedChange {
                event_type: EventType::Updated,
                severity: Severity::Low,
                summary: format!("Documentation updated for {}", title),
                details: json!({
                    "detector": "section_diff",
                    "changed_sections": headings,
                    "changed_section_count": changed.len(),
                }),
            });
        }

        events
    }
}

/// The single event emitted when a document is first seen.
pub fn document_added(title: &str) -> DetectedChange {
    DetectedChange {
        event_type: EventType::DocumentAdded,
        severity: Severity::Low,
        summary: format!("Documentation added for {}", title),
        details: json!({ "detector": "new_document" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(prev: &str, next: &str) -> Vec<DetectedChange> {
        KeywordSectionClassifier.classify(prev, next, "Payments API")
    }

    #[test]
    fn test_split_sections_default_heading() {
        let sections = split_sections("Intro text\n## Setup\nInstall it\n## \nOrphan");
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].heading, "Document");
        assert_eq!(sections[1].heading, "Setup");
        assert_eq!(sections[1].body, "Install it");
        assert_eq!(sections[2].heading, "Untitled");
    }

    #[test]
    fn test_changed_sections_ignores_whitespace_and_case() {
        let prev = "## Auth\nUse a  Bearer token.\n## Limits\n100 rps";
        let next = "## Auth\nuse a bearer\ttoken.\n## Limits\n50 rps\n## Errors\nRetry on 429";
        let changed = changed_sections(prev, next);
        let headings: Vec<&str> = changed.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(headings, vec!["Limits", "Errors"]);
    }

    #[test]
    fn test_deprecation_introduced() {
        let prev = "## Charges\nCreate a charge with the charges endpoint.";
        let next = "## Charges\nThe charges endpoint is deprecated. Use payment intents.";
        let events = classify(prev, next);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Deprecation);
        assert_eq!(events[0].severity, Severity::Medium);
        assert_eq!(events[0].details["keyword_family"], "deprecation");
    }

    #[test]
    fn test_breaking_introduced_first() {
        let prev = "## Webhooks\nVersion 1 payloads are sent.";
        let next = "## Webhooks\nVersion 1 payloads are no longer supported and deprecated.";
        let events = classify(prev, next);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::BreakingChange);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[1].event_type, EventType::Deprecation);
        assert_eq!(events[0].summary, "Potential breaking change detected in Payments API");
    }

    #[test]
    fn test_persistent_keyword_is_just_update() {
        let prev = "## Legacy\nThis API is deprecated.\n## Usage\nCall list().";
        let next = "## Legacy\nThis API is deprecated.\n## Usage\nCall list() with a cursor. Deprecated params ignored.";
        let events = classify(prev, next);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Updated);
        assert_eq!(events[0].details["changed_sections"], json!(["Usage"]));
        assert_eq!(events[0].details["changed_section_count"], 1);
    }

    #[test]
    fn test_keyword_in_unchanged_section_ignored() {
        let prev = "## Intro\nHello";
        let next = "## Intro\nHello there\n## Sunset\nsunset policy text";
        let events = classify("## Sunset\nsunset policy text\n## Intro\nHello", next);
        assert_eq!(events[0].event_type, EventType::Updated);
        let events = classify(prev, next);
        assert_eq!(events[0].event_type, EventType::BreakingChange);
    }
}
