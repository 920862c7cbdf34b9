//! Answer decision engine.
//!
//! Classifies reranked results into exactly one terminal status, with a
//! confidence score, policy flags, and recommended next steps. Business
//! conditions (nothing found, stale, conflicting, unsafe, blocked by
//! policy) are data in the returned [`Decision`], never errors.
//!
//! # Precedence
//!
//! 1. Tenant policy removed every candidate → `policy_blocked`
//!    (see [`policy_blocked`]).
//! 2. No results → `insufficient_sources`.
//! 3. Every result trips an injection detector → `unsafe_content`.
//! 4. Otherwise only safe results are used. None left → `insufficient_sources`.
//! 5. Oldest used result older than the staleness threshold → `stale_sources`.
//! 6. More than one source and the top two scores within 0.15 →
//!    `conflict_detected`, else `grounded`.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rerank::RankedResult;
use crate::sanitize::has_injection_signals;

/// Default staleness threshold: one day.
pub const DEFAULT_STALE_THRESHOLD_MINUTES: i64 = 24 * 60;

const BASE_CONFIDENCE: f64 = 0.92;
const MAX_AGE_PENALTY: f64 = 0.35;
const CONFLICT_PENALTY: f64 = 0.35;
const STATUS_PENALTY: f64 = 0.25;
const CONFLICT_SCORE_GAP: f64 = 0.15;

pub const WARNING_INSUFFICIENT: &str = "insufficient_sources";
pub const WARNING_STALE: &str = "stale_sources";
pub const WARNING_CONFLICT: &str = "conflict_detected";
pub const WARNING_INJECTION: &str = "prompt_injection_signals_detected";
pub const WARNING_POLICY: &str = "policy_blocked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Grounded,
    InsufficientSources,
    StaleSources,
    ConflictDetected,
    UnsafeContent,
    PolicyBlocked,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Grounded => "grounded",
            DecisionStatus::InsufficientSources => "insufficient_sources",
            DecisionStatus::StaleSources => "stale_sources",
            DecisionStatus::ConflictDetected => "conflict_detected",
            DecisionStatus::UnsafeContent => "unsafe_content",
            DecisionStatus::PolicyBlocked => "policy_blocked",
        }
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Actionability {
    pub recommended_next_steps: Vec<String>,
}

/// Trust classification attached to every answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionEnvelope {
    pub status: DecisionStatus,
    pub confidence: f64,
    pub uncertainties: Vec<String>,
    pub policy_flags: Vec<String>,
    pub actionability: Actionability,
}

/// Result of [`decide`]: the envelope plus what it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub envelope: DecisionEnvelope,
    /// Results the answer may cite: the safe subset, or every result for
    /// `unsafe_content` (cited but not acted on).
    pub cited: Vec<RankedResult>,
    pub max_age_minutes: i64,
    pub warnings: Vec<String>,
}

/// Per-tenant restrictions on which sources may back an answer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourcePolicy {
    #[serde(default)]
    pub allow_sources: Vec<String>,
    #[serde(default)]
    pub deny_sources: Vec<String>,
    #[serde(default)]
    pub min_trust_score: Option<f64>,
}

impl SourcePolicy {
    /// Resolve the sources a request may search.
    ///
    /// `None` means unrestricted. An explicit request is intersected with
    /// the allow list; without one the allow list itself is used. Deny
    /// always wins. The result may be empty, which blocks the request.
    pub fn resolve_sources(&self, requested: &[String]) -> Option<Vec<String>> {
        let input: Vec<String> = if !requested.is_empty() {
            requested.to_vec()
        } else if !self.allow_sources.is_empty() {
            self.allow_sources.clone()
        } else {
            return None;
        };

        let mut seen = HashSet::new();
        Some(
            input
                .into_iter()
                .filter(|s| !self.deny_sources.contains(s))
                .filter(|s| self.allow_sources.is_empty() || self.allow_sources.contains(s))
                .filter(|s| seen.insert(s.clone()))
                .collect(),
        )
    }

    /// Whether a source may back an answer under this policy.
    pub fn permits(&self, source_id: &str, trust_score: f64) -> bool {
        if self.deny_sources.iter().any(|s| s == source_id) {
            return false;
        }
        if !self.allow_sources.is_empty() && !self.allow_sources.iter().any(|s| s == source_id) {
            return false;
        }
        match self.min_trust_score {
            Some(min) => trust_score >= min.clamp(0.0, 1.0),
            None => true,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Build the envelope for a status, applying the confidence formula
/// `clamp(0.92 - age - conflict - status, 0, 1)`.
pub fn build_decision(
    status: DecisionStatus,
    max_age_minutes: i64,
    has_conflict: bool,
) -> DecisionEnvelope {
    let age_penalty = (max_age_minutes.max(0) as f64 / 10_000.0).min(MAX_AGE_PENALTY);
    let conflict_penalty = if has_conflict { CONFLICT_PENALTY } else { 0.0 };
    let status_penalty = if status == DecisionStatus::Grounded {
        0.0
    } else {
        STATUS_PENALTY
    };
    let confidence =
        (BASE_CONFIDENCE - age_penalty - conflict_penalty - status_penalty).clamp(0.0, 1.0);

    let (uncertainties, policy_flags, steps): (&[&str], &[&str], &[&str]) = match status {
        DecisionStatus::InsufficientSources => (
            &["insufficient_evidence"],
            &["abstained"],
            &[
                "Broaden source filters or remove strict version constraints.",
                "Trigger a source sync if documentation may be stale.",
            ],
        ),
        DecisionStatus::StaleSources => (
            &["stale_evidence"],
            &["stale_source_block"],
            &[
                "Sync affected sources and retry the request.",
                "Temporarily scope to fresher sources if available.",
            ],
        ),
        DecisionStatus::ConflictDetected => (
            &["conflicting_sources"],
            &["manual_review_recommended"],
            &[
                "Review cited sources directly before merging code changes.",
                "Pin version constraints to reduce ambiguity.",
            ],
        ),
        DecisionStatus::UnsafeContent => (
            &["untrusted_source_content"],
            &["prompt_injection_block"],
            &[
                "Inspect cited source pages directly before using any instructions.",
                "Run source sync and retry with stricter source/version filters.",
            ],
        ),
        DecisionStatus::PolicyBlocked => (
            &["source_policy_restriction"],
            &["tenant_policy_block"],
            &[
                "Request access to the required sources from a workspace administrator.",
                "Retry with sources permitted by the tenant policy.",
            ],
        ),
        DecisionStatus::Grounded => (
            &[],
            &[],
            &[
                "Validate implementation in a test environment.",
                "Keep source version constraints pinned in automation.",
            ],
        ),
    };

    DecisionEnvelope {
        status,
        confidence,
        uncertainties: strings(uncertainties),
        policy_flags: strings(policy_flags),
        actionability: Actionability {
            recommended_next_steps: strings(steps),
        },
    }
}

/// Decision for a request whose candidates were all removed by tenant policy.
pub fn policy_blocked() -> Decision {
    Decision {
        envelope: build_decision(DecisionStatus::PolicyBlocked, 0, false),
        cited: Vec::new(),
        max_age_minutes: 0,
        warnings: vec![WARNING_POLICY.to_string()],
    }
}

fn age_minutes(result: &RankedResult, now: DateTime<Utc>) -> i64 {
    let millis = (now - result.last_changed_at).num_milliseconds().max(0);
    (millis as f64 / 60_000.0).round() as i64
}

/// Classify reranked results (best first) into a [`Decision`].
pub fn decide(
    results: &[RankedResult],
    stale_threshold_minutes: i64,
    now: DateTime<Utc>,
) -> Decision {
    if results.is_empty() {
        return Decision {
            envelope: build_decision(DecisionStatus::InsufficientSources, 0, false),
            cited: Vec::new(),
            max_age_minutes: 0,
            warnings: vec![WARNING_INSUFFICIENT.to_string()],
        };
    }

    let (risky, safe): (Vec<&RankedResult>, Vec<&RankedResult>) =
        results.iter().partition(|r| has_injection_signals(&r.text));
    let injection = !risky.is_empty();

    if injection && safe.is_empty() {
        return Decision {
            envelope: build_decision(DecisionStatus::UnsafeContent, 0, false),
            cited: results.to_vec(),
            max_age_minutes: 0,
            warnings: vec![WARNING_INJECTION.to_string()],
        };
    }

    let used: Vec<RankedResult> = if safe.is_empty() {
        results.to_vec()
    } else {
        safe.into_iter().cloned().collect()
    };
    let max_age_minutes = used.iter().map(|r| age_minutes(r, now)).max().unwrap_or(0);

    if used.is_empty() {
        return Decision {
            envelope: build_decision(DecisionStatus::InsufficientSources, max_age_minutes, false),
            cited: Vec::new(),
            max_age_minutes,
            warnings: vec![WARNING_INSUFFICIENT.to_string()],
        };
    }

    let distinct_sources: HashSet<&str> = used.iter().map(|r| r.source.as_str()).collect();
    let has_conflict = distinct_sources.len() > 1
        && used.len() > 1
        && (used[0].score - used[1].score).abs() <= CONFLICT_SCORE_GAP;

    if max_age_minutes > stale_threshold_minutes {
        let mut warnings = vec![WARNING_STALE.to_string()];
        if injection {
            warnings.push(WARNING_INJECTION.to_string());
        }
        return Decision {
            envelope: build_decision(DecisionStatus::StaleSources, max_age_minutes, has_conflict),
            cited: used,
            max_age_minutes,
            warnings,
        };
    }

    let status = if has_conflict {
        DecisionStatus::ConflictDetected
    } else {
        DecisionStatus::Grounded
    };
    let mut warnings = Vec::new();
    if has_conflict {
        warnings.push(WARNING_CONFLICT.to_string());
    }
    if injection {
        warnings.push(WARNING_INJECTION.to_string());
    }

    Decision {
        envelope: build_decision(status, max_age_minutes, has_conflict),
        cited: used,
        max_age_minutes,
        warnings,
    }
}
