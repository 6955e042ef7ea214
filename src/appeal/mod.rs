//! Batch verification and appeal workflow types.

mod engine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use engine::AppealEngine;

/// What kind of restriction a profile is under, decided before any live
/// verification runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionScenario {
    /// The stored expiry already passed; unblock immediately.
    Expired,
    /// An interactive checkpoint (captcha, identity check) blocks the
    /// profile; automation stops here.
    Checkpoint,
    /// A live verification is needed to find out where the restriction
    /// stands.
    CommentRestriction,
}

impl std::fmt::Display for RestrictionScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestrictionScenario::Expired => write!(f, "expired"),
            RestrictionScenario::Checkpoint => write!(f, "checkpoint"),
            RestrictionScenario::CommentRestriction => write!(f, "comment_restriction"),
        }
    }
}

/// Final per-profile outcome of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileOutcome {
    /// The restriction is gone (expired or verified resolved).
    Unblocked,
    /// Flagged for manual intervention.
    NeedsCaptcha,
    /// An appeal is already under review; left alone.
    PendingReview,
    /// Verification confirmed the restriction; no appeal ran (verify-only).
    ConfirmedActive,
    /// An appeal was submitted this batch.
    Appealed,
    /// Every appeal round this batch failed, attempts remain.
    AppealFailed,
    /// The per-profile attempt cap was reached.
    Exhausted,
    /// Verification stayed inconclusive even after the fallback probe.
    Unknown,
    /// The verification call itself failed.
    VerifyFailed,
}

/// One profile's journey through a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileResult {
    pub profile: String,
    pub scenario: RestrictionScenario,
    pub outcome: ProfileOutcome,
    pub detail: String,
}

/// Counts per outcome bucket plus the full per-profile result list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub unblocked: usize,
    pub needs_captcha: usize,
    pub pending_review: usize,
    pub confirmed_active: usize,
    pub appealed: usize,
    pub exhausted: usize,
    pub failed: usize,
    pub unknown: usize,
    /// Profiles the batch did not manage to unblock.
    pub still_restricted: usize,
    pub results: Vec<ProfileResult>,
}

impl BatchSummary {
    pub fn tally(started_at: DateTime<Utc>, results: Vec<ProfileResult>) -> Self {
        let count =
            |o: ProfileOutcome| results.iter().filter(|r| r.outcome == o).count();
        let unblocked = count(ProfileOutcome::Unblocked);
        Self {
            started_at,
            finished_at: Utc::now(),
            total: results.len(),
            unblocked,
            needs_captcha: count(ProfileOutcome::NeedsCaptcha),
            pending_review: count(ProfileOutcome::PendingReview),
            confirmed_active: count(ProfileOutcome::ConfirmedActive),
            appealed: count(ProfileOutcome::Appealed),
            exhausted: count(ProfileOutcome::Exhausted),
            failed: count(ProfileOutcome::AppealFailed) + count(ProfileOutcome::VerifyFailed),
            unknown: count(ProfileOutcome::Unknown),
            still_restricted: results.len() - unblocked,
            results,
        }
    }
}

/// Result of a batch entry point: either a summary or an immediate `busy`
/// when another batch already holds the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchOutcome {
    Completed(BatchSummary),
    Busy,
}

impl BatchOutcome {
    pub fn summary(&self) -> Option<&BatchSummary> {
        match self {
            BatchOutcome::Completed(summary) => Some(summary),
            BatchOutcome::Busy => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, BatchOutcome::Busy)
    }
}

/// Compact record of one scheduler-driven or manual run, kept in the
/// bounded run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub at: DateTime<Utc>,
    pub trigger: String,
    pub total: usize,
    pub unblocked: usize,
    pub appealed: usize,
    pub still_restricted: usize,
}

impl RunRecord {
    pub fn from_summary(trigger: &str, summary: &BatchSummary) -> Self {
        Self {
            at: summary.finished_at,
            trigger: trigger.to_string(),
            total: summary.total,
            unblocked: summary.unblocked,
            appealed: summary.appealed,
            still_restricted: summary.still_restricted,
        }
    }
}
