//! Interfaces to the external action executor.
//!
//! The orchestration core never inspects page content or vendor responses
//! directly. Everything externally-visible happens behind [`ActionExecutor`],
//! and the opaque [`Signal`] an executor surfaces is mapped to a closed enum
//! by a [`SignalClassifier`]. Swapping the browser driver, the vision step or
//! the vendor clients for anything else leaves this module untouched.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Opaque structured signal surfaced by the executor after an action.
///
/// `kind` is a coarse machine tag, `detail` free-form text produced by the
/// executor's own reasoning. The core only ever feeds it to a classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: String,
    pub detail: String,
}

impl Signal {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// Terminal status of a performed action as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformStatus {
    /// The action completed and was confirmed.
    Ok,
    /// The action failed cleanly (no side effect landed).
    Failed,
    /// The action ran into a restriction on the profile.
    Restricted,
}

/// A durably-observable milestone reached inside the executor.
///
/// Executors report these through the progress channel as they happen; the
/// runner persists a checkpoint phase bump for each one before the action
/// continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMark {
    pub step: String,
    pub at: DateTime<Utc>,
}

impl StepMark {
    pub fn now(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            at: Utc::now(),
        }
    }
}

/// Channel on which an executor reports [`StepMark`]s mid-action.
pub type ProgressSender = mpsc::UnboundedSender<StepMark>;

/// Full report returned by [`ActionExecutor::perform`] and
/// [`ActionExecutor::appeal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformReport {
    pub status: PerformStatus,
    pub signal: Signal,
    pub steps: Vec<StepMark>,
}

/// What the executor is asked to do, detached from campaign bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub action: String,
    pub text: String,
    pub target: Option<String>,
    pub attachment: Option<String>,
}

/// Hints handed to [`ActionExecutor::reconcile`] after a crash: the last
/// persisted phase and the content hash of the interrupted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHint {
    pub phase: String,
    pub content_hash: String,
    pub attempt_id: String,
}

/// Answer to a reconciliation query: did the interrupted action land?
///
/// `found = None` means the executor could not tell either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub found: Option<bool>,
    pub confidence: f32,
    pub reason: String,
}

/// The pluggable execution backend.
///
/// Methods return `impl Future + Send` rather than plain `async fn` so the
/// scheduler can drive engine futures from a spawned task.
pub trait ActionExecutor: Send + Sync {
    /// Performs a side-effecting action for `profile`, reporting milestones
    /// on `progress` as they become durably observable.
    fn perform(
        &self,
        profile: &str,
        task: &TaskSpec,
        progress: ProgressSender,
    ) -> impl Future<Output = anyhow::Result<PerformReport>> + Send;

    /// Live check of a profile's restriction state.
    fn verify(&self, profile: &str) -> impl Future<Output = anyhow::Result<Signal>> + Send;

    /// Narrower fallback check used when [`verify`](Self::verify) comes back
    /// inconclusive.
    fn probe(&self, profile: &str) -> impl Future<Output = anyhow::Result<Signal>> + Send;

    /// Submits an appeal for a restricted profile.
    fn appeal(&self, profile: &str)
    -> impl Future<Output = anyhow::Result<PerformReport>> + Send;

    /// Inspects present-tense external state to decide whether an
    /// interrupted action actually completed.
    fn reconcile(
        &self,
        profile: &str,
        hint: &CheckpointHint,
    ) -> impl Future<Output = anyhow::Result<ReconcileReport>> + Send;
}

/// Queries which profiles are busy with unrelated work right now.
pub trait BusyProfiles: Send + Sync {
    fn list_profiles_in_use(&self) -> impl Future<Output = Vec<String>> + Send;
}

/// Closed set of verification outcomes a signal can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationOutcome {
    /// The restriction is gone; the profile can be unblocked.
    Resolved,
    /// An appeal is already under review; do not appeal again.
    InReview,
    /// The restriction is confirmed active; queue for appeal.
    Active,
    /// The signal was inconclusive.
    Unknown,
}

impl std::fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationOutcome::Resolved => write!(f, "resolved"),
            VerificationOutcome::InReview => write!(f, "in_review"),
            VerificationOutcome::Active => write!(f, "active"),
            VerificationOutcome::Unknown => write!(f, "unknown"),
        }
    }
}

/// Maps opaque executor signals onto the closed [`VerificationOutcome`] set.
pub trait SignalClassifier: Send + Sync {
    fn classify(&self, signal: &Signal) -> VerificationOutcome;

    /// Whether the signal describes an interactive checkpoint (captcha,
    /// identity verification) that needs a human.
    fn is_checkpoint(&self, signal: &Signal) -> bool;
}

/// Weighted keyword scoring over the signal text.
///
/// The default classifier shipped with the crate; production setups may
/// replace it with anything implementing [`SignalClassifier`].
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn score(text: &str, keywords: &[(&str, u32)]) -> u32 {
        let lower = text.to_lowercase();
        keywords
            .iter()
            .filter(|(kw, _)| lower.contains(kw))
            .map(|(_, w)| w)
            .sum()
    }
}

impl SignalClassifier for KeywordClassifier {
    fn classify(&self, signal: &Signal) -> VerificationOutcome {
        let text = format!("{} {}", signal.kind, signal.detail);

        let resolved: &[(&str, u32)] = &[
            ("no longer restricted", 10),
            ("restriction lifted", 10),
            ("resolved", 8),
            ("unrestricted", 8),
            ("can post", 5),
        ];
        let in_review: &[(&str, u32)] = &[
            ("under review", 10),
            ("in review", 10),
            ("appeal pending", 8),
            ("pending", 4),
        ];
        let active: &[(&str, u32)] = &[
            ("still restricted", 10),
            ("restricted", 6),
            ("blocked", 6),
            ("violation", 5),
            ("cannot post", 8),
        ];

        let mut scores: HashMap<VerificationOutcome, u32> = HashMap::new();
        scores.insert(VerificationOutcome::Resolved, Self::score(&text, resolved));
        scores.insert(VerificationOutcome::InReview, Self::score(&text, in_review));
        scores.insert(VerificationOutcome::Active, Self::score(&text, active));

        scores
            .into_iter()
            .filter(|&(_, score)| score > 0)
            .max_by_key(|&(_, score)| score)
            .map(|(outcome, _)| outcome)
            .unwrap_or(VerificationOutcome::Unknown)
    }

    fn is_checkpoint(&self, signal: &Signal) -> bool {
        let text = format!("{} {}", signal.kind, signal.detail).to_lowercase();
        ["captcha", "checkpoint", "identity verification", "verify your identity"]
            .iter()
            .any(|kw| text.contains(kw))
    }
}
