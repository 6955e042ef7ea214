//! The batch verification / appeal engine.
//!
//! Two entry points, [`AppealEngine::verify_all`] and
//! [`AppealEngine::batch_appeal_all`], share one process-wide mutual
//! exclusion lock: a second caller gets an immediate `busy` outcome instead
//! of blocking. The lock spans the entire multi-step workflow, not just
//! individual writes, so two batches can never race to appeal the same
//! profile.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::appeal::{BatchOutcome, BatchSummary, ProfileOutcome, ProfileResult, RestrictionScenario};
use crate::error::CarrosselError;
use crate::executor::{ActionExecutor, Signal, SignalClassifier, VerificationOutcome};
use crate::ledger::{AppealMark, ProfileLedger, ProfileStatus};
use crate::notify::Notifier;

/// Orchestrates verification and appeals across all restricted profiles.
/// Constructed once at startup and shared by reference.
pub struct AppealEngine<E, C, N> {
    ledger: Arc<ProfileLedger>,
    executor: E,
    classifier: C,
    notifier: N,
    max_attempts: u32,
    retry_delay: Duration,
    lock: Mutex<()>,
}

/// How one live verification ended.
enum Verdict {
    Mapped(VerificationOutcome, String),
    CallFailed(String),
}

impl<E, C, N> AppealEngine<E, C, N>
where
    E: ActionExecutor,
    C: SignalClassifier,
    N: Notifier,
{
    pub fn new(
        ledger: Arc<ProfileLedger>,
        executor: E,
        classifier: C,
        notifier: N,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            executor,
            classifier,
            notifier,
            max_attempts,
            retry_delay,
            lock: Mutex::new(()),
        }
    }

    /// Takes the batch lock without running anything, so a caller can hold
    /// off both entry points (e.g. while sessions are being rebuilt).
    /// Returns [`CarrosselError::Busy`] when a batch is running.
    pub fn try_quiesce(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, CarrosselError> {
        self.lock.try_lock().map_err(|_| CarrosselError::Busy)
    }

    /// Read-mostly half of the batch: classify and verify every restricted
    /// profile, but never appeal. `still_restricted == 0` on the summary
    /// tells the caller the appeal phase is unnecessary.
    pub async fn verify_all(&self, exclude: &[String]) -> BatchOutcome {
        let Ok(_guard) = self.lock.try_lock() else {
            tracing::info!("verify batch skipped, another batch is running");
            return BatchOutcome::Busy;
        };
        let started_at = Utc::now();

        let (mut results, active) = self.classify_and_verify(exclude).await;
        for (profile, detail) in active {
            results.push(ProfileResult {
                profile,
                scenario: RestrictionScenario::CommentRestriction,
                outcome: ProfileOutcome::ConfirmedActive,
                detail,
            });
        }

        BatchOutcome::Completed(BatchSummary::tally(started_at, results))
    }

    /// The full batch: reset exhausted profiles, classify, verify, then
    /// appeal confirmed-active profiles in rounds.
    pub async fn batch_appeal_all(&self, exclude: &[String]) -> BatchOutcome {
        let Ok(_guard) = self.lock.try_lock() else {
            tracing::info!("appeal batch skipped, another batch is running");
            return BatchOutcome::Busy;
        };
        let started_at = Utc::now();

        // Exhausted marks belong to previous batches; this one grants a
        // fresh set of rounds.
        match self.ledger.clear_exhausted_marks().await {
            Ok(cleared) if cleared > 0 => {
                tracing::info!(cleared, "reset exhausted profiles for new batch");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "failed to reset exhausted profiles"),
        }

        let (mut results, active) = self.classify_and_verify(exclude).await;
        results.extend(self.appeal_rounds(active).await);

        let summary = BatchSummary::tally(started_at, results);
        self.notifier
            .notify(
                "batch_complete",
                serde_json::json!({
                    "total": summary.total,
                    "unblocked": summary.unblocked,
                    "appealed": summary.appealed,
                    "needs_captcha": summary.needs_captcha,
                    "still_restricted": summary.still_restricted,
                }),
            )
            .await;
        BatchOutcome::Completed(summary)
    }

    /// Steps 2–3 of the batch: scenario classification, then concurrent
    /// live verification of every `comment_restriction` profile. Returns
    /// settled results plus the confirmed-active profiles awaiting appeal.
    async fn classify_and_verify(
        &self,
        exclude: &[String],
    ) -> (Vec<ProfileResult>, Vec<(String, String)>) {
        let now = Utc::now();
        let mut results = Vec::new();
        let mut to_verify: Vec<String> = Vec::new();

        for profile in self.ledger.snapshot().await {
            if profile.status != ProfileStatus::Restricted || exclude.contains(&profile.name) {
                continue;
            }
            let reason = profile.restriction_reason.clone().unwrap_or_default();

            if profile.restriction_expired(now) {
                let outcome = match self.ledger.unblock(&profile.name).await {
                    Ok(()) => ProfileOutcome::Unblocked,
                    Err(error) => {
                        tracing::warn!(profile = %profile.name, %error, "unblock failed");
                        ProfileOutcome::VerifyFailed
                    }
                };
                results.push(ProfileResult {
                    profile: profile.name,
                    scenario: RestrictionScenario::Expired,
                    outcome,
                    detail: reason,
                });
            } else if self
                .classifier
                .is_checkpoint(&Signal::new("restriction_reason", reason.clone()))
            {
                if let Err(error) = self
                    .ledger
                    .set_appeal_mark(&profile.name, Some(AppealMark::NeedsCaptcha))
                    .await
                {
                    tracing::warn!(profile = %profile.name, %error, "mark failed");
                }
                results.push(ProfileResult {
                    profile: profile.name,
                    scenario: RestrictionScenario::Checkpoint,
                    outcome: ProfileOutcome::NeedsCaptcha,
                    detail: reason,
                });
            } else {
                to_verify.push(profile.name);
            }
        }

        let verdicts = join_all(to_verify.iter().map(|name| self.verify_one(name))).await;

        let mut active = Vec::new();
        for (name, verdict) in to_verify.into_iter().zip(verdicts) {
            match verdict {
                Verdict::Mapped(VerificationOutcome::Resolved, detail) => {
                    let outcome = match self.ledger.unblock(&name).await {
                        Ok(()) => ProfileOutcome::Unblocked,
                        Err(error) => {
                            tracing::warn!(profile = %name, %error, "unblock failed");
                            ProfileOutcome::VerifyFailed
                        }
                    };
                    results.push(ProfileResult {
                        profile: name,
                        scenario: RestrictionScenario::CommentRestriction,
                        outcome,
                        detail,
                    });
                }
                Verdict::Mapped(VerificationOutcome::InReview, detail) => {
                    if let Err(error) = self
                        .ledger
                        .set_appeal_mark(&name, Some(AppealMark::PendingReview))
                        .await
                    {
                        tracing::warn!(profile = %name, %error, "mark failed");
                    }
                    results.push(ProfileResult {
                        profile: name,
                        scenario: RestrictionScenario::CommentRestriction,
                        outcome: ProfileOutcome::PendingReview,
                        detail,
                    });
                }
                Verdict::Mapped(VerificationOutcome::Active, detail) => {
                    active.push((name, detail));
                }
                Verdict::Mapped(VerificationOutcome::Unknown, detail) => {
                    results.push(ProfileResult {
                        profile: name,
                        scenario: RestrictionScenario::CommentRestriction,
                        outcome: ProfileOutcome::Unknown,
                        detail,
                    });
                }
                Verdict::CallFailed(detail) => {
                    results.push(ProfileResult {
                        profile: name,
                        scenario: RestrictionScenario::CommentRestriction,
                        outcome: ProfileOutcome::VerifyFailed,
                        detail,
                    });
                }
            }
        }

        (results, active)
    }

    /// One live verification, with the narrow fallback probe when the first
    /// signal stays inconclusive.
    async fn verify_one(&self, name: &str) -> Verdict {
        let signal = match self.executor.verify(name).await {
            Ok(signal) => signal,
            Err(error) => return Verdict::CallFailed(error.to_string()),
        };
        let mapped = self.classifier.classify(&signal);
        if mapped != VerificationOutcome::Unknown {
            return Verdict::Mapped(mapped, signal.detail);
        }

        match self.executor.probe(name).await {
            Ok(fallback) => Verdict::Mapped(self.classifier.classify(&fallback), fallback.detail),
            Err(error) => {
                tracing::warn!(profile = %name, %error, "fallback probe failed");
                Verdict::Mapped(VerificationOutcome::Unknown, signal.detail)
            }
        }
    }

    /// Step 4: appeal confirmed-active profiles concurrently, in rounds with
    /// a fixed delay, retrying only while the per-profile attempt counter is
    /// below the cap.
    async fn appeal_rounds(&self, active: Vec<(String, String)>) -> Vec<ProfileResult> {
        let mut results = Vec::new();
        let mut pending: Vec<String> = active.into_iter().map(|(name, _)| name).collect();

        for round in 0..self.max_attempts {
            if pending.is_empty() {
                break;
            }
            if round > 0 {
                sleep(self.retry_delay).await;
            }

            let mut eligible = Vec::new();
            for name in pending.drain(..) {
                if self.attempts_of(&name).await >= self.max_attempts {
                    results.push(self.exhaust(name).await);
                } else {
                    eligible.push(name);
                }
            }
            if eligible.is_empty() {
                break;
            }

            tracing::info!(round, profiles = eligible.len(), "appeal round");
            let outcomes = join_all(eligible.iter().map(|name| self.appeal_one(name))).await;
            for (name, outcome) in eligible.into_iter().zip(outcomes) {
                match outcome {
                    Ok(detail) => {
                        if let Err(error) = self
                            .ledger
                            .set_appeal_mark(&name, Some(AppealMark::PendingReview))
                            .await
                        {
                            tracing::warn!(profile = %name, %error, "mark failed");
                        }
                        results.push(ProfileResult {
                            profile: name,
                            scenario: RestrictionScenario::CommentRestriction,
                            outcome: ProfileOutcome::Appealed,
                            detail,
                        });
                    }
                    Err(detail) => {
                        tracing::warn!(profile = %name, detail, "appeal attempt failed");
                        pending.push(name);
                    }
                }
            }
        }

        for name in pending {
            if self.attempts_of(&name).await >= self.max_attempts {
                results.push(self.exhaust(name).await);
            } else {
                results.push(ProfileResult {
                    profile: name,
                    scenario: RestrictionScenario::CommentRestriction,
                    outcome: ProfileOutcome::AppealFailed,
                    detail: "appeal rounds exhausted for this batch".into(),
                });
            }
        }

        results
    }

    async fn attempts_of(&self, name: &str) -> u32 {
        self.ledger
            .get(name)
            .await
            .map(|p| p.appeal_attempts)
            .unwrap_or(0)
    }

    async fn exhaust(&self, name: String) -> ProfileResult {
        if let Err(error) = self
            .ledger
            .set_appeal_mark(&name, Some(AppealMark::Exhausted))
            .await
        {
            tracing::warn!(profile = %name, %error, "mark failed");
        }
        ProfileResult {
            profile: name,
            scenario: RestrictionScenario::CommentRestriction,
            outcome: ProfileOutcome::Exhausted,
            detail: "appeal attempt cap reached".into(),
        }
    }

    /// One appeal submission. The attempt counter is bumped before the call
    /// so a crash mid-appeal still counts against the cap.
    async fn appeal_one(&self, name: &str) -> Result<String, String> {
        if let Err(error) = self.ledger.bump_appeal_attempts(name).await {
            return Err(error.to_string());
        }
        match self.executor.appeal(name).await {
            Ok(report) if report.status == crate::executor::PerformStatus::Ok => {
                Ok(report.signal.detail)
            }
            Ok(report) => Err(report.signal.detail),
            Err(error) => Err(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::executor::{
        CheckpointHint, KeywordClassifier, PerformReport, PerformStatus, ProgressSender,
        ReconcileReport, TaskSpec,
    };
    use crate::notify::NoopNotifier;

    /// Executor scripted per profile name.
    #[derive(Default)]
    struct MapExecutor {
        verify: HashMap<String, String>,
        probe: HashMap<String, String>,
        appeal_ok: bool,
        appeal_calls: StdMutex<Vec<String>>,
        verify_calls: AtomicU32,
    }

    impl ActionExecutor for MapExecutor {
        async fn perform(
            &self,
            _profile: &str,
            _task: &TaskSpec,
            _progress: ProgressSender,
        ) -> anyhow::Result<PerformReport> {
            anyhow::bail!("not part of the appeal workflow")
        }

        async fn verify(&self, profile: &str) -> anyhow::Result<Signal> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            match self.verify.get(profile) {
                Some(detail) => Ok(Signal::new("verify", detail.clone())),
                None => anyhow::bail!("verification transport failed"),
            }
        }

        async fn probe(&self, profile: &str) -> anyhow::Result<Signal> {
            match self.probe.get(profile) {
                Some(detail) => Ok(Signal::new("probe", detail.clone())),
                None => anyhow::bail!("probe unavailable"),
            }
        }

        async fn appeal(&self, profile: &str) -> anyhow::Result<PerformReport> {
            self.appeal_calls.lock().unwrap().push(profile.to_string());
            Ok(PerformReport {
                status: if self.appeal_ok {
                    PerformStatus::Ok
                } else {
                    PerformStatus::Failed
                },
                signal: Signal::new("appeal", if self.appeal_ok { "submitted" } else { "form error" }),
                steps: Vec::new(),
            })
        }

        async fn reconcile(
            &self,
            _profile: &str,
            _hint: &CheckpointHint,
        ) -> anyhow::Result<ReconcileReport> {
            anyhow::bail!("not part of the appeal workflow")
        }
    }

    async fn ledger_with(names: &[&str]) -> (tempfile::TempDir, Arc<ProfileLedger>) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ProfileLedger::open(dir.path().join("profiles.json")).await;
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        ledger.sync_sessions(&names).await.unwrap();
        (dir, Arc::new(ledger))
    }

    fn engine(
        ledger: Arc<ProfileLedger>,
        executor: MapExecutor,
        max_attempts: u32,
    ) -> AppealEngine<MapExecutor, KeywordClassifier, NoopNotifier> {
        AppealEngine::new(
            ledger,
            executor,
            KeywordClassifier,
            NoopNotifier,
            max_attempts,
            Duration::from_millis(0),
        )
    }

    #[tokio::test]
    async fn concurrent_trigger_gets_busy_immediately() {
        let (_dir, ledger) = ledger_with(&[]).await;
        let engine = engine(ledger, MapExecutor::default(), 3);

        let held = engine.try_quiesce().unwrap();
        let outcome = engine.batch_appeal_all(&[]).await;
        assert!(outcome.is_busy());
        let outcome = engine.verify_all(&[]).await;
        assert!(outcome.is_busy());

        // Releasing the lock lets the next trigger through.
        drop(held);
        assert!(!engine.batch_appeal_all(&[]).await.is_busy());
    }

    #[tokio::test]
    async fn full_batch_scenario_split() {
        // One expired, one checkpoint, one confirmed-active restriction.
        let (_dir, ledger) = ledger_with(&["expired", "captcha", "active"]).await;
        ledger
            .mark_restricted("expired", Some(-1), "old comment block")
            .await
            .unwrap();
        ledger
            .mark_restricted("captcha", Some(48), "solve the captcha to continue")
            .await
            .unwrap();
        ledger
            .mark_restricted("active", Some(48), "comment block")
            .await
            .unwrap();

        let mut executor = MapExecutor {
            appeal_ok: true,
            ..Default::default()
        };
        executor
            .verify
            .insert("active".into(), "still restricted from commenting".into());

        let engine = engine(ledger.clone(), executor, 3);
        let outcome = engine.batch_appeal_all(&[]).await;
        let summary = outcome.summary().unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.unblocked, 1);
        assert_eq!(summary.needs_captcha, 1);
        assert_eq!(summary.appealed, 1);

        assert_eq!(
            ledger.get("expired").await.unwrap().status,
            ProfileStatus::Active
        );
        assert_eq!(
            ledger.get("captcha").await.unwrap().appeal_mark,
            Some(AppealMark::NeedsCaptcha)
        );
        let appealed = ledger.get("active").await.unwrap();
        assert_eq!(appealed.appeal_attempts, 1);
        assert_eq!(appealed.appeal_mark, Some(AppealMark::PendingReview));
    }

    #[tokio::test]
    async fn verify_all_never_appeals() {
        let (_dir, ledger) = ledger_with(&["active"]).await;
        ledger
            .mark_restricted("active", Some(48), "comment block")
            .await
            .unwrap();

        let mut executor = MapExecutor::default();
        executor
            .verify
            .insert("active".into(), "still restricted".into());

        let engine = engine(ledger, executor, 3);
        let outcome = engine.verify_all(&[]).await;
        let summary = outcome.summary().unwrap();

        assert_eq!(summary.confirmed_active, 1);
        assert_eq!(summary.still_restricted, 1);
        assert!(engine.executor.appeal_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolved_verification_unblocks() {
        let (_dir, ledger) = ledger_with(&["lucky"]).await;
        ledger
            .mark_restricted("lucky", Some(48), "comment block")
            .await
            .unwrap();

        let mut executor = MapExecutor::default();
        executor
            .verify
            .insert("lucky".into(), "account is no longer restricted".into());

        let engine = engine(ledger.clone(), executor, 3);
        let summary = engine.batch_appeal_all(&[]).await;
        assert_eq!(summary.summary().unwrap().unblocked, 1);
        assert_eq!(
            ledger.get("lucky").await.unwrap().status,
            ProfileStatus::Active
        );
    }

    #[tokio::test]
    async fn unknown_signal_falls_back_to_probe() {
        let (_dir, ledger) = ledger_with(&["murky"]).await;
        ledger
            .mark_restricted("murky", Some(48), "comment block")
            .await
            .unwrap();

        let mut executor = MapExecutor::default();
        executor.verify.insert("murky".into(), "page looks normal".into());
        executor
            .probe
            .insert("murky".into(), "restriction lifted".into());

        let engine = engine(ledger.clone(), executor, 3);
        let summary = engine.batch_appeal_all(&[]).await;
        assert_eq!(summary.summary().unwrap().unblocked, 1);
    }

    #[tokio::test]
    async fn probe_failure_gives_up_as_unknown() {
        let (_dir, ledger) = ledger_with(&["murky"]).await;
        ledger
            .mark_restricted("murky", Some(48), "comment block")
            .await
            .unwrap();

        let mut executor = MapExecutor::default();
        executor.verify.insert("murky".into(), "page looks normal".into());

        let engine = engine(ledger, executor, 3);
        let summary = engine.batch_appeal_all(&[]).await;
        let summary = summary.summary().unwrap();
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.appealed, 0);
    }

    #[tokio::test]
    async fn in_review_profiles_are_not_appealed() {
        let (_dir, ledger) = ledger_with(&["waiting"]).await;
        ledger
            .mark_restricted("waiting", Some(48), "comment block")
            .await
            .unwrap();

        let mut executor = MapExecutor::default();
        executor
            .verify
            .insert("waiting".into(), "your appeal is under review".into());

        let engine = engine(ledger.clone(), executor, 3);
        let summary = engine.batch_appeal_all(&[]).await;
        assert_eq!(summary.summary().unwrap().pending_review, 1);
        assert!(engine.executor.appeal_calls.lock().unwrap().is_empty());
        assert_eq!(
            ledger.get("waiting").await.unwrap().appeal_mark,
            Some(AppealMark::PendingReview)
        );
    }

    #[tokio::test]
    async fn failed_appeals_retry_in_rounds_until_exhausted() {
        let (_dir, ledger) = ledger_with(&["stubborn"]).await;
        ledger
            .mark_restricted("stubborn", Some(48), "comment block")
            .await
            .unwrap();

        let mut executor = MapExecutor::default();
        executor
            .verify
            .insert("stubborn".into(), "still restricted".into());

        let engine = engine(ledger.clone(), executor, 2);
        let outcome = engine.batch_appeal_all(&[]).await;
        let summary = outcome.summary().unwrap();

        // Two rounds ran, both failed, the cap was reached.
        assert_eq!(engine.executor.appeal_calls.lock().unwrap().len(), 2);
        assert_eq!(summary.exhausted, 1);
        assert_eq!(summary.appealed, 0);
        assert_eq!(
            ledger.get("stubborn").await.unwrap().appeal_mark,
            Some(AppealMark::Exhausted)
        );
    }

    #[tokio::test]
    async fn new_batch_resets_exhausted_profiles() {
        let (_dir, ledger) = ledger_with(&["stubborn"]).await;
        ledger
            .mark_restricted("stubborn", Some(48), "comment block")
            .await
            .unwrap();
        ledger
            .set_appeal_mark("stubborn", Some(AppealMark::Exhausted))
            .await
            .unwrap();
        ledger.bump_appeal_attempts("stubborn").await.unwrap();
        ledger.bump_appeal_attempts("stubborn").await.unwrap();

        let mut executor = MapExecutor {
            appeal_ok: true,
            ..Default::default()
        };
        executor
            .verify
            .insert("stubborn".into(), "still restricted".into());

        let engine = engine(ledger.clone(), executor, 2);
        let outcome = engine.batch_appeal_all(&[]).await;

        // The stale counter was wiped, so the appeal ran again.
        assert_eq!(outcome.summary().unwrap().appealed, 1);
        assert_eq!(ledger.get("stubborn").await.unwrap().appeal_attempts, 1);
    }

    #[tokio::test]
    async fn excluded_profiles_are_left_alone() {
        let (_dir, ledger) = ledger_with(&["busy-one"]).await;
        ledger
            .mark_restricted("busy-one", Some(48), "comment block")
            .await
            .unwrap();

        let engine = engine(ledger, MapExecutor::default(), 3);
        let outcome = engine.batch_appeal_all(&["busy-one".to_string()]).await;
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(engine.executor.verify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn verify_transport_failure_is_recorded_per_profile() {
        let (_dir, ledger) = ledger_with(&["offline"]).await;
        ledger
            .mark_restricted("offline", Some(48), "comment block")
            .await
            .unwrap();

        // No verify entry: the call itself errors.
        let engine = engine(ledger, MapExecutor::default(), 3);
        let outcome = engine.batch_appeal_all(&[]).await;
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.results[0].outcome, ProfileOutcome::VerifyFailed);
    }
}
