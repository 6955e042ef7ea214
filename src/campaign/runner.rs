//! Campaign execution and crash recovery.
//!
//! Jobs run strictly in index order with at most one inflight checkpoint per
//! campaign. Recovery guarantees at-most-once externally-visible execution:
//! an action whose completion state cannot be determined is recorded as
//! `uncertain_no_repost` and never re-attempted.

use std::pin::pin;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::campaign::{
    Campaign, CampaignQueue, CampaignStatus, CheckpointPhase, InflightCheckpoint, Job, JobResult,
};
use crate::error::CarrosselError;
use crate::executor::{ActionExecutor, CheckpointHint, PerformStatus, TaskSpec};
use crate::ledger::ProfileLedger;

/// Minimum reconciliation confidence to accept a definite answer.
const RECONCILE_CONFIDENCE: f32 = 0.8;

/// Per-campaign processing summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignReport {
    pub campaign_id: String,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when processing stopped before the campaign completed.
    pub halted: Option<String>,
}

/// What recovery decided about one interrupted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub campaign_id: String,
    pub job_index: usize,
    pub profile: String,
    pub method: String,
    pub success: bool,
}

/// Drives campaigns through the queue one job at a time, delegating the
/// actual action to the external executor.
pub struct CampaignRunner<'a, E> {
    queue: &'a CampaignQueue,
    ledger: &'a ProfileLedger,
    executor: &'a E,
    restriction_default_hours: i64,
}

impl<'a, E: ActionExecutor> CampaignRunner<'a, E> {
    pub fn new(
        queue: &'a CampaignQueue,
        ledger: &'a ProfileLedger,
        executor: &'a E,
        restriction_default_hours: i64,
    ) -> Self {
        Self {
            queue,
            ledger,
            executor,
            restriction_default_hours,
        }
    }

    /// Resolves every inflight checkpoint left behind by a crash. Must run
    /// before any campaign processing starts.
    pub async fn recover_all(&self) -> Result<Vec<RecoveryReport>, CarrosselError> {
        let mut reports = Vec::new();
        for campaign in self.queue.campaigns_with_inflight().await {
            if let Some(report) = self.recover(&campaign).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Resolves a single campaign's inflight checkpoint, if any.
    ///
    /// The original action is never retried. The executor reconciles against
    /// present-tense external state; anything short of a high-confidence
    /// answer is recorded as `uncertain_no_repost`.
    pub async fn recover(
        &self,
        campaign: &Campaign,
    ) -> Result<Option<RecoveryReport>, CarrosselError> {
        let Some(checkpoint) = &campaign.inflight else {
            return Ok(None);
        };

        let hint = CheckpointHint {
            phase: checkpoint.phase.to_string(),
            content_hash: checkpoint.content_hash.clone(),
            attempt_id: checkpoint.attempt_id.clone(),
        };
        tracing::warn!(
            campaign = %campaign.id,
            job_index = checkpoint.job_index,
            phase = %checkpoint.phase,
            "found inflight checkpoint, reconciling",
        );

        let (success, method, detail) =
            match self.executor.reconcile(&checkpoint.profile, &hint).await {
                Ok(report) if report.confidence >= RECONCILE_CONFIDENCE => match report.found {
                    Some(true) => (true, "reconciled", report.reason),
                    Some(false) => (false, "reconciled_absent", report.reason),
                    None => (false, "uncertain_no_repost", report.reason),
                },
                Ok(report) => (false, "uncertain_no_repost", report.reason),
                Err(error) => (false, "uncertain_no_repost", error.to_string()),
            };

        tracing::info!(
            campaign = %campaign.id,
            job_index = checkpoint.job_index,
            method,
            success,
            "inflight checkpoint resolved",
        );

        let result = JobResult {
            job_index: checkpoint.job_index,
            profile: Some(checkpoint.profile.clone()),
            success,
            method: method.to_string(),
            detail,
            recovered_from_inflight: true,
            completed_at: Utc::now(),
        };
        let report = RecoveryReport {
            campaign_id: campaign.id.clone(),
            job_index: checkpoint.job_index,
            profile: checkpoint.profile.clone(),
            method: method.to_string(),
            success,
        };
        self.queue.record_result(&campaign.id, result).await?;
        Ok(Some(report))
    }

    /// Processes the next runnable campaign to completion (or until no
    /// eligible profile remains). Returns `None` when the queue is drained.
    pub async fn run_next(
        &self,
        tag_filter: Option<&str>,
    ) -> Result<Option<CampaignReport>, CarrosselError> {
        let Some(campaign) = self.queue.next_runnable().await else {
            return Ok(None);
        };
        if campaign.inflight.is_some() {
            self.recover(&campaign).await?;
        }
        if campaign.status == CampaignStatus::Pending {
            self.queue.mark_processing(&campaign.id).await?;
        }

        let mut report = CampaignReport {
            campaign_id: campaign.id.clone(),
            succeeded: 0,
            failed: 0,
            halted: None,
        };

        loop {
            let Some(current) = self.queue.campaign(&campaign.id).await else {
                return Err(CarrosselError::CampaignNotFound(campaign.id.clone()));
            };
            let Some(job) = current.next_job().cloned() else {
                break;
            };

            // Structural validation happens before any checkpoint exists, so
            // a bad job is rejected without a side effect and never retried.
            if job.text.trim().is_empty() {
                self.queue
                    .record_result(
                        &campaign.id,
                        JobResult {
                            job_index: job.index,
                            profile: None,
                            success: false,
                            method: "rejected".into(),
                            detail: "empty job text".into(),
                            recovered_from_inflight: false,
                            completed_at: Utc::now(),
                        },
                    )
                    .await?;
                report.failed += 1;
                continue;
            }

            let Some(profile) = self
                .ledger
                .priority_order(tag_filter)
                .await
                .into_iter()
                .next()
            else {
                report.halted = Some("no eligible profile".into());
                break;
            };

            let success = self.run_job(&campaign.id, &job, &profile).await?;
            if success {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        Ok(Some(report))
    }

    /// Executes one job: checkpoint, perform with live phase bumps, record.
    async fn run_job(
        &self,
        campaign_id: &str,
        job: &Job,
        profile: &str,
    ) -> Result<bool, CarrosselError> {
        self.queue
            .set_checkpoint(campaign_id, InflightCheckpoint::new(job, profile))
            .await?;

        let task = TaskSpec {
            action: job.kind.as_action().to_string(),
            text: job.text.clone(),
            target: job.target.clone(),
            attachment: job.attachment.clone(),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut perform = pin!(self.executor.perform(profile, &task, tx));
        let mut progress_open = true;
        let outcome = loop {
            tokio::select! {
                mark = rx.recv(), if progress_open => match mark {
                    Some(mark) => {
                        if let Some(phase) = CheckpointPhase::from_step(&mark.step) {
                            self.queue.advance_phase(campaign_id, phase).await?;
                        }
                    }
                    None => progress_open = false,
                },
                result = &mut perform => {
                    // The executor finished; flush milestones it reported on
                    // the way out before the result is recorded.
                    while let Ok(mark) = rx.try_recv() {
                        if let Some(phase) = CheckpointPhase::from_step(&mark.step) {
                            self.queue.advance_phase(campaign_id, phase).await?;
                        }
                    }
                    break result;
                }
            }
        };

        let (success, method, detail) = match outcome {
            Ok(report) => match report.status {
                PerformStatus::Ok => (true, "posted", report.signal.detail),
                PerformStatus::Failed => (false, "failed", report.signal.detail),
                PerformStatus::Restricted => {
                    self.ledger
                        .mark_restricted(
                            profile,
                            Some(self.restriction_default_hours),
                            &report.signal.detail,
                        )
                        .await?;
                    (false, "restricted", report.signal.detail)
                }
            },
            Err(error) => (false, "error", error.to_string()),
        };

        self.ledger
            .mark_used(profile, campaign_id, &job.text, success)
            .await?;
        self.queue
            .record_result(
                campaign_id,
                JobResult {
                    job_index: job.index,
                    profile: Some(profile.to_string()),
                    success,
                    method: method.to_string(),
                    detail,
                    recovered_from_inflight: false,
                    completed_at: Utc::now(),
                },
            )
            .await?;
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::campaign::{JobDraft, JobKind};
    use crate::executor::{PerformReport, ProgressSender, ReconcileReport, Signal, StepMark};

    /// Test executor scripted per call. `perform_allowed = false` turns any
    /// perform call into a panic, which is how the at-most-once property is
    /// asserted.
    struct ScriptedExecutor {
        perform_allowed: bool,
        perform_status: PerformStatus,
        perform_error: Option<String>,
        reconcile: Option<ReconcileReport>,
        perform_calls: AtomicU32,
        reconcile_hints: Mutex<Vec<CheckpointHint>>,
    }

    impl Default for ScriptedExecutor {
        fn default() -> Self {
            Self {
                perform_allowed: true,
                perform_status: PerformStatus::Ok,
                perform_error: None,
                reconcile: None,
                perform_calls: AtomicU32::new(0),
                reconcile_hints: Mutex::new(Vec::new()),
            }
        }
    }

    impl ActionExecutor for ScriptedExecutor {
        async fn perform(
            &self,
            _profile: &str,
            _task: &TaskSpec,
            progress: ProgressSender,
        ) -> anyhow::Result<PerformReport> {
            assert!(
                self.perform_allowed,
                "perform must not be called during recovery"
            );
            self.perform_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.perform_error {
                anyhow::bail!("{message}");
            }
            let _ = progress.send(StepMark::now("attachment_confirmed"));
            let _ = progress.send(StepMark::now("submit_clicked"));
            let _ = progress.send(StepMark::now("confirmed"));
            Ok(PerformReport {
                status: self.perform_status,
                signal: Signal::new("post", "done"),
                steps: Vec::new(),
            })
        }

        async fn verify(&self, _profile: &str) -> anyhow::Result<Signal> {
            Ok(Signal::new("verify", "unused"))
        }

        async fn probe(&self, _profile: &str) -> anyhow::Result<Signal> {
            Ok(Signal::new("probe", "unused"))
        }

        async fn appeal(&self, _profile: &str) -> anyhow::Result<PerformReport> {
            anyhow::bail!("not part of campaign execution")
        }

        async fn reconcile(
            &self,
            _profile: &str,
            hint: &CheckpointHint,
        ) -> anyhow::Result<ReconcileReport> {
            self.reconcile_hints.lock().unwrap().push(hint.clone());
            match &self.reconcile {
                Some(report) => Ok(report.clone()),
                None => anyhow::bail!("reconcile unavailable"),
            }
        }
    }

    fn draft(text: &str) -> JobDraft {
        JobDraft {
            kind: JobKind::Post,
            text: text.to_string(),
            target: None,
            attachment: None,
        }
    }

    async fn services(profiles: &[&str]) -> (tempfile::TempDir, CampaignQueue, ProfileLedger) {
        let dir = tempfile::tempdir().unwrap();
        let queue = CampaignQueue::open(dir.path().join("campaigns.json"), 30).await;
        let ledger = ProfileLedger::open(dir.path().join("profiles.json")).await;
        let names: Vec<String> = profiles.iter().map(|s| s.to_string()).collect();
        ledger.sync_sessions(&names).await.unwrap();
        (dir, queue, ledger)
    }

    /// Puts a campaign into the exact state a crash after "submit clicked"
    /// leaves behind: processing, one checkpoint, no result.
    async fn crashed_campaign(queue: &CampaignQueue, text: &str) -> Campaign {
        let submitted = queue.submit_draft("crashed", vec![draft(text)]).await.unwrap();
        queue.mark_processing(&submitted.id).await.unwrap();
        let campaign = queue.campaign(&submitted.id).await.unwrap();
        queue
            .set_checkpoint(&submitted.id, InflightCheckpoint::new(&campaign.jobs[0], "p1"))
            .await
            .unwrap();
        queue
            .advance_phase(&submitted.id, CheckpointPhase::SubmitClicked)
            .await
            .unwrap();
        queue.campaign(&submitted.id).await.unwrap()
    }

    #[tokio::test]
    async fn happy_path_rotates_profiles_and_completes() {
        let (_dir, queue, ledger) = services(&["p1", "p2"]).await;
        let executor = ScriptedExecutor::default();
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);

        queue
            .submit_draft("launch", vec![draft("first post"), draft("second post")])
            .await
            .unwrap();
        let report = runner.run_next(None).await.unwrap().unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert!(report.halted.is_none());

        let campaign = queue.campaign(&report.campaign_id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert!(campaign.inflight.is_none());

        // LRU rotation: job 0 went to p1, job 1 to p2.
        assert_eq!(campaign.results[0].profile.as_deref(), Some("p1"));
        assert_eq!(campaign.results[1].profile.as_deref(), Some("p2"));

        let p1 = ledger.get("p1").await.unwrap();
        assert_eq!(p1.usage_count, 1);
        assert_eq!(p1.usage_history[0].campaign_id, report.campaign_id);
    }

    #[tokio::test]
    async fn recovery_never_reruns_the_action_when_inconclusive() {
        let (_dir, queue, ledger) = services(&["p1"]).await;
        let campaign = crashed_campaign(&queue, "interrupted post").await;

        let executor = ScriptedExecutor {
            perform_allowed: false,
            reconcile: Some(ReconcileReport {
                found: None,
                confidence: 0.3,
                reason: "feed scan inconclusive".into(),
            }),
            ..Default::default()
        };
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);

        let reports = runner.recover_all().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].method, "uncertain_no_repost");
        assert!(!reports[0].success);
        assert_eq!(executor.perform_calls.load(Ordering::SeqCst), 0);

        let recovered = queue.campaign(&campaign.id).await.unwrap();
        assert!(recovered.inflight.is_none());
        assert_eq!(recovered.status, CampaignStatus::Completed);
        let result = &recovered.results[0];
        assert_eq!(result.method, "uncertain_no_repost");
        assert!(!result.success);
        assert!(result.recovered_from_inflight);

        // The reconcile call received the persisted phase as a hint.
        let hints = executor.reconcile_hints.lock().unwrap();
        assert_eq!(hints[0].phase, "submit_clicked");
    }

    #[tokio::test]
    async fn confident_reconciliation_records_success() {
        let (_dir, queue, ledger) = services(&["p1"]).await;
        let campaign = crashed_campaign(&queue, "it actually landed").await;

        let executor = ScriptedExecutor {
            perform_allowed: false,
            reconcile: Some(ReconcileReport {
                found: Some(true),
                confidence: 0.95,
                reason: "post visible on profile".into(),
            }),
            ..Default::default()
        };
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);
        let report = runner.recover(&campaign).await.unwrap().unwrap();

        assert!(report.success);
        assert_eq!(report.method, "reconciled");
        let result = &queue.campaign(&campaign.id).await.unwrap().results[0];
        assert!(result.success);
        assert!(result.recovered_from_inflight);
    }

    #[tokio::test]
    async fn confident_absence_records_failure_not_uncertain() {
        let (_dir, queue, ledger) = services(&["p1"]).await;
        let campaign = crashed_campaign(&queue, "never landed").await;

        let executor = ScriptedExecutor {
            perform_allowed: false,
            reconcile: Some(ReconcileReport {
                found: Some(false),
                confidence: 0.9,
                reason: "no trace of the post".into(),
            }),
            ..Default::default()
        };
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);
        let report = runner.recover(&campaign).await.unwrap().unwrap();

        assert!(!report.success);
        assert_eq!(report.method, "reconciled_absent");
    }

    #[tokio::test]
    async fn reconcile_error_is_treated_as_uncertain() {
        let (_dir, queue, ledger) = services(&["p1"]).await;
        let campaign = crashed_campaign(&queue, "executor offline").await;

        let executor = ScriptedExecutor {
            perform_allowed: false,
            reconcile: None,
            ..Default::default()
        };
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);
        let report = runner.recover(&campaign).await.unwrap().unwrap();
        assert_eq!(report.method, "uncertain_no_repost");
    }

    #[tokio::test]
    async fn restricted_outcome_marks_the_profile() {
        let (_dir, queue, ledger) = services(&["p1", "p2"]).await;
        let executor = ScriptedExecutor {
            perform_status: PerformStatus::Restricted,
            ..Default::default()
        };
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);

        queue
            .submit_draft("launch", vec![draft("gets blocked")])
            .await
            .unwrap();
        let report = runner.run_next(None).await.unwrap().unwrap();
        assert_eq!(report.failed, 1);

        let p1 = ledger.get("p1").await.unwrap();
        assert_eq!(p1.status, crate::ledger::ProfileStatus::Restricted);
        assert!(p1.restriction_expires_at.is_some());
        // The restricted profile no longer rotates.
        assert_eq!(ledger.priority_order(None).await, vec!["p2"]);
    }

    #[tokio::test]
    async fn executor_error_records_failure_and_continues() {
        let (_dir, queue, ledger) = services(&["p1"]).await;
        let executor = ScriptedExecutor {
            perform_error: Some("vendor timeout".into()),
            ..Default::default()
        };
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);

        queue
            .submit_draft("launch", vec![draft("a"), draft("b")])
            .await
            .unwrap();
        let report = runner.run_next(None).await.unwrap().unwrap();

        assert_eq!(report.failed, 2);
        let campaign = queue.campaign(&report.campaign_id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.results[0].method, "error");
        assert!(campaign.results[0].detail.contains("vendor timeout"));
    }

    #[tokio::test]
    async fn halts_when_no_profile_is_eligible() {
        let (_dir, queue, ledger) = services(&["p1"]).await;
        ledger
            .mark_restricted("p1", Some(24), "blocked")
            .await
            .unwrap();
        let executor = ScriptedExecutor::default();
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);

        queue.submit_draft("launch", vec![draft("stuck")]).await.unwrap();
        let report = runner.run_next(None).await.unwrap().unwrap();

        assert_eq!(report.halted.as_deref(), Some("no eligible profile"));
        let campaign = queue.campaign(&report.campaign_id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Processing);
        assert!(campaign.results.is_empty());
        assert_eq!(executor.perform_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interrupted_campaign_resumes_after_recovery() {
        let (_dir, queue, ledger) = services(&["p1"]).await;
        // Two jobs; the first crashed mid-flight.
        let submitted = queue
            .submit_draft("resume", vec![draft("crashed one"), draft("fresh one")])
            .await
            .unwrap();
        queue.mark_processing(&submitted.id).await.unwrap();
        let campaign = queue.campaign(&submitted.id).await.unwrap();
        queue
            .set_checkpoint(&submitted.id, InflightCheckpoint::new(&campaign.jobs[0], "p1"))
            .await
            .unwrap();

        let executor = ScriptedExecutor {
            reconcile: Some(ReconcileReport {
                found: None,
                confidence: 0.0,
                reason: "cannot tell".into(),
            }),
            ..Default::default()
        };
        let runner = CampaignRunner::new(&queue, &ledger, &executor, 24);
        let report = runner.run_next(None).await.unwrap().unwrap();

        // Job 0 resolved by recovery, job 1 executed normally.
        assert_eq!(executor.perform_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.succeeded, 1);
        let campaign = queue.campaign(&submitted.id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.results[0].method, "uncertain_no_repost");
        assert_eq!(campaign.results[1].method, "posted");
    }

    #[test]
    fn step_names_map_to_phases() {
        assert_eq!(
            CheckpointPhase::from_step("submit_clicked"),
            Some(CheckpointPhase::SubmitClicked)
        );
        assert_eq!(
            CheckpointPhase::from_step("attachment_confirmed"),
            Some(CheckpointPhase::AttachmentConfirmed)
        );
        assert_eq!(CheckpointPhase::from_step("hovered_button"), None);
        assert!(CheckpointPhase::Started < CheckpointPhase::Confirmed);
    }
}
