//! Campaign queue: ordered job lists, inflight checkpoints and completed
//! history.
//!
//! A campaign moves `pending → processing → completed`; each job moves
//! `pending → inflight → {success | failed | uncertain}`. At most one job per
//! campaign carries an inflight checkpoint, and it must be cleared (by
//! recording a result) before the next job starts.

mod runner;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

pub use runner::{CampaignReport, CampaignRunner, RecoveryReport};

use crate::dedup::{self, DuplicateHit, HistoryEntry, HistoryResult};
use crate::error::CarrosselError;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Post,
    Reply,
}

impl JobKind {
    pub fn as_action(&self) -> &'static str {
        match self {
            JobKind::Post => "post",
            JobKind::Reply => "reply",
        }
    }
}

/// A single unit of outbound work inside a campaign. `index` is immutable
/// and fixes execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub index: usize,
    pub kind: JobKind,
    pub text: String,
    pub target: Option<String>,
    pub attachment: Option<String>,
}

/// Job input as submitted by a caller, before the queue assigns indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDraft {
    pub kind: JobKind,
    pub text: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub attachment: Option<String>,
}

/// Ordered milestones of a side-effecting action. Persisted transitions only
/// ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    Started,
    AttachmentConfirmed,
    SubmitClicked,
    Confirmed,
}

impl CheckpointPhase {
    /// Maps an executor step name to a phase, if it names one.
    pub fn from_step(step: &str) -> Option<Self> {
        match step {
            "attachment_confirmed" => Some(Self::AttachmentConfirmed),
            "submit_clicked" => Some(Self::SubmitClicked),
            "confirmed" => Some(Self::Confirmed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointPhase::Started => write!(f, "started"),
            CheckpointPhase::AttachmentConfirmed => write!(f, "attachment_confirmed"),
            CheckpointPhase::SubmitClicked => write!(f, "submit_clicked"),
            CheckpointPhase::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Durable marker written immediately before an externally-visible side
/// effect is attempted. Cleared only once the job's outcome is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InflightCheckpoint {
    pub job_index: usize,
    pub profile: String,
    pub content_hash: String,
    pub phase: CheckpointPhase,
    pub attempt_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
}

impl InflightCheckpoint {
    pub fn new(job: &Job, profile: &str) -> Self {
        Self {
            job_index: job.index,
            profile: profile.to_string(),
            content_hash: content_hash(&job.text),
            phase: CheckpointPhase::Started,
            attempt_id: Uuid::new_v4().to_string(),
            metadata: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }
}

/// The durably recorded outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_index: usize,
    pub profile: Option<String>,
    pub success: bool,
    /// How the outcome was determined: `posted`, `failed`, `rejected`,
    /// `reconciled`, `reconciled_absent`, `uncertain_no_repost`.
    pub method: String,
    pub detail: String,
    #[serde(default)]
    pub recovered_from_inflight: bool,
    pub completed_at: DateTime<Utc>,
}

/// A named batch of jobs plus everything recorded about running them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub results: Vec<JobResult>,
    pub inflight: Option<InflightCheckpoint>,
    #[serde(default)]
    pub warnings: Vec<DuplicateHit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// The next job without a recorded result, in index order.
    pub fn next_job(&self) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|job| !self.results.iter().any(|r| r.job_index == job.index))
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() >= self.jobs.len()
    }
}

/// Content address of a job text: truncated hex SHA-256 over the normalized
/// form, so case and whitespace differences collapse to the same identity.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(dedup::normalize(text).as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Outcome of submitting a draft: the assigned id plus any duplicate
/// warnings. Warnings are advisory, the campaign is enqueued regardless.
#[derive(Debug, Clone)]
pub struct SubmittedCampaign {
    pub id: String,
    pub warnings: Vec<DuplicateHit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    campaigns: Vec<Campaign>,
}

/// Single-instance service over the campaign state file.
pub struct CampaignQueue {
    path: PathBuf,
    lookback_days: u32,
    inner: Mutex<QueueState>,
}

impl CampaignQueue {
    pub async fn open(path: impl AsRef<Path>, lookback_days: u32) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = store::read_json_or(&path, QueueState::default()).await;
        Self {
            path,
            lookback_days,
            inner: Mutex::new(state),
        }
    }

    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut QueueState) -> Result<T, CarrosselError>,
    ) -> Result<T, CarrosselError> {
        let mut state = self.inner.lock().await;
        let out = op(&mut state)?;
        store::write_json(&self.path, &*state).await?;
        Ok(out)
    }

    /// Validates and enqueues a draft campaign, running the duplicate guard
    /// against the batch itself and completed history.
    pub async fn submit_draft(
        &self,
        name: &str,
        drafts: Vec<JobDraft>,
    ) -> Result<SubmittedCampaign, CarrosselError> {
        if drafts.is_empty() {
            return Err(CarrosselError::InvalidJob("empty job list".into()));
        }
        for (index, draft) in drafts.iter().enumerate() {
            if draft.text.trim().is_empty() {
                return Err(CarrosselError::InvalidJob(format!(
                    "job {index} has empty text"
                )));
            }
        }

        let lookback = self.lookback_days;
        self.mutate(|state| {
            let candidates: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
            let history = completed_history(state);
            let warnings = dedup::scan(&candidates, &history, lookback, Utc::now());
            for hit in &warnings {
                tracing::warn!(
                    scope = %hit.scope.label(),
                    text = %hit.text,
                    origin = %hit.origin,
                    "duplicate content in submitted campaign",
                );
            }

            let now = Utc::now();
            let campaign = Campaign {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                status: CampaignStatus::Pending,
                jobs: drafts
                    .into_iter()
                    .enumerate()
                    .map(|(index, d)| Job {
                        index,
                        kind: d.kind,
                        text: d.text,
                        target: d.target,
                        attachment: d.attachment,
                    })
                    .collect(),
                results: Vec::new(),
                inflight: None,
                warnings: warnings.clone(),
                created_at: now,
                updated_at: now,
            };
            let id = campaign.id.clone();
            state.campaigns.push(campaign);
            Ok(SubmittedCampaign { id, warnings })
        })
        .await
    }

    /// The first campaign still waiting to be processed.
    pub async fn next_pending(&self) -> Option<Campaign> {
        self.inner
            .lock()
            .await
            .campaigns
            .iter()
            .find(|c| c.status == CampaignStatus::Pending)
            .cloned()
    }

    /// The first campaign with work left: an interrupted `processing`
    /// campaign takes precedence over untouched pending ones.
    pub async fn next_runnable(&self) -> Option<Campaign> {
        let state = self.inner.lock().await;
        state
            .campaigns
            .iter()
            .find(|c| c.status == CampaignStatus::Processing && !c.is_complete())
            .or_else(|| {
                state
                    .campaigns
                    .iter()
                    .find(|c| c.status == CampaignStatus::Pending)
            })
            .cloned()
    }

    pub async fn campaign(&self, id: &str) -> Option<Campaign> {
        self.inner
            .lock()
            .await
            .campaigns
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Campaigns carrying an inflight checkpoint, in queue order. Non-empty
    /// only after a crash mid-action.
    pub async fn campaigns_with_inflight(&self) -> Vec<Campaign> {
        self.inner
            .lock()
            .await
            .campaigns
            .iter()
            .filter(|c| c.inflight.is_some())
            .cloned()
            .collect()
    }

    pub async fn mark_processing(&self, id: &str) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let campaign = find_mut(state, id)?;
            campaign.status = CampaignStatus::Processing;
            campaign.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// Writes the inflight checkpoint for a job about to execute. Refuses if
    /// another job in the campaign is already checkpointed.
    pub async fn set_checkpoint(
        &self,
        id: &str,
        checkpoint: InflightCheckpoint,
    ) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let campaign = find_mut(state, id)?;
            if let Some(existing) = &campaign.inflight {
                return Err(CarrosselError::InvalidJob(format!(
                    "job {} is already in flight",
                    existing.job_index
                )));
            }
            campaign.inflight = Some(checkpoint);
            campaign.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// Advances the checkpoint phase. Transitions only move forward; a stale
    /// or repeated milestone is ignored.
    pub async fn advance_phase(
        &self,
        id: &str,
        phase: CheckpointPhase,
    ) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let campaign = find_mut(state, id)?;
            if let Some(checkpoint) = &mut campaign.inflight
                && phase > checkpoint.phase
            {
                checkpoint.phase = phase;
                campaign.updated_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    /// Appends a job result and clears the inflight checkpoint in the same
    /// persisted mutation. Marks the campaign completed when every job has a
    /// result.
    pub async fn record_result(&self, id: &str, result: JobResult) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let campaign = find_mut(state, id)?;
            campaign.results.push(result);
            campaign.inflight = None;
            campaign.updated_at = Utc::now();
            if campaign.is_complete() {
                campaign.status = CampaignStatus::Completed;
            }
            Ok(())
        })
        .await
    }
}

/// View of completed campaigns for the duplicate guard: each successful
/// result contributes its job's text.
fn completed_history(state: &QueueState) -> Vec<HistoryEntry> {
    state
        .campaigns
        .iter()
        .filter(|c| c.status == CampaignStatus::Completed)
        .map(|c| HistoryEntry {
            campaign_id: c.id.clone(),
            completed_at: c.updated_at,
            results: c
                .results
                .iter()
                .filter_map(|r| {
                    c.jobs.iter().find(|j| j.index == r.job_index).map(|job| {
                        HistoryResult {
                            text: job.text.clone(),
                            success: r.success,
                        }
                    })
                })
                .collect(),
        })
        .collect()
}

fn find_mut<'a>(state: &'a mut QueueState, id: &str) -> Result<&'a mut Campaign, CarrosselError> {
    state
        .campaigns
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(|| CarrosselError::CampaignNotFound(id.to_string()))
}
