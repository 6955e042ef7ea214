use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Ring cap for per-profile usage records.
pub const USAGE_HISTORY_CAP: usize = 20;
/// Ring cap for per-profile restriction events.
pub const RESTRICTION_HISTORY_CAP: usize = 10;

const TEXT_PREVIEW_LEN: usize = 80;

/// Whether a profile is currently usable for campaign work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    Active,
    Restricted,
}

/// Per-day attempt counters, keyed by `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayStats {
    pub attempts: u32,
    pub success: u32,
    pub failed: u32,
}

/// One entry in the bounded usage ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub at: DateTime<Utc>,
    pub campaign_id: String,
    pub text: String,
    pub success: bool,
}

/// What happened to a restriction at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionEvent {
    Imposed,
    AutoExpired,
    Unblocked,
    Extended,
}

/// One entry in the bounded restriction ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionRecord {
    pub at: DateTime<Utc>,
    pub event: RestrictionEvent,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Appeal bookkeeping the batch workflow pins onto a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealMark {
    /// An interactive checkpoint blocks automation; needs a human.
    NeedsCaptcha,
    /// An appeal is already under review; leave it alone.
    PendingReview,
    /// The per-profile appeal attempt cap was reached.
    Exhausted,
}

/// A reusable automation identity with its own usage and restriction state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub status: ProfileStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub daily_stats: BTreeMap<String, DayStats>,
    #[serde(default)]
    pub usage_history: Vec<UsageRecord>,
    pub restriction_expires_at: Option<DateTime<Utc>>,
    pub restriction_reason: Option<String>,
    /// A restriction without an expiry can only be lifted manually.
    #[serde(default)]
    pub manual_release: bool,
    #[serde(default)]
    pub restriction_history: Vec<RestrictionRecord>,
    #[serde(default)]
    pub appeal_attempts: u32,
    #[serde(default)]
    pub appeal_mark: Option<AppealMark>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: ProfileStatus::Active,
            tags: Vec::new(),
            last_used_at: None,
            usage_count: 0,
            daily_stats: BTreeMap::new(),
            usage_history: Vec::new(),
            restriction_expires_at: None,
            restriction_reason: None,
            manual_release: false,
            restriction_history: Vec::new(),
            appeal_attempts: 0,
            appeal_mark: None,
            created_at: now,
        }
    }

    /// Records one campaign action against this profile.
    pub fn record_usage(
        &mut self,
        now: DateTime<Utc>,
        campaign_id: &str,
        text: &str,
        success: bool,
    ) {
        self.last_used_at = Some(now);
        self.usage_count += 1;

        let day = now.format("%Y-%m-%d").to_string();
        let stats = self.daily_stats.entry(day).or_default();
        stats.attempts += 1;
        if success {
            stats.success += 1;
        } else {
            stats.failed += 1;
        }

        self.usage_history.push(UsageRecord {
            at: now,
            campaign_id: campaign_id.to_string(),
            text: text.chars().take(TEXT_PREVIEW_LEN).collect(),
            success,
        });
        trim_ring(&mut self.usage_history, USAGE_HISTORY_CAP);
    }

    /// Marks the profile restricted. `hours = None` means manual-only
    /// release: no expiry is set and auto-expiry never fires.
    pub fn impose_restriction(&mut self, now: DateTime<Utc>, hours: Option<i64>, reason: &str) {
        self.status = ProfileStatus::Restricted;
        self.restriction_expires_at = hours.map(|h| now + Duration::hours(h));
        self.restriction_reason = Some(reason.to_string());
        self.manual_release = hours.is_none();
        self.push_restriction_event(now, RestrictionEvent::Imposed, reason);
    }

    /// Whether an expiry exists and has passed.
    pub fn restriction_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ProfileStatus::Restricted
            && self
                .restriction_expires_at
                .is_some_and(|expires| expires <= now)
    }

    /// Clears every restriction field and appeal mark.
    pub fn release_restriction(&mut self, now: DateTime<Utc>, event: RestrictionEvent) {
        let reason = self.restriction_reason.clone().unwrap_or_default();
        self.status = ProfileStatus::Active;
        self.restriction_expires_at = None;
        self.restriction_reason = None;
        self.manual_release = false;
        self.appeal_mark = None;
        self.appeal_attempts = 0;
        self.push_restriction_event(now, event, &reason);
    }

    /// Adds `extra_hours` to the current expiry, or to `now` when the
    /// restriction had no expiry. No-op unless currently restricted.
    pub fn extend_restriction(&mut self, now: DateTime<Utc>, extra_hours: i64) {
        if self.status != ProfileStatus::Restricted {
            return;
        }
        let base = self.restriction_expires_at.unwrap_or(now);
        self.restriction_expires_at = Some(base + Duration::hours(extra_hours));
        self.manual_release = false;
        let reason = self.restriction_reason.clone().unwrap_or_default();
        self.push_restriction_event(now, RestrictionEvent::Extended, &reason);
    }

    fn push_restriction_event(&mut self, now: DateTime<Utc>, event: RestrictionEvent, reason: &str) {
        self.restriction_history.push(RestrictionRecord {
            at: now,
            event,
            reason: reason.to_string(),
            expires_at: self.restriction_expires_at,
        });
        trim_ring(&mut self.restriction_history, RESTRICTION_HISTORY_CAP);
    }
}

/// Keeps only the most recent `cap` entries.
fn trim_ring<T>(ring: &mut Vec<T>, cap: usize) {
    if ring.len() > cap {
        let excess = ring.len() - cap;
        ring.drain(..excess);
    }
}
