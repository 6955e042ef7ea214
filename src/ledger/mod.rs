//! Profile ledger: usage history, restriction lifecycle and LRU rotation.
//!
//! One instance owns the `profiles.json` state file. Every mutator persists
//! through the durable store before returning; restriction auto-expiry runs
//! lazily as a side effect of reads, there is no background timer.

mod profile;

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;

pub use profile::{
    AppealMark, DayStats, Profile, ProfileStatus, RESTRICTION_HISTORY_CAP, RestrictionEvent,
    RestrictionRecord, USAGE_HISTORY_CAP, UsageRecord,
};

use crate::error::CarrosselError;
use crate::store;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct LedgerState {
    // Insertion order doubles as the LRU tie-break, so this stays a Vec.
    profiles: Vec<Profile>,
}

/// Counts reported by [`ProfileLedger::sync_sessions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
}

/// Single-instance service over the profile state file.
pub struct ProfileLedger {
    path: PathBuf,
    inner: Mutex<LedgerState>,
}

impl ProfileLedger {
    /// Loads the ledger from `path`, starting empty when nothing was
    /// persisted yet.
    pub async fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = store::read_json_or(&path, LedgerState::default()).await;
        Self {
            path,
            inner: Mutex::new(state),
        }
    }

    /// Locks, applies `op` and persists the mutated state before returning.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut LedgerState) -> Result<T, CarrosselError>,
    ) -> Result<T, CarrosselError> {
        let mut state = self.inner.lock().await;
        let out = op(&mut state)?;
        store::write_json(&self.path, &*state).await?;
        Ok(out)
    }

    /// Releases every restriction whose expiry has passed. Returns how many
    /// profiles were released.
    fn expire_due(state: &mut LedgerState) -> usize {
        let now = Utc::now();
        let mut released = 0;
        for profile in &mut state.profiles {
            if profile.restriction_expired(now) {
                tracing::info!(profile = %profile.name, "restriction expired, reactivating");
                profile.release_restriction(now, RestrictionEvent::AutoExpired);
                released += 1;
            }
        }
        released
    }

    /// Eligible profiles in rotation order: restrictions auto-expired first,
    /// then non-restricted profiles matching `tag_filter`, ordered by
    /// `last_used_at` ascending with never-used profiles first. Ties keep
    /// insertion order.
    pub async fn priority_order(&self, tag_filter: Option<&str>) -> Vec<String> {
        let mut state = self.inner.lock().await;
        if Self::expire_due(&mut state) > 0
            && let Err(error) = store::write_json(&self.path, &*state).await
        {
            tracing::warn!(%error, "failed to persist lazy restriction expiry");
        }

        let mut eligible: Vec<&Profile> = state
            .profiles
            .iter()
            .filter(|p| p.status != ProfileStatus::Restricted)
            .filter(|p| match tag_filter {
                Some(tag) => p.tags.iter().any(|t| t == tag),
                None => true,
            })
            .collect();
        eligible.sort_by_key(|p| p.last_used_at);
        eligible.iter().map(|p| p.name.clone()).collect()
    }

    /// Records one campaign action: bumps `last_used_at`, the usage counter,
    /// the day bucket and the bounded usage ring.
    pub async fn mark_used(
        &self,
        name: &str,
        campaign_id: &str,
        text: &str,
        success: bool,
    ) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let profile = find_mut(state, name)?;
            profile.record_usage(Utc::now(), campaign_id, text, success);
            Ok(())
        })
        .await
    }

    /// Restricts a profile for `hours` from now. `None` means the
    /// restriction can only be lifted manually.
    pub async fn mark_restricted(
        &self,
        name: &str,
        hours: Option<i64>,
        reason: &str,
    ) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let profile = find_mut(state, name)?;
            profile.impose_restriction(Utc::now(), hours, reason);
            tracing::info!(profile = %name, ?hours, reason, "profile restricted");
            Ok(())
        })
        .await
    }

    /// Unconditionally clears restriction fields and appeal marks.
    pub async fn unblock(&self, name: &str) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let profile = find_mut(state, name)?;
            profile.release_restriction(Utc::now(), RestrictionEvent::Unblocked);
            tracing::info!(profile = %name, "profile unblocked");
            Ok(())
        })
        .await
    }

    /// Extends an active restriction. No-op for unrestricted profiles.
    pub async fn extend_restriction(
        &self,
        name: &str,
        extra_hours: i64,
    ) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let profile = find_mut(state, name)?;
            profile.extend_restriction(Utc::now(), extra_hours);
            Ok(())
        })
        .await
    }

    /// Reconciles the ledger with the session artifacts currently present:
    /// unseen names become new profiles, profiles whose artifact disappeared
    /// are removed. A restricted profile is kept until its restriction has
    /// expired, its state is still meaningful for the appeal workflow.
    pub async fn sync_sessions(&self, names: &[String]) -> Result<SyncReport, CarrosselError> {
        self.mutate(|state| {
            let now = Utc::now();
            let mut report = SyncReport::default();

            for name in names {
                if !state.profiles.iter().any(|p| &p.name == name) {
                    tracing::info!(profile = %name, "new session artifact, creating profile");
                    state.profiles.push(Profile::new(name.clone(), now));
                    report.added += 1;
                }
            }

            let before = state.profiles.len();
            state.profiles.retain(|p| {
                names.contains(&p.name)
                    || (p.status == ProfileStatus::Restricted && !p.restriction_expired(now))
            });
            report.removed = before - state.profiles.len();
            if report.removed > 0 {
                tracing::info!(removed = report.removed, "profiles removed after artifact loss");
            }

            Ok(report)
        })
        .await
    }

    /// Currently restricted profiles, after lazy expiry.
    pub async fn restricted(&self) -> Vec<Profile> {
        let mut state = self.inner.lock().await;
        if Self::expire_due(&mut state) > 0
            && let Err(error) = store::write_json(&self.path, &*state).await
        {
            tracing::warn!(%error, "failed to persist lazy restriction expiry");
        }
        state
            .profiles
            .iter()
            .filter(|p| p.status == ProfileStatus::Restricted)
            .cloned()
            .collect()
    }

    /// A point-in-time copy of every profile, with no expiry side effect.
    pub async fn snapshot(&self) -> Vec<Profile> {
        self.inner.lock().await.profiles.clone()
    }

    pub async fn get(&self, name: &str) -> Option<Profile> {
        self.inner
            .lock()
            .await
            .profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Sets or clears the appeal mark on a profile.
    pub async fn set_appeal_mark(
        &self,
        name: &str,
        mark: Option<AppealMark>,
    ) -> Result<(), CarrosselError> {
        self.mutate(|state| {
            let profile = find_mut(state, name)?;
            profile.appeal_mark = mark;
            Ok(())
        })
        .await
    }

    /// Increments a profile's appeal attempt counter, returning the new
    /// value.
    pub async fn bump_appeal_attempts(&self, name: &str) -> Result<u32, CarrosselError> {
        self.mutate(|state| {
            let profile = find_mut(state, name)?;
            profile.appeal_attempts += 1;
            Ok(profile.appeal_attempts)
        })
        .await
    }

    /// Resets every exhausted profile back to no-appeal-state so a new batch
    /// gets a fresh set of rounds. Returns how many were reset.
    pub async fn clear_exhausted_marks(&self) -> Result<usize, CarrosselError> {
        self.mutate(|state| {
            let mut cleared = 0;
            for profile in &mut state.profiles {
                if profile.appeal_mark == Some(AppealMark::Exhausted) {
                    profile.appeal_mark = None;
                    profile.appeal_attempts = 0;
                    cleared += 1;
                }
            }
            Ok(cleared)
        })
        .await
    }
}

fn find_mut<'a>(
    state: &'a mut LedgerState,
    name: &str,
) -> Result<&'a mut Profile, CarrosselError> {
    state
        .profiles
        .iter_mut()
        .find(|p| p.name == name)
        .ok_or_else(|| CarrosselError::ProfileNotFound(name.to_string()))
}
