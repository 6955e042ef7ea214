//! Duplicate content guard.
//!
//! Flags candidate job texts that repeat either an earlier job in the same
//! batch or a successfully posted text from recent campaign history. The
//! output is advisory: callers surface the hits as warnings and still enqueue
//! the campaign.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a duplicate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateScope {
    /// The same text appears earlier in the candidate batch itself.
    CurrentCampaign,
    /// The text matches a successful result within the lookback window.
    History { days: u32 },
}

impl DuplicateScope {
    /// Stable label used in serialized warnings: `current_campaign`,
    /// `history_30d`.
    pub fn label(&self) -> String {
        match self {
            DuplicateScope::CurrentCampaign => "current_campaign".to_string(),
            DuplicateScope::History { days } => format!("history_{days}d"),
        }
    }
}

/// One duplicate conflict: the scope it was found in, the normalized text
/// that matched and where the original lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateHit {
    pub scope: DuplicateScope,
    pub text: String,
    pub origin: String,
}

/// A posted result from a completed campaign, as seen by the guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResult {
    pub text: String,
    pub success: bool,
}

/// A completed campaign the guard can scan against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub campaign_id: String,
    pub completed_at: DateTime<Utc>,
    pub results: Vec<HistoryResult>,
}

/// Trim + Unicode case-fold; the identity under which texts are compared.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Scans `candidates` for duplicates within the batch and against completed
/// campaigns newer than `lookback_days`.
pub fn scan(
    candidates: &[String],
    history: &[HistoryEntry],
    lookback_days: u32,
    now: DateTime<Utc>,
) -> Vec<DuplicateHit> {
    let mut hits = Vec::new();

    // In-batch pass: the first occurrence of a text is fine, every later
    // repetition conflicts with it.
    let mut seen: HashSet<String> = HashSet::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let normalized = normalize(candidate);
        if normalized.is_empty() {
            continue;
        }
        if !seen.insert(normalized.clone()) {
            hits.push(DuplicateHit {
                scope: DuplicateScope::CurrentCampaign,
                text: normalized,
                origin: format!("job {index}"),
            });
        }
    }

    // History pass: only successful results from campaigns completed inside
    // the window count.
    let cutoff = now - Duration::days(i64::from(lookback_days));
    let mut posted: HashMap<String, String> = HashMap::new();
    for entry in history {
        if entry.completed_at < cutoff {
            continue;
        }
        for result in &entry.results {
            if result.success {
                posted
                    .entry(normalize(&result.text))
                    .or_insert_with(|| entry.campaign_id.clone());
            }
        }
    }

    let mut flagged: HashSet<String> = HashSet::new();
    for candidate in candidates {
        let normalized = normalize(candidate);
        if let Some(campaign_id) = posted.get(&normalized)
            && flagged.insert(normalized.clone())
        {
            hits.push(DuplicateHit {
                scope: DuplicateScope::History {
                    days: lookback_days,
                },
                text: normalized,
                origin: format!("campaign {campaign_id}"),
            });
        }
    }

    hits
}
