//! Time-based trigger for the appeal workflow.
//!
//! A single background task ticks on a fixed period; when the persisted
//! `next_run_at` is due it runs verification (and the appeal phase when
//! anything is still restricted), persists the results and reschedules. A
//! manual batch holding the appeal lock makes the tick skip and retry on the
//! next period rather than queue behind it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::appeal::{AppealEngine, BatchOutcome, BatchSummary, RunRecord};
use crate::executor::{ActionExecutor, BusyProfiles, SignalClassifier};
use crate::notify::Notifier;
use crate::store;

/// Ring cap for the persisted run history.
pub const RUN_HISTORY_CAP: usize = 10;

/// Persisted schedule state, one singleton document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleState {
    pub enabled: bool,
    pub interval_hours: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_results: Option<BatchSummary>,
    #[serde(default)]
    pub run_history: Vec<RunRecord>,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            last_run_at: None,
            next_run_at: None,
            last_results: None,
            run_history: Vec::new(),
        }
    }
}

/// Owner handle for the background loop. Dropping it does not stop the
/// task; call [`SchedulerHandle::shutdown`] for a clean exit.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the loop to stop and waits for it to drain the current tick.
    /// A persist in progress always completes before the task exits.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Starts the background loop. `interval_hours` seeds the schedule state
    /// the first time the state file comes into existence.
    pub fn spawn<E, C, N, N2, B>(
        engine: Arc<AppealEngine<E, C, N>>,
        busy: B,
        notifier: N2,
        state_path: PathBuf,
        tick: Duration,
        interval_hours: u64,
    ) -> SchedulerHandle
    where
        E: ActionExecutor + 'static,
        C: SignalClassifier + 'static,
        N: Notifier + 'static,
        N2: Notifier + 'static,
        B: BusyProfiles + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_due_tick(&*engine, &busy, &notifier, &state_path, interval_hours)
                            .await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            tracing::info!("scheduler loop stopping");
                            break;
                        }
                    }
                }
            }
        });
        SchedulerHandle { shutdown, task }
    }
}

/// One tick: run the batch when due, otherwise return immediately.
async fn run_due_tick<E, C, N, N2, B>(
    engine: &AppealEngine<E, C, N>,
    busy: &B,
    notifier: &N2,
    state_path: &PathBuf,
    interval_hours: u64,
) where
    E: ActionExecutor,
    C: SignalClassifier,
    N: Notifier,
    N2: Notifier,
    B: BusyProfiles,
{
    let mut state = store::read_json_or(
        state_path,
        ScheduleState {
            interval_hours,
            ..Default::default()
        },
    )
    .await;

    if !state.enabled {
        return;
    }
    let now = Utc::now();
    if state.next_run_at.is_some_and(|at| now < at) {
        return;
    }

    let exclude = busy.list_profiles_in_use().await;
    notifier
        .notify(
            "batch_start",
            serde_json::json!({
                "trigger": "scheduler",
                "excluded": exclude.len(),
            }),
        )
        .await;

    let summary = match engine.verify_all(&exclude).await {
        BatchOutcome::Busy => {
            // A manual run holds the lock; retry on the next tick without
            // advancing next_run_at.
            tracing::info!("scheduled batch skipped, appeal lock is held");
            return;
        }
        BatchOutcome::Completed(verify) if verify.still_restricted == 0 => {
            // Nothing left to appeal; the engine never notified, so the
            // completion event is ours.
            notifier
                .notify(
                    "batch_complete",
                    serde_json::json!({
                        "total": verify.total,
                        "unblocked": verify.unblocked,
                        "still_restricted": 0,
                    }),
                )
                .await;
            verify
        }
        BatchOutcome::Completed(_) => match engine.batch_appeal_all(&exclude).await {
            BatchOutcome::Busy => {
                tracing::info!("appeal phase skipped, appeal lock is held");
                return;
            }
            BatchOutcome::Completed(summary) => summary,
        },
    };

    state.last_run_at = Some(now);
    state.next_run_at = Some(now + chrono::Duration::hours(state.interval_hours as i64));
    state.run_history.push(RunRecord::from_summary("scheduler", &summary));
    if state.run_history.len() > RUN_HISTORY_CAP {
        let excess = state.run_history.len() - RUN_HISTORY_CAP;
        state.run_history.drain(..excess);
    }
    state.last_results = Some(summary);

    if let Err(error) = store::write_json(state_path, &state).await {
        tracing::error!(%error, "failed to persist schedule state");
    }
}
