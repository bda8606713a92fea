use crate::controller::assessment::Verdict;
use crate::controller::traffic::{TrafficAction, TrafficSplit};
use crate::crd::experiment::{ExperimentStatus, IterationRecord, Phase, VerdictKind};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Number of verdicts kept in status.criteriaHistory
pub const MAX_HISTORY: usize = 50;

/// Reason recorded while a manual pause holds traffic
pub const PAUSED_REASON: &str = "Paused by spec.paused";

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339()
}

/// Carry `prev` forward into `phase`, stamping the transition time if the
/// phase changed
fn transitioned(prev: &ExperimentStatus, phase: Phase, now: DateTime<Utc>, generation: Option<i64>) -> ExperimentStatus {
    let mut status = prev.clone();
    if prev.phase() != phase || prev.phase.is_none() {
        status.last_transition_time = Some(timestamp(now));
    }
    status.phase = Some(phase);
    status.observed_generation = generation;
    status
}

/// Status after preconditions pass and the initial split has been applied
pub fn initialize_status(
    prev: &ExperimentStatus,
    applied: TrafficSplit,
    now: DateTime<Utc>,
    generation: Option<i64>,
) -> ExperimentStatus {
    let mut status = transitioned(prev, Phase::Progressing, now, generation);
    status.current_weight = Some(applied.candidate());
    status.iteration = 0;
    status.criteria_history.clear();
    // Samples at the initial weight need a full interval too
    status.last_iteration_time = Some(timestamp(now));
    status.reason = None;
    status
}

/// Terminal failure outside of assessment (bad spec, retry budget exhausted)
///
/// `weight` is the candidate weight actually applied, if one is known.
pub fn failed_status(
    prev: &ExperimentStatus,
    reason: String,
    weight: Option<i32>,
    now: DateTime<Utc>,
    generation: Option<i64>,
) -> ExperimentStatus {
    let mut status = transitioned(prev, Phase::Failed, now, generation);
    status.current_weight = weight.or(prev.current_weight);
    status.reason = Some(reason);
    status
}

/// Status after one assessment cycle
///
/// `phase` is the non-terminal phase the tick ran in (Progressing or
/// Pausing); a terminal action overrides it. `applied` is the split the
/// traffic backend reported, or the unchanged split when nothing was
/// applied. Only forward-moving or terminal cycles are recorded in
/// history; inconclusive and held cycles update the reason only.
pub fn status_after_verdict(
    prev: &ExperimentStatus,
    phase: Phase,
    verdict: &Verdict,
    action: TrafficAction,
    applied: TrafficSplit,
    now: DateTime<Utc>,
    generation: Option<i64>,
) -> ExperimentStatus {
    let phase = action.terminal_phase().unwrap_or(phase);
    let mut status = transitioned(prev, phase, now, generation);

    if !action.is_progress() {
        status.reason = match (phase, verdict.kind()) {
            (Phase::Pausing, _) => Some(PAUSED_REASON.to_string()),
            (_, VerdictKind::Continue) => None,
            _ => Some(verdict.summary()),
        };
        return status;
    }

    let passed = matches!(
        verdict.kind(),
        VerdictKind::Continue | VerdictKind::CandidateWins
    );
    if passed {
        status.iteration = prev.iteration.saturating_add(1);
    }
    status.current_weight = Some(applied.candidate());
    status.last_iteration_time = Some(timestamp(now));
    status.reason = verdict.is_terminal().then(|| verdict.summary());

    status.criteria_history.push(IterationRecord {
        iteration: status.iteration,
        timestamp: timestamp(now),
        verdict: verdict.kind(),
        weight: applied.candidate(),
        criteria: verdict.criteria().to_vec(),
    });
    if status.criteria_history.len() > MAX_HISTORY {
        let excess = status.criteria_history.len() - MAX_HISTORY;
        status.criteria_history.drain(..excess);
    }

    status
}

/// Phase after applying the spec's pause flag to a non-terminal phase
///
/// `Initializing` is left alone; the reconciler withholds the first split
/// until the experiment is resumed.
pub fn phase_for_pause(current: Phase, paused: bool) -> Phase {
    match (current, paused) {
        (Phase::Progressing, true) => Phase::Pausing,
        (Phase::Pausing, false) => Phase::Progressing,
        (phase, _) => phase,
    }
}

/// Time left before the next iteration may run, if any
pub fn interval_remaining(
    status: &ExperimentStatus,
    interval: Option<Duration>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let interval = interval?;
    let last = status
        .last_iteration_time
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);

    let elapsed = now.signed_duration_since(last).num_milliseconds().max(0) as u64;
    let remaining = interval.saturating_sub(Duration::from_millis(elapsed));
    (!remaining.is_zero()).then_some(remaining)
}
