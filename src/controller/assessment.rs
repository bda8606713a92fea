//! Assessment Engine
//!
//! Pure scoring of one snapshot against an experiment's success criteria.
//! Missing data, insufficient samples and exact ties with a threshold are
//! all Inconclusive: a candidate is never promoted on absent evidence.

use crate::controller::prometheus::SampleSet;
use crate::controller::snapshot::{CriterionSamples, Snapshot};
use crate::crd::experiment::{
    Comparison, CriterionOutcome, CriterionResult, SuccessCriterion, TrafficControl, VerdictKind,
};
use std::cmp::Ordering;

/// Progress accumulated by earlier ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct History {
    /// Passing iterations completed so far
    pub iteration: u32,
    /// Candidate weight currently applied
    pub current_weight: i32,
}

/// When an all-passing assessment promotes instead of continuing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPolicy {
    pub max_iterations: u32,
    pub max_weight: i32,
}

impl From<&TrafficControl> for CompletionPolicy {
    fn from(control: &TrafficControl) -> Self {
        CompletionPolicy {
            max_iterations: control.max_iterations,
            max_weight: control.max_weight.clamp(0, 100),
        }
    }
}

/// Result of one assessment, with the per-criterion detail behind it
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Continue(Vec<CriterionResult>),
    CandidateWins(Vec<CriterionResult>),
    BaselineWins(Vec<CriterionResult>),
    Inconclusive(Vec<CriterionResult>),
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::Continue(_) => VerdictKind::Continue,
            Verdict::CandidateWins(_) => VerdictKind::CandidateWins,
            Verdict::BaselineWins(_) => VerdictKind::BaselineWins,
            Verdict::Inconclusive(_) => VerdictKind::Inconclusive,
        }
    }

    pub fn criteria(&self) -> &[CriterionResult] {
        match self {
            Verdict::Continue(c)
            | Verdict::CandidateWins(c)
            | Verdict::BaselineWins(c)
            | Verdict::Inconclusive(c) => c,
        }
    }

    pub fn into_criteria(self) -> Vec<CriterionResult> {
        match self {
            Verdict::Continue(c)
            | Verdict::CandidateWins(c)
            | Verdict::BaselineWins(c)
            | Verdict::Inconclusive(c) => c,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Verdict::CandidateWins(_) | Verdict::BaselineWins(_))
    }

    /// Human-readable explanation, used for status.reason
    pub fn summary(&self) -> String {
        match self {
            Verdict::BaselineWins(criteria) => {
                let failed: Vec<String> = criteria
                    .iter()
                    .filter(|c| c.outcome == CriterionOutcome::Failed)
                    .map(describe)
                    .collect();
                format!("Candidate failed: {}", failed.join("; "))
            }
            Verdict::CandidateWins(criteria) => {
                format!("Candidate passed all {} criteria", criteria.len())
            }
            Verdict::Inconclusive(criteria) if criteria.is_empty() => {
                "No success criteria to assess".to_string()
            }
            Verdict::Inconclusive(criteria) => {
                // Names only, so the reason stays stable between ticks
                let pending: Vec<&str> = criteria
                    .iter()
                    .filter(|c| c.outcome == CriterionOutcome::Inconclusive)
                    .map(|c| c.name.as_str())
                    .collect();
                format!("Waiting for evidence: {}", pending.join(", "))
            }
            Verdict::Continue(criteria) => {
                format!("All {} criteria passing", criteria.len())
            }
        }
    }
}

fn describe(result: &CriterionResult) -> String {
    match &result.message {
        Some(message) => format!("{} ({})", result.name, message),
        None => result.name.clone(),
    }
}

/// Score a snapshot
///
/// Any failed criterion → BaselineWins. Otherwise any inconclusive
/// criterion (or no criteria at all) → Inconclusive. When every criterion
/// passes, the candidate wins once this iteration completes the configured
/// count or the candidate already holds the maximum weight; otherwise
/// Continue.
pub fn assess(
    snapshot: &Snapshot,
    criteria: &[SuccessCriterion],
    history: &History,
    policy: &CompletionPolicy,
) -> Verdict {
    let results: Vec<CriterionResult> = criteria
        .iter()
        .map(|criterion| evaluate(criterion, snapshot.samples_for(&criterion.name)))
        .collect();

    let any = |outcome| results.iter().any(|r| r.outcome == outcome);

    if any(CriterionOutcome::Failed) {
        return Verdict::BaselineWins(results);
    }
    if results.is_empty() || any(CriterionOutcome::Inconclusive) {
        return Verdict::Inconclusive(results);
    }

    let iterations_done = history.iteration.saturating_add(1) >= policy.max_iterations;
    let at_max_weight = history.current_weight >= policy.max_weight;
    if iterations_done || at_max_weight {
        Verdict::CandidateWins(results)
    } else {
        Verdict::Continue(results)
    }
}

/// Usable value from a sample set, or why there isn't one
fn observed(samples: &SampleSet, min_sample_size: u64, side: &str) -> Result<f64, String> {
    if samples.count < min_sample_size {
        return Err(format!(
            "{} has {} of {} required samples",
            side, samples.count, min_sample_size
        ));
    }
    match samples.value {
        Some(v) if v.is_finite() => Ok(v),
        Some(_) => Err(format!("{} value is not a finite number", side)),
        None => Err(format!("no {} data", side)),
    }
}

fn evaluate(criterion: &SuccessCriterion, samples: Option<&CriterionSamples>) -> CriterionResult {
    let mut result = CriterionResult {
        name: criterion.name.clone(),
        outcome: CriterionOutcome::Inconclusive,
        candidate_value: None,
        baseline_value: None,
        samples: 0,
        message: None,
    };

    let Some(samples) = samples else {
        result.message = Some("no samples collected".to_string());
        return result;
    };

    result.candidate_value = samples.candidate.value;
    result.samples = samples.candidate.count;
    if let Some(baseline) = &samples.baseline {
        result.baseline_value = baseline.value;
        result.samples = result.samples.min(baseline.count);
    }

    let candidate = match observed(&samples.candidate, criterion.min_sample_size, "candidate") {
        Ok(v) => v,
        Err(message) => {
            result.message = Some(message);
            return result;
        }
    };

    // (observed, limit, observed must be below limit)
    let (limit, below) = match &criterion.check {
        Comparison::LessThan { value } => (*value, true),
        Comparison::GreaterThan { value } => (*value, false),
        Comparison::WithinBaseline { tolerance } => {
            let baseline = match samples
                .baseline
                .as_ref()
                .ok_or_else(|| "no baseline samples collected".to_string())
                .and_then(|b| observed(b, criterion.min_sample_size, "baseline"))
            {
                Ok(v) => v,
                Err(message) => {
                    result.message = Some(message);
                    return result;
                }
            };
            (baseline + tolerance, true)
        }
    };

    let ordering = candidate.partial_cmp(&limit).unwrap_or(Ordering::Equal);
    let (outcome, message) = match (ordering, below) {
        (Ordering::Equal, _) => (
            CriterionOutcome::Inconclusive,
            format!("value {} equals limit {}", candidate, limit),
        ),
        (Ordering::Less, true) | (Ordering::Greater, false) => (
            CriterionOutcome::Passed,
            format!("value {} within limit {}", candidate, limit),
        ),
        (Ordering::Greater, true) => (
            CriterionOutcome::Failed,
            format!("value {} exceeds limit {}", candidate, limit),
        ),
        (Ordering::Less, false) => (
            CriterionOutcome::Failed,
            format!("value {} below minimum {}", candidate, limit),
        ),
    };

    result.outcome = outcome;
    result.message = Some(message);
    result
}
