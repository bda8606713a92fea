use crate::controller::snapshot::Snapshot;
use crate::crd::experiment::{Comparison, Experiment};
use std::collections::HashSet;
use std::time::Duration;

/// Validate Experiment specification
///
/// Checks constraints the CRD schema cannot express. A failure here moves
/// the experiment straight to Failed; it is never retried.
///
/// # Validation Rules
/// - at least one success criterion, with unique non-empty names
/// - `minSampleSize` >= 1, thresholds finite, tolerance >= 0
/// - baseline and candidate services non-empty and distinct
/// - `trafficRouting.gatewayAPI.httpRoute` non-empty
/// - `0 <= initialWeight <= maxWeight <= 100`, `stepSize > 0`
/// - `maxIterations >= 1`
/// - `interval` must be a valid duration (e.g., "30s", "5m")
pub fn validate_experiment(experiment: &Experiment) -> Result<(), String> {
    let spec = &experiment.spec;

    if spec.baseline.service.is_empty() {
        return Err("spec.baseline.service cannot be empty".to_string());
    }
    if spec.candidate.service.is_empty() {
        return Err("spec.candidate.service cannot be empty".to_string());
    }
    if spec.baseline.service == spec.candidate.service {
        return Err(format!(
            "spec.baseline.service and spec.candidate.service must differ, both are {}",
            spec.baseline.service
        ));
    }

    if spec.traffic_routing.gateway_api.http_route.is_empty() {
        return Err("spec.trafficRouting.gatewayAPI.httpRoute cannot be empty".to_string());
    }
    if let Some(port) = spec.traffic_routing.port {
        if !(1..=65535).contains(&port) {
            return Err(format!(
                "spec.trafficRouting.port must be 1-65535, got {}",
                port
            ));
        }
    }

    if spec.criteria.is_empty() {
        return Err("spec.criteria must have at least one criterion".to_string());
    }

    let mut names = HashSet::new();
    for (i, criterion) in spec.criteria.iter().enumerate() {
        if criterion.name.is_empty() {
            return Err(format!("criteria[{}].name cannot be empty", i));
        }
        if !names.insert(criterion.name.as_str()) {
            return Err(format!("criteria[{}].name {} is duplicated", i, criterion.name));
        }
        if criterion.min_sample_size == 0 {
            return Err(format!("criteria[{}].minSampleSize must be >= 1", i));
        }
        match criterion.check {
            Comparison::LessThan { value } | Comparison::GreaterThan { value }
                if !value.is_finite() =>
            {
                return Err(format!("criteria[{}].check value must be finite", i));
            }
            Comparison::WithinBaseline { tolerance } if !(tolerance >= 0.0 && tolerance.is_finite()) => {
                return Err(format!(
                    "criteria[{}].check.withinBaseline.tolerance must be >= 0, got {}",
                    i, tolerance
                ));
            }
            _ => {}
        }
    }

    let control = &spec.traffic_control;
    if !(0..=100).contains(&control.max_weight) {
        return Err(format!(
            "spec.trafficControl.maxWeight must be 0-100, got {}",
            control.max_weight
        ));
    }
    if control.initial_weight < 0 || control.initial_weight > control.max_weight {
        return Err(format!(
            "spec.trafficControl.initialWeight must be 0-{} (maxWeight), got {}",
            control.max_weight, control.initial_weight
        ));
    }
    if control.step_size <= 0 {
        return Err(format!(
            "spec.trafficControl.stepSize must be > 0, got {}",
            control.step_size
        ));
    }
    if control.max_iterations == 0 {
        return Err("spec.trafficControl.maxIterations must be >= 1".to_string());
    }
    if let Some(interval) = &control.interval {
        if parse_duration(interval).is_none() {
            return Err(format!("spec.trafficControl.interval invalid: {}", interval));
        }
    }

    Ok(())
}

/// Spec validation plus the live preconditions checked at Initializing
pub fn check_preconditions(experiment: &Experiment, snapshot: &Snapshot) -> Result<(), String> {
    validate_experiment(experiment)?;

    if !snapshot.baseline_ready {
        return Err(format!(
            "baseline service {} not found",
            experiment.spec.baseline.service
        ));
    }
    if !snapshot.candidate_ready {
        return Err(format!(
            "candidate service {} not found",
            experiment.spec.candidate.service
        ));
    }

    Ok(())
}

/// Minimum time between iterations, if configured and valid
pub fn iteration_interval(experiment: &Experiment) -> Option<Duration> {
    experiment
        .spec
        .traffic_control
        .interval
        .as_deref()
        .and_then(parse_duration)
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Zero is rejected. Seconds and minutes are limited to 24h, hours to one
/// week, to catch typos like "999999h".
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - unit.len_utf8()]
        .parse()
        .ok()?;

    if number == 0 {
        return None;
    }

    let (limit, scale) = match unit {
        's' => (86_400, 1),
        'm' => (1_440, 60),
        'h' => (168, 3_600),
        _ => return None,
    };

    if number > limit {
        return None;
    }
    number.checked_mul(scale).map(Duration::from_secs)
}
