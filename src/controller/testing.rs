//! Shared builders for controller tests

use crate::crd::experiment::{
    Comparison, Experiment, ExperimentSpec, GatewayAPIRouting, MetricSource, MetricTemplate,
    SuccessCriterion, TargetRef, TrafficControl, TrafficRouting,
};

/// Experiment `name` in namespace `default` routing `app-v1` / `app-v2`
/// through HTTPRoute `app-route`
pub fn experiment(name: &str, criteria: Vec<SuccessCriterion>) -> Experiment {
    let mut experiment = Experiment::new(
        name,
        ExperimentSpec {
            baseline: TargetRef {
                service: "app-v1".to_string(),
            },
            candidate: TargetRef {
                service: "app-v2".to_string(),
            },
            traffic_routing: TrafficRouting {
                gateway_api: GatewayAPIRouting {
                    http_route: "app-route".to_string(),
                },
                port: Some(8080),
            },
            criteria,
            traffic_control: TrafficControl::default(),
            paused: false,
            analysis: None,
        },
    );
    experiment.metadata.namespace = Some("default".to_string());
    experiment.metadata.generation = Some(1);
    experiment
}

/// error-rate below `threshold` percent, judged after `min_samples` requests
pub fn error_rate_below(threshold: f64, min_samples: u64) -> SuccessCriterion {
    SuccessCriterion {
        name: "error-rate".to_string(),
        metric: MetricSource::Template(MetricTemplate::ErrorRate),
        min_sample_size: min_samples,
        check: Comparison::LessThan { value: threshold },
    }
}
