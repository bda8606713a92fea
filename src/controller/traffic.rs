//! Traffic Controller
//!
//! Turns an assessment verdict into the next baseline/candidate split and
//! applies it through a `TrafficRouter`. Planning is pure; only `apply`
//! talks to the backend, and its result is authoritative: a split is not
//! committed until the router reports it back.

use crate::controller::assessment::Verdict;
use crate::crd::experiment::{Experiment, Phase, TrafficControl};
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRouteRulesBackendRefs;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Get the service port from routing configuration, defaulting to 80
pub fn default_service_port(configured: Option<i32>) -> i32 {
    configured.unwrap_or(80)
}

/// Percentages of live traffic for baseline and candidate; always sums to 100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrafficSplit {
    baseline: i32,
    candidate: i32,
}

impl TrafficSplit {
    /// All traffic to the baseline
    pub const ALL_BASELINE: TrafficSplit = TrafficSplit {
        baseline: 100,
        candidate: 0,
    };

    /// All traffic to the candidate
    pub const ALL_CANDIDATE: TrafficSplit = TrafficSplit {
        baseline: 0,
        candidate: 100,
    };

    /// Split with the given candidate percentage, or None outside 0-100
    pub fn with_candidate(candidate: i32) -> Option<Self> {
        if (0..=100).contains(&candidate) {
            Some(TrafficSplit {
                baseline: 100 - candidate,
                candidate,
            })
        } else {
            None
        }
    }

    pub fn baseline(&self) -> i32 {
        self.baseline
    }

    pub fn candidate(&self) -> i32 {
        self.candidate
    }
}

impl fmt::Display for TrafficSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate={}% baseline={}%",
            self.candidate, self.baseline
        )
    }
}

/// Step-size and bounds policy for Continue verdicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub step_size: i32,
    pub max_weight: i32,
}

impl From<&TrafficControl> for StepPolicy {
    fn from(control: &TrafficControl) -> Self {
        StepPolicy {
            step_size: control.step_size.max(0),
            max_weight: control.max_weight.clamp(0, 100),
        }
    }
}

/// What the controller decided to do with traffic this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficAction {
    /// Verdict inconclusive; weight unchanged
    Hold,
    /// Continue at or above the ceiling, or with a zero step
    ///
    /// `assess` promotes once the ceiling is reached, so the reconciler only
    /// sees this for a policy that bypassed `validate_experiment`.
    HoldAtMaximum,
    /// Shift one step toward the candidate
    Advance(TrafficSplit),
    /// Candidate wins: full promotion
    Promote,
    /// Baseline wins: full rollback
    Rollback,
}

impl TrafficAction {
    /// Split that results from taking this action from `current`
    pub fn target(&self, current: TrafficSplit) -> TrafficSplit {
        match self {
            TrafficAction::Hold | TrafficAction::HoldAtMaximum => current,
            TrafficAction::Advance(split) => *split,
            TrafficAction::Promote => TrafficSplit::ALL_CANDIDATE,
            TrafficAction::Rollback => TrafficSplit::ALL_BASELINE,
        }
    }

    /// Phase this action moves the experiment into, if terminal
    pub fn terminal_phase(&self) -> Option<Phase> {
        match self {
            TrafficAction::Promote => Some(Phase::Completed),
            TrafficAction::Rollback => Some(Phase::Failed),
            _ => None,
        }
    }

    /// Whether this action moves the experiment forward
    pub fn is_progress(&self) -> bool {
        !matches!(self, TrafficAction::Hold | TrafficAction::HoldAtMaximum)
    }
}

/// Decide the traffic action for a verdict
///
/// Continue never lowers the candidate weight: if the current weight is
/// already above the ceiling (e.g., after an external edit) the step is
/// computed from the higher value and held.
pub fn plan(current: TrafficSplit, verdict: &Verdict, policy: &StepPolicy) -> TrafficAction {
    match verdict {
        Verdict::CandidateWins(_) => TrafficAction::Promote,
        Verdict::BaselineWins(_) => TrafficAction::Rollback,
        Verdict::Inconclusive(_) => TrafficAction::Hold,
        Verdict::Continue(_) => {
            if current.candidate() >= policy.max_weight || policy.step_size == 0 {
                return TrafficAction::HoldAtMaximum;
            }
            let next = (current.candidate() + policy.step_size).min(policy.max_weight);
            match TrafficSplit::with_candidate(next) {
                Some(split) => TrafficAction::Advance(split),
                None => TrafficAction::HoldAtMaximum,
            }
        }
    }
}

/// Next split for a verdict
pub fn next_split(current: TrafficSplit, verdict: &Verdict, policy: &StepPolicy) -> TrafficSplit {
    plan(current, verdict, policy).target(current)
}

/// Everything a router needs to address one experiment's traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficTarget {
    pub namespace: String,
    pub http_route: String,
    pub baseline_service: String,
    pub candidate_service: String,
    pub port: i32,
}

impl TrafficTarget {
    pub fn from_experiment(experiment: &Experiment, namespace: &str) -> Self {
        let routing = &experiment.spec.traffic_routing;
        TrafficTarget {
            namespace: namespace.to_string(),
            http_route: routing.gateway_api.http_route.clone(),
            baseline_service: experiment.spec.baseline.service.clone(),
            candidate_service: experiment.spec.candidate.service.clone(),
            port: default_service_port(routing.port),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("HTTPRoute {0} not found")]
    RouteNotFound(String),

    #[error("HTTPRoute {route} has no usable backend weights: {detail}")]
    Malformed { route: String, detail: String },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Traffic backend unavailable: {0}")]
    Unavailable(String),
}

/// Traffic-shaping backend
///
/// `set_split` is the only authoritative write of traffic weight. It
/// returns the split the backend holds after the write.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn get_split(&self, target: &TrafficTarget) -> Result<TrafficSplit, TrafficError>;

    async fn set_split(
        &self,
        target: &TrafficTarget,
        split: TrafficSplit,
    ) -> Result<TrafficSplit, TrafficError>;

    /// Whether a backend Service exists and can receive traffic
    async fn backend_ready(&self, namespace: &str, service: &str) -> Result<bool, TrafficError>;
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Backend(#[from] TrafficError),

    #[error("traffic backend accepted {requested} but reports {reported}")]
    Inconsistent {
        requested: TrafficSplit,
        reported: TrafficSplit,
    },
}

/// Apply a split and verify the backend holds exactly what was requested
pub async fn apply(
    router: &dyn TrafficRouter,
    target: &TrafficTarget,
    split: TrafficSplit,
) -> Result<TrafficSplit, ApplyError> {
    debug!(route = %target.http_route, split = %split, "Applying traffic split");

    let reported = router.set_split(target, split).await?;
    if reported != split {
        return Err(ApplyError::Inconsistent {
            requested: split,
            reported,
        });
    }

    info!(
        namespace = %target.namespace,
        route = %target.http_route,
        candidate_weight = split.candidate(),
        baseline_weight = split.baseline(),
        "Traffic split applied"
    );
    Ok(reported)
}

/// Build Gateway API backend refs carrying the split's weights
pub fn build_backend_refs(
    target: &TrafficTarget,
    split: TrafficSplit,
) -> Vec<HTTPRouteRulesBackendRefs> {
    [
        (&target.baseline_service, split.baseline()),
        (&target.candidate_service, split.candidate()),
    ]
    .into_iter()
    .map(|(service, weight)| HTTPRouteRulesBackendRefs {
        name: service.clone(),
        port: Some(target.port),
        weight: Some(weight),
        kind: Some("Service".to_string()),
        group: Some("".to_string()),
        namespace: None,
        filters: None,
    })
    .collect()
}

/// Read the baseline/candidate split out of an HTTPRoute's JSON body
///
/// Uses the first rule. Gateway API weights are relative, so they are
/// normalised to percentages; a backendRef without a weight counts as 1
/// and an absent backend counts as 0.
pub fn split_from_route(
    route: &serde_json::Value,
    target: &TrafficTarget,
) -> Result<TrafficSplit, TrafficError> {
    let malformed = |detail: &str| TrafficError::Malformed {
        route: target.http_route.clone(),
        detail: detail.to_string(),
    };

    let refs = route
        .pointer("/spec/rules/0/backendRefs")
        .and_then(|v| v.as_array())
        .ok_or_else(|| malformed("first rule has no backendRefs"))?;

    let weight_of = |service: &str| -> i64 {
        refs.iter()
            .filter(|r| r.get("name").and_then(|n| n.as_str()) == Some(service))
            .map(|r| r.get("weight").and_then(|w| w.as_i64()).unwrap_or(1))
            .sum()
    };

    let baseline = weight_of(&target.baseline_service).max(0);
    let candidate = weight_of(&target.candidate_service).max(0);
    let total = baseline + candidate;
    if total == 0 {
        return Err(malformed("baseline and candidate weights are both zero"));
    }

    let percent = ((candidate as f64 / total as f64) * 100.0).round() as i32;
    TrafficSplit::with_candidate(percent).ok_or_else(|| malformed("weight out of range"))
}

/// Production router: Gateway API HTTPRoute plus core Services
pub struct GatewayRouter {
    client: kube::Client,
}

impl GatewayRouter {
    pub fn new(client: kube::Client) -> Self {
        GatewayRouter { client }
    }

    fn httproutes(&self, namespace: &str) -> kube::Api<kube::core::DynamicObject> {
        use kube::discovery::ApiResource;

        let ar = ApiResource {
            group: "gateway.networking.k8s.io".to_string(),
            version: "v1".to_string(),
            api_version: "gateway.networking.k8s.io/v1".to_string(),
            kind: "HTTPRoute".to_string(),
            plural: "httproutes".to_string(),
        };
        kube::Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

#[async_trait]
impl TrafficRouter for GatewayRouter {
    async fn get_split(&self, target: &TrafficTarget) -> Result<TrafficSplit, TrafficError> {
        let route = self
            .httproutes(&target.namespace)
            .get_opt(&target.http_route)
            .await?
            .ok_or_else(|| TrafficError::RouteNotFound(target.http_route.clone()))?;

        split_from_route(&route.data, target)
    }

    async fn set_split(
        &self,
        target: &TrafficTarget,
        split: TrafficSplit,
    ) -> Result<TrafficSplit, TrafficError> {
        use kube::api::PostParams;

        let api = self.httproutes(&target.namespace);
        let mut route = api
            .get_opt(&target.http_route)
            .await?
            .ok_or_else(|| TrafficError::RouteNotFound(target.http_route.clone()))?;

        // Only the first rule's backendRefs are owned by the controller;
        // matches, filters and any other rules are left untouched.
        let backend_refs = serde_json::to_value(build_backend_refs(target, split)).map_err(|e| {
            TrafficError::Malformed {
                route: target.http_route.clone(),
                detail: e.to_string(),
            }
        })?;
        let first_rule = route
            .data
            .pointer_mut("/spec/rules/0")
            .and_then(|rule| rule.as_object_mut())
            .ok_or_else(|| TrafficError::Malformed {
                route: target.http_route.clone(),
                detail: "route has no rules".to_string(),
            })?;
        first_rule.insert("backendRefs".to_string(), backend_refs);

        // resourceVersion from the read is kept, so a concurrent edit of the
        // route surfaces as a 409 and the tick retries instead of clobbering it.
        let updated = match api
            .replace(&target.http_route, &PostParams::default(), &route)
            .await
        {
            Ok(updated) => updated,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                warn!(route = %target.http_route, "HTTPRoute disappeared during update");
                return Err(TrafficError::RouteNotFound(target.http_route.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        split_from_route(&updated.data, target)
    }

    async fn backend_ready(&self, namespace: &str, service: &str) -> Result<bool, TrafficError> {
        use k8s_openapi::api::core::v1::Service;

        let services: kube::Api<Service> = kube::Api::namespaced(self.client.clone(), namespace);
        Ok(services.get_opt(service).await?.is_some())
    }
}

/// In-memory router for tests
///
/// Holds one split per HTTPRoute name and records every write.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct MockTrafficRouter {
    splits: std::sync::Mutex<std::collections::HashMap<String, TrafficSplit>>,
    applied: std::sync::Mutex<Vec<TrafficSplit>>,
    set_failure: std::sync::Mutex<Option<String>>,
    get_failure: std::sync::Mutex<Option<String>>,
    reported_override: std::sync::Mutex<Option<TrafficSplit>>,
    missing_services: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockTrafficRouter {
    pub fn new() -> Self {
        MockTrafficRouter {
            splits: Default::default(),
            applied: Default::default(),
            set_failure: Default::default(),
            get_failure: Default::default(),
            reported_override: Default::default(),
            missing_services: Default::default(),
        }
    }

    /// Pretend something outside the controller changed the route
    pub fn set_external(&self, route: &str, split: TrafficSplit) {
        self.splits.lock().unwrap().insert(route.to_string(), split);
    }

    pub fn current(&self, route: &str) -> TrafficSplit {
        self.splits
            .lock()
            .unwrap()
            .get(route)
            .copied()
            .unwrap_or(TrafficSplit::ALL_BASELINE)
    }

    pub fn applied(&self) -> Vec<TrafficSplit> {
        self.applied.lock().unwrap().clone()
    }

    pub fn fail_writes(&self, message: Option<&str>) {
        *self.set_failure.lock().unwrap() = message.map(str::to_string);
    }

    pub fn fail_reads(&self, message: Option<&str>) {
        *self.get_failure.lock().unwrap() = message.map(str::to_string);
    }

    /// Make the next writes report this split instead of the requested one
    pub fn report_instead(&self, split: Option<TrafficSplit>) {
        *self.reported_override.lock().unwrap() = split;
    }

    pub fn remove_service(&self, service: &str) {
        self.missing_services
            .lock()
            .unwrap()
            .push(service.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl TrafficRouter for MockTrafficRouter {
    async fn get_split(&self, target: &TrafficTarget) -> Result<TrafficSplit, TrafficError> {
        if let Some(msg) = self.get_failure.lock().unwrap().clone() {
            return Err(TrafficError::Unavailable(msg));
        }
        Ok(self.current(&target.http_route))
    }

    async fn set_split(
        &self,
        target: &TrafficTarget,
        split: TrafficSplit,
    ) -> Result<TrafficSplit, TrafficError> {
        if let Some(msg) = self.set_failure.lock().unwrap().clone() {
            return Err(TrafficError::Unavailable(msg));
        }
        let reported = self.reported_override.lock().unwrap().unwrap_or(split);
        self.splits
            .lock()
            .unwrap()
            .insert(target.http_route.clone(), reported);
        self.applied.lock().unwrap().push(split);
        Ok(reported)
    }

    async fn backend_ready(&self, _namespace: &str, service: &str) -> Result<bool, TrafficError> {
        if let Some(msg) = self.get_failure.lock().unwrap().clone() {
            return Err(TrafficError::Unavailable(msg));
        }
        Ok(!self
            .missing_services
            .lock()
            .unwrap()
            .iter()
            .any(|s| s == service))
    }
}
