use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Experiment is a Custom Resource for a metrics-driven canary comparison
///
/// The controller shifts traffic from `baseline` to `candidate` one step per
/// iteration while every success criterion holds, promotes the candidate when
/// the experiment has seen enough evidence, and rolls back on the first
/// violated criterion.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "vaaka.io",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.currentWeight"}"#,
    printcolumn = r#"{"name":"Iteration", "type":"integer", "jsonPath":".status.iteration"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.reason", "priority": 1}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// The version currently serving production traffic
    pub baseline: TargetRef,

    /// The version under evaluation
    pub candidate: TargetRef,

    /// Where the weighted split between baseline and candidate lives
    #[serde(rename = "trafficRouting")]
    pub traffic_routing: TrafficRouting,

    /// Success criteria; every one must hold for traffic to advance
    #[serde(default)]
    pub criteria: Vec<SuccessCriterion>,

    /// Step-size and bounds policy for traffic shifting
    #[serde(rename = "trafficControl", default)]
    pub traffic_control: TrafficControl,

    /// Manual pause. Assessment keeps running but only a terminal verdict
    /// may change traffic while set.
    #[serde(default)]
    pub paused: bool,

    /// Per-experiment analysis overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisConfig>,
}

/// Reference to a Kubernetes Service selecting one version's pods
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct TargetRef {
    /// Service name (same namespace as the Experiment)
    pub service: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TrafficRouting {
    /// Gateway API configuration
    #[serde(rename = "gatewayAPI")]
    pub gateway_api: GatewayAPIRouting,

    /// Service port for traffic routing (default: 80)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct GatewayAPIRouting {
    /// Name of the HTTPRoute to manipulate
    #[serde(rename = "httpRoute")]
    pub http_route: String,
}

/// Traffic shifting policy
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct TrafficControl {
    /// Candidate weight seeded when the experiment starts progressing
    #[serde(rename = "initialWeight", default = "default_initial_weight")]
    pub initial_weight: i32,

    /// Candidate weight added per passing iteration
    #[serde(rename = "stepSize", default = "default_step_size")]
    pub step_size: i32,

    /// Ceiling for candidate weight while iterating; promotion goes to 100
    #[serde(rename = "maxWeight", default = "default_max_weight")]
    pub max_weight: i32,

    /// Passing iterations after which the candidate is promoted
    #[serde(rename = "maxIterations", default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Minimum time between iterations (e.g., "30s", "5m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

fn default_initial_weight() -> i32 {
    10
}

fn default_step_size() -> i32 {
    10
}

fn default_max_weight() -> i32 {
    100
}

fn default_max_iterations() -> u32 {
    100
}

impl Default for TrafficControl {
    fn default() -> Self {
        TrafficControl {
            initial_weight: default_initial_weight(),
            step_size: default_step_size(),
            max_weight: default_max_weight(),
            max_iterations: default_max_iterations(),
            interval: None,
        }
    }
}

/// Analysis configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct AnalysisConfig {
    /// Prometheus configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusConfig>,
}

/// Prometheus configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct PrometheusConfig {
    /// Prometheus server address (e.g., "http://prometheus:9090")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A single success criterion
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct SuccessCriterion {
    /// Criterion name, unique within the experiment
    pub name: String,

    /// Which metric to observe
    pub metric: MetricSource,

    /// Samples required on each observed version before the criterion can
    /// pass or fail
    #[serde(rename = "minSampleSize", default = "default_min_sample_size")]
    pub min_sample_size: u64,

    /// How the observed value is judged
    pub check: Comparison,
}

fn default_min_sample_size() -> u64 {
    1
}

/// Metric to query, either a built-in template or raw PromQL
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum MetricSource {
    /// Built-in query template
    Template(MetricTemplate),
    /// Custom PromQL. `$name`, `$namespace`, `$service`, `$revision` and
    /// `$window` are substituted before the query is sent.
    Query(String),
}

/// Built-in metric templates
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum MetricTemplate {
    /// Percentage of 5xx responses
    #[serde(rename = "error-rate")]
    ErrorRate,
    /// 95th percentile request latency in seconds
    #[serde(rename = "latency-p95")]
    LatencyP95,
    /// 99th percentile request latency in seconds
    #[serde(rename = "latency-p99")]
    LatencyP99,
    /// Requests observed over the window
    #[serde(rename = "request-count")]
    RequestCount,
}

/// Comparison applied to a criterion's observed value
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    /// Candidate value must be strictly below `value`
    LessThan { value: f64 },
    /// Candidate value must be strictly above `value`
    GreaterThan { value: f64 },
    /// Candidate value may exceed the baseline value by at most `tolerance`
    WithinBaseline { tolerance: f64 },
}

impl Comparison {
    /// Whether judging this comparison needs baseline samples
    pub fn needs_baseline(&self) -> bool {
        matches!(self, Comparison::WithinBaseline { .. })
    }
}

/// Phase of an Experiment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// First observation; spec preconditions not yet checked
    #[default]
    Initializing,
    /// Iterating: assessing criteria and shifting traffic
    Progressing,
    /// Manually paused; only a terminal verdict may act
    Pausing,
    /// Candidate promoted to 100% traffic
    Completed,
    /// Candidate rolled back to 0% traffic, or the experiment could not run
    Failed,
}

impl Phase {
    /// Completed and Failed are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// Classification of one assessment cycle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum VerdictKind {
    Continue,
    CandidateWins,
    BaselineWins,
    Inconclusive,
}

/// Outcome of one criterion in one cycle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CriterionOutcome {
    Passed,
    Failed,
    Inconclusive,
}

/// Per-criterion detail recorded with each verdict
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CriterionResult {
    pub name: String,
    pub outcome: CriterionOutcome,
    #[serde(rename = "candidateValue", skip_serializing_if = "Option::is_none")]
    pub candidate_value: Option<f64>,
    #[serde(rename = "baselineValue", skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<f64>,
    /// Smallest sample count among the versions this criterion observed
    pub samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One entry in the experiment's verdict history
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct IterationRecord {
    pub iteration: u32,
    pub timestamp: String,
    pub verdict: VerdictKind,
    /// Candidate weight applied as a result of this verdict
    pub weight: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<CriterionResult>,
}

/// Status of the Experiment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    /// Phase of the experiment (Initializing, Progressing, Pausing, Completed, Failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Candidate weight percentage last applied to the traffic backend
    #[serde(rename = "currentWeight", skip_serializing_if = "Option::is_none")]
    pub current_weight: Option<i32>,

    /// Number of passing iterations completed
    #[serde(default)]
    pub iteration: u32,

    /// Most recent verdicts, oldest first
    #[serde(rename = "criteriaHistory", default, skip_serializing_if = "Vec::is_empty")]
    pub criteria_history: Vec<IterationRecord>,

    /// Timestamp of the last phase change (RFC3339 format)
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Timestamp of the last recorded iteration (RFC3339 format)
    /// Used to enforce trafficControl.interval
    #[serde(rename = "lastIterationTime", skip_serializing_if = "Option::is_none")]
    pub last_iteration_time: Option<String>,

    /// Human-readable cause of the current terminal or blocking state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// metadata.generation of the spec this status was computed from
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ExperimentStatus {
    pub fn phase(&self) -> Phase {
        self.phase.unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;
