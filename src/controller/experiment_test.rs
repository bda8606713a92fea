use super::*;
use crate::config::ControllerConfig;
use crate::controller::clock::MockClock;
use crate::controller::prometheus::{MockPrometheusClient, SampleSet};
use crate::controller::snapshot::ExperimentId;
use crate::controller::store::MockExperimentStore;
use crate::controller::testing::{error_rate_below, experiment};
use crate::controller::traffic::{MockTrafficRouter, TrafficSplit};
use crate::crd::experiment::{
    Experiment, ExperimentStatus, MetricSource, MetricTemplate, Phase, VerdictKind,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const ROUTE: &str = "app-route";

/// Mocks wired into a Context, with handles kept for inspection
struct Harness {
    store: Arc<MockExperimentStore>,
    prometheus: Arc<MockPrometheusClient>,
    router: Arc<MockTrafficRouter>,
    clock: Arc<MockClock>,
    ctx: Context,
    id: ExperimentId,
}

impl Harness {
    fn new(experiment: Experiment) -> Self {
        Self::with_config(experiment, test_config())
    }

    fn with_config(experiment: Experiment, config: ControllerConfig) -> Self {
        let store = Arc::new(MockExperimentStore::new());
        let prometheus = Arc::new(MockPrometheusClient::new());
        let router = Arc::new(MockTrafficRouter::new());
        let clock = Arc::new(MockClock::at_epoch());
        let id = store.insert(experiment);

        let ctx = Context::with_collaborators(
            store.clone(),
            prometheus.clone(),
            router.clone(),
            clock.clone(),
            config,
        );

        Harness {
            store,
            prometheus,
            router,
            clock,
            ctx,
            id,
        }
    }

    async fn tick(&self) -> Result<Option<Duration>, ReconcileError> {
        reconcile_experiment(&self.id, &self.ctx).await
    }

    /// Advance past the iteration interval, then tick
    async fn tick_later(&self) -> Result<Option<Duration>, ReconcileError> {
        self.clock.advance(chrono::Duration::seconds(10));
        self.tick().await
    }

    fn status(&self) -> ExperimentStatus {
        self.store.status(&self.id)
    }

    fn candidate_error_rate(&self, value: f64, count: u64) {
        self.prometheus.set(
            "app-v2",
            MetricSource::Template(MetricTemplate::ErrorRate),
            SampleSet::new(value, count),
        );
    }

    fn update(&self, edit: impl FnOnce(&mut Experiment)) {
        self.store.update(&self.id, edit);
    }
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        progress_requeue: Duration::from_secs(10),
        inconclusive_requeue: Duration::from_secs(60),
        idle_requeue: Duration::from_secs(30),
        retry_budget: 3,
        ..ControllerConfig::default()
    }
}

fn split(candidate: i32) -> TrafficSplit {
    TrafficSplit::with_candidate(candidate).unwrap()
}

fn error_rate_experiment() -> Experiment {
    experiment("checkout", vec![error_rate_below(1.0, 100)])
}

/// Harness with the experiment already initialized at 10% and passing samples
async fn progressing() -> Harness {
    let h = Harness::new(error_rate_experiment());
    h.candidate_error_rate(0.2, 500);
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Some(Phase::Progressing));
    h
}

#[tokio::test]
async fn test_initialization_seeds_initial_split() {
    let h = Harness::new(error_rate_experiment());

    let requeue = h.tick().await.unwrap();

    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.current_weight, Some(10));
    assert_eq!(status.iteration, 0);
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.last_transition_time.is_some());
    assert_eq!(h.router.applied(), vec![split(10)]);
    assert_eq!(requeue, Some(Duration::from_secs(10)));
}

#[tokio::test]
async fn test_scenario_a_passing_ticks_step_traffic() {
    let h = progressing().await;

    let mut weights = vec![];
    for _ in 0..3 {
        let requeue = h.tick_later().await.unwrap();
        assert_eq!(requeue, Some(Duration::from_secs(10)));
        weights.push(h.status().current_weight.unwrap());
    }

    assert_eq!(weights, vec![20, 30, 40]);
    assert_eq!(h.router.current(ROUTE), split(40));

    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.iteration, 3);
    assert_eq!(status.criteria_history.len(), 3);
    assert!(status
        .criteria_history
        .iter()
        .all(|r| r.verdict == VerdictKind::Continue));
    assert_eq!(status.reason, None);
}

#[tokio::test]
async fn test_scenario_b_failing_sample_rolls_back() {
    let h = progressing().await;
    h.tick_later().await.unwrap();
    assert_eq!(h.status().current_weight, Some(20));

    h.candidate_error_rate(5.0, 500);
    let requeue = h.tick_later().await.unwrap();

    let status = h.status();
    assert_eq!(requeue, None);
    assert_eq!(status.phase, Some(Phase::Failed));
    assert_eq!(status.current_weight, Some(0));
    assert_eq!(h.router.current(ROUTE), TrafficSplit::ALL_BASELINE);
    assert!(status.reason.unwrap().contains("error-rate"));
    assert_eq!(
        status.criteria_history.last().unwrap().verdict,
        VerdictKind::BaselineWins
    );
}

#[tokio::test]
async fn test_scenario_c_max_weight_promotes() {
    let mut exp = error_rate_experiment();
    exp.spec.traffic_control.max_weight = 30;
    let h = Harness::new(exp);
    h.candidate_error_rate(0.2, 500);

    h.tick().await.unwrap();
    h.tick_later().await.unwrap();
    h.tick_later().await.unwrap();
    assert_eq!(h.status().current_weight, Some(30));
    assert_eq!(h.status().phase, Some(Phase::Progressing));

    let requeue = h.tick_later().await.unwrap();

    let status = h.status();
    assert_eq!(requeue, None);
    assert_eq!(status.phase, Some(Phase::Completed));
    assert_eq!(status.current_weight, Some(100));
    assert_eq!(h.router.current(ROUTE), TrafficSplit::ALL_CANDIDATE);

    // No further weight change on subsequent ticks
    let applied = h.router.applied();
    let writes = h.store.writes().len();
    h.candidate_error_rate(9.0, 500);
    for _ in 0..3 {
        assert_eq!(h.tick_later().await.unwrap(), None);
    }
    assert_eq!(h.router.applied(), applied);
    assert_eq!(h.store.writes().len(), writes);
    assert_eq!(h.status(), status);
}

#[tokio::test]
async fn test_candidate_wins_after_max_iterations() {
    let mut exp = error_rate_experiment();
    exp.spec.traffic_control.max_iterations = 2;
    let h = Harness::new(exp);
    h.candidate_error_rate(0.2, 500);

    h.tick().await.unwrap();
    h.tick_later().await.unwrap();
    assert_eq!(h.status().phase, Some(Phase::Progressing));

    h.tick_later().await.unwrap();
    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Completed));
    assert_eq!(status.iteration, 2);
    assert_eq!(status.current_weight, Some(100));
}

#[tokio::test]
async fn test_scenario_d_conflict_aborts_and_recomputes() {
    let h = progressing().await;
    h.store.conflict_next(1);
    let before = h.status();

    let result = h.tick_later().await;

    assert!(matches!(result, Err(ReconcileError::Conflict)));
    assert_eq!(h.status(), before);
    assert_eq!(h.status().phase, Some(Phase::Progressing));
    assert_eq!(
        requeue_after_error(&ReconcileError::Conflict, 0, &h.ctx.config),
        Some(Duration::ZERO)
    );
    assert_eq!(h.ctx.retries.failures(&h.id), 0);

    // Next tick re-reads at the new version and does not step twice
    h.tick().await.unwrap();
    let status = h.status();
    assert_eq!(status.current_weight, Some(20));
    assert_eq!(status.iteration, 1);
    assert_eq!(h.router.current(ROUTE), split(20));
}

#[tokio::test]
async fn test_repeated_conflicts_never_write_the_same_status_twice() {
    let h = progressing().await;
    let writes_before = h.store.writes().len();
    h.store.conflict_next(3);

    h.clock.advance(chrono::Duration::seconds(10));
    for _ in 0..3 {
        assert!(matches!(h.tick().await, Err(ReconcileError::Conflict)));
    }
    assert_eq!(h.store.writes().len(), writes_before);

    h.tick().await.unwrap();

    let writes = h.store.writes();
    assert_eq!(writes.len(), writes_before + 1);
    assert_eq!(writes.last().unwrap().1.current_weight, Some(20));

    // Every successful write was based on a distinct version
    let mut versions: Vec<&String> = writes.iter().map(|(v, _)| v).collect();
    versions.dedup();
    assert_eq!(versions.len(), writes.len());
}

#[tokio::test]
async fn test_terminal_states_are_absorbing() {
    for phase in [Phase::Completed, Phase::Failed] {
        let h = Harness::new(error_rate_experiment());
        h.update(|e| {
            e.status = Some(ExperimentStatus {
                phase: Some(phase),
                current_weight: Some(40),
                iteration: 3,
                ..Default::default()
            })
        });
        h.candidate_error_rate(50.0, 10_000);

        let requeue = h.tick_later().await.unwrap();

        assert_eq!(requeue, None);
        let status = h.status();
        assert_eq!(status.phase, Some(phase));
        assert_eq!(status.current_weight, Some(40));
        assert_eq!(status.iteration, 3);
        assert!(h.router.applied().is_empty());
        assert!(h.store.writes().is_empty());
        assert_eq!(h.prometheus.calls(), 0);
    }
}

#[tokio::test]
async fn test_terminal_is_absorbing_even_when_backends_are_down() {
    let h = Harness::new(error_rate_experiment());
    h.update(|e| {
        e.status = Some(ExperimentStatus {
            phase: Some(Phase::Completed),
            current_weight: Some(100),
            ..Default::default()
        })
    });
    h.prometheus.fail_with(Some("prometheus down"));
    h.router.fail_reads(Some("gateway down"));

    assert_eq!(h.tick().await.unwrap(), None);
}

#[tokio::test]
async fn test_failed_apply_leaves_status_untouched() {
    let h = progressing().await;
    let before = h.status();
    h.router.fail_writes(Some("gateway rejected update"));

    let result = h.tick_later().await;

    assert!(matches!(result, Err(ReconcileError::TransientIo { .. })));
    assert_eq!(h.status(), before);
    assert_eq!(h.status().current_weight, Some(10));
    assert_eq!(h.ctx.retries.failures(&h.id), 1);
}

#[tokio::test]
async fn test_failed_initial_apply_stays_initializing() {
    let h = Harness::new(error_rate_experiment());
    h.router.fail_writes(Some("gateway unavailable"));

    let result = h.tick().await;

    assert!(matches!(result, Err(ReconcileError::TransientIo { .. })));
    assert_eq!(h.status().phase(), Phase::Initializing);
    assert_eq!(h.status().current_weight, None);
    assert!(h.store.writes().is_empty());
}

#[tokio::test]
async fn test_inconsistent_apply_is_invariant_violation() {
    let h = progressing().await;
    let before = h.status();
    h.router.report_instead(Some(split(15)));

    let result = h.tick_later().await;

    assert!(matches!(result, Err(ReconcileError::InvariantViolation(_))));
    assert_eq!(h.status(), before);
    assert_eq!(h.ctx.retries.failures(&h.id), 1);
}

#[tokio::test]
async fn test_snapshot_reused_after_failed_apply() {
    let h = progressing().await;
    h.router.fail_writes(Some("gateway rejected update"));
    assert!(h.tick_later().await.is_err());
    let calls = h.prometheus.calls();

    h.router.fail_writes(None);
    h.tick().await.unwrap();

    assert_eq!(h.prometheus.calls(), calls);
    assert_eq!(h.status().current_weight, Some(20));
    // Consumed by the successful tick
    assert!(h.ctx.cache.get(&h.id).is_none());
}

#[tokio::test]
async fn test_metrics_outage_is_retried_with_backoff() {
    let h = progressing().await;
    h.prometheus.fail_with(Some("connection refused"));

    let err = h.tick_later().await.unwrap_err();

    assert!(matches!(err, ReconcileError::TransientIo { .. }));
    assert_eq!(h.status().phase, Some(Phase::Progressing));
    assert_eq!(h.ctx.retries.failures(&h.id), 1);
    assert_eq!(
        requeue_after_error(&err, 1, &h.ctx.config),
        Some(Duration::from_secs(5))
    );
    assert_eq!(
        requeue_after_error(&err, 3, &h.ctx.config),
        Some(Duration::from_secs(20))
    );
}

#[tokio::test]
async fn test_exhausted_retry_budget_fails_and_rolls_back() {
    let h = progressing().await;
    h.prometheus.fail_with(Some("connection refused"));

    for attempt in 1..=3 {
        assert!(h.tick_later().await.is_err(), "attempt {}", attempt);
        assert_eq!(h.status().phase, Some(Phase::Progressing));
    }

    let requeue = h.tick_later().await.unwrap();

    let status = h.status();
    assert_eq!(requeue, None);
    assert_eq!(status.phase, Some(Phase::Failed));
    assert_eq!(status.current_weight, Some(0));
    assert!(status.reason.unwrap().contains("exceeded retry budget"));
    assert_eq!(h.router.current(ROUTE), TrafficSplit::ALL_BASELINE);
    assert_eq!(h.ctx.retries.failures(&h.id), 0);
}

#[tokio::test]
async fn test_exhausted_retry_budget_without_rollback_keeps_weight() {
    let h = progressing().await;
    h.router.fail_writes(Some("gateway rejected update"));

    for _ in 1..=3 {
        assert!(h.tick_later().await.is_err());
    }
    h.tick_later().await.unwrap();

    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Failed));
    // Rollback was not applied, so status must not claim 0%
    assert_eq!(status.current_weight, Some(10));
}

#[tokio::test]
async fn test_pause_holds_traffic() {
    let h = progressing().await;
    h.update(|e| e.spec.paused = true);

    let requeue = h.tick_later().await.unwrap();

    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Pausing));
    assert_eq!(status.current_weight, Some(10));
    assert_eq!(status.iteration, 0);
    assert_eq!(status.reason.as_deref(), Some(PAUSED_REASON));
    assert_eq!(requeue, Some(Duration::from_secs(30)));
    assert_eq!(h.router.applied(), vec![split(10)]);

    // Still paused: passing verdicts keep holding
    h.tick_later().await.unwrap();
    assert_eq!(h.status().current_weight, Some(10));

    h.update(|e| e.spec.paused = false);
    h.tick_later().await.unwrap();
    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.current_weight, Some(20));
    assert_eq!(status.reason, None);
}

#[tokio::test]
async fn test_pause_still_acts_on_terminal_verdict() {
    let h = progressing().await;
    h.update(|e| e.spec.paused = true);
    h.tick_later().await.unwrap();
    assert_eq!(h.status().phase, Some(Phase::Pausing));

    h.candidate_error_rate(7.5, 500);
    let requeue = h.tick_later().await.unwrap();

    assert_eq!(requeue, None);
    assert_eq!(h.status().phase, Some(Phase::Failed));
    assert_eq!(h.router.current(ROUTE), TrafficSplit::ALL_BASELINE);
}

#[tokio::test]
async fn test_insufficient_samples_hold_weight() {
    let h = progressing().await;
    h.candidate_error_rate(0.2, 40);

    let requeue = h.tick_later().await.unwrap();

    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.current_weight, Some(10));
    assert_eq!(status.iteration, 0);
    assert_eq!(
        status.reason.as_deref(),
        Some("Waiting for evidence: error-rate")
    );
    assert_eq!(requeue, Some(Duration::from_secs(60)));
    assert_eq!(h.router.applied(), vec![split(10)]);

    // Same reason next time: no extra write
    let writes = h.store.writes().len();
    h.tick_later().await.unwrap();
    assert_eq!(h.store.writes().len(), writes);
}

#[tokio::test]
async fn test_deleted_experiment_is_noop() {
    let h = progressing().await;
    h.store.remove(&h.id);
    let applied = h.router.applied();

    assert_eq!(h.tick_later().await.unwrap(), None);
    assert_eq!(h.router.applied(), applied);
}

#[tokio::test]
async fn test_deleted_before_initialization_is_noop() {
    let h = Harness::new(error_rate_experiment());
    h.candidate_error_rate(0.2, 500);
    h.store.remove(&h.id);

    assert_eq!(h.tick().await.unwrap(), None);
    assert!(h.router.applied().is_empty());
}

#[tokio::test]
async fn test_missing_candidate_service_fails_initialization() {
    let h = Harness::new(error_rate_experiment());
    h.router.remove_service("app-v2");

    let err = h.tick().await.unwrap_err();

    assert!(matches!(err, ReconcileError::Validation(_)));
    assert_eq!(requeue_after_error(&err, 0, &h.ctx.config), None);
    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Failed));
    assert!(status.reason.unwrap().contains("candidate service app-v2 not found"));
    assert!(h.router.applied().is_empty());
}

#[tokio::test]
async fn test_invalid_spec_fails_initialization() {
    let h = Harness::new(experiment("no-criteria", vec![]));

    let err = h.tick().await.unwrap_err();

    assert!(matches!(err, ReconcileError::Validation(_)));
    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Failed));
    assert!(status.reason.unwrap().contains("at least one criterion"));

    // Terminal afterwards
    assert_eq!(h.tick().await.unwrap(), None);
}

#[tokio::test]
async fn test_iteration_interval_gates_assessment() {
    let mut exp = error_rate_experiment();
    exp.spec.traffic_control.interval = Some("1m".to_string());
    let h = Harness::new(exp);
    h.candidate_error_rate(0.2, 500);

    assert_eq!(h.tick().await.unwrap(), Some(Duration::from_secs(60)));
    let calls = h.prometheus.calls();

    assert_eq!(h.tick().await.unwrap(), Some(Duration::from_secs(60)));
    h.clock.advance(chrono::Duration::seconds(45));
    assert_eq!(h.tick().await.unwrap(), Some(Duration::from_secs(15)));
    assert_eq!(h.prometheus.calls(), calls);
    assert_eq!(h.status().current_weight, Some(10));

    h.clock.advance(chrono::Duration::seconds(15));
    h.tick().await.unwrap();
    assert_eq!(h.status().current_weight, Some(20));
}

#[tokio::test]
async fn test_external_traffic_change_is_corrected() {
    let h = progressing().await;
    h.router.set_external(ROUTE, split(50));

    h.tick_later().await.unwrap();

    // Progress continues from the last applied weight, not the drifted one
    assert_eq!(h.status().current_weight, Some(20));
    assert_eq!(h.router.current(ROUTE), split(20));
}

#[tokio::test]
async fn test_weight_never_decreases_while_passing() {
    let mut exp = error_rate_experiment();
    exp.spec.traffic_control.step_size = 15;
    exp.spec.traffic_control.max_weight = 80;
    let h = Harness::new(exp);
    h.candidate_error_rate(0.2, 500);
    h.tick().await.unwrap();

    let mut last = 0;
    while !h.status().phase().is_terminal() {
        h.tick_later().await.unwrap();
        let weight = h.status().current_weight.unwrap();
        assert!(weight >= last, "{} after {}", weight, last);
        last = weight;
    }
    assert_eq!(h.status().phase, Some(Phase::Completed));
}

#[tokio::test]
async fn test_history_is_bounded() {
    let mut exp = error_rate_experiment();
    exp.spec.traffic_control.step_size = 1;
    exp.spec.traffic_control.initial_weight = 0;
    let h = Harness::new(exp);
    h.candidate_error_rate(0.2, 500);
    h.tick().await.unwrap();

    for _ in 0..(MAX_HISTORY + 10) {
        h.tick_later().await.unwrap();
    }

    let status = h.status();
    assert_eq!(status.criteria_history.len(), MAX_HISTORY);
    assert_eq!(status.iteration as usize, MAX_HISTORY + 10);
    assert_eq!(status.criteria_history.last().unwrap().iteration, status.iteration);
}

#[tokio::test]
async fn test_store_outage_on_read_is_transient() {
    let h = progressing().await;
    h.store.fail_with(Some("apiserver unavailable"));

    let result = h.tick_later().await;

    assert!(matches!(result, Err(ReconcileError::TransientIo { .. })));
    assert!(h.store.read_count.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_error_policy_uses_failure_count() {
    let h = progressing().await;
    h.prometheus.fail_with(Some("down"));
    h.tick_later().await.unwrap_err();
    h.tick_later().await.unwrap_err();

    let exp = Arc::new(h.store.get(&h.id).unwrap());
    let err = ReconcileError::TransientIo {
        reason: "down".to_string(),
    };
    let ctx = Arc::new(h.ctx);

    assert_eq!(
        error_policy(exp.clone(), &err, ctx.clone()),
        kube::runtime::controller::Action::requeue(Duration::from_secs(10))
    );
    assert_eq!(
        error_policy(exp, &ReconcileError::Conflict, ctx),
        kube::runtime::controller::Action::requeue(Duration::ZERO)
    );
}

#[tokio::test]
async fn test_reconcile_skips_when_not_leader() {
    let h = Harness::new(error_rate_experiment());
    let exp = Arc::new(h.store.get(&h.id).unwrap());
    let mut ctx = h.ctx;
    ctx.leader_state = Some(crate::server::LeaderState::new());

    let action = reconcile(exp, Arc::new(ctx)).await.unwrap();

    assert_eq!(
        action,
        kube::runtime::controller::Action::requeue(Duration::from_secs(5))
    );
    assert!(h.store.writes().is_empty());
}

#[test]
fn test_status_helpers() {
    let clock = MockClock::at_epoch();
    let now = crate::controller::clock::Clock::now(&clock);

    let status = initialize_status(&ExperimentStatus::default(), split(10), now, Some(2));
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.observed_generation, Some(2));

    assert_eq!(
        interval_remaining(&status, Some(Duration::from_secs(30)), now),
        Some(Duration::from_secs(30))
    );
    assert_eq!(
        interval_remaining(&status, Some(Duration::from_secs(30)), now + chrono::Duration::seconds(31)),
        None
    );
    assert_eq!(interval_remaining(&status, None, now), None);

    assert_eq!(phase_for_pause(Phase::Progressing, true), Phase::Pausing);
    assert_eq!(phase_for_pause(Phase::Pausing, false), Phase::Progressing);
    assert_eq!(phase_for_pause(Phase::Initializing, true), Phase::Initializing);
    assert_eq!(phase_for_pause(Phase::Completed, false), Phase::Completed);
}

#[test]
fn test_validation_rules() {
    let valid = error_rate_experiment();
    assert!(validate_experiment(&valid).is_ok());

    let mut same_services = valid.clone();
    same_services.spec.candidate.service = "app-v1".to_string();
    assert!(validate_experiment(&same_services).unwrap_err().contains("must differ"));

    let mut duplicate = valid.clone();
    duplicate.spec.criteria.push(error_rate_below(2.0, 10));
    assert!(validate_experiment(&duplicate).unwrap_err().contains("duplicated"));

    let mut bad_weight = valid.clone();
    bad_weight.spec.traffic_control.initial_weight = 60;
    bad_weight.spec.traffic_control.max_weight = 50;
    assert!(validate_experiment(&bad_weight).unwrap_err().contains("initialWeight"));

    let mut bad_step = valid.clone();
    bad_step.spec.traffic_control.step_size = 0;
    assert!(validate_experiment(&bad_step).unwrap_err().contains("stepSize"));

    let mut bad_interval = valid.clone();
    bad_interval.spec.traffic_control.interval = Some("soon".to_string());
    assert!(validate_experiment(&bad_interval).unwrap_err().contains("interval"));

    let mut no_samples = valid.clone();
    no_samples.spec.criteria[0].min_sample_size = 0;
    assert!(validate_experiment(&no_samples).unwrap_err().contains("minSampleSize"));

    let mut no_route = valid;
    no_route.spec.traffic_routing.gateway_api.http_route = String::new();
    assert!(validate_experiment(&no_route).unwrap_err().contains("httpRoute"));
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
    assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
    assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    assert_eq!(parse_duration(" 10s "), Some(Duration::from_secs(10)));
    assert_eq!(parse_duration("0s"), None);
    assert_eq!(parse_duration("86401s"), None);
    assert_eq!(parse_duration("169h"), None);
    assert_eq!(parse_duration("10"), None);
    assert_eq!(parse_duration("s"), None);
    assert_eq!(parse_duration(""), None);
    assert_eq!(parse_duration("5d"), None);
}

#[tokio::test]
async fn test_external_split_matching_next_step_is_still_applied() {
    let h = progressing().await;
    h.router.set_external(ROUTE, split(20));

    h.tick_later().await.unwrap();

    assert_eq!(h.status().current_weight, Some(20));
    assert_eq!(h.router.applied(), vec![split(10), split(20)]);
}

#[tokio::test]
async fn test_initial_split_is_applied_even_if_route_already_holds_it() {
    let h = Harness::new(error_rate_experiment());
    h.router.set_external(ROUTE, split(10));

    h.tick().await.unwrap();

    assert_eq!(h.status().current_weight, Some(10));
    assert_eq!(h.router.applied(), vec![split(10)]);
}

#[tokio::test]
async fn test_failed_status_write_is_retried_from_a_fresh_snapshot() {
    let mut h = progressing().await;
    let metrics = crate::server::create_metrics().unwrap();
    h.ctx.metrics = Some(metrics.clone());
    let before = h.status();

    h.router.set_external(ROUTE, split(20));
    h.store.fail_writes(Some("forbidden"));
    let err = h.tick_later().await.unwrap_err();

    assert!(matches!(err, ReconcileError::TransientIo { ref reason } if reason.contains("forbidden")));
    assert_eq!(h.status(), before);
    assert_eq!(h.ctx.retries.failures(&h.id), 1);
    assert!(h.ctx.cache.get(&h.id).is_none());
    assert!(metrics
        .encode()
        .unwrap()
        .contains("vaaka_status_persist_failures_total 1"));

    // Backend moves back before the retry; the retry must see it
    h.router.set_external(ROUTE, split(10));
    h.store.fail_writes(None);
    let calls = h.prometheus.calls();

    h.tick().await.unwrap();

    assert!(h.prometheus.calls() > calls);
    assert_eq!(h.status().current_weight, Some(20));
    assert_eq!(h.router.current(ROUTE), split(20));
    assert_eq!(h.router.applied().last(), Some(&split(20)));
    assert_eq!(h.ctx.retries.failures(&h.id), 0);
}

#[tokio::test]
async fn test_paused_at_creation_holds_before_first_split() {
    let mut exp = error_rate_experiment();
    exp.spec.paused = true;
    let h = Harness::new(exp);
    h.candidate_error_rate(0.2, 500);

    let requeue = h.tick().await.unwrap();

    let status = h.status();
    assert_eq!(requeue, Some(Duration::from_secs(30)));
    assert_eq!(status.phase(), Phase::Initializing);
    assert_eq!(status.current_weight, None);
    assert_eq!(status.reason.as_deref(), Some(PAUSED_REASON));
    assert!(h.router.applied().is_empty());

    // Holding again does not rewrite status
    let writes = h.store.writes().len();
    h.tick().await.unwrap();
    assert_eq!(h.store.writes().len(), writes);

    h.update(|e| e.spec.paused = false);
    h.tick().await.unwrap();

    let status = h.status();
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.current_weight, Some(10));
    assert_eq!(status.reason, None);
    assert_eq!(h.router.applied(), vec![split(10)]);
}
