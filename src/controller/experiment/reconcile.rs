use crate::config::ControllerConfig;
use crate::controller::assessment::{assess, CompletionPolicy, History};
use crate::controller::backoff::{backoff_delay, RetryBudget};
use crate::controller::cache::SnapshotCache;
use crate::controller::clock::{Clock, SystemClock};
use crate::controller::prometheus::{MetricsQuerier, PrometheusClient, TimeRange};
use crate::controller::snapshot::{load_snapshot, ExperimentId, Snapshot, SnapshotError};
use crate::controller::store::{
    persist, ExperimentStore, KubeExperimentStore, PersistOutcome, VersionedExperiment,
};
use crate::controller::traffic::{
    apply, plan, ApplyError, GatewayRouter, StepPolicy, TrafficAction, TrafficRouter, TrafficSplit,
    TrafficTarget,
};
use crate::crd::experiment::{Experiment, ExperimentStatus, Phase};
use crate::server::{LeaderState, SharedMetrics};
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::status::{
    failed_status, initialize_status, interval_remaining, phase_for_pause, status_after_verdict,
    PAUSED_REASON,
};
use super::validation::{check_preconditions, iteration_interval};

/// Window queried when the experiment sets no iteration interval
const DEFAULT_QUERY_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid Experiment spec: {0}")]
    Validation(String),

    #[error("Transient I/O failure: {reason}")]
    TransientIo { reason: String },

    #[error("Status write conflicted with a concurrent update")]
    Conflict,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl ReconcileError {
    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Validation(_) => "validation",
            ReconcileError::TransientIo { .. } => "transient_io",
            ReconcileError::Conflict => "conflict",
            ReconcileError::InvariantViolation(_) => "invariant_violation",
        }
    }

    /// Counts against the retry budget
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::TransientIo { .. } | ReconcileError::InvariantViolation(_)
        )
    }

    fn transient(reason: impl std::fmt::Display) -> Self {
        ReconcileError::TransientIo {
            reason: reason.to_string(),
        }
    }
}

impl From<SnapshotError> for ReconcileError {
    fn from(err: SnapshotError) -> Self {
        ReconcileError::transient(err)
    }
}

impl From<ApplyError> for ReconcileError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Backend(e) => ReconcileError::transient(format!("traffic apply failed: {}", e)),
            inconsistent @ ApplyError::Inconsistent { .. } => {
                ReconcileError::InvariantViolation(inconsistent.to_string())
            }
        }
    }
}

pub struct Context {
    pub store: Arc<dyn ExperimentStore>,
    pub metrics_querier: Arc<dyn MetricsQuerier>,
    pub router: Arc<dyn TrafficRouter>,
    pub cache: SnapshotCache,
    pub retries: RetryBudget,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    /// Optional leader state for multi-replica deployments
    /// When Some, reconciliation is skipped if not the leader
    pub leader_state: Option<LeaderState>,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    /// Create a Context backed by the Kubernetes API and Prometheus
    pub fn new(
        client: kube::Client,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let prometheus = PrometheusClient::new(config.prometheus_address.clone(), config.call_timeout);
        let mut ctx = Self::with_collaborators(
            Arc::new(KubeExperimentStore::new(client.clone())),
            Arc::new(prometheus),
            Arc::new(GatewayRouter::new(client)),
            Arc::new(SystemClock),
            config,
        );
        ctx.metrics = metrics;
        ctx
    }

    /// Create a Context with leader election support
    ///
    /// Reconciliation checks leadership before doing any work.
    pub fn new_with_leader(
        client: kube::Client,
        config: ControllerConfig,
        leader_state: LeaderState,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let mut ctx = Self::new(client, config, metrics);
        ctx.leader_state = Some(leader_state);
        ctx
    }

    /// Create a Context from explicit collaborators
    pub fn with_collaborators(
        store: Arc<dyn ExperimentStore>,
        metrics_querier: Arc<dyn MetricsQuerier>,
        router: Arc<dyn TrafficRouter>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Context {
            store,
            metrics_querier,
            router,
            cache: SnapshotCache::with_ttl(config.snapshot_ttl),
            retries: RetryBudget::new(),
            clock,
            config,
            leader_state: None,
            metrics: None,
        }
    }

    /// Check if this instance should reconcile
    ///
    /// Returns true if:
    /// - No leader election configured (single instance mode)
    /// - Leader election enabled and this instance is the leader
    pub fn should_reconcile(&self) -> bool {
        match &self.leader_state {
            None => true,
            Some(state) => state.is_leader(),
        }
    }
}

/// Flags scoped to one tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickState {
    /// Status must be persisted
    pub status_dirty: bool,
    /// The snapshot must be re-read before the next tick
    pub refresh_required: bool,
    /// At least one forward-moving action happened
    pub progress_made: bool,
}

impl TickState {
    fn mark_dirty(&mut self) {
        self.status_dirty = true;
    }

    fn mark_refresh(&mut self) {
        self.refresh_required = true;
    }

    fn mark_progress(&mut self) {
        self.progress_made = true;
    }
}

/// Reconcile an Experiment resource (kube runtime entry point)
pub async fn reconcile(experiment: Arc<Experiment>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let id = ExperimentId::from_resource(&experiment);

    if !ctx.should_reconcile() {
        // Not the leader - skip reconciliation, requeue later to check again
        debug!(experiment = %id, "Skipping reconciliation - not leader");
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation_skipped();
        }
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let start_time = std::time::Instant::now();
    let result = reconcile_experiment(&id, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        let duration_secs = start_time.elapsed().as_secs_f64();
        match &result {
            Ok(_) => metrics.record_reconciliation_success(duration_secs),
            Err(e) => metrics.record_reconciliation_error(e.kind(), duration_secs),
        }
    }

    match result? {
        Some(delay) => Ok(Action::requeue(delay)),
        None => Ok(Action::await_change()),
    }
}

/// Error policy for the kube runtime Controller
pub fn error_policy(experiment: Arc<Experiment>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let id = ExperimentId::from_resource(&experiment);
    let failures = ctx.retries.failures(&id);
    match requeue_after_error(error, failures, &ctx.config) {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

/// Requeue delay for a failed tick
///
/// Conflicts requeue immediately without growing the backoff; retryable
/// failures back off exponentially; validation failures wait for a spec
/// change.
pub fn requeue_after_error(
    error: &ReconcileError,
    failures: u32,
    config: &ControllerConfig,
) -> Option<Duration> {
    match error {
        ReconcileError::Conflict => Some(Duration::ZERO),
        ReconcileError::TransientIo { .. } | ReconcileError::InvariantViolation(_) => Some(
            backoff_delay(failures, config.backoff_base, config.backoff_max),
        ),
        ReconcileError::Validation(_) => None,
    }
}

/// Run one tick for `id`; returns when to run the next one
///
/// Retryable failures are counted per experiment and the count is cleared
/// by the next tick that runs to completion (a tick that only waits for
/// the iteration interval does not count). Once the count exceeds the
/// configured budget the experiment is failed with traffic rolled back
/// where possible.
pub async fn reconcile_experiment(
    id: &ExperimentId,
    ctx: &Context,
) -> Result<Option<Duration>, ReconcileError> {
    match run_tick(id, ctx).await {
        Ok(requeue) => Ok(requeue),
        Err(ReconcileError::Conflict) => Err(ReconcileError::Conflict),
        Err(err) if err.is_retryable() => {
            let failures = ctx.retries.record_failure(id);
            warn!(
                experiment = %id,
                error = %err,
                failures = failures,
                budget = ctx.config.retry_budget,
                "Retryable reconcile failure"
            );
            if failures > ctx.config.retry_budget {
                return exhaust_retry_budget(id, ctx, err, failures).await;
            }
            Err(err)
        }
        Err(err) => {
            ctx.retries.reset(id);
            Err(err)
        }
    }
}

async fn read_experiment(
    id: &ExperimentId,
    ctx: &Context,
) -> Result<Option<VersionedExperiment>, ReconcileError> {
    match tokio::time::timeout(ctx.config.call_timeout, ctx.store.read(id)).await {
        Ok(result) => result.map_err(|e| ReconcileError::transient(format!("read failed: {}", e))),
        Err(_) => Err(ReconcileError::transient(format!(
            "read did not complete within {:?}",
            ctx.config.call_timeout
        ))),
    }
}

async fn apply_within(
    ctx: &Context,
    target: &TrafficTarget,
    split: TrafficSplit,
) -> Result<TrafficSplit, ReconcileError> {
    match tokio::time::timeout(ctx.config.call_timeout, apply(ctx.router.as_ref(), target, split)).await {
        Ok(Ok(reported)) => Ok(reported),
        Ok(Err(e)) => {
            let err = ReconcileError::from(e);
            if let ReconcileError::InvariantViolation(ref detail) = err {
                error!(route = %target.http_route, detail = %detail, "Traffic backend reported an inconsistent split");
                if let Some(ref metrics) = ctx.metrics {
                    metrics.record_invariant_violation();
                }
            }
            Err(err)
        }
        Err(_) => Err(ReconcileError::transient(format!(
            "traffic apply did not complete within {:?}",
            ctx.config.call_timeout
        ))),
    }
}

async fn resolve_snapshot(
    id: &ExperimentId,
    experiment: &Experiment,
    window: Duration,
    ctx: &Context,
) -> Result<Arc<Snapshot>, ReconcileError> {
    if let Some(snapshot) = ctx.cache.get(id) {
        debug!(experiment = %id, "Using cached snapshot");
        return Ok(snapshot);
    }

    let range = TimeRange::ending_at(ctx.clock.now(), window);
    let snapshot = load_snapshot(
        experiment,
        id,
        ctx.metrics_querier.as_ref(),
        ctx.router.as_ref(),
        range,
        ctx.config.call_timeout,
    )
    .await?;
    Ok(ctx.cache.put(id.clone(), snapshot))
}

/// One tick: read, snapshot, assess, act, persist, decide requeue
async fn run_tick(id: &ExperimentId, ctx: &Context) -> Result<Option<Duration>, ReconcileError> {
    let Some(VersionedExperiment {
        experiment,
        version,
    }) = read_experiment(id, ctx).await?
    else {
        debug!(experiment = %id, "Experiment deleted, nothing to do");
        ctx.cache.invalidate(id);
        ctx.retries.reset(id);
        return Ok(None);
    };

    let prev = experiment.status.clone().unwrap_or_default();
    let stored_phase = prev.phase();

    // Terminal is absorbing: no snapshot, no assessment, no traffic change
    if stored_phase.is_terminal() {
        debug!(experiment = %id, phase = ?stored_phase, "Experiment is terminal");
        ctx.cache.invalidate(id);
        ctx.retries.reset(id);
        return Ok(None);
    }

    let interval = iteration_interval(&experiment);
    let pacing = interval.unwrap_or(ctx.config.progress_requeue);
    let phase = phase_for_pause(stored_phase, experiment.spec.paused);

    if phase == stored_phase && phase != Phase::Initializing {
        if let Some(remaining) = interval_remaining(&prev, Some(pacing), ctx.clock.now()) {
            debug!(experiment = %id, remaining = ?remaining, "Waiting for iteration interval");
            return Ok(Some(remaining));
        }
    }

    let window = interval.unwrap_or(DEFAULT_QUERY_WINDOW);
    let snapshot = resolve_snapshot(id, &experiment, window, ctx).await?;

    let tick = Tick {
        id,
        experiment: &experiment,
        version: &version,
        prev: &prev,
        phase,
        pacing,
    };
    let mut state = TickState::default();
    let result = tick.run(&snapshot, ctx, &mut state).await;

    // A consumed snapshot is never reused, whichever way the tick ended
    if state.refresh_required {
        ctx.cache.invalidate(id);
    }
    if result.is_ok() {
        ctx.retries.reset(id);
    }
    result
}

/// Inputs of one tick after the resource has been read
struct Tick<'a> {
    id: &'a ExperimentId,
    experiment: &'a Experiment,
    version: &'a str,
    prev: &'a ExperimentStatus,
    phase: Phase,
    pacing: Duration,
}

impl Tick<'_> {
    async fn run(
        &self,
        snapshot: &Snapshot,
        ctx: &Context,
        state: &mut TickState,
    ) -> Result<Option<Duration>, ReconcileError> {
        let id = self.id;
        let new_status = if self.phase == Phase::Initializing {
            match self.initialize(snapshot, ctx, state).await? {
                Some(status) => status,
                None => return Ok(None),
            }
        } else {
            self.iterate(snapshot, ctx, state).await?
        };

        if new_status != *self.prev {
            state.mark_dirty();
        }

        if state.status_dirty {
            if let Persisted::Gone =
                persist_status(id, ctx, &new_status, self.version, state).await?
            {
                return Ok(None);
            }
        }

        if let Some(ref metrics) = ctx.metrics {
            if let Some(weight) = new_status.current_weight {
                metrics.set_candidate_weight(&id.namespace, &id.name, weight as i64);
            }
        }

        let next_phase = new_status.phase();
        let requeue = if next_phase.is_terminal() {
            info!(experiment = %id, phase = ?next_phase, reason = ?new_status.reason, "Experiment finished");
            None
        } else if state.progress_made {
            Some(self.pacing)
        } else if self.experiment.spec.paused {
            Some(ctx.config.idle_requeue)
        } else {
            Some(ctx.config.inconclusive_requeue)
        };

        Ok(requeue)
    }

    /// Check preconditions and seed the initial split
    ///
    /// Returns None when the experiment was deleted while failing it.
    async fn initialize(
        &self,
        snapshot: &Snapshot,
        ctx: &Context,
        state: &mut TickState,
    ) -> Result<Option<ExperimentStatus>, ReconcileError> {
        let (id, experiment) = (self.id, self.experiment);
        let now = ctx.clock.now();
        let generation = experiment.metadata.generation;

        if let Err(reason) = check_preconditions(experiment, snapshot) {
            warn!(experiment = %id, reason = %reason, "Experiment preconditions failed");
            state.mark_refresh();
            let status = failed_status(self.prev, reason.clone(), None, now, generation);
            return match persist_status(id, ctx, &status, self.version, state).await? {
                Persisted::Yes => Err(ReconcileError::Validation(reason)),
                Persisted::Gone => Ok(None),
            };
        }

        if experiment.spec.paused {
            debug!(experiment = %id, "Paused before the first split, holding");
            state.mark_refresh();
            let mut status = self.prev.clone();
            status.reason = Some(PAUSED_REASON.to_string());
            status.observed_generation = generation;
            return Ok(Some(status));
        }

        let initial = TrafficSplit::with_candidate(experiment.spec.traffic_control.initial_weight)
            .ok_or_else(|| ReconcileError::Validation("initial weight out of range".to_string()))?;
        let target = TrafficTarget::from_experiment(experiment, &id.namespace);
        let applied = apply_within(ctx, &target, initial).await?;

        info!(
            experiment = %id,
            weight = applied.candidate(),
            "Experiment initialized, progressing"
        );
        state.mark_dirty();
        state.mark_progress();
        state.mark_refresh();
        Ok(Some(initialize_status(self.prev, applied, now, generation)))
    }

    /// Assess the snapshot and act on the verdict
    async fn iterate(
        &self,
        snapshot: &Snapshot,
        ctx: &Context,
        state: &mut TickState,
    ) -> Result<ExperimentStatus, ReconcileError> {
        let (id, experiment) = (self.id, self.experiment);
        let recorded = self
            .prev
            .current_weight
            .and_then(TrafficSplit::with_candidate);
        let basis = recorded.unwrap_or(snapshot.split);

        if snapshot.split != basis {
            warn!(
                experiment = %id,
                expected = %basis,
                observed = %snapshot.split,
                "Traffic split changed outside the controller"
            );
        }

        let history = History {
            iteration: self.prev.iteration,
            current_weight: basis.candidate(),
        };
        let control = &experiment.spec.traffic_control;
        let verdict = assess(
            snapshot,
            &experiment.spec.criteria,
            &history,
            &CompletionPolicy::from(control),
        );

        let paused_hold = self.phase == Phase::Pausing && !verdict.is_terminal();
        let action = if paused_hold {
            TrafficAction::Hold
        } else {
            plan(basis, &verdict, &StepPolicy::from(control))
        };
        let desired = action.target(basis);

        // Only a split returned by the router may be recorded; an external
        // edit that happens to match the target does not count
        let applied = if paused_hold || (recorded == Some(desired) && snapshot.split == desired) {
            basis
        } else {
            let target = TrafficTarget::from_experiment(experiment, &id.namespace);
            apply_within(ctx, &target, desired).await?
        };

        info!(
            experiment = %id,
            phase = ?self.phase,
            verdict = ?verdict.kind(),
            action = ?action,
            weight = applied.candidate(),
            "Assessment complete"
        );

        if action.is_progress() {
            state.mark_progress();
        }
        state.mark_refresh();

        Ok(status_after_verdict(
            self.prev,
            self.phase,
            &verdict,
            action,
            applied,
            ctx.clock.now(),
            experiment.metadata.generation,
        ))
    }
}

enum Persisted {
    Yes,
    Gone,
}

/// Persist `status`, mapping the outcome onto the tick's error taxonomy
async fn persist_status(
    id: &ExperimentId,
    ctx: &Context,
    status: &ExperimentStatus,
    version: &str,
    state: &mut TickState,
) -> Result<Persisted, ReconcileError> {
    match persist(ctx.store.as_ref(), id, status, version, ctx.config.call_timeout).await {
        PersistOutcome::Persisted { .. } => {
            info!(
                experiment = %id,
                phase = ?status.phase(),
                weight = ?status.current_weight,
                iteration = status.iteration,
                "Status updated"
            );
            Ok(Persisted::Yes)
        }
        PersistOutcome::Conflict => {
            debug!(experiment = %id, "Status write conflicted, recomputing from a fresh read");
            state.mark_refresh();
            ctx.cache.invalidate(id);
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_conflict();
            }
            Err(ReconcileError::Conflict)
        }
        PersistOutcome::Gone => {
            debug!(experiment = %id, "Experiment deleted during tick");
            ctx.cache.invalidate(id);
            Ok(Persisted::Gone)
        }
        PersistOutcome::Fatal(reason) => {
            error!(experiment = %id, reason = %reason, "Failed to update status");
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_persist_failure();
            }
            Err(ReconcileError::transient(format!("status write failed: {}", reason)))
        }
    }
}

/// Fail the experiment after too many consecutive retryable failures
///
/// Traffic is rolled back to the baseline if the backend accepts it; the
/// status only claims 0% when the rollback was applied.
async fn exhaust_retry_budget(
    id: &ExperimentId,
    ctx: &Context,
    cause: ReconcileError,
    failures: u32,
) -> Result<Option<Duration>, ReconcileError> {
    let Some(VersionedExperiment {
        experiment,
        version,
    }) = read_experiment(id, ctx).await?
    else {
        ctx.retries.reset(id);
        return Ok(None);
    };

    let prev = experiment.status.clone().unwrap_or_default();
    if prev.phase().is_terminal() {
        ctx.retries.reset(id);
        return Ok(None);
    }

    let target = TrafficTarget::from_experiment(&experiment, &id.namespace);
    let rolled_back = match apply_within(ctx, &target, TrafficSplit::ALL_BASELINE).await {
        Ok(split) => Some(split.candidate()),
        Err(e) => {
            warn!(experiment = %id, error = %e, "Rollback after exhausted retry budget failed");
            None
        }
    };

    let reason = format!(
        "exceeded retry budget after {} consecutive failures: {}",
        failures, cause
    );
    error!(experiment = %id, reason = %reason, "Failing experiment");

    let status = failed_status(
        &prev,
        reason,
        rolled_back,
        ctx.clock.now(),
        experiment.metadata.generation,
    );
    let mut state = TickState::default();
    ctx.cache.invalidate(id);

    match persist_status(id, ctx, &status, &version, &mut state).await {
        Ok(_) => {
            ctx.retries.reset(id);
            Ok(None)
        }
        Err(ReconcileError::Conflict) => Err(ReconcileError::Conflict),
        Err(_) => Err(cause),
    }
}
