//! Point-in-time observation of an Experiment's dependent state
//!
//! A `Snapshot` bundles the live traffic split, backend readiness and one
//! `SampleSet` per criterion and version. It is immutable once built and is
//! shared through the `SnapshotCache` as an `Arc`.

use crate::controller::prometheus::{MetricRef, MetricsError, MetricsQuerier, Revision, SampleSet, TimeRange};
use crate::controller::traffic::{TrafficError, TrafficRouter, TrafficSplit, TrafficTarget};
use crate::crd::experiment::Experiment;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Stable identity of an Experiment (namespace + name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExperimentId {
    pub namespace: String,
    pub name: String,
}

impl ExperimentId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ExperimentId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource(experiment: &Experiment) -> Self {
        ExperimentId {
            namespace: experiment.namespace().unwrap_or_else(|| "default".to_string()),
            name: experiment.name_any(),
        }
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Samples for one criterion
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CriterionSamples {
    pub candidate: SampleSet,
    /// Only queried for comparisons against the baseline
    pub baseline: Option<SampleSet>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub split: TrafficSplit,
    pub baseline_ready: bool,
    pub candidate_ready: bool,
    /// Keyed by criterion name
    pub samples: BTreeMap<String, CriterionSamples>,
    pub observed_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn samples_for(&self, criterion: &str) -> Option<&CriterionSamples> {
        self.samples.get(criterion)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("metrics query for criterion {criterion} failed: {source}")]
    Metrics {
        criterion: String,
        #[source]
        source: MetricsError,
    },

    #[error("traffic backend read failed: {0}")]
    Traffic(#[from] TrafficError),

    #[error("{call} did not complete within {budget:?}")]
    TimedOut { call: String, budget: Duration },
}

/// Run `fut` under the per-call budget
pub(crate) async fn within<T, E, F>(call: &str, budget: Duration, fut: F) -> Result<Result<T, E>, SnapshotError>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| SnapshotError::TimedOut {
            call: call.to_string(),
            budget,
        })
}

/// Read everything the next assessment needs
///
/// Traffic and readiness reads happen first; metric queries for all
/// criteria then run concurrently. Any failure aborts the whole read so a
/// partially observed snapshot is never cached.
pub async fn load_snapshot(
    experiment: &Experiment,
    id: &ExperimentId,
    querier: &dyn MetricsQuerier,
    router: &dyn TrafficRouter,
    range: TimeRange,
    budget: Duration,
) -> Result<Snapshot, SnapshotError> {
    let target = TrafficTarget::from_experiment(experiment, &id.namespace);

    let split = within("traffic split read", budget, router.get_split(&target)).await??;
    let baseline_ready = within(
        "baseline readiness check",
        budget,
        router.backend_ready(&id.namespace, &target.baseline_service),
    )
    .await??;
    let candidate_ready = within(
        "candidate readiness check",
        budget,
        router.backend_ready(&id.namespace, &target.candidate_service),
    )
    .await??;

    let address = experiment
        .spec
        .analysis
        .as_ref()
        .and_then(|a| a.prometheus.as_ref())
        .and_then(|p| p.address.clone());

    let metric_ref = |service: &str, revision: Revision, source| MetricRef {
        experiment: id.name.clone(),
        namespace: id.namespace.clone(),
        service: service.to_string(),
        revision,
        source,
        address: address.clone(),
    };

    let queries = experiment.spec.criteria.iter().map(|criterion| {
        let candidate_ref = metric_ref(
            &target.candidate_service,
            Revision::Candidate,
            criterion.metric.clone(),
        );
        let baseline_ref = criterion.check.needs_baseline().then(|| {
            metric_ref(
                &target.baseline_service,
                Revision::Baseline,
                criterion.metric.clone(),
            )
        });
        let name = criterion.name.clone();

        async move {
            let metrics_err = |source| SnapshotError::Metrics {
                criterion: name.clone(),
                source,
            };
            let call = format!("metrics query for criterion {}", name);

            let candidate = within(&call, budget, querier.query(&candidate_ref, &range))
                .await?
                .map_err(metrics_err)?;
            let baseline = match baseline_ref {
                Some(r) => Some(
                    within(&call, budget, querier.query(&r, &range))
                        .await?
                        .map_err(metrics_err)?,
                ),
                None => None,
            };

            Ok::<_, SnapshotError>((name.clone(), CriterionSamples { candidate, baseline }))
        }
    });

    let samples: BTreeMap<_, _> = try_join_all(queries).await?.into_iter().collect();

    debug!(
        experiment = %id,
        split = %split,
        criteria = samples.len(),
        "Loaded snapshot"
    );

    Ok(Snapshot {
        split,
        baseline_ready,
        candidate_ready,
        samples,
        observed_at: range.end,
    })
}
