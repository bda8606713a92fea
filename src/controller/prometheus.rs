//! Prometheus metrics backend
//!
//! Queries one criterion's metric for one version (baseline or candidate)
//! over a time window and returns the observed value together with the
//! number of requests it was computed from.

use crate::crd::experiment::{MetricSource, MetricTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus HTTP error: {0}")]
    HttpError(String),

    #[error("Prometheus query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No data returned from Prometheus")]
    NoData,
}

/// Which side of the experiment a query observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Revision {
    Baseline,
    Candidate,
}

impl Revision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Revision::Baseline => "baseline",
            Revision::Candidate => "candidate",
        }
    }
}

/// Query window, evaluated at `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn ending_at(end: DateTime<Utc>, window: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(2));
        TimeRange {
            start: end - window,
            end,
        }
    }

    /// PromQL range selector for this window, at least one second
    pub fn selector(&self) -> String {
        format!("{}s", (self.end - self.start).num_seconds().max(1))
    }
}

/// Everything needed to turn a criterion into PromQL for one version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRef {
    pub experiment: String,
    pub namespace: String,
    pub service: String,
    pub revision: Revision,
    pub source: MetricSource,
    /// Per-experiment Prometheus address; None uses the client default
    pub address: Option<String>,
}

/// Observed value plus the sample count behind it
///
/// `value` is None when Prometheus returned no series. A count of zero
/// means nothing has been observed yet.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleSet {
    pub value: Option<f64>,
    pub count: u64,
}

impl SampleSet {
    pub fn empty() -> Self {
        SampleSet::default()
    }

    pub fn new(value: f64, count: u64) -> Self {
        SampleSet {
            value: Some(value),
            count,
        }
    }
}

/// Metrics backend seam, implemented by `PrometheusClient` and by a mock in tests
#[async_trait]
pub trait MetricsQuerier: Send + Sync {
    async fn query(&self, metric: &MetricRef, range: &TimeRange) -> Result<SampleSet, MetricsError>;
}

fn selector_labels(namespace: &str, service: &str) -> String {
    format!(r#"namespace="{}",service="{}""#, namespace, service)
}

/// Build PromQL for a built-in template
///
/// Error rate is a percentage: (5xx responses / all responses) * 100.
pub fn build_template_query(
    template: MetricTemplate,
    namespace: &str,
    service: &str,
    window: &str,
) -> String {
    let labels = selector_labels(namespace, service);
    match template {
        MetricTemplate::ErrorRate => format!(
            r#"sum(rate(http_requests_total{{{labels},status=~"5.."}}[{window}])) / sum(rate(http_requests_total{{{labels}}}[{window}])) * 100"#
        ),
        MetricTemplate::LatencyP95 => format!(
            r#"histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{{{labels}}}[{window}])) by (le))"#
        ),
        MetricTemplate::LatencyP99 => format!(
            r#"histogram_quantile(0.99, sum(rate(http_request_duration_seconds_bucket{{{labels}}}[{window}])) by (le))"#
        ),
        MetricTemplate::RequestCount => {
            format!(r#"sum(increase(http_requests_total{{{labels}}}[{window}]))"#)
        }
    }
}

/// Substitute placeholders in a custom query
pub fn render_custom_query(query: &str, metric: &MetricRef, window: &str) -> String {
    query
        .replace("$namespace", &metric.namespace)
        .replace("$service", &metric.service)
        .replace("$revision", metric.revision.as_str())
        .replace("$window", window)
        .replace("$name", &metric.experiment)
}

/// PromQL for a metric reference over a window
pub fn build_query(metric: &MetricRef, window: &str) -> String {
    match &metric.source {
        MetricSource::Template(template) => {
            build_template_query(*template, &metric.namespace, &metric.service, window)
        }
        MetricSource::Query(query) => render_custom_query(query, metric, window),
    }
}

/// Prometheus instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<PrometheusData>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: (f64, String), // [timestamp, value_as_string]
}

/// Parse Prometheus instant query response and extract the first value
///
/// An empty result vector is `NoData`. Prometheus encodes NaN and
/// infinities as strings, which parse to the matching f64 values.
pub fn parse_prometheus_instant_query(json_response: &str) -> Result<f64, MetricsError> {
    let response: PrometheusResponse = serde_json::from_str(json_response)
        .map_err(|e| MetricsError::ParseError(format!("Invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(MetricsError::HttpError(format!(
            "Prometheus query failed with status: {} ({})",
            response.status,
            response.error.unwrap_or_default()
        )));
    }

    let result = response
        .data
        .and_then(|d| d.result.into_iter().next())
        .ok_or(MetricsError::NoData)?;

    result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| MetricsError::ParseError(format!("Invalid value: {}", e)))
}

/// Production metrics backend over the Prometheus HTTP API
pub struct PrometheusClient {
    client: reqwest::Client,
    address: String,
    timeout: Duration,
}

impl PrometheusClient {
    pub fn new(address: String, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build Prometheus HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            client,
            address,
            timeout,
        }
    }

    /// Run one instant query; `Ok(None)` when Prometheus has no series
    async fn instant(
        &self,
        address: &str,
        promql: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, MetricsError> {
        let url = format!("{}/api/v1/query", address.trim_end_matches('/'));
        let time = at.timestamp().to_string();

        debug!(query = %promql, address = %address, "Querying Prometheus");

        let response = self
            .client
            .get(&url)
            .query(&[("query", promql), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MetricsError::Timeout(self.timeout)
                } else {
                    MetricsError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MetricsError::HttpError(e.to_string()))?;

        if !status.is_success() {
            return Err(MetricsError::HttpError(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        match parse_prometheus_instant_query(&body) {
            Ok(value) => Ok(Some(value)),
            Err(MetricsError::NoData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MetricsQuerier for PrometheusClient {
    async fn query(&self, metric: &MetricRef, range: &TimeRange) -> Result<SampleSet, MetricsError> {
        let address = metric.address.as_deref().unwrap_or(&self.address);
        let window = range.selector();

        let value_query = build_query(metric, &window);
        let count_query = build_template_query(
            MetricTemplate::RequestCount,
            &metric.namespace,
            &metric.service,
            &window,
        );

        let (value, count) = futures::try_join!(
            self.instant(address, &value_query, range.end),
            self.instant(address, &count_query, range.end)
        )?;

        // increase() extrapolates, so the count can be fractional
        let count = count
            .filter(|c| c.is_finite() && *c > 0.0)
            .map(|c| c.round() as u64)
            .unwrap_or(0);

        Ok(SampleSet { value, count })
    }
}

/// Mock metrics backend for testing
///
/// Responses are keyed by (service, metric source). Unknown keys return an
/// empty sample set, like a Prometheus with no series yet.
#[cfg(test)]
pub struct MockPrometheusClient {
    responses: std::sync::Mutex<std::collections::HashMap<(String, MetricSource), SampleSet>>,
    failure: std::sync::Mutex<Option<String>>,
    pub call_count: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockPrometheusClient {
    pub fn new() -> Self {
        Self {
            responses: Default::default(),
            failure: Default::default(),
            call_count: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn set(&self, service: &str, source: MetricSource, samples: SampleSet) {
        self.responses
            .lock()
            .unwrap()
            .insert((service.to_string(), source), samples);
    }

    pub fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().unwrap() = message.map(str::to_string);
    }

    pub fn calls(&self) -> u32 {
        self.call_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl MetricsQuerier for MockPrometheusClient {
    async fn query(&self, metric: &MetricRef, _range: &TimeRange) -> Result<SampleSet, MetricsError> {
        self.call_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(msg) = self.failure.lock().unwrap().clone() {
            return Err(MetricsError::HttpError(msg));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&(metric.service.clone(), metric.source.clone()))
            .copied()
            .unwrap_or_default())
    }
}
