//! Lease-based leader election
//!
//! Only one replica reconciles at a time. Every replica runs the election
//! loop; the one holding the `coordination.k8s.io/v1` Lease sets
//! `LeaderState` and the others skip reconciliation until the lease
//! expires.

use crate::server::shutdown::ShutdownSignal;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lease duration; a replica that stops renewing loses leadership after this
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// How often the leader renews (and followers retry)
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_LEASE_NAME: &str = "vaaka-controller-leader";
pub const DEFAULT_LEASE_NAMESPACE: &str = "vaaka-system";

/// Whether this replica currently holds the lease
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaderConfig {
    pub holder_id: String,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration_seconds: i32,
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Identity from POD_NAME, then HOSTNAME, then a random id
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let holder_id = lookup("POD_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("vaaka-{}", uuid::Uuid::new_v4()));

        LeaderConfig {
            holder_id,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace: lookup("POD_NAMESPACE")
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| DEFAULT_LEASE_NAMESPACE.to_string()),
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// A lease without a renew time or duration counts as expired
pub fn is_lease_expired(
    renew_time: Option<DateTime<Utc>>,
    lease_duration_seconds: Option<i32>,
    now: DateTime<Utc>,
) -> bool {
    match (renew_time, lease_duration_seconds) {
        (Some(renewed), Some(seconds)) => {
            now > renewed + chrono::Duration::seconds(i64::from(seconds))
        }
        _ => true,
    }
}

/// Holder, renew time, duration and transition count read from a Lease
#[derive(Debug, Default, PartialEq)]
pub(crate) struct LeaseRecord {
    pub holder: Option<String>,
    pub renew_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub transitions: i32,
}

impl LeaseRecord {
    pub(crate) fn from_lease(lease: &Lease) -> Self {
        let spec = lease
            .spec
            .as_ref()
            .and_then(|spec| serde_json::to_value(spec).ok())
            .unwrap_or_default();

        LeaseRecord {
            holder: spec["holderIdentity"].as_str().map(str::to_string),
            renew_time: spec["renewTime"]
                .as_str()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            duration_seconds: spec["leaseDurationSeconds"]
                .as_i64()
                .and_then(|s| i32::try_from(s).ok()),
            transitions: spec["leaseTransitions"]
                .as_i64()
                .and_then(|t| i32::try_from(t).ok())
                .unwrap_or(0),
        }
    }
}

fn micro_time(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Spec written when `holder` takes or renews the lease
pub(crate) fn lease_spec(
    config: &LeaderConfig,
    previous: &LeaseRecord,
    now: DateTime<Utc>,
) -> serde_json::Value {
    let renewing = previous.holder.as_deref() == Some(config.holder_id.as_str());
    let mut spec = json!({
        "holderIdentity": config.holder_id,
        "leaseDurationSeconds": config.lease_duration_seconds,
        "renewTime": micro_time(now),
    });
    if !renewing {
        spec["acquireTime"] = json!(micro_time(now));
        spec["leaseTransitions"] = json!(previous.transitions + 1);
    }
    spec
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// One election round; returns whether this replica holds the lease
async fn try_acquire_or_renew(api: &Api<Lease>, config: &LeaderConfig) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(lease) = api.get_opt(&config.lease_name).await? else {
        let lease: Lease = serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": config.lease_name },
            "spec": lease_spec(config, &LeaseRecord::default(), now),
        }))
        .map_err(kube::Error::SerdeError)?;

        return match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e),
        };
    };

    let record = LeaseRecord::from_lease(&lease);
    let ours = record.holder.as_deref() == Some(config.holder_id.as_str());
    if !ours && !is_lease_expired(record.renew_time, record.duration_seconds, now) {
        debug!(holder = ?record.holder, "Lease held by another replica");
        return Ok(false);
    }

    // resourceVersion makes the takeover fail if another replica wins the race
    let patch = json!({
        "metadata": { "resourceVersion": lease.metadata.resource_version },
        "spec": lease_spec(config, &record, now),
    });
    match api
        .patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if is_conflict(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Clear the holder so another replica can take over without waiting out the TTL
async fn release(api: &Api<Lease>, config: &LeaderConfig) -> Result<(), kube::Error> {
    let Some(lease) = api.get_opt(&config.lease_name).await? else {
        return Ok(());
    };
    if LeaseRecord::from_lease(&lease).holder.as_deref() != Some(config.holder_id.as_str()) {
        return Ok(());
    }
    let patch = json!({
        "metadata": { "resourceVersion": lease.metadata.resource_version },
        "spec": { "holderIdentity": null, "renewTime": null },
    });
    api.patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Run the election loop until shutdown
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);

    loop {
        let leader = match try_acquire_or_renew(&api, &config).await {
            Ok(leader) => leader,
            Err(e) => {
                warn!(error = %e, lease = %config.lease_name, "Leader election round failed");
                false
            }
        };

        if leader != state.is_leader() {
            info!(
                holder_id = %config.holder_id,
                leader = leader,
                "Leadership changed"
            );
        }
        state.set_leader(leader);

        tokio::select! {
            _ = tokio::time::sleep(config.renew_interval) => {}
            _ = shutdown.wait() => break,
        }
    }

    if state.is_leader() {
        state.set_leader(false);
        if let Err(e) = release(&api, &config).await {
            warn!(error = %e, "Failed to release leader lease");
        } else {
            info!(holder_id = %config.holder_id, "Released leader lease");
        }
    }
}
