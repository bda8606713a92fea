//! Status Updater and Experiment resource store
//!
//! Status writes carry the resourceVersion read at the start of the tick,
//! so the API server rejects them with 409 if anyone else wrote in between.
//! Errors are classified by HTTP status code, never by message text.

use crate::controller::snapshot::ExperimentId;
use crate::crd::experiment::{Experiment, ExperimentStatus};
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Experiment was modified since it was read")]
    Conflict,

    #[error("Experiment not found")]
    NotFound,

    #[error("Resource store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Map a Kubernetes API error onto the store taxonomy
    pub fn classify(err: kube::Error) -> Self {
        let code = match &err {
            kube::Error::Api(response) => Some(response.code),
            _ => None,
        };
        Self::from_status_code(code, err.to_string())
    }

    /// 409 is a conflict and 404 a deletion; anything else, including
    /// transport errors without a status code, is unavailability
    pub fn from_status_code(code: Option<u16>, detail: String) -> Self {
        match code {
            Some(409) => StoreError::Conflict,
            Some(404) => StoreError::NotFound,
            _ => StoreError::Unavailable(detail),
        }
    }
}

/// An Experiment together with the version token it was read at
#[derive(Debug, Clone)]
pub struct VersionedExperiment {
    pub experiment: Experiment,
    pub version: String,
}

/// Resource store seam
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Read the current resource; `Ok(None)` once it has been deleted
    async fn read(&self, id: &ExperimentId) -> Result<Option<VersionedExperiment>, StoreError>;

    /// Write status only if the stored version still equals
    /// `expected_version`; returns the new version
    async fn write_status(
        &self,
        id: &ExperimentId,
        status: &ExperimentStatus,
        expected_version: &str,
    ) -> Result<String, StoreError>;
}

/// Result of one persistence attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted { version: String },
    /// Someone else wrote first; recompute from a fresh read
    Conflict,
    /// The resource was deleted mid-tick
    Gone,
    /// Anything else, including the call budget elapsing
    Fatal(String),
}

pub async fn persist(
    store: &dyn ExperimentStore,
    id: &ExperimentId,
    status: &ExperimentStatus,
    expected_version: &str,
    budget: Duration,
) -> PersistOutcome {
    match tokio::time::timeout(budget, store.write_status(id, status, expected_version)).await {
        Ok(Ok(version)) => {
            debug!(experiment = %id, version = %version, "Status persisted");
            PersistOutcome::Persisted { version }
        }
        Ok(Err(StoreError::Conflict)) => PersistOutcome::Conflict,
        Ok(Err(StoreError::NotFound)) => PersistOutcome::Gone,
        Ok(Err(StoreError::Unavailable(reason))) => PersistOutcome::Fatal(reason),
        Err(_) => PersistOutcome::Fatal(format!("status write timed out after {:?}", budget)),
    }
}

/// Optional status fields that must be cleared explicitly
///
/// A JSON merge patch keeps any key it does not mention, so a field that
/// became empty has to be sent as null.
const CLEARABLE_FIELDS: &[&str] = &[
    "phase",
    "currentWeight",
    "criteriaHistory",
    "lastTransitionTime",
    "lastIterationTime",
    "reason",
    "observedGeneration",
];

/// Build the merge patch for a status write
///
/// Carries `metadata.resourceVersion` so the API server enforces the
/// version precondition.
pub fn status_merge_patch(
    status: &ExperimentStatus,
    expected_version: &str,
) -> Result<serde_json::Value, serde_json::Error> {
    let mut status_json = serde_json::to_value(status)?;
    if let Some(fields) = status_json.as_object_mut() {
        for field in CLEARABLE_FIELDS {
            fields
                .entry(field.to_string())
                .or_insert(serde_json::Value::Null);
        }
    }

    let mut patch = serde_json::json!({ "status": status_json });
    if !expected_version.is_empty() {
        patch["metadata"] = serde_json::json!({ "resourceVersion": expected_version });
    }
    Ok(patch)
}

/// Production store backed by the Kubernetes API
pub struct KubeExperimentStore {
    client: kube::Client,
}

impl KubeExperimentStore {
    pub fn new(client: kube::Client) -> Self {
        KubeExperimentStore { client }
    }

    fn api(&self, namespace: &str) -> Api<Experiment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ExperimentStore for KubeExperimentStore {
    async fn read(&self, id: &ExperimentId) -> Result<Option<VersionedExperiment>, StoreError> {
        let experiment = self
            .api(&id.namespace)
            .get_opt(&id.name)
            .await
            .map_err(StoreError::classify)?;

        Ok(experiment.map(|experiment| {
            let version = experiment
                .metadata
                .resource_version
                .clone()
                .unwrap_or_default();
            VersionedExperiment {
                experiment,
                version,
            }
        }))
    }

    async fn write_status(
        &self,
        id: &ExperimentId,
        status: &ExperimentStatus,
        expected_version: &str,
    ) -> Result<String, StoreError> {
        let patch = status_merge_patch(status, expected_version)
            .map_err(|e| StoreError::Unavailable(format!("failed to serialize status: {}", e)))?;

        let updated = self
            .api(&id.namespace)
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::classify)?;

        Ok(updated.metadata.resource_version.unwrap_or_default())
    }
}

/// In-memory store with Kubernetes-style version checks
///
/// Every write bumps the version. External edits made through `update`
/// also bump it, which is how tests provoke conflicts.
#[cfg(test)]
pub struct MockExperimentStore {
    objects: std::sync::Mutex<std::collections::HashMap<ExperimentId, (Experiment, u64)>>,
    writes: std::sync::Mutex<Vec<(String, ExperimentStatus)>>,
    forced_conflicts: std::sync::atomic::AtomicU32,
    failure: std::sync::Mutex<Option<String>>,
    write_failure: std::sync::Mutex<Option<String>>,
    pub read_count: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockExperimentStore {
    pub fn new() -> Self {
        Self {
            objects: Default::default(),
            writes: Default::default(),
            forced_conflicts: std::sync::atomic::AtomicU32::new(0),
            failure: Default::default(),
            write_failure: Default::default(),
            read_count: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn insert(&self, experiment: Experiment) -> ExperimentId {
        let id = ExperimentId::from_resource(&experiment);
        self.objects
            .lock()
            .unwrap()
            .insert(id.clone(), (experiment, 1));
        id
    }

    /// Edit the stored object as an external writer would
    pub fn update(&self, id: &ExperimentId, edit: impl FnOnce(&mut Experiment)) {
        let mut objects = self.objects.lock().unwrap();
        let (experiment, version) = objects.get_mut(id).unwrap();
        edit(experiment);
        *version += 1;
    }

    pub fn remove(&self, id: &ExperimentId) {
        self.objects.lock().unwrap().remove(id);
    }

    pub fn get(&self, id: &ExperimentId) -> Option<Experiment> {
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .map(|(experiment, _)| experiment.clone())
    }

    pub fn status(&self, id: &ExperimentId) -> ExperimentStatus {
        self.get(id)
            .and_then(|e| e.status)
            .unwrap_or_default()
    }

    /// Make the next `n` writes fail with a conflict
    pub fn conflict_next(&self, n: u32) {
        self.forced_conflicts
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fail reads and writes
    pub fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().unwrap() = message.map(str::to_string);
    }

    /// Fail status writes only; reads keep working
    pub fn fail_writes(&self, message: Option<&str>) {
        *self.write_failure.lock().unwrap() = message.map(str::to_string);
    }

    /// Successful writes, with the version each one was based on
    pub fn writes(&self) -> Vec<(String, ExperimentStatus)> {
        self.writes.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ExperimentStore for MockExperimentStore {
    async fn read(&self, id: &ExperimentId) -> Result<Option<VersionedExperiment>, StoreError> {
        use std::sync::atomic::Ordering;

        self.read_count.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.failure.lock().unwrap().clone() {
            return Err(StoreError::Unavailable(msg));
        }
        Ok(self.objects.lock().unwrap().get(id).map(|(experiment, version)| {
            let mut experiment = experiment.clone();
            experiment.metadata.resource_version = Some(version.to_string());
            VersionedExperiment {
                experiment,
                version: version.to_string(),
            }
        }))
    }

    async fn write_status(
        &self,
        id: &ExperimentId,
        status: &ExperimentStatus,
        expected_version: &str,
    ) -> Result<String, StoreError> {
        use std::sync::atomic::Ordering;

        let failure = self.failure.lock().unwrap().clone();
        if let Some(msg) = failure.or_else(|| self.write_failure.lock().unwrap().clone()) {
            return Err(StoreError::Unavailable(msg));
        }

        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut objects = self.objects.lock().unwrap();
        let (experiment, version) = objects.get_mut(id).ok_or(StoreError::NotFound)?;

        if forced {
            // Someone else got there first
            *version += 1;
            return Err(StoreError::Conflict);
        }
        if version.to_string() != expected_version {
            return Err(StoreError::Conflict);
        }

        experiment.status = Some(status.clone());
        self.writes
            .lock()
            .unwrap()
            .push((expected_version.to_string(), status.clone()));
        *version += 1;
        Ok(version.to_string())
    }
}
