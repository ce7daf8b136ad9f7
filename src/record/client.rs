//! Kubernetes Allocation Record Client
//!
//! Typed CRUD + watch access to this node's NodeAllocationState object.
//! All writes carry the caller's fetched resourceVersion so the API server
//! rejects stale writes with a 409, which the driver's update protocol
//! treats as a retry-from-fresh signal.

use crate::crd::{AllocationPhase, NodeAllocationState, NodeAllocationStateSpec, NodeAllocationStateStatus};
use crate::domain::ports::{AllocationStore, RecordEvent, RecordEventStream, WatchOptions};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ListParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use tracing::{debug, info};

// =============================================================================
// Kube Allocation Store
// =============================================================================

/// Allocation record client backed by the Kubernetes API
pub struct KubeAllocationStore {
    api: Api<NodeAllocationState>,
    node_name: String,
}

impl KubeAllocationStore {
    /// Create a client scoped to one node's record
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            node_name: node_name.into(),
        }
    }

    /// Field selector limiting list/watch to this node's record
    fn name_selector(&self) -> String {
        format!("metadata.name={}", self.node_name)
    }
}

#[async_trait]
impl AllocationStore for KubeAllocationStore {
    async fn get_or_create(&self) -> Result<NodeAllocationState> {
        if let Some(existing) = self.api.get_opt(&self.node_name).await? {
            return Ok(existing);
        }

        info!("Creating allocation record for node {}", self.node_name);
        let fresh = NodeAllocationState::new_for_node(&self.node_name);
        // A create race with another writer surfaces as 409 and is retried
        // by the caller like any other conflict.
        let created = self.api.create(&PostParams::default(), &fresh).await?;
        Ok(created)
    }

    async fn get(&self) -> Result<NodeAllocationState> {
        self.api
            .get_opt(&self.node_name)
            .await?
            .ok_or_else(|| Error::RecordNotFound {
                node: self.node_name.clone(),
            })
    }

    async fn update(
        &self,
        current: &NodeAllocationState,
        spec: NodeAllocationStateSpec,
    ) -> Result<NodeAllocationState> {
        let mut desired = current.clone();
        desired.spec = spec;

        debug!(
            "Updating allocation record for node {} at version {}",
            self.node_name,
            current.resource_version()
        );

        let stored = self
            .api
            .replace(&self.node_name, &PostParams::default(), &desired)
            .await?;
        Ok(stored)
    }

    async fn update_status(
        &self,
        current: &NodeAllocationState,
        phase: AllocationPhase,
    ) -> Result<NodeAllocationState> {
        let mut desired = current.clone();
        desired.status = Some(NodeAllocationStateStatus {
            phase,
            last_transition_time: Some(Utc::now()),
        });

        debug!(
            "Marking allocation record for node {} as {}",
            self.node_name, phase
        );

        let data = serde_json::to_vec(&desired)?;
        let stored = self
            .api
            .replace_status(&self.node_name, &PostParams::default(), data)
            .await?;
        Ok(stored)
    }

    async fn list(&self) -> Result<(Vec<NodeAllocationState>, String)> {
        let params = ListParams::default().fields(&self.name_selector());
        let list = self.api.list(&params).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        Ok((list.items, resource_version))
    }

    async fn watch(&self, options: WatchOptions) -> Result<RecordEventStream> {
        let mut params = WatchParams::default().fields(&self.name_selector());
        if let Some(timeout) = options.timeout {
            params = params.timeout(timeout.as_secs() as u32);
        }

        let stream = self.api.watch(&params, &options.resume_from).await?;

        let events = stream
            .filter_map(|result| async move {
                match result {
                    Ok(WatchEvent::Added(nas)) => Some(Ok(RecordEvent::Added(Box::new(nas)))),
                    Ok(WatchEvent::Modified(nas)) => {
                        Some(Ok(RecordEvent::Modified(Box::new(nas))))
                    }
                    Ok(WatchEvent::Deleted(nas)) => Some(Ok(RecordEvent::Deleted(Box::new(nas)))),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(resp)) => {
                        Some(Err(Error::MalformedWatchEvent(resp.message)))
                    }
                    Err(e) => Some(Err(Error::Kube(e))),
                }
            })
            .boxed();

        Ok(events)
    }
}
