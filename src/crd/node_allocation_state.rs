//! NodeAllocationState CRD
//!
//! The per-node declarative allocation record. The control plane writes the
//! set of claims allocated to this node; the node driver writes the set of
//! claims it has prepared devices for. The two maps diverging is what drives
//! stale-state cleanup.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// NodeAllocationState CRD
// =============================================================================

/// NodeAllocationState tracks GPU claim allocation and preparation for a
/// single cluster node. `allocatedClaims` is authored by the cluster control
/// plane and read-only from the node's perspective; `preparedClaims` is
/// authored exclusively by the node driver running on the named node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gpu.billyronks.io",
    version = "v1alpha1",
    kind = "NodeAllocationState",
    plural = "nodeallocationstates",
    shortname = "nas",
    status = "NodeAllocationStateStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationStateSpec {
    /// Claims allocated to this node by the control plane, keyed by claim UID
    #[serde(default)]
    pub allocated_claims: BTreeMap<String, AllocatedClaim>,

    /// Claims this node has reserved devices for, keyed by claim UID
    #[serde(default)]
    pub prepared_claims: BTreeMap<String, PreparedClaim>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Allocation details for one claim, decided upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedClaim {
    /// GPUs assigned to this claim
    #[serde(default)]
    pub gpus: Vec<AllocatedGpu>,
}

/// One GPU assignment within an allocation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedGpu {
    /// Device UUID (e.g., GPU-7d8429d5-531d-d6a6-6510-3b662081a75a)
    pub uuid: String,
}

/// Devices reserved on this node for one claim
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreparedClaim {
    /// UUIDs of the reserved GPUs
    #[serde(default)]
    pub gpu_uuids: Vec<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the NodeAllocationState
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocationStateStatus {
    /// Whether the node driver is serving claim requests
    #[serde(default)]
    pub phase: AllocationPhase,

    /// Last phase transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Driver readiness phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AllocationPhase {
    #[default]
    NotReady,
    Ready,
}

impl std::fmt::Display for AllocationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationPhase::NotReady => write!(f, "NotReady"),
            AllocationPhase::Ready => write!(f, "Ready"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl NodeAllocationState {
    /// Build the record created at driver start for a node with no record yet
    pub fn new_for_node(node_name: &str) -> Self {
        let mut nas = NodeAllocationState::new(node_name, NodeAllocationStateSpec::default());
        nas.status = Some(NodeAllocationStateStatus::default());
        nas
    }

    /// The node this record belongs to
    pub fn node_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Opaque optimistic-concurrency version token
    pub fn resource_version(&self) -> &str {
        self.metadata.resource_version.as_deref().unwrap_or_default()
    }

    /// Check if the driver has marked this record ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == AllocationPhase::Ready)
            .unwrap_or(false)
    }
}

impl NodeAllocationStateSpec {
    /// Claim UIDs present in the prepared set but absent from the allocated
    /// set. These claims were deallocated upstream without this node being
    /// told synchronously and must be unprepared by cleanup.
    pub fn orphaned_claims(&self) -> Vec<String> {
        self.prepared_claims
            .keys()
            .filter(|uid| !self.allocated_claims.contains_key(*uid))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocated(uuids: &[&str]) -> AllocatedClaim {
        AllocatedClaim {
            gpus: uuids
                .iter()
                .map(|u| AllocatedGpu {
                    uuid: (*u).to_string(),
                })
                .collect(),
        }
    }

    fn prepared(uuids: &[&str]) -> PreparedClaim {
        PreparedClaim {
            gpu_uuids: uuids.iter().map(|u| (*u).to_string()).collect(),
        }
    }

    #[test]
    fn test_new_for_node_defaults() {
        let nas = NodeAllocationState::new_for_node("worker-1");
        assert_eq!(nas.node_name(), "worker-1");
        assert!(!nas.is_ready());
        assert!(nas.spec.allocated_claims.is_empty());
        assert!(nas.spec.prepared_claims.is_empty());
    }

    #[test]
    fn test_orphaned_claims() {
        let mut spec = NodeAllocationStateSpec::default();
        spec.allocated_claims
            .insert("claim-a".into(), allocated(&["gpu-1"]));
        spec.prepared_claims
            .insert("claim-a".into(), prepared(&["gpu-1"]));
        spec.prepared_claims
            .insert("claim-b".into(), prepared(&["gpu-2"]));

        let orphans = spec.orphaned_claims();
        assert_eq!(orphans, vec!["claim-b".to_string()]);
    }

    #[test]
    fn test_spec_serialization_uses_camel_case() {
        let mut spec = NodeAllocationStateSpec::default();
        spec.prepared_claims
            .insert("claim-a".into(), prepared(&["gpu-1"]));

        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("preparedClaims"));
        assert!(json.contains("gpuUuids"));

        let roundtrip: NodeAllocationStateSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(
            roundtrip.prepared_claims["claim-a"].gpu_uuids,
            vec!["gpu-1".to_string()]
        );
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(format!("{}", AllocationPhase::NotReady), "NotReady");
        assert_eq!(format!("{}", AllocationPhase::Ready), "Ready");
    }
}
