//! GPU Device State
//!
//! Reservation bookkeeping for the node's GPUs. This is the concrete
//! device state manager behind the driver: it validates allocations against
//! the discovered inventory, guarantees no device is reserved for two claims
//! at once, and projects its reservations back into the allocation record's
//! spec shape.

use crate::crd::{AllocatedClaim, NodeAllocationStateSpec, PreparedClaim};
use crate::device::cdi::CdiRegistry;
use crate::device::discovery::GpuDevice;
use crate::domain::ports::DeviceStateManager;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

// =============================================================================
// GPU Device State
// =============================================================================

/// In-memory reservation state for the node's GPU inventory
pub struct GpuDeviceState {
    /// Discovered GPUs by UUID
    inventory: HashMap<String, GpuDevice>,
    /// Claim UID -> reserved GPU UUIDs
    prepared: RwLock<HashMap<String, Vec<String>>>,
    /// CDI registry backing claim device IDs
    cdi: CdiRegistry,
}

impl GpuDeviceState {
    /// Create device state for a discovered inventory
    pub fn new(devices: Vec<GpuDevice>, cdi_root: impl Into<PathBuf>) -> Self {
        let inventory: HashMap<String, GpuDevice> =
            devices.into_iter().map(|d| (d.uuid.clone(), d)).collect();

        info!("Device state manages {} GPUs", inventory.len());

        Self {
            inventory,
            prepared: RwLock::new(HashMap::new()),
            cdi: CdiRegistry::new(cdi_root),
        }
    }

    /// Number of GPUs in the inventory
    pub fn device_count(&self) -> usize {
        self.inventory.len()
    }

    /// Claim UIDs with active reservations
    pub fn prepared_claims(&self) -> Vec<String> {
        self.prepared.read().keys().cloned().collect()
    }

    /// The claim currently holding a device, if any
    fn holder_of(prepared: &HashMap<String, Vec<String>>, uuid: &str) -> Option<String> {
        prepared
            .iter()
            .find(|(_, uuids)| uuids.iter().any(|u| u == uuid))
            .map(|(claim, _)| claim.clone())
    }

    /// Inventory entries for a set of UUIDs, skipping (and warning about)
    /// devices the inventory no longer has
    fn known_devices(&self, claim_uid: &str, uuids: &[String]) -> Vec<&GpuDevice> {
        uuids
            .iter()
            .filter_map(|uuid| {
                let device = self.inventory.get(uuid);
                if device.is_none() {
                    warn!(
                        "Claim {} references device {} absent from inventory",
                        claim_uid, uuid
                    );
                }
                device
            })
            .collect()
    }
}

#[async_trait]
impl DeviceStateManager for GpuDeviceState {
    fn reset_from_spec(&self, spec: &NodeAllocationStateSpec) -> Result<()> {
        let mut prepared = self.prepared.write();
        prepared.clear();

        for (claim_uid, claim) in &spec.prepared_claims {
            let devices = self.known_devices(claim_uid, &claim.gpu_uuids);
            self.cdi.register(claim_uid, &devices)?;
            // The record is authoritative: keep the claim's full device list
            // even when part of it is missing from the inventory, so cleanup
            // can still release the claim later.
            prepared.insert(claim_uid.clone(), claim.gpu_uuids.clone());
        }

        info!(
            "Reconstructed {} prepared claims from allocation record",
            prepared.len()
        );
        Ok(())
    }

    async fn prepare(
        &self,
        claim_uid: &str,
        allocation: Option<&AllocatedClaim>,
    ) -> Result<Vec<String>> {
        let mut prepared = self.prepared.write();

        if prepared.contains_key(claim_uid) {
            debug!("Claim {} already has a reservation", claim_uid);
            return Ok(self.cdi.claim_devices(claim_uid));
        }

        let allocation = allocation.ok_or_else(|| Error::ClaimNotAllocated {
            claim_uid: claim_uid.to_string(),
        })?;
        if allocation.gpus.is_empty() {
            return Err(Error::EmptyAllocation {
                claim_uid: claim_uid.to_string(),
            });
        }

        let mut devices = Vec::with_capacity(allocation.gpus.len());
        for gpu in &allocation.gpus {
            let device = self
                .inventory
                .get(&gpu.uuid)
                .ok_or_else(|| Error::UnknownDevice {
                    uuid: gpu.uuid.clone(),
                })?;

            if let Some(holder) = Self::holder_of(&prepared, &gpu.uuid) {
                return Err(Error::DeviceBusy {
                    uuid: gpu.uuid.clone(),
                    claim_uid: holder,
                });
            }

            devices.push(device);
        }

        let ids = self.cdi.register(claim_uid, &devices)?;
        prepared.insert(
            claim_uid.to_string(),
            allocation.gpus.iter().map(|g| g.uuid.clone()).collect(),
        );

        info!(
            "Reserved {} devices for claim {}",
            devices.len(),
            claim_uid
        );
        Ok(ids)
    }

    async fn unprepare(&self, claim_uid: &str) -> Result<()> {
        let removed = self.prepared.write().remove(claim_uid);
        if removed.is_none() {
            debug!("Claim {} has no reservation, nothing to release", claim_uid);
            return Ok(());
        }

        self.cdi.unregister(claim_uid)?;
        info!("Released devices for claim {}", claim_uid);
        Ok(())
    }

    fn claim_devices(&self, claim_uid: &str) -> Vec<String> {
        self.cdi.claim_devices(claim_uid)
    }

    fn updated_spec(&self, base: &NodeAllocationStateSpec) -> NodeAllocationStateSpec {
        let mut spec = base.clone();
        spec.prepared_claims = self
            .prepared
            .read()
            .iter()
            .map(|(claim_uid, uuids)| {
                (
                    claim_uid.clone(),
                    PreparedClaim {
                        gpu_uuids: uuids.clone(),
                    },
                )
            })
            .collect();
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AllocatedGpu;
    use assert_matches::assert_matches;

    fn inventory() -> Vec<GpuDevice> {
        (0..4)
            .map(|i| GpuDevice {
                uuid: format!("GPU-{i}"),
                model: "Test GPU".to_string(),
                minor: i,
            })
            .collect()
    }

    fn allocation(uuids: &[&str]) -> AllocatedClaim {
        AllocatedClaim {
            gpus: uuids
                .iter()
                .map(|u| AllocatedGpu {
                    uuid: (*u).to_string(),
                })
                .collect(),
        }
    }

    fn state(tmp: &tempfile::TempDir) -> GpuDeviceState {
        GpuDeviceState::new(inventory(), tmp.path())
    }

    #[tokio::test]
    async fn test_prepare_reserves_and_returns_cdi_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        let ids = state
            .prepare("claim-1", Some(&allocation(&["GPU-0", "GPU-1"])))
            .await
            .unwrap();

        assert_eq!(
            ids,
            vec![
                "gpu.billyronks.io/gpu=GPU-0".to_string(),
                "gpu.billyronks.io/gpu=GPU-1".to_string(),
            ]
        );
        assert_eq!(state.claim_devices("claim-1"), ids);
        assert_eq!(state.prepared_claims(), vec!["claim-1".to_string()]);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        let first = state
            .prepare("claim-1", Some(&allocation(&["GPU-0"])))
            .await
            .unwrap();
        // Second call ignores the allocation and returns the reservation
        let second = state.prepare("claim-1", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(state.prepared_claims().len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_without_allocation_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        let result = state.prepare("claim-1", None).await;
        assert_matches!(result, Err(Error::ClaimNotAllocated { .. }));

        let result = state.prepare("claim-1", Some(&allocation(&[]))).await;
        assert_matches!(result, Err(Error::EmptyAllocation { .. }));
    }

    #[tokio::test]
    async fn test_prepare_unknown_device_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        let result = state
            .prepare("claim-1", Some(&allocation(&["GPU-404"])))
            .await;
        assert_matches!(result, Err(Error::UnknownDevice { uuid }) if uuid == "GPU-404");
    }

    #[tokio::test]
    async fn test_prepare_busy_device_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        state
            .prepare("claim-1", Some(&allocation(&["GPU-0"])))
            .await
            .unwrap();

        let result = state
            .prepare("claim-2", Some(&allocation(&["GPU-0"])))
            .await;
        assert_matches!(
            result,
            Err(Error::DeviceBusy { uuid, claim_uid }) if uuid == "GPU-0" && claim_uid == "claim-1"
        );
    }

    #[tokio::test]
    async fn test_unprepare_releases_and_tolerates_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        state
            .prepare("claim-1", Some(&allocation(&["GPU-0"])))
            .await
            .unwrap();
        state.unprepare("claim-1").await.unwrap();

        assert!(state.claim_devices("claim-1").is_empty());
        assert!(state.prepared_claims().is_empty());

        // Device is free for another claim again
        state
            .prepare("claim-2", Some(&allocation(&["GPU-0"])))
            .await
            .unwrap();

        // Unpreparing something never prepared is a no-op success
        state.unprepare("claim-404").await.unwrap();
    }

    #[tokio::test]
    async fn test_updated_spec_projects_reservations() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        state
            .prepare("claim-1", Some(&allocation(&["GPU-0", "GPU-2"])))
            .await
            .unwrap();

        let mut base = NodeAllocationStateSpec::default();
        base.allocated_claims
            .insert("claim-1".into(), allocation(&["GPU-0", "GPU-2"]));

        let spec = state.updated_spec(&base);
        // Allocated claims are untouched; prepared claims mirror reservations
        assert!(spec.allocated_claims.contains_key("claim-1"));
        assert_eq!(
            spec.prepared_claims["claim-1"].gpu_uuids,
            vec!["GPU-0".to_string(), "GPU-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reset_from_spec_reconstructs_reservations() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(&tmp);

        let mut spec = NodeAllocationStateSpec::default();
        spec.prepared_claims.insert(
            "claim-1".into(),
            PreparedClaim {
                gpu_uuids: vec!["GPU-1".into()],
            },
        );

        state.reset_from_spec(&spec).unwrap();

        assert_eq!(state.prepared_claims(), vec!["claim-1".to_string()]);
        assert_eq!(
            state.claim_devices("claim-1"),
            vec!["gpu.billyronks.io/gpu=GPU-1".to_string()]
        );

        // A restart must not allow the reconstructed device to be re-reserved
        let result = state
            .prepare("claim-2", Some(&allocation(&["GPU-1"])))
            .await;
        assert_matches!(result, Err(Error::DeviceBusy { .. }));
    }
}
