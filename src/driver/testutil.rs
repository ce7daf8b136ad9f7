//! Test doubles for driver-level tests

use crate::crd::{AllocatedClaim, NodeAllocationStateSpec, PreparedClaim};
use crate::device::cdi::CdiRegistry;
use crate::domain::ports::DeviceStateManager;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Scriptable device state manager: counts real reservations and can be
/// told to fail unprepare for specific claims.
pub(crate) struct MockDevices {
    prepared: Mutex<HashMap<String, Vec<String>>>,
    reservations: AtomicUsize,
    failing_unprepare: Mutex<HashSet<String>>,
}

impl MockDevices {
    pub(crate) fn new() -> Self {
        Self {
            prepared: Mutex::new(HashMap::new()),
            reservations: AtomicUsize::new(0),
            failing_unprepare: Mutex::new(HashSet::new()),
        }
    }

    /// Number of actual (non-cached) reservations performed
    pub(crate) fn reservation_count(&self) -> usize {
        self.reservations.load(Ordering::SeqCst)
    }

    /// Claims currently holding reservations, sorted
    pub(crate) fn reserved_claims(&self) -> Vec<String> {
        let mut claims: Vec<String> = self.prepared.lock().keys().cloned().collect();
        claims.sort();
        claims
    }

    /// Make unprepare fail for one claim
    pub(crate) fn fail_unprepare(&self, claim_uid: &str) {
        self.failing_unprepare.lock().insert(claim_uid.to_string());
    }

    /// Let unprepare succeed again for one claim
    pub(crate) fn heal_unprepare(&self, claim_uid: &str) {
        self.failing_unprepare.lock().remove(claim_uid);
    }
}

#[async_trait]
impl DeviceStateManager for MockDevices {
    fn reset_from_spec(&self, spec: &NodeAllocationStateSpec) -> Result<()> {
        let mut prepared = self.prepared.lock();
        prepared.clear();
        for (claim_uid, claim) in &spec.prepared_claims {
            prepared.insert(claim_uid.clone(), claim.gpu_uuids.clone());
        }
        Ok(())
    }

    async fn prepare(
        &self,
        claim_uid: &str,
        allocation: Option<&AllocatedClaim>,
    ) -> Result<Vec<String>> {
        let mut prepared = self.prepared.lock();

        if let Some(uuids) = prepared.get(claim_uid) {
            return Ok(uuids.iter().map(|u| CdiRegistry::device_id(u)).collect());
        }

        let allocation = allocation.ok_or_else(|| Error::ClaimNotAllocated {
            claim_uid: claim_uid.to_string(),
        })?;
        if allocation.gpus.is_empty() {
            return Err(Error::EmptyAllocation {
                claim_uid: claim_uid.to_string(),
            });
        }

        let uuids: Vec<String> = allocation.gpus.iter().map(|g| g.uuid.clone()).collect();
        self.reservations.fetch_add(1, Ordering::SeqCst);
        prepared.insert(claim_uid.to_string(), uuids.clone());

        Ok(uuids.iter().map(|u| CdiRegistry::device_id(u)).collect())
    }

    async fn unprepare(&self, claim_uid: &str) -> Result<()> {
        if self.failing_unprepare.lock().contains(claim_uid) {
            return Err(Error::Internal(format!(
                "simulated device failure for claim {}",
                claim_uid
            )));
        }
        self.prepared.lock().remove(claim_uid);
        Ok(())
    }

    fn claim_devices(&self, claim_uid: &str) -> Vec<String> {
        self.prepared
            .lock()
            .get(claim_uid)
            .map(|uuids| uuids.iter().map(|u| CdiRegistry::device_id(u)).collect())
            .unwrap_or_default()
    }

    fn updated_spec(&self, base: &NodeAllocationStateSpec) -> NodeAllocationStateSpec {
        let mut spec = base.clone();
        spec.prepared_claims = self
            .prepared
            .lock()
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
