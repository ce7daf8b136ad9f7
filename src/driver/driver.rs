//! Node Driver Core
//!
//! The single serialization point for claim lifecycle operations on this
//! node. Bridges the allocation store and the device state manager under an
//! optimistic-concurrency discipline: every record mutation is computed from
//! a fresh read and written with the fetched version, and version conflicts
//! restart the whole sequence up to a fixed retry budget.

use crate::crd::{AllocationPhase, NodeAllocationState};
use crate::domain::ports::{AllocationStore, DeviceStateManager};
use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::reconcile::{self, ReconcilerHandle};

/// Total attempts for a conflict-retried record operation
pub const DEFAULT_UPDATE_RETRY_BUDGET: usize = 5;

// =============================================================================
// Driver Configuration
// =============================================================================

/// Configuration for the node driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Attempts per conflict-retried record operation
    pub retry_budget: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_UPDATE_RETRY_BUDGET,
        }
    }
}

// =============================================================================
// Driver Status
// =============================================================================

/// Snapshot of the driver's last-known record state
#[derive(Debug, Clone)]
pub struct DriverStatus {
    pub node: String,
    pub ready: bool,
    pub allocated_claims: usize,
    pub prepared_claims: usize,
}

// =============================================================================
// Driver
// =============================================================================

/// Per-node claim lifecycle controller
pub struct Driver {
    store: Arc<dyn AllocationStore>,
    devices: Arc<dyn DeviceStateManager>,
    /// Driver-wide lock guarding the mutable driver state. Holding the
    /// guard is what makes prepare/unprepare/is-prepared mutually exclusive;
    /// the mirror inside is the last-fetched copy of the allocation record
    /// and is refreshed from the store before every mutating decision.
    mirror: Mutex<NodeAllocationState>,
    retry_budget: usize,
    metrics: DriverMetrics,
}

impl Driver {
    /// Bring up the driver and start its background reconciliation loop.
    ///
    /// Construction runs the full startup sequence (get-or-create the
    /// record, mark NotReady, rebuild device state from record contents,
    /// write back the projected spec, mark Ready) under conflict retry.
    /// Returns as soon as the record is Ready; the reconciliation loop runs
    /// until the returned handle is stopped.
    pub async fn start(
        store: Arc<dyn AllocationStore>,
        devices: Arc<dyn DeviceStateManager>,
        config: DriverConfig,
    ) -> Result<(Arc<Self>, ReconcilerHandle)> {
        let driver = Self::initialize(store, devices, config).await?;
        let handle = reconcile::spawn(Arc::clone(&driver));
        Ok((driver, handle))
    }

    /// Run the construction protocol without starting the reconciler
    pub(crate) async fn initialize(
        store: Arc<dyn AllocationStore>,
        devices: Arc<dyn DeviceStateManager>,
        config: DriverConfig,
    ) -> Result<Arc<Self>> {
        let metrics = DriverMetrics::new();

        let mut attempt = 0;
        let record = loop {
            attempt += 1;
            match Self::bring_up(store.as_ref(), devices.as_ref()).await {
                Ok(record) => break record,
                Err(e) if e.is_conflict() => {
                    metrics.update_conflicts_total.inc();
                    if attempt >= config.retry_budget {
                        return Err(Error::RetriesExhausted { attempts: attempt });
                    }
                    warn!(
                        "Conflict bringing up allocation record (attempt {}), retrying",
                        attempt
                    );
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            "Allocation record for node {} is {} with {} prepared claims",
            record.node_name(),
            AllocationPhase::Ready,
            record.spec.prepared_claims.len()
        );
        metrics
            .prepared_claims
            .set(record.spec.prepared_claims.len() as i64);

        Ok(Arc::new(Self {
            store,
            devices,
            mirror: Mutex::new(record),
            retry_budget: config.retry_budget,
            metrics,
        }))
    }

    /// One attempt of the startup sequence, from a fresh read
    async fn bring_up(
        store: &dyn AllocationStore,
        devices: &dyn DeviceStateManager,
    ) -> Result<NodeAllocationState> {
        let record = store.get_or_create().await?;
        let record = store
            .update_status(&record, AllocationPhase::NotReady)
            .await?;

        devices.reset_from_spec(&record.spec)?;

        let record = store
            .update(&record, devices.updated_spec(&record.spec))
            .await?;
        store.update_status(&record, AllocationPhase::Ready).await
    }

    /// Mark the record NotReady. Best-effort: devices stay reserved, and the
    /// record still reflects the true prepared set for the next instance's
    /// startup and reconciliation to act on.
    pub async fn shutdown(&self) -> Result<()> {
        let mut mirror = self.mirror.lock().await;
        info!("Marking allocation record NotReady for shutdown");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<()> = async {
                let fresh = self.store.get().await?;
                let stored = self
                    .store
                    .update_status(&fresh, AllocationPhase::NotReady)
                    .await?;
                *mirror = stored;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    self.metrics.update_conflicts_total.inc();
                    if attempt >= self.retry_budget {
                        return Err(Error::RetriesExhausted { attempts: attempt });
                    }
                    warn!("Conflict marking record NotReady (attempt {})", attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle a prepare request for one claim.
    ///
    /// Serialized against all other claim operations on this node. Repeat
    /// calls for an already-prepared claim are side-effect-free and return
    /// the cached device list.
    pub async fn prepare_resource(&self, claim_uid: &str) -> Result<Vec<String>> {
        let mut mirror = self.mirror.lock().await;
        info!("PrepareResource called for claim {}", claim_uid);

        let cached = self
            .is_prepared_locked(&mut mirror, claim_uid)
            .await
            .map_err(|e| Error::CheckPrepared {
                claim_uid: claim_uid.to_string(),
                source: Box::new(e),
            })?;

        if let Some(devices) = cached {
            info!(
                "Returning cached devices for claim {}: {:?}",
                claim_uid, devices
            );
            self.metrics.prepares_cached_total.inc();
            return Ok(devices);
        }

        let prepared = self
            .prepare_locked(&mut mirror, claim_uid)
            .await
            .map_err(|e| Error::PrepareClaim {
                claim_uid: claim_uid.to_string(),
                source: Box::new(e),
            })?;

        info!(
            "Returning newly prepared devices for claim {}: {:?}",
            claim_uid, prepared
        );
        self.metrics.prepares_total.inc();
        self.metrics
            .prepared_claims
            .set(mirror.spec.prepared_claims.len() as i64);
        Ok(prepared)
    }

    /// Handle an unprepare request for one claim.
    ///
    /// Used by both the RPC surface (when synchronous unprepare is enabled)
    /// and the stale-state cleanup fan-out. Unpreparing a claim with no
    /// reservation is a success no-op inside the device manager, so repeats
    /// and races with cleanup are harmless.
    pub async fn unprepare_resource(&self, claim_uid: &str) -> Result<()> {
        let mut mirror = self.mirror.lock().await;

        self.unprepare_locked(&mut mirror, claim_uid)
            .await
            .map_err(|e| Error::UnprepareClaim {
                claim_uid: claim_uid.to_string(),
                source: Box::new(e),
            })?;

        self.metrics.unprepares_total.inc();
        self.metrics
            .prepared_claims
            .set(mirror.spec.prepared_claims.len() as i64);
        Ok(())
    }

    /// Whether a claim is already prepared, with its cached device list
    pub async fn is_prepared(&self, claim_uid: &str) -> Result<Option<Vec<String>>> {
        let mut mirror = self.mirror.lock().await;
        self.is_prepared_locked(&mut mirror, claim_uid).await
    }

    /// Last-known record state, for readiness probes
    pub async fn status(&self) -> DriverStatus {
        let mirror = self.mirror.lock().await;
        DriverStatus {
            node: mirror.node_name().to_string(),
            ready: mirror.is_ready(),
            allocated_claims: mirror.spec.allocated_claims.len(),
            prepared_claims: mirror.spec.prepared_claims.len(),
        }
    }

    pub(crate) fn store(&self) -> &dyn AllocationStore {
        self.store.as_ref()
    }

    pub(crate) fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    // =========================================================================
    // Locked Internals
    // =========================================================================

    async fn is_prepared_locked(
        &self,
        mirror: &mut NodeAllocationState,
        claim_uid: &str,
    ) -> Result<Option<Vec<String>>> {
        *mirror = self.store.get().await?;
        if mirror.spec.prepared_claims.contains_key(claim_uid) {
            Ok(Some(self.devices.claim_devices(claim_uid)))
        } else {
            Ok(None)
        }
    }

    async fn prepare_locked(
        &self,
        mirror: &mut NodeAllocationState,
        claim_uid: &str,
    ) -> Result<Vec<String>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_prepare(mirror, claim_uid).await {
                Ok(devices) => return Ok(devices),
                Err(e) if e.is_conflict() => {
                    self.metrics.update_conflicts_total.inc();
                    if attempt >= self.retry_budget {
                        self.release_reservation(claim_uid).await;
                        return Err(Error::RetriesExhausted { attempts: attempt });
                    }
                    warn!(
                        "Conflict preparing claim {} (attempt {}), retrying",
                        claim_uid, attempt
                    );
                }
                Err(e) => {
                    self.release_reservation(claim_uid).await;
                    return Err(e);
                }
            }
        }
    }

    /// One prepare attempt: fresh read, device reservation, write-back
    async fn try_prepare(
        &self,
        mirror: &mut NodeAllocationState,
        claim_uid: &str,
    ) -> Result<Vec<String>> {
        *mirror = self.store.get().await?;

        let allocation = mirror.spec.allocated_claims.get(claim_uid);
        let devices = self.devices.prepare(claim_uid, allocation).await?;

        let spec = self.devices.updated_spec(&mirror.spec);
        let stored = self.store.update(mirror, spec).await?;
        *mirror = stored;
        Ok(devices)
    }

    /// Roll back a claim's local reservation after a failed prepare so no
    /// device is left reserved without the record recording it
    async fn release_reservation(&self, claim_uid: &str) {
        if let Err(e) = self.devices.unprepare(claim_uid).await {
            warn!(
                "Failed to roll back reservation for claim {}: {}",
                claim_uid, e
            );
        }
    }

    async fn unprepare_locked(
        &self,
        mirror: &mut NodeAllocationState,
        claim_uid: &str,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<()> = async {
                *mirror = self.store.get().await?;
                self.devices.unprepare(claim_uid).await?;
                let spec = self.devices.updated_spec(&mirror.spec);
                let stored = self.store.update(mirror, spec).await?;
                *mirror = stored;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    self.metrics.update_conflicts_total.inc();
                    if attempt >= self.retry_budget {
                        return Err(Error::RetriesExhausted { attempts: attempt });
                    }
                    debug!(
                        "Conflict unpreparing claim {} (attempt {}), retrying",
                        claim_uid, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
