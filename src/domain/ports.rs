//! Domain Ports - Core trait definitions for the node driver
//!
//! These traits define the boundaries between the driver core and external
//! systems. Adapters implement these traits to provide concrete
//! functionality: the allocation record lives in the Kubernetes API (or in
//! process memory for standalone mode), and device reservation is owned by
//! the GPU device state manager.

use crate::crd::{AllocatedClaim, AllocationPhase, NodeAllocationState, NodeAllocationStateSpec};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

// =============================================================================
// Record Events
// =============================================================================

/// A change notification for the node's allocation record
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// The record was created
    Added(Box<NodeAllocationState>),
    /// The record was modified (the only event kind that triggers cleanup)
    Modified(Box<NodeAllocationState>),
    /// The record was deleted
    Deleted(Box<NodeAllocationState>),
}

/// Options for opening a record watch
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Version token to resume from (as returned by `list`)
    pub resume_from: String,
    /// Close the stream after this long, ended-without-error
    pub timeout: Option<Duration>,
}

/// Stream of record change notifications
pub type RecordEventStream = BoxStream<'static, Result<RecordEvent>>;

// =============================================================================
// Allocation Store
// =============================================================================

/// Typed access to the node's allocation record with version-based
/// optimistic-concurrency conflict detection.
///
/// Every write takes the caller's fetched copy of the record and fails with
/// a conflict-kind error (`Error::is_conflict`) when another writer advanced
/// the version in between. Callers are expected to re-fetch and retry.
#[async_trait]
pub trait AllocationStore: Send + Sync + 'static {
    /// Fetch the record, creating an empty one if the node has none yet
    async fn get_or_create(&self) -> Result<NodeAllocationState>;

    /// Fetch the latest record
    async fn get(&self) -> Result<NodeAllocationState>;

    /// Version-checked spec write. Returns the stored record with its
    /// advanced version token.
    async fn update(
        &self,
        current: &NodeAllocationState,
        spec: NodeAllocationStateSpec,
    ) -> Result<NodeAllocationState>;

    /// Version-checked status phase write
    async fn update_status(
        &self,
        current: &NodeAllocationState,
        phase: AllocationPhase,
    ) -> Result<NodeAllocationState>;

    /// List the record objects for this node (expected cardinality: exactly
    /// one) together with the list version token a watch can resume from
    async fn list(&self) -> Result<(Vec<NodeAllocationState>, String)>;

    /// Open a change-notification stream starting from a version token
    async fn watch(&self, options: WatchOptions) -> Result<RecordEventStream>;
}

// =============================================================================
// Device State Manager
// =============================================================================

/// Owner of physical device reservation on this node.
///
/// The driver core never touches hardware directly; it asks this manager to
/// reserve and release devices and to project its in-memory reservations
/// back into the record's desired-state shape.
#[async_trait]
pub trait DeviceStateManager: Send + Sync + 'static {
    /// Rebuild in-memory reservation state from record contents, so a
    /// process restart does not orphan hardware
    fn reset_from_spec(&self, spec: &NodeAllocationStateSpec) -> Result<()>;

    /// Reserve devices for a claim using its allocation details. Repeated
    /// calls for an already-prepared claim return the existing reservation.
    /// Returns the CDI device identifiers handed back to the workload.
    async fn prepare(
        &self,
        claim_uid: &str,
        allocation: Option<&AllocatedClaim>,
    ) -> Result<Vec<String>>;

    /// Release a claim's devices. Releasing a claim that is not currently
    /// prepared is a no-op success.
    async fn unprepare(&self, claim_uid: &str) -> Result<()>;

    /// CDI device identifiers for a prepared claim. Pure local lookup;
    /// returns an empty list for unknown claims.
    fn claim_devices(&self, claim_uid: &str) -> Vec<String>;

    /// Project in-memory reservations into a copy of the given spec
    fn updated_spec(&self, base: &NodeAllocationStateSpec) -> NodeAllocationStateSpec;
}
