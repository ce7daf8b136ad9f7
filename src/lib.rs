//! GPU Node Driver
//!
//! A node-local GPU allocation driver for Kubernetes. The driver keeps a
//! per-node declarative allocation record (the NodeAllocationState CRD)
//! consistent with the claims the control plane has assigned to this node,
//! makes physical device state match that record, and guarantees that
//! allocation and deallocation are crash-safe, idempotent, and convergent
//! even after partial failures or missed notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           GPU Node Driver                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌──────────────────┐   ┌────────────────────┐  │
//! │  │   Claim API    │   │     Driver       │   │  Reconciliation    │  │
//! │  │  (REST/axum)   ├──▶│  (serialized     │◀──┤  Loop (resync +    │  │
//! │  │                │   │   prepare/       │   │  watch + cleanup   │  │
//! │  └────────────────┘   │   unprepare)     │   │  fan-out)          │  │
//! │                       └───────┬──────────┘   └─────────┬──────────┘  │
//! │                               │                        │             │
//! │              ┌────────────────┴───────┐   ┌────────────┴──────────┐  │
//! │              │  Device State Manager  │   │   Allocation Store    │  │
//! │              │  (GPU inventory, CDI)  │   │ (NodeAllocationState) │  │
//! │              └────────────────────────┘   └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every record mutation follows the same optimistic-concurrency protocol:
//! fetch latest, compute the desired change from the fresh value, write with
//! the fetched version, and restart from the fetch on a version conflict,
//! up to a fixed retry budget.
//!
//! # Modules
//!
//! - [`api`]: REST surface for prepare/unprepare requests
//! - [`crd`]: NodeAllocationState custom resource
//! - [`device`]: GPU discovery, CDI specs, and reservation state
//! - [`domain`]: Port traits between the core and its collaborators
//! - [`driver`]: Claim lifecycle controller and reconciliation loop
//! - [`error`]: Error types and conflict classification
//! - [`record`]: Allocation store implementations (Kubernetes, in-memory)

pub mod api;
pub mod crd;
pub mod device;
pub mod domain;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod record;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig};
pub use crd::{
    AllocatedClaim, AllocatedGpu, AllocationPhase, NodeAllocationState, NodeAllocationStateSpec,
    NodeAllocationStateStatus, PreparedClaim,
};
pub use device::{CdiRegistry, DiscoveryConfig, GpuDevice, GpuDeviceState, GpuDiscovery};
pub use domain::ports::{
    AllocationStore, DeviceStateManager, RecordEvent, RecordEventStream, WatchOptions,
};
pub use driver::{Driver, DriverConfig, DriverStatus, ReconcilerHandle};
pub use error::{Error, ErrorAction, Result};
pub use metrics::DriverMetrics;
pub use record::{KubeAllocationStore, MemoryAllocationStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
