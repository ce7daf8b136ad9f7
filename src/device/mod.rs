//! GPU device state management
//!
//! Discovery of the node's GPU inventory, CDI spec handling, and the
//! reservation bookkeeping that backs claim preparation.

pub mod cdi;
pub mod discovery;
pub mod state;

pub use cdi::CdiRegistry;
pub use discovery::{DiscoveryConfig, GpuDevice, GpuDiscovery};
pub use state::GpuDeviceState;
