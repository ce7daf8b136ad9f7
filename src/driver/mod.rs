//! Node driver core
//!
//! The claim lifecycle controller, its stale-state reconciliation loop, and
//! the per-pass cleanup fan-out.

pub mod cleanup;
#[allow(clippy::module_inception)]
pub mod driver;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testutil;

pub use driver::{Driver, DriverConfig, DriverStatus, DEFAULT_UPDATE_RETRY_BUDGET};
pub use reconcile::ReconcilerHandle;
