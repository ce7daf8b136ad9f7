//! Custom Resource Definitions for the GPU node driver
//!
//! One CRD: NodeAllocationState, the per-node declarative allocation record.

pub mod node_allocation_state;

pub use node_allocation_state::*;
