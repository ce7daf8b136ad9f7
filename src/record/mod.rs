//! Allocation record access
//!
//! Two implementations of the [`AllocationStore`](crate::domain::ports::AllocationStore)
//! port: a Kubernetes-backed client for cluster operation and an in-process
//! store with identical conflict semantics for standalone mode and tests.

pub mod client;
pub mod memory;

pub use client::KubeAllocationStore;
pub use memory::MemoryAllocationStore;
