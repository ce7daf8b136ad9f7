//! Claim API surface
//!
//! The RPC endpoints the cluster's transport layer delivers prepare and
//! unprepare requests through.

pub mod rest;
pub mod server;

pub use rest::{PrepareResourceResponse, RestRouter, UnprepareResourceResponse};
pub use server::{ApiServer, ApiServerConfig};
