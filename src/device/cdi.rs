//! CDI Registry
//!
//! Maps prepared claims to the CDI device identifiers handed back to
//! workloads, and maintains the corresponding CDI spec files on disk so the
//! container runtime can resolve those identifiers.

use crate::device::discovery::GpuDevice;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// CDI vendor for devices produced by this driver
pub const CDI_VENDOR: &str = "gpu.billyronks.io";

/// CDI device class
pub const CDI_CLASS: &str = "gpu";

/// CDI spec format version written to disk
pub const CDI_SPEC_VERSION: &str = "0.6.0";

// =============================================================================
// CDI Spec File Format
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdiSpecFile {
    cdi_version: String,
    kind: String,
    devices: Vec<CdiSpecDevice>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdiSpecDevice {
    name: String,
    container_edits: ContainerEdits,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerEdits {
    device_nodes: Vec<DeviceNode>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceNode {
    path: String,
}

// =============================================================================
// CDI Registry
// =============================================================================

/// Claim-indexed registry of CDI devices and their on-disk specs
pub struct CdiRegistry {
    root: PathBuf,
    /// Claim UID -> fully-qualified CDI device IDs
    devices: DashMap<String, Vec<String>>,
}

impl CdiRegistry {
    /// Create a registry writing spec files under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            devices: DashMap::new(),
        }
    }

    /// Fully-qualified CDI identifier for one GPU
    pub fn device_id(uuid: &str) -> String {
        format!("{}/{}={}", CDI_VENDOR, CDI_CLASS, uuid)
    }

    /// Path of the spec file for one claim
    pub fn spec_path(&self, claim_uid: &str) -> PathBuf {
        self.root
            .join(format!("{}-{}-{}.json", CDI_VENDOR, CDI_CLASS, claim_uid))
    }

    /// Register a claim's devices: write the spec file and remember the IDs.
    /// Re-registering a claim overwrites its previous spec, which makes
    /// startup reconstruction safe to repeat.
    pub fn register(&self, claim_uid: &str, devices: &[&GpuDevice]) -> Result<Vec<String>> {
        let spec = CdiSpecFile {
            cdi_version: CDI_SPEC_VERSION.to_string(),
            kind: format!("{}/{}", CDI_VENDOR, CDI_CLASS),
            devices: devices
                .iter()
                .map(|d| CdiSpecDevice {
                    name: d.uuid.clone(),
                    container_edits: ContainerEdits {
                        device_nodes: vec![DeviceNode {
                            path: d.device_node().display().to_string(),
                        }],
                    },
                })
                .collect(),
        };

        fs::create_dir_all(&self.root).map_err(|e| Error::CdiSpec {
            claim_uid: claim_uid.to_string(),
            reason: format!("failed to create CDI root {:?}: {}", self.root, e),
        })?;

        let path = self.spec_path(claim_uid);
        let content = serde_json::to_vec_pretty(&spec)?;
        fs::write(&path, content).map_err(|e| Error::CdiSpec {
            claim_uid: claim_uid.to_string(),
            reason: format!("failed to write {:?}: {}", path, e),
        })?;

        let ids: Vec<String> = devices.iter().map(|d| Self::device_id(&d.uuid)).collect();
        debug!("Registered CDI spec for claim {}: {:?}", claim_uid, ids);
        self.devices.insert(claim_uid.to_string(), ids.clone());
        Ok(ids)
    }

    /// Drop a claim's registration and remove its spec file
    pub fn unregister(&self, claim_uid: &str) -> Result<()> {
        self.devices.remove(claim_uid);

        let path = self.spec_path(claim_uid);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed CDI spec {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::CdiSpec {
                claim_uid: claim_uid.to_string(),
                reason: format!("failed to remove {:?}: {}", path, e),
            }),
        }
    }

    /// CDI device IDs for a claim (empty if unknown)
    pub fn claim_devices(&self, claim_uid: &str) -> Vec<String> {
        self.devices
            .get(claim_uid)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Spec root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}
