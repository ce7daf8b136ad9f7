//! GPU Discovery
//!
//! Enumerates the node's GPUs from the kernel driver's procfs tree, with a
//! JSON inventory file as an override for nodes where the driver tree is
//! unavailable (or for standalone runs without hardware).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

const PROC_GPU_ROOT: &str = "/proc/driver/nvidia/gpus";

// =============================================================================
// GPU Device
// =============================================================================

/// One physical GPU on this node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    /// Stable device UUID (e.g., GPU-7d8429d5-531d-d6a6-6510-3b662081a75a)
    pub uuid: String,
    /// Model name as reported by the driver
    #[serde(default)]
    pub model: String,
    /// Device minor number (maps to /dev/nvidia<minor>)
    #[serde(default)]
    pub minor: u32,
}

impl GpuDevice {
    /// Device node exposed to containers for this GPU
    pub fn device_node(&self) -> PathBuf {
        PathBuf::from(format!("/dev/nvidia{}", self.minor))
    }
}

// =============================================================================
// Discovery Configuration
// =============================================================================

/// Configuration for GPU discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Root of the kernel driver's per-GPU procfs tree
    pub proc_root: PathBuf,
    /// JSON inventory file overriding procfs discovery
    pub inventory_file: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_GPU_ROOT),
            inventory_file: None,
        }
    }
}

// =============================================================================
// GPU Discovery
// =============================================================================

/// Discovers the GPUs present on the local node
pub struct GpuDiscovery {
    config: DiscoveryConfig,
}

impl GpuDiscovery {
    /// Create a new discovery instance
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Enumerate the node's GPUs
    pub fn discover(&self) -> Result<Vec<GpuDevice>> {
        if let Some(inventory) = &self.config.inventory_file {
            info!("Loading GPU inventory from {:?}", inventory);
            return self.load_inventory(inventory);
        }

        if !self.config.proc_root.exists() {
            warn!(
                "No GPU driver tree at {:?}, node has no discoverable GPUs",
                self.config.proc_root
            );
            return Ok(Vec::new());
        }

        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.config.proc_root)? {
            let entry = entry?;
            let info_path = entry.path().join("information");
            if !info_path.is_file() {
                continue;
            }

            match self.parse_information(&info_path) {
                Ok(device) => {
                    debug!("Discovered GPU {} ({})", device.uuid, device.model);
                    devices.push(device);
                }
                Err(e) => {
                    warn!("Skipping GPU entry {:?}: {}", entry.path(), e);
                }
            }
        }

        info!("Discovered {} GPUs", devices.len());
        Ok(devices)
    }

    /// Load a JSON inventory file
    fn load_inventory(&self, path: &Path) -> Result<Vec<GpuDevice>> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::DeviceDiscovery(format!("failed to read inventory {:?}: {}", path, e))
        })?;
        let devices: Vec<GpuDevice> = serde_json::from_str(&content)?;
        info!("Loaded {} GPUs from inventory", devices.len());
        Ok(devices)
    }

    /// Parse one GPU's `information` file from the driver procfs tree
    fn parse_information(&self, path: &Path) -> Result<GpuDevice> {
        let content = fs::read_to_string(path)?;

        let mut uuid = None;
        let mut model = String::new();
        let mut minor = 0u32;

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "GPU UUID" => uuid = Some(value.to_string()),
                "Model" => model = value.to_string(),
                "Device Minor" => {
                    minor = value.parse().map_err(|_| {
                        Error::DeviceDiscovery(format!("invalid device minor: {}", value))
                    })?;
                }
                _ => {}
            }
        }

        let uuid = uuid
            .ok_or_else(|| Error::DeviceDiscovery(format!("no GPU UUID in {:?}", path)))?;

        Ok(GpuDevice { uuid, model, minor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn write_information(dir: &Path, name: &str, content: &str) {
        let gpu_dir = dir.join(name);
        fs::create_dir_all(&gpu_dir).unwrap();
        let mut file = fs::File::create(gpu_dir.join("information")).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_discover_from_proc_tree() {
        let tmp = tempfile::tempdir().unwrap();
        write_information(
            tmp.path(),
            "0000:01:00.0",
            "Model: \t Hopper H100\nIRQ: 130\nGPU UUID: \t GPU-11111111-2222-3333-4444-555555555555\nDevice Minor: \t 0\n",
        );
        write_information(
            tmp.path(),
            "0000:41:00.0",
            "Model: \t Hopper H100\nGPU UUID: \t GPU-66666666-7777-8888-9999-000000000000\nDevice Minor: \t 1\n",
        );

        let discovery = GpuDiscovery::new(DiscoveryConfig {
            proc_root: tmp.path().to_path_buf(),
            inventory_file: None,
        });

        let mut devices = discovery.discover().unwrap();
        devices.sort_by(|a, b| a.minor.cmp(&b.minor));

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].uuid, "GPU-11111111-2222-3333-4444-555555555555");
        assert_eq!(devices[0].model, "Hopper H100");
        assert_eq!(devices[1].minor, 1);
        assert_eq!(devices[1].device_node(), PathBuf::from("/dev/nvidia1"));
    }

    #[test]
    fn test_discover_missing_proc_tree_is_empty() {
        let discovery = GpuDiscovery::new(DiscoveryConfig {
            proc_root: PathBuf::from("/nonexistent/gpus"),
            inventory_file: None,
        });
        assert!(discovery.discover().unwrap().is_empty());
    }

    #[test]
    fn test_discover_skips_entry_without_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        write_information(tmp.path(), "0000:01:00.0", "Model: Broken\nIRQ: 130\n");

        let discovery = GpuDiscovery::new(DiscoveryConfig {
            proc_root: tmp.path().to_path_buf(),
            inventory_file: None,
        });
        assert!(discovery.discover().unwrap().is_empty());
    }

    #[test]
    fn test_inventory_file_override() {
        let tmp = tempfile::tempdir().unwrap();
        let inventory = tmp.path().join("gpus.json");
        fs::write(
            &inventory,
            r#"[{"uuid": "GPU-aaaa", "model": "Test GPU", "minor": 3}]"#,
        )
        .unwrap();

        let discovery = GpuDiscovery::new(DiscoveryConfig {
            proc_root: PathBuf::from("/nonexistent"),
            inventory_file: Some(inventory),
        });

        let devices = discovery.discover().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uuid, "GPU-aaaa");
        assert_eq!(devices[0].minor, 3);
    }

    #[test]
    fn test_inventory_file_missing_fails() {
        let discovery = GpuDiscovery::new(DiscoveryConfig {
            proc_root: PathBuf::from("/nonexistent"),
            inventory_file: Some(PathBuf::from("/nonexistent/gpus.json")),
        });
        assert_matches!(discovery.discover(), Err(Error::DeviceDiscovery(_)));
    }
}
