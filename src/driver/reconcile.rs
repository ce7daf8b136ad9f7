//! Stale-State Reconciliation Loop
//!
//! Watches the allocation record and triggers cleanup whenever claims
//! disappear from the allocated set while still marked prepared. The loop
//! alternates between two states: a resync (full list + one cleanup pass,
//! capturing the version to resume from) and a watch that runs a cleanup
//! pass for every modification event. Whenever the watch stream ends the
//! loop falls back to a resync. It never terminates on error, only when
//! cancelled.

use crate::domain::ports::{RecordEvent, WatchOptions};
use crate::driver::cleanup;
use crate::driver::driver::Driver;
use crate::error::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after a failed cycle, and watch timeout while the backend is
/// misbehaving, so the loop neither hot-loops nor blocks forever on a
/// broken stream
pub(crate) const CLEANUP_ERROR_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Reconciler Handle
// =============================================================================

/// Handle to the background reconciliation loop
pub struct ReconcilerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Request the loop to exit without waiting for it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the reconciliation loop for a driver
pub(crate) fn spawn(driver: Arc<Driver>) -> ReconcilerHandle {
    let token = CancellationToken::new();
    let task = tokio::spawn(run(driver, token.clone()));
    ReconcilerHandle { token, task }
}

// =============================================================================
// Supervisory Loop
// =============================================================================

/// Run reconciliation until cancelled
pub(crate) async fn run(driver: Arc<Driver>, token: CancellationToken) {
    info!("Starting stale-state reconciliation loop");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Reconciliation loop shutdown requested");
                return;
            }
            result = cycle(&driver) => {
                if let Err(e) = result {
                    error!("Error cleaning up stale claim state: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => {
                            info!("Reconciliation loop shutdown requested");
                            return;
                        }
                        _ = sleep(CLEANUP_ERROR_TIMEOUT) => {}
                    }
                }
            }
        }
    }
}

/// One resync-then-watch cycle. Returns when the watch stream ends; an Ok
/// return means the loop can reopen immediately, an Err means it should
/// pause first.
async fn cycle(driver: &Arc<Driver>) -> Result<()> {
    let (resume_from, resync_failed) = match resync(driver).await {
        Ok(version) => (version, false),
        Err(e) => {
            error!("Error cleaning up stale claim state: {}", e);
            // Watch from the current state; the short timeout below bounds
            // how long a broken backend can hold the stream open.
            (String::new(), true)
        }
    };

    watch_stale_state(driver, resume_from, resync_failed).await
}

/// List the record fresh, run one cleanup pass, and return the version
/// token a watch can resume from
async fn resync(driver: &Arc<Driver>) -> Result<String> {
    let (items, resource_version) = driver.store().list().await?;

    if items.len() != 1 {
        return Err(Error::UnexpectedRecordCount { count: items.len() });
    }

    cleanup::cleanup_pass(driver, &items[0]).await?;
    Ok(resource_version)
}

/// Consume the watch stream, running one cleanup pass per modification.
/// Creation and deletion events on the singleton record are not cleanup
/// triggers.
async fn watch_stale_state(
    driver: &Arc<Driver>,
    resume_from: String,
    previous_error: bool,
) -> Result<()> {
    let options = WatchOptions {
        resume_from,
        timeout: previous_error.then_some(CLEANUP_ERROR_TIMEOUT),
    };

    let mut events = driver.store().watch(options).await?;

    while let Some(event) = events.next().await {
        match event? {
            RecordEvent::Modified(record) => {
                debug!(
                    "Allocation record modified at version {}, running cleanup pass",
                    record.resource_version()
                );
                cleanup::cleanup_pass(driver, &record).await?;
            }
            RecordEvent::Added(_) | RecordEvent::Deleted(_) => continue,
        }
    }

    debug!("Watch stream ended, resyncing");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AllocatedClaim, AllocatedGpu};
    use crate::domain::ports::AllocationStore;
    use crate::driver::driver::{Driver, DriverConfig};
    use crate::driver::testutil::MockDevices;
    use crate::record::MemoryAllocationStore;
    use std::time::Duration;

    fn allocation(uuids: &[&str]) -> AllocatedClaim {
        AllocatedClaim {
            gpus: uuids
                .iter()
                .map(|u| AllocatedGpu {
                    uuid: (*u).to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_loop_cleans_orphans_from_watch_events() {
        let store = Arc::new(MemoryAllocationStore::new("worker-1"));
        let devices = Arc::new(MockDevices::new());

        store.get_or_create().await.unwrap();
        store
            .mutate_spec(|spec| {
                spec.allocated_claims
                    .insert("claim-a".into(), allocation(&["GPU-0"]));
            })
            .unwrap();

        let (driver, handle) = Driver::start(
            store.clone(),
            devices.clone(),
            DriverConfig::default(),
        )
        .await
        .unwrap();

        driver.prepare_resource("claim-a").await.unwrap();

        // The control plane deallocates the claim; only the watch tells us
        store
            .mutate_spec(|spec| {
                spec.allocated_claims.remove("claim-a");
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = store.get().await.unwrap();
                if record.spec.prepared_claims.is_empty() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("orphan was not cleaned up");

        assert!(devices.reserved_claims().is_empty());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancellation() {
        let store = Arc::new(MemoryAllocationStore::new("worker-1"));
        let devices = Arc::new(MockDevices::new());

        let (_driver, handle) =
            Driver::start(store, devices, DriverConfig::default())
                .await
                .unwrap();

        // Must return promptly even though the loop is blocked in a watch
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("reconciler did not stop");
    }

    #[tokio::test]
    async fn test_resync_captures_resume_version() {
        let store = Arc::new(MemoryAllocationStore::new("worker-1"));
        let devices = Arc::new(MockDevices::new());

        let driver = Driver::initialize(store.clone(), devices, DriverConfig::default())
            .await
            .unwrap();

        // A healthy store lists exactly one record and hands back a token
        // the watch can resume from
        let version = resync(&driver).await.unwrap();
        assert!(!version.is_empty());
    }
}
