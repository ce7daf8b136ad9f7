//! Stale-State Cleanup Fan-Out
//!
//! One cleanup pass runs three independent categories concurrently:
//! unpreparing orphaned claims, removing orphaned CDI spec files, and
//! removing per-claim helper-process artifacts. Each category reports
//! errors through its own channel with its own counting consumer, so a slow
//! or failing category never stalls the others; the pass joins every unit
//! before aggregating a single error count.

use crate::crd::NodeAllocationState;
use crate::driver::driver::Driver;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

/// Run one cleanup pass against a record snapshot.
///
/// The pass is a barrier: it returns only after every spawned unit across
/// every category has finished. A nonzero aggregate error count fails the
/// pass without having blocked any other unit.
pub(crate) async fn cleanup_pass(
    driver: &Arc<Driver>,
    record: &NodeAllocationState,
) -> Result<()> {
    driver.metrics().cleanup_passes_total.inc();

    let mut units = JoinSet::new();

    let claim_errors = spawn_claim_cleanup(driver, record, &mut units);
    let cdi_errors = spawn_cdi_artifact_cleanup(driver, record, &mut units);
    let helper_errors = spawn_helper_artifact_cleanup(driver, record, &mut units);

    // Barrier: wait for all units in all categories
    while units.join_next().await.is_some() {}

    let total = claim_errors.await.unwrap_or(0)
        + cdi_errors.await.unwrap_or(0)
        + helper_errors.await.unwrap_or(0);

    if total != 0 {
        driver.metrics().cleanup_errors_total.inc_by(total as u64);
        return Err(Error::CleanupErrors { count: total });
    }

    Ok(())
}

/// Unprepare every claim present in the prepared set but absent from the
/// allocated set, one concurrent unit per claim
fn spawn_claim_cleanup(
    driver: &Arc<Driver>,
    record: &NodeAllocationState,
    units: &mut JoinSet<()>,
) -> JoinHandle<usize> {
    let (tx, rx) = mpsc::channel::<Error>(1);

    for claim_uid in record.spec.orphaned_claims() {
        let driver = Arc::clone(driver);
        let tx = tx.clone();
        units.spawn(async move {
            info!("Attempting to unprepare resources for claim {}", claim_uid);
            match driver.unprepare_resource(&claim_uid).await {
                Ok(()) => {
                    info!("Successfully unprepared resources for claim {}", claim_uid);
                }
                Err(e) => {
                    let _ = tx.send(e).await;
                }
            }
        });
    }

    drop(tx);
    consume_errors("claim allocations", rx)
}

/// Remove CDI spec files for claims no longer in the allocated set.
///
/// TODO: walk the CDI root and delete spec files whose claim UID is absent
/// from `allocated_claims` (today specs are removed by unprepare itself, so
/// this only matters for files left behind by a crashed process). The
/// category already participates in the fan-out and aggregation contract.
fn spawn_cdi_artifact_cleanup(
    _driver: &Arc<Driver>,
    _record: &NodeAllocationState,
    _units: &mut JoinSet<()>,
) -> JoinHandle<usize> {
    let (tx, rx) = mpsc::channel::<Error>(1);
    drop(tx);
    consume_errors("CDI spec files", rx)
}

/// Remove per-claim helper-process state for claims no longer in the
/// allocated set.
///
/// TODO: tear down per-claim sharing-daemon directories once the helper
/// process lands. The category already participates in the fan-out and
/// aggregation contract.
fn spawn_helper_artifact_cleanup(
    _driver: &Arc<Driver>,
    _record: &NodeAllocationState,
    _units: &mut JoinSet<()>,
) -> JoinHandle<usize> {
    let (tx, rx) = mpsc::channel::<Error>(1);
    drop(tx);
    consume_errors("helper process artifacts", rx)
}

/// Consume one category's error channel, logging each error and returning
/// the count once every sender is gone
fn consume_errors(category: &'static str, mut rx: mpsc::Receiver<Error>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut count = 0;
        while let Some(e) = rx.recv().await {
            error!("Error cleaning up {}: {}", category, e);
            count += 1;
        }
        count
    })
}
