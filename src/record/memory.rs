//! In-Memory Allocation Record Store
//!
//! An in-process implementation of the allocation store with the same
//! conflict and watch semantics as the Kubernetes-backed client: a
//! monotonically advancing version counter, version-checked writes, and a
//! resumable change stream that replays events newer than the caller's
//! resume version. Serves `--standalone` mode and the test suite.

use crate::crd::{AllocationPhase, NodeAllocationState, NodeAllocationStateSpec, NodeAllocationStateStatus};
use crate::domain::ports::{AllocationStore, RecordEvent, RecordEventStream, WatchOptions};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Capacity of the live event fan-out channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events retained for watch resumption. Resuming from a version older
/// than this window fails the same way a Kubernetes watch does when the
/// server has compacted past the requested version.
const EVENT_HISTORY_LIMIT: usize = 1024;

// =============================================================================
// Memory Allocation Store
// =============================================================================

/// In-process allocation record store
pub struct MemoryAllocationStore {
    node_name: String,
    inner: Mutex<Inner>,
    events: broadcast::Sender<RecordEvent>,
    /// Remaining writes to fail with a conflict (failure injection)
    forced_conflicts: AtomicUsize,
}

struct Inner {
    record: Option<NodeAllocationState>,
    version: u64,
    /// (version, event) pairs for resumable watches
    history: VecDeque<(u64, RecordEvent)>,
    /// Highest version evicted from the history window
    evicted_through: u64,
}

impl Inner {
    /// Record an event in the history window and fan it out to live
    /// watchers. Called with the store lock held so history order, the
    /// version counter, and live delivery stay consistent.
    fn publish(&mut self, events: &broadcast::Sender<RecordEvent>, version: u64, event: RecordEvent) {
        self.history.push_back((version, event.clone()));
        while self.history.len() > EVENT_HISTORY_LIMIT {
            if let Some((evicted, _)) = self.history.pop_front() {
                self.evicted_through = evicted;
            }
        }
        let _ = events.send(event);
    }
}

impl MemoryAllocationStore {
    /// Create an empty store for one node
    pub fn new(node_name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            node_name: node_name.into(),
            inner: Mutex::new(Inner {
                record: None,
                version: 0,
                history: VecDeque::new(),
                evicted_through: 0,
            }),
            events,
            forced_conflicts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` version-checked writes with a conflict, regardless
    /// of the version presented. Lets callers exercise the driver's
    /// conflict-retry protocol without a second writer.
    pub fn fail_next_updates(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Mutate the spec as the control plane would: outside the node driver's
    /// optimistic-concurrency session, advancing the version and notifying
    /// watchers. Used by standalone mode and tests to author
    /// `allocated_claims`.
    pub fn mutate_spec(&self, f: impl FnOnce(&mut NodeAllocationStateSpec)) -> Result<()> {
        let mut inner = self.inner.lock();
        let version = inner.version + 1;
        let record = inner.record.as_mut().ok_or_else(|| Error::RecordNotFound {
            node: self.node_name.clone(),
        })?;

        f(&mut record.spec);
        record.metadata.resource_version = Some(version.to_string());
        let event = RecordEvent::Modified(Box::new(record.clone()));
        inner.version = version;
        inner.publish(&self.events, version, event);
        Ok(())
    }

    fn take_forced_conflict(&self) -> Option<Error> {
        let mut remaining = self.forced_conflicts.load(Ordering::SeqCst);
        loop {
            if remaining == 0 {
                return None;
            }
            match self.forced_conflicts.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(Error::Conflict {
                        version: remaining.to_string(),
                    })
                }
                Err(actual) => remaining = actual,
            }
        }
    }

    fn write(
        &self,
        current: &NodeAllocationState,
        apply: impl FnOnce(&mut NodeAllocationState),
    ) -> Result<NodeAllocationState> {
        if let Some(conflict) = self.take_forced_conflict() {
            return Err(conflict);
        }

        let mut inner = self.inner.lock();
        let version = inner.version + 1;
        let node_name = self.node_name.clone();
        let record = inner
            .record
            .as_mut()
            .ok_or(Error::RecordNotFound { node: node_name })?;

        if current.resource_version() != record.resource_version() {
            return Err(Error::Conflict {
                version: current.resource_version().to_string(),
            });
        }

        apply(record);
        record.metadata.resource_version = Some(version.to_string());
        let stored = record.clone();
        inner.version = version;
        inner.publish(
            &self.events,
            version,
            RecordEvent::Modified(Box::new(stored.clone())),
        );
        Ok(stored)
    }
}

#[async_trait]
impl AllocationStore for MemoryAllocationStore {
    async fn get_or_create(&self) -> Result<NodeAllocationState> {
        let mut inner = self.inner.lock();
        if let Some(record) = &inner.record {
            return Ok(record.clone());
        }

        let mut record = NodeAllocationState::new_for_node(&self.node_name);
        let version = inner.version + 1;
        record.metadata.resource_version = Some(version.to_string());
        inner.record = Some(record.clone());
        inner.version = version;
        inner.publish(
            &self.events,
            version,
            RecordEvent::Added(Box::new(record.clone())),
        );
        Ok(record)
    }

    async fn get(&self) -> Result<NodeAllocationState> {
        self.inner
            .lock()
            .record
            .clone()
            .ok_or_else(|| Error::RecordNotFound {
                node: self.node_name.clone(),
            })
    }

    async fn update(
        &self,
        current: &NodeAllocationState,
        spec: NodeAllocationStateSpec,
    ) -> Result<NodeAllocationState> {
        self.write(current, move |record| {
            record.spec = spec;
        })
    }

    async fn update_status(
        &self,
        current: &NodeAllocationState,
        phase: AllocationPhase,
    ) -> Result<NodeAllocationState> {
        self.write(current, move |record| {
            record.status = Some(NodeAllocationStateStatus {
                phase,
                last_transition_time: Some(Utc::now()),
            });
        })
    }

    async fn list(&self) -> Result<(Vec<NodeAllocationState>, String)> {
        let inner = self.inner.lock();
        let items = inner.record.clone().into_iter().collect();
        Ok((items, inner.version.to_string()))
    }

    async fn watch(&self, options: WatchOptions) -> Result<RecordEventStream> {
        // Snapshot missed events and subscribe under one lock acquisition:
        // writers publish under the same lock, so nothing falls between the
        // replay and the live subscription.
        let (replay, receiver) = {
            let inner = self.inner.lock();

            // An empty resume token means "from the current state", the
            // way the record client treats a watch opened without a list.
            let resume: u64 = options
                .resume_from
                .parse()
                .unwrap_or(inner.version);

            if resume < inner.evicted_through {
                return Err(Error::ExpiredWatchVersion {
                    version: options.resume_from,
                });
            }

            let replay: Vec<RecordEvent> = inner
                .history
                .iter()
                .filter(|(version, _)| *version > resume)
                .map(|(_, event)| event.clone())
                .collect();

            (replay, self.events.subscribe())
        };

        let deadline = options.timeout.map(|t| Instant::now() + t);

        let live = futures::stream::unfold(receiver, move |mut rx| async move {
            loop {
                let received = match deadline {
                    Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                        // Watch timeout: the stream ends without error and
                        // the caller resyncs, like a server-closed watch.
                        Err(_) => return None,
                        Ok(result) => result,
                    },
                    None => rx.recv().await,
                };

                match received {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Some((
                            Err(Error::MalformedWatchEvent(format!(
                                "watch fell {skipped} events behind"
                            ))),
                            rx,
                        ))
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(futures::stream::iter(replay.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PreparedClaim;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemoryAllocationStore::new("worker-1");

        let first = store.get_or_create().await.unwrap();
        let second = store.get_or_create().await.unwrap();

        assert_eq!(first.resource_version(), second.resource_version());
        assert_eq!(second.node_name(), "worker-1");
    }

    #[tokio::test]
    async fn test_get_without_record_fails() {
        let store = MemoryAllocationStore::new("worker-1");
        let result = store.get().await;
        assert_matches!(result, Err(Error::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_advances_version() {
        let store = MemoryAllocationStore::new("worker-1");
        let record = store.get_or_create().await.unwrap();

        let mut spec = record.spec.clone();
        spec.prepared_claims
            .insert("claim-a".into(), PreparedClaim::default());

        let updated = store.update(&record, spec).await.unwrap();
        assert_ne!(updated.resource_version(), record.resource_version());
        assert!(updated.spec.prepared_claims.contains_key("claim-a"));
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryAllocationStore::new("worker-1");
        let stale = store.get_or_create().await.unwrap();

        // Another writer advances the record
        store.mutate_spec(|_| {}).unwrap();

        let result = store.update(&stale, stale.spec.clone()).await;
        assert_matches!(result, Err(ref e) if e.is_conflict());

        // A fresh read succeeds
        let fresh = store.get().await.unwrap();
        store.update(&fresh, fresh.spec.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_conflicts_then_success() {
        let store = MemoryAllocationStore::new("worker-1");
        let record = store.get_or_create().await.unwrap();

        store.fail_next_updates(2);
        assert_matches!(
            store.update(&record, record.spec.clone()).await,
            Err(ref e) if e.is_conflict()
        );
        assert_matches!(
            store.update(&record, record.spec.clone()).await,
            Err(ref e) if e.is_conflict()
        );
        store.update(&record, record.spec.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_replays_events_after_resume_version() {
        let store = MemoryAllocationStore::new("worker-1");
        store.get_or_create().await.unwrap();

        let (_, resume) = store.list().await.unwrap();

        // This change lands before the watch opens; the resume token must
        // still surface it
        store
            .mutate_spec(|spec| {
                spec.prepared_claims
                    .insert("claim-a".into(), PreparedClaim::default());
            })
            .unwrap();

        let mut stream = store
            .watch(WatchOptions {
                resume_from: resume,
                timeout: None,
            })
            .await
            .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        let nas = assert_matches!(event, RecordEvent::Modified(nas) => nas);
        assert!(nas.spec.prepared_claims.contains_key("claim-a"));
    }

    #[tokio::test]
    async fn test_watch_does_not_replay_seen_events() {
        let store = MemoryAllocationStore::new("worker-1");
        store.get_or_create().await.unwrap();

        // Modification happens, then the caller lists (observing it)
        store.mutate_spec(|_| {}).unwrap();
        let (_, resume) = store.list().await.unwrap();

        let mut stream = store
            .watch(WatchOptions {
                resume_from: resume,
                timeout: None,
            })
            .await
            .unwrap();

        store
            .mutate_spec(|spec| {
                spec.prepared_claims
                    .insert("claim-b".into(), PreparedClaim::default());
            })
            .unwrap();

        // Only the post-list modification is delivered
        let event = stream.next().await.unwrap().unwrap();
        let nas = assert_matches!(event, RecordEvent::Modified(nas) => nas);
        assert!(nas.spec.prepared_claims.contains_key("claim-b"));
    }

    #[tokio::test]
    async fn test_watch_timeout_ends_stream() {
        let store = MemoryAllocationStore::new("worker-1");
        store.get_or_create().await.unwrap();
        let (_, resume) = store.list().await.unwrap();

        let mut stream = store
            .watch(WatchOptions {
                resume_from: resume,
                timeout: Some(std::time::Duration::from_millis(20)),
            })
            .await
            .unwrap();

        assert!(stream.next().await.is_none());
    }
}
