//! Optimistic snapshots: speculative writes with exact, version-checked rollback.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::descriptor::ProduceFn;
use crate::entity::EntityStore;

/// Captured pre-speculative state for one optimistic update.
///
/// For every key in the descriptor's optimistic table the snapshot records
/// the value before the speculative write and the version the write stamped.
/// Rollback restores a key only while its version still matches; a newer
/// write from another completed query takes priority over the rollback and
/// the key is left untouched.
#[derive(Debug)]
pub(crate) struct Snapshot {
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug)]
struct SnapshotEntry {
    key: String,
    prior: Option<Value>,
    applied_version: u64,
}

impl Snapshot {
    /// Capture prior values and apply the speculative producers.
    pub(crate) fn capture_and_apply(
        store: &mut EntityStore,
        producers: &BTreeMap<String, Arc<ProduceFn>>,
    ) -> Self {
        let mut entries = Vec::with_capacity(producers.len());
        for (key, produce) in producers {
            let prior = store.get(key);
            let applied_version = store.write_with(key, |current| produce(current));
            trace!(key, applied_version, "applied optimistic write");
            entries.push(SnapshotEntry {
                key: key.clone(),
                prior,
                applied_version,
            });
        }
        Self { entries }
    }

    /// Make the speculative values permanent by discarding the snapshot.
    pub(crate) fn commit(self) {
        trace!(keys = self.entries.len(), "committed optimistic snapshot");
    }

    /// Restore every captured key that still holds the speculative write.
    ///
    /// A key whose version has advanced past the snapshot keeps its newer
    /// value; a key whose prior state was "absent" is removed.
    pub(crate) fn rollback(self, store: &mut EntityStore) {
        for entry in self.entries {
            if store.version_of(&entry.key) != Some(entry.applied_version) {
                trace!(key = %entry.key, "skipping rollback, newer write present");
                continue;
            }
            match entry.prior {
                Some(value) => {
                    store.write_with(&entry.key, move |_| value);
                    trace!(key = %entry.key, "rolled back to prior value");
                }
                None => {
                    store.remove(&entry.key);
                    trace!(key = %entry.key, "rolled back to absent");
                }
            }
        }
    }
}
