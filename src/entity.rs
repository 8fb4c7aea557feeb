//! Entity store: canonical server-confirmed data, mutated only through merges.

use std::collections::HashMap;

use serde_json::Value;

/// Key → JSON value map with write versioning.
///
/// Every mutation goes through [`write_with`](Self::write_with) and stamps
/// the key with a store-wide monotonic sequence number. Versions never
/// repeat, even across removal and reinsertion of a key, which is what lets
/// optimistic rollback detect that a newer write has superseded its
/// snapshot. The store itself is plain data; the owning client serializes
/// access behind its lock.
#[derive(Debug, Default)]
pub(crate) struct EntityStore {
    entries: HashMap<String, Slot, ahash::RandomState>,
    write_seq: u64,
}

#[derive(Debug)]
struct Slot {
    value: Value,
    version: u64,
}

impl EntityStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current value for a key, cloned out.
    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|slot| slot.value.clone())
    }

    /// Version stamped on the key's last write, `None` if absent.
    pub(crate) fn version_of(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|slot| slot.version)
    }

    /// Apply a merge to one key and return the new version.
    ///
    /// `f` receives the current value (`None` if the key is absent) and its
    /// result becomes the stored value.
    pub(crate) fn write_with<F>(&mut self, key: &str, f: F) -> u64
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        self.write_seq += 1;
        let version = self.write_seq;
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.value = f(Some(&slot.value));
                slot.version = version;
            }
            None => {
                let value = f(None);
                self.entries.insert(key.to_string(), Slot { value, version });
            }
        }
        version
    }

    /// Remove a key entirely, restoring "absent" as a state.
    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
