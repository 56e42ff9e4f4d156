//! Keyed Conflict Resolution
//!
//! Maps and sets resolve changes made on both sides before a sync per key.
//!
//! - The master stamps every change with a fresh version and keeps the keys it
//!   touched pending until the slave acknowledges that version. A `clear`
//!   stamps all removed keys with one version.
//! - While a key is pending, the master ignores unversioned changes of it.
//! - The slave applies every versioned change and acknowledges its version,
//!   dropping any unsent change of its own to the same keys.
//!
//! Keys whose change could not be sent are remembered. On reconnect the
//! current state of each of them is sent again, together with every key still
//! pending on the master, so removals made offline reach the peer too.

use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

struct State<K> {
    next_version: i64,
    pending: IndexMap<K, i64>,
    unsent: IndexSet<K>,
}

pub(crate) struct KeyVersions<K> {
    state: Mutex<State<K>>,
}

impl<K> KeyVersions<K>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(State { next_version: 0, pending: IndexMap::new(), unsent: IndexSet::new() }) }
    }

    /// Version for a local change of `keys`: a fresh one on the master,
    /// `None` on the slave.
    pub(crate) fn stamp<'a>(&self, master: bool, keys: impl IntoIterator<Item = &'a K>) -> Option<i64>
    where
        K: 'a,
    {
        if !master {
            return None;
        }
        let mut state = self.state.lock();
        state.next_version += 1;
        let version = state.next_version;
        for key in keys {
            state.pending.insert(key.clone(), version);
        }
        Some(version)
    }

    pub(crate) fn mark_unsent(&self, keys: impl IntoIterator<Item = K>) {
        self.state.lock().unsent.extend(keys);
    }

    /// Whether a received change of `key` should be applied.
    pub(crate) fn accepts(&self, master: bool, key: &K, version: Option<i64>) -> bool {
        version.is_some() || !master || !self.state.lock().pending.contains_key(key)
    }

    /// A versioned change of `key` arrived; the local unsent change lost.
    pub(crate) fn superseded(&self, key: &K) {
        self.state.lock().unsent.shift_remove(key);
    }

    /// A versioned clear arrived; every local unsent change lost.
    pub(crate) fn all_superseded(&self) {
        self.state.lock().unsent.clear();
    }

    /// The slave acknowledged `version`: keys still stamped with it are no
    /// longer pending. Keys changed again since keep waiting for the newer
    /// version. Returns `false` for a version this side never issued.
    pub(crate) fn acknowledge(&self, version: i64) -> bool {
        let mut state = self.state.lock();
        if version <= 0 || version > state.next_version {
            return false;
        }
        state.pending.retain(|_, pending| *pending != version);
        true
    }

    /// Keys to send again after a reconnect: every unsent key, then every
    /// pending one. Clears the unsent set.
    pub(crate) fn take_resync_keys(&self) -> Vec<K> {
        let mut state = self.state.lock();
        let mut keys: IndexSet<K> = std::mem::take(&mut state.unsent);
        keys.extend(state.pending.keys().cloned());
        keys.into_iter().collect()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
