//! Handle table
//!
//! Maps opaque object identities to the wrapper instances handed out to
//! callers. The table never owns a wrapper: entries are weak, so once every
//! caller drops its `Arc` the wrapper is freed and the next lookup for the
//! same identity builds a fresh one (with a new generation number).

use crate::webrtc::WebRTCError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an engine-side object (session, channel, transceiver, track)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(u64);

impl HandleId {
    /// Allocate a process-unique identity
    pub fn next() -> Self {
        HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry<T> {
    wrapper: Weak<T>,
    generation: u64,
}

struct TableInner<T> {
    entries: HashMap<HandleId, Entry<T>>,
    disposed: bool,
    generation: u64,
}

/// Weak identity -> wrapper map with at-most-one live wrapper per identity
pub struct HandleTable<T> {
    inner: Mutex<TableInner<T>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                disposed: false,
                generation: 0,
            }),
        }
    }

    /// Return the live wrapper for `id`, or build one with `factory`.
    ///
    /// The factory runs with the table locked, which is what makes creation
    /// unique under concurrent lookups. It must not call back into this table.
    pub fn find_or_create<F>(&self, id: HandleId, factory: F) -> Result<Arc<T>, WebRTCError>
    where
        F: FnOnce(HandleId) -> T,
    {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return Err(WebRTCError::NotFound(format!("handle {} (table disposed)", id)));
        }

        if let Some(existing) = inner.entries.get(&id).and_then(|e| e.wrapper.upgrade()) {
            return Ok(existing);
        }

        let wrapper = Arc::new(factory(id));
        inner.generation += 1;
        let generation = inner.generation;
        inner.entries.insert(
            id,
            Entry {
                wrapper: Arc::downgrade(&wrapper),
                generation,
            },
        );
        Ok(wrapper)
    }

    /// Look up a live wrapper without creating one
    pub fn get(&self, id: HandleId) -> Option<Arc<T>> {
        let inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        inner.entries.get(&id).and_then(|e| e.wrapper.upgrade())
    }

    /// Generation of the live wrapper for `id`, if any.
    ///
    /// Changes every time the wrapper is rebuilt after being dropped.
    pub fn generation(&self, id: HandleId) -> Option<u64> {
        let inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        inner
            .entries
            .get(&id)
            .filter(|e| e.wrapper.strong_count() > 0)
            .map(|e| e.generation)
    }

    /// Evict `id`. Returns whether an entry was present; calling twice is fine.
    pub fn remove(&self, id: HandleId) -> bool {
        self.inner.lock().entries.remove(&id).is_some()
    }

    /// Snapshot of every live wrapper, safe to iterate while entries are removed
    pub fn all_values(&self) -> Vec<Arc<T>> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return Vec::new();
        }
        inner.entries.retain(|_, e| e.wrapper.strong_count() > 0);
        inner
            .entries
            .values()
            .filter_map(|e| e.wrapper.upgrade())
            .collect()
    }

    /// Number of identities with a live wrapper
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        if inner.disposed {
            return 0;
        }
        inner
            .entries
            .values()
            .filter(|e| e.wrapper.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry; later lookups report "not found"
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    struct Wrapper {
        id: HandleId,
    }

    #[test]
    fn test_find_or_create_deduplicates() {
        let table = HandleTable::new();
        let id = HandleId::next();
        let a = table.find_or_create(id, |id| Wrapper { id }).unwrap();
        let b = table.find_or_create(id, |_| panic!("factory must not run twice")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id, id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_entries_do_not_keep_wrappers_alive() {
        let table = HandleTable::new();
        let id = HandleId::next();
        let first = table.find_or_create(id, |id| Wrapper { id }).unwrap();
        let first_gen = table.generation(id).unwrap();
        drop(first);

        assert!(table.get(id).is_none());
        assert!(table.generation(id).is_none());

        let second = table.find_or_create(id, |id| Wrapper { id }).unwrap();
        assert_eq!(second.id, id);
        assert!(table.generation(id).unwrap() > first_gen);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = HandleTable::new();
        let id = HandleId::next();
        let _w = table.find_or_create(id, |id| Wrapper { id }).unwrap();
        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_disposed_table_reports_not_found() {
        let table = HandleTable::new();
        let id = HandleId::next();
        let _w = table.find_or_create(id, |id| Wrapper { id }).unwrap();
        table.dispose();

        assert!(table.is_disposed());
        assert!(table.get(id).is_none());
        assert!(table.all_values().is_empty());
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());
        match table.find_or_create(id, |id| Wrapper { id }) {
            Err(WebRTCError::NotFound(_)) => {}
            _ => panic!("Expected NotFound"),
        }
    }

    #[test]
    fn test_all_values_is_a_snapshot() {
        let table = HandleTable::new();
        let held: Vec<_> = (0..4)
            .map(|_| table.find_or_create(HandleId::next(), |id| Wrapper { id }).unwrap())
            .collect();

        let snapshot = table.all_values();
        for w in &snapshot {
            table.remove(w.id);
        }
        assert_eq!(snapshot.len(), held.len());
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_lookups_share_one_wrapper() {
        let table = Arc::new(HandleTable::new());
        let id = HandleId::next();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    table.find_or_create(id, |id| Wrapper { id }).unwrap()
                })
            })
            .collect();

        let wrappers: Vec<Arc<Wrapper>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for w in &wrappers[1..] {
            assert!(Arc::ptr_eq(&wrappers[0], w));
        }
    }
}
