//! The capability table behind callback-by-reference marshaling.
//!
//! Each session owns one table. Registering a closure yields a
//! `FunctionRef` placeholder to embed in an outgoing argument tree;
//! the peer invokes it by sending a message whose method is the
//! numeric id. References live only as long as the session: the table
//! is cleared on disconnect and on close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use kite_protocol::FunctionRef;

/// A local callable the peer may invoke. Invocations are one-way.
pub type Callback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

#[derive(Default)]
pub struct CallbackTable {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, Callback>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable and get the placeholder to send. Ids are
    /// monotonically increasing within the session.
    pub fn register(&self, callback: Callback) -> FunctionRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.lock().insert(id, callback);
        FunctionRef::new(id)
    }

    /// Drop a registration, e.g. after its response arrived or timed
    /// out.
    pub fn purge(&self, id: u64) {
        self.table.lock().remove(&id);
    }

    pub fn get(&self, id: u64) -> Option<Callback> {
        self.table.lock().get(&id).cloned()
    }

    /// Free every reference. Called when the owning session ends.
    pub fn clear(&self) {
        self.table.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ids_are_monotonic() {
        let table = CallbackTable::new();
        let a = table.register(Arc::new(|_| {}));
        let b = table.register(Arc::new(|_| {}));
        assert!(b.id > a.id);
    }

    #[test]
    fn purge_frees_single_reference() {
        let table = CallbackTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let func = table.register(Arc::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        table.get(func.id).expect("registered")(vec![]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        table.purge(func.id);
        assert!(table.get(func.id).is_none());
    }

    #[test]
    fn clear_frees_everything() {
        let table = CallbackTable::new();
        for _ in 0..4 {
            table.register(Arc::new(|_| {}));
        }
        assert_eq!(table.len(), 4);
        table.clear();
        assert!(table.is_empty());
    }
}
