//! Process-wide wait-for graph backing deadlock detection.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use hashbrown::HashMap;

use crate::raw::LockState;

/// Adjacency map from waiting context id to the lock it is blocked on.
///
/// Guarded by a plain std mutex: the graph must never participate in fair-lock waiting itself,
/// otherwise registering a wait could recurse into the detector. Size is bounded by the number
/// of live threads, each of which can block on at most one lock at a time.
pub(crate) struct WaitForGraph {
    waits: Mutex<HashMap<u64, Arc<LockState>>>,
}

static GRAPH: OnceLock<WaitForGraph> = OnceLock::new();

pub(crate) fn wait_for_graph() -> &'static WaitForGraph {
    GRAPH.get_or_init(|| WaitForGraph {
        waits: Mutex::new(HashMap::new()),
    })
}

impl WaitForGraph {
    /// Records that `context` is about to block on `lock`, then walks the chain
    /// `context -> lock -> holder -> ...` looking for a cycle back to `context`.
    ///
    /// # Panics
    ///
    /// Panics when the walk returns to `context`: two or more contexts are mutually waiting and
    /// no ticket will ever be served. The entry is removed first so diagnostics run against a
    /// consistent graph.
    pub(crate) fn register_wait(&self, context: u64, lock: &Arc<LockState>) {
        let mut waits = self
            .waits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        waits.insert(context, Arc::clone(lock));

        let mut check = context;
        // The walk is bounded by the map size: a chain longer than the number of registered
        // waiters must have revisited a context through a stale owner read.
        for _ in 0..=waits.len() {
            let Some(waited) = waits.get(&check) else {
                return;
            };
            let holder = waited.owner();
            if holder == 0 || holder == check {
                return;
            }
            if holder == context {
                waits.remove(&context);
                drop(waits);
                panic!(
                    "deadlock detected: fair-lock wait cycle closing at context {context}"
                );
            }
            check = holder;
        }
    }

    /// Clears the wait edge once `context` has been granted its lock.
    pub(crate) fn clear_wait(&self, context: u64) {
        let mut waits = self
            .waits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        waits.remove(&context);
    }
}
