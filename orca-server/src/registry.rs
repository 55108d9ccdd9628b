//! Process-wide registry of live client connections.

use std::sync::Arc;

use hashbrown::HashMap;
use orca_common::ids::{ClientId, WorkerId};

use crate::client::Client;

/// Id-indexed collection of all linked clients.
///
/// Guarded by the coarse registry lock in [`crate::app::ServerShared`]; callers hold that lock
/// across lookup-then-act sequences. Detached clients are never linked here.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    by_id: HashMap<ClientId, Arc<Client>>,
    per_worker_counts: Vec<usize>,
}

impl ClientRegistry {
    /// Creates a registry tracking counts for `workers` event-loop threads.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            per_worker_counts: vec![0; workers],
        }
    }

    /// Links a client; O(1).
    pub fn link(&mut self, client: Arc<Client>) {
        let worker = usize::from(client.worker());
        if let Some(count) = self.per_worker_counts.get_mut(worker) {
            *count += 1;
        }
        let previous = self.by_id.insert(client.id(), client);
        debug_assert!(previous.is_none(), "client ids are unique per process");
    }

    /// Unlinks a client by id; O(1). Returns the registry's reference when it was linked.
    pub fn unlink(&mut self, id: ClientId) -> Option<Arc<Client>> {
        let client = self.by_id.remove(&id)?;
        let worker = usize::from(client.worker());
        if let Some(count) = self.per_worker_counts.get_mut(worker) {
            *count = count.saturating_sub(1);
        }
        Some(client)
    }

    /// O(1) lookup by identifier.
    #[must_use]
    pub fn lookup(&self, id: ClientId) -> Option<&Arc<Client>> {
        self.by_id.get(&id)
    }

    /// Number of linked clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Clients owned by one worker.
    #[must_use]
    pub fn count_for_worker(&self, worker: WorkerId) -> usize {
        self.per_worker_counts
            .get(usize::from(worker))
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of all clients ordered by id, the stable order used by introspection output.
    #[must_use]
    pub fn snapshot_ordered(&self) -> Vec<Arc<Client>> {
        let mut clients = self.by_id.values().cloned().collect::<Vec<_>>();
        clients.sort_by_key(|client| client.id());
        clients
    }
}
