//! Client creation, unlinking, and safe destruction.
//!
//! Synchronous destruction only happens on the client's owning thread with no protection or
//! in-flight cross-thread operations; every other request is deferred onto the to-close queue
//! and drained once per loop iteration by the owner, so teardown never races a readiness
//! callback for the same connection.

use std::sync::Arc;

use mio::net::TcpStream;
use orca_common::ids::{ClientId, WorkerId};
use orca_protocol::parser::{ParserLimits, RequestParser};

use crate::app::{ServerShared, WorkerMessage, on_owner_thread};
use crate::client::{Client, ClientRole, ClientState};
use crate::registry::ClientRegistry;
use crate::scheduler::set_socket_interest;

/// Builds and links a client for an accepted socket.
///
/// Poll registration is deferred to the owning worker's adopt step; only the registry link
/// and socket options happen here, on the accepting thread.
pub fn create_client(shared: &Arc<ServerShared>, socket: TcpStream, worker: WorkerId) -> Arc<Client> {
    let _ = socket.set_nodelay(true);
    let id = shared.allocate_client_id();
    let parser = RequestParser::new(ParserLimits::from_config(&shared.config));
    let client = Arc::new(Client::from_socket(id, worker, socket, parser));
    shared.registry.lock().link(Arc::clone(&client));
    client
}

/// Builds a detached client for executing commands outside a live connection.
///
/// Detached clients get an id but are never linked into the registry.
pub fn create_detached_client(shared: &Arc<ServerShared>) -> Arc<Client> {
    let id = shared.allocate_client_id();
    let parser = RequestParser::new(ParserLimits::from_config(&shared.config));
    Arc::new(Client::detached(id, 0, parser))
}

/// Destroys a client now when that is safe, deferring otherwise.
///
/// Returns `true` when the client was destroyed synchronously. Callers must not hold the
/// client's guard or the registry lock.
pub fn free_client(shared: &Arc<ServerShared>, client: &Arc<Client>) -> bool {
    if !client.is_detached() && !on_owner_thread(client) {
        free_client_async(shared, client);
        return false;
    }
    let mut registry = shared.registry.lock();
    free_client_with_registry(shared, &mut registry, client)
}

/// [`free_client`] for callers already holding the registry lock (e.g. `CLIENT KILL`).
pub fn free_client_with_registry(
    shared: &Arc<ServerShared>,
    registry: &mut ClientRegistry,
    client: &Arc<Client>,
) -> bool {
    if !client.is_detached() && !on_owner_thread(client) {
        free_client_async(shared, client);
        return false;
    }
    let mut state = client.state.lock();
    if state.protected || state.async_ops_pending > 0 {
        // Someone still holds a reference into this client's buffers; retry at a safe point.
        free_client_async_locked(shared, client, &mut state);
        return false;
    }

    match &state.role {
        ClientRole::Master => tracing::warn!(client = client.id(), "connection with master lost"),
        ClientRole::Replica { monitor: false, .. } => {
            tracing::warn!(client = client.id(), "connection with replica lost");
        }
        ClientRole::Replica { monitor: true, .. } | ClientRole::Normal => {}
    }

    unlink_client(shared, registry, client, &mut state);

    if state.close_asap {
        let mut to_close = shared.to_close.lock();
        if let Some(position) = to_close.iter().position(|queued| queued.id() == client.id()) {
            let _ = to_close.remove(position);
        }
    }

    state.reply.clear();
    state.async_scratch = Vec::new();
    true
}

/// Removes the client from every place it may be referenced: registry, poller, pending-write
/// and pending-async sets. Socket close happens here.
fn unlink_client(
    shared: &Arc<ServerShared>,
    registry: &mut ClientRegistry,
    client: &Arc<Client>,
    state: &mut ClientState,
) {
    if state.socket.is_some() {
        if state.interest.is_some() {
            let _ = set_socket_interest(shared, client, state, None);
        }
        state.socket = None;
        let _ = registry.unlink(client.id());
        let _ = shared.post_to_worker(client.worker(), WorkerMessage::ForgetClient(client.id()));
    }

    if state.pending_write {
        if let Some(set) = shared.pending_write.get(usize::from(client.worker())) {
            let mut set = set.lock();
            let position = set.iter().position(|queued| queued.id() == client.id());
            debug_assert!(position.is_some(), "pending-write flag implies set membership");
            if let Some(position) = position {
                let _ = set.remove(position);
            }
        }
        state.pending_write = false;
    }

    if state.pending_async_write {
        let mut pending = shared.pending_async.lock();
        let position = pending.iter().position(|queued| queued.id() == client.id());
        debug_assert!(position.is_some(), "pending-async flag implies set membership");
        if let Some(position) = position {
            let _ = pending.remove(position);
        }
        state.pending_async_write = false;
    }
}

/// Idempotently schedules a client for destruction at a safe point.
///
/// Callable from any thread; acquires the client's lock itself.
pub fn free_client_async(shared: &Arc<ServerShared>, client: &Arc<Client>) {
    let mut state = client.state.lock();
    free_client_async_locked(shared, client, &mut state);
}

/// [`free_client_async`] for callers already holding the client's guard.
pub fn free_client_async_locked(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
) {
    if state.close_asap || client.is_detached() {
        return;
    }
    state.close_asap = true;
    shared.to_close.lock().push(Arc::clone(client));
}

/// Destroys every queued client owned by `worker`; run once per scheduler iteration so each
/// thread only frees clients it owns.
pub fn drain_async_free_queue(shared: &Arc<ServerShared>, worker: WorkerId) -> usize {
    let mine = {
        let mut to_close = shared.to_close.lock();
        let mut kept = Vec::with_capacity(to_close.len());
        let mut mine = Vec::new();
        for client in to_close.drain(..) {
            if client.worker() == worker {
                mine.push(client);
            } else {
                kept.push(client);
            }
        }
        *to_close = kept;
        mine
    };

    let freed = mine.len();
    for client in mine {
        {
            let mut state = client.state.lock();
            state.close_asap = false;
        }
        let _ = free_client(shared, &client);
    }
    freed
}

/// Looks up a live client by id; detached clients are never found here.
#[must_use]
pub fn lookup_client(shared: &Arc<ServerShared>, id: ClientId) -> Option<Arc<Client>> {
    shared.registry.lock().lookup(id).cloned()
}
