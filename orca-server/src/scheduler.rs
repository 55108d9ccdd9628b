//! Reply write scheduling: synchronous and cross-thread paths.
//!
//! On the owning thread, a client producing its first reply bytes is queued for an
//! opportunistic flush before the next poll wait instead of installing a writable-event
//! handler immediately; the handler is only installed when the socket cannot swallow the
//! whole backlog. Off-thread writers stage bytes in a separate scratch buffer that a drain
//! step later merges into the normal chain, posting the handler install to the owner.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use mio::Interest;
use orca_common::config::RuntimeConfig;
use orca_common::error::{OrcaError, OrcaResult};
use orca_common::ids::WorkerId;
use orca_protocol::reply::{self, AggregateKind};

use crate::app::{ServerShared, WorkerMessage, on_owner_thread};
use crate::client::{Client, ClientRole, ClientState, ReplyMode, output_buffer_memory_usage};
use crate::lifecycle::{free_client, free_client_async_locked};
use crate::reactor::client_token;
use crate::reply_buffer::DeferredNode;

/// Result of one bounded flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The client remains valid; zero or more bytes were written.
    Alive,
    /// A write error occurred or the close-after-reply drain completed; the caller must
    /// funnel the client into the deferred-free path (with the guard released).
    MustClose,
}

/// Handle to a reserved aggregate-length slot, patched once the element count is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredReply {
    /// Placeholder node in the normal reply chain.
    Chain(DeferredNode),
    /// Offset into the cross-thread scratch buffer.
    Async(usize),
    /// The client does not accept replies; patching is a no-op.
    Discarded,
}

/// Whether replies for this client are built synchronously into its normal buffers.
///
/// True on the owning thread and for detached clients capturing replies; everything else
/// stages through the async scratch.
fn uses_sync_buffers(client: &Client, state: &ClientState) -> bool {
    on_owner_thread(client) || (client.is_detached() && state.force_reply)
}

/// Gate called before queueing any reply bytes.
///
/// Returns `false` when the client must not receive new data (suppressed replies, master
/// links, socketless clients without capture). As a side effect, schedules the client for
/// flushing: first synchronous reply queues it into the owner's pending-write set, first
/// asynchronous reply into the shared pending-async set.
pub fn prepare_client_to_write(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
) -> bool {
    match state.reply_mode {
        ReplyMode::Off | ReplyMode::Skip => return false,
        ReplyMode::On | ReplyMode::SkipNext => {}
    }
    if matches!(state.role, ClientRole::Master) {
        // Masters push the replication stream; they never receive replies.
        return false;
    }
    if client.is_detached() {
        // Replies of detached clients are either captured in-place or dropped; no scheduling.
        return state.force_reply;
    }

    if uses_sync_buffers(client, state) {
        if !Client::has_pending_replies(state) && !state.pending_write {
            debug_assert!(client.state.raw().is_held_by_caller());
            state.pending_write = true;
            if let Some(set) = shared.pending_write.get(usize::from(client.worker())) {
                set.lock().push(Arc::clone(client));
            }
        }
    } else if !state.pending_async_write {
        state.pending_async_write = true;
        shared.pending_async.lock().push(Arc::clone(client));
    }
    true
}

/// Low-level append of protocol bytes to the client's output path.
pub fn add_reply(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState, bytes: &[u8]) {
    if !prepare_client_to_write(shared, client, state) {
        return;
    }
    if uses_sync_buffers(client, state) {
        if state.close_after_reply {
            // The terminal error reply is already queued; anything later is dropped.
            return;
        }
        state.reply.write(bytes);
    } else {
        append_async_scratch(state, bytes);
    }
    maybe_close_on_output_limit(shared, client, state);
}

/// Grows the cross-thread scratch geometrically and appends.
fn append_async_scratch(state: &mut ClientState, bytes: &[u8]) {
    let needed = state.async_scratch.len() + bytes.len();
    if state.async_scratch.capacity() < needed {
        let doubled = state.async_scratch.capacity().saturating_mul(2);
        state
            .async_scratch
            .reserve(doubled.max(needed) - state.async_scratch.len());
    }
    state.async_scratch.extend_from_slice(bytes);
}

pub fn add_reply_status(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState, text: &str) {
    add_reply(shared, client, state, &reply::simple_string(text));
}

/// Error reply; newlines are flattened to spaces so the wire framing stays valid.
pub fn add_reply_error(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState, text: &str) {
    let sanitized = text.replace(['\r', '\n'], " ");
    add_reply(shared, client, state, &reply::error(&sanitized));
}

pub fn add_reply_integer(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState, value: i64) {
    add_reply(shared, client, state, &reply::integer(value));
}

pub fn add_reply_bulk(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState, payload: &[u8]) {
    add_reply(shared, client, state, &reply::bulk(payload));
}

pub fn add_reply_null(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState) {
    let encoded = reply::null(state.version);
    add_reply(shared, client, state, encoded);
}

pub fn add_reply_null_array(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState) {
    let encoded = reply::null_array(state.version);
    add_reply(shared, client, state, encoded);
}

pub fn add_reply_bool(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState, value: bool) {
    let encoded = reply::boolean(state.version, value);
    add_reply(shared, client, state, encoded);
}

pub fn add_reply_double(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState, value: f64) {
    let encoded = reply::double(state.version, value);
    add_reply(shared, client, state, &encoded);
}

pub fn add_reply_verbatim(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
    ext: &str,
    payload: &[u8],
) {
    let encoded = reply::verbatim(state.version, ext, payload);
    add_reply(shared, client, state, &encoded);
}

pub fn add_reply_aggregate_header(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
    kind: AggregateKind,
    count: i64,
) {
    let encoded = reply::aggregate_header(state.version, kind, count);
    add_reply(shared, client, state, &encoded);
}

/// Reserves an aggregate-length slot to be patched after its elements are serialized.
pub fn reserve_deferred_reply(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
) -> DeferredReply {
    if !prepare_client_to_write(shared, client, state) {
        return DeferredReply::Discarded;
    }
    if uses_sync_buffers(client, state) {
        DeferredReply::Chain(state.reply.reserve_deferred())
    } else {
        DeferredReply::Async(state.async_scratch.len())
    }
}

/// Writes the final aggregate header into a reserved slot.
pub fn patch_deferred_reply(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
    handle: DeferredReply,
    kind: AggregateKind,
    count: i64,
) {
    let header = reply::aggregate_header(state.version, kind, count);
    match handle {
        DeferredReply::Discarded => {}
        DeferredReply::Chain(node) => {
            state.reply.patch_deferred(node, &header);
            maybe_close_on_output_limit(shared, client, state);
        }
        DeferredReply::Async(offset) => {
            debug_assert!(offset <= state.async_scratch.len());
            let _ = state
                .async_scratch
                .splice(offset..offset, header.iter().copied());
        }
    }
}

/// Flushes queued reply bytes to the socket, bounded per invocation for fairness.
///
/// Replication peers are exempt from the byte bound so their stream never falls behind on a
/// fast link. Must be called on the owning thread with the client guard held.
pub fn write_to_client(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
) -> WriteOutcome {
    debug_assert!(on_owner_thread(client));
    let unbounded = matches!(state.role, ClientRole::Replica { .. });
    let budget = shared.config.max_writes_per_event_bytes;
    let mut total_written = 0_usize;
    let mut failed = false;

    while Client::has_pending_replies(state) {
        let write_result = {
            let (reply, socket) = (&mut state.reply, state.socket.as_mut());
            let Some(socket) = socket else {
                failed = true;
                break;
            };
            let Some(slice) = reply.pending_slice() else {
                break;
            };
            socket.write(slice)
        };
        match write_result {
            Ok(0) => {
                failed = true;
                break;
            }
            Ok(written) => {
                state.reply.advance(written);
                total_written += written;
                if total_written > budget && !unbounded {
                    break;
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => {
                tracing::debug!(client = client.id(), %error, "error writing to client");
                failed = true;
                break;
            }
        }
    }

    if failed {
        return WriteOutcome::MustClose;
    }
    if total_written > 0 && !matches!(state.role, ClientRole::Master) {
        state.last_interaction = Instant::now();
    }
    if !Client::has_pending_replies(state) {
        if state.interest.is_some_and(|interest| interest.is_writable()) {
            let _ = set_socket_interest(shared, client, state, Some(Interest::READABLE));
        }
        if state.close_after_reply {
            return WriteOutcome::MustClose;
        }
    }
    WriteOutcome::Alive
}

/// Re-registers the client's socket with the owning worker's poller.
///
/// `None` deregisters, e.g. while a client is protected or being torn down.
pub(crate) fn set_socket_interest(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
    interest: Option<Interest>,
) -> OrcaResult<()> {
    let handle = shared.worker(client.worker())?;
    let token = client_token(client.id());
    let Some(socket) = state.socket.as_mut() else {
        return Err(OrcaError::InvalidState(
            "cannot change poll interest of a socketless client",
        ));
    };
    match (state.interest, interest) {
        (_, Some(next)) if state.interest == Some(next) => {}
        (None, Some(next)) => {
            handle
                .registry
                .register(socket, token, next)
                .map_err(|error| OrcaError::Io(format!("register client socket failed: {error}")))?;
        }
        (Some(_), Some(next)) => {
            handle
                .registry
                .reregister(socket, token, next)
                .map_err(|error| {
                    OrcaError::Io(format!("refresh client poll interest failed: {error}"))
                })?;
        }
        (Some(_), None) => {
            handle
                .registry
                .deregister(socket)
                .map_err(|error| OrcaError::Io(format!("deregister client socket failed: {error}")))?;
        }
        (None, None) => {}
    }
    state.interest = interest;
    Ok(())
}

/// Removes file events so a re-entrant call stack cannot observe the client being freed
/// underneath it; destruction requests arriving meanwhile are deferred.
pub fn protect_client(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState) {
    state.protected = true;
    if state.socket.is_some() {
        let _ = set_socket_interest(shared, client, state, None);
    }
}

/// Undoes [`protect_client`], restoring readiness callbacks and flush scheduling.
pub fn unprotect_client(shared: &Arc<ServerShared>, client: &Arc<Client>, state: &mut ClientState) {
    if !state.protected {
        return;
    }
    state.protected = false;
    if state.socket.is_some() {
        let _ = set_socket_interest(shared, client, state, Some(Interest::READABLE));
    }
    if Client::has_pending_replies(state) && !state.pending_write {
        state.pending_write = true;
        if let Some(set) = shared.pending_write.get(usize::from(client.worker())) {
            set.lock().push(Arc::clone(client));
        }
    }
}

/// Attempts a direct flush for every client queued on this worker, installing the writable
/// handler only when bytes remain. Runs once per loop iteration, before the poll wait.
pub fn handle_pending_writes(shared: &Arc<ServerShared>, worker: WorkerId) -> usize {
    let drained = {
        let Some(set) = shared.pending_write.get(usize::from(worker)) else {
            return 0;
        };
        std::mem::take(&mut *set.lock())
    };
    let processed = drained.len();

    for client in drained {
        let mut state = client.state.lock();
        state.pending_write = false;
        if state.protected {
            continue;
        }
        match write_to_client(shared, &client, &mut state) {
            WriteOutcome::MustClose => {
                drop(state);
                // On the owning thread destruction can usually complete synchronously.
                let _ = free_client(shared, &client);
            }
            WriteOutcome::Alive => {
                if Client::has_pending_replies(&state)
                    && set_socket_interest(
                        shared,
                        &client,
                        &mut state,
                        Some(Interest::READABLE | Interest::WRITABLE),
                    )
                    .is_err()
                {
                    free_client_async_locked(shared, &client, &mut state);
                }
            }
        }
    }
    processed
}

/// Merges staged cross-thread bytes into each client's normal reply chain and arranges for
/// the owning worker to install the writable handler.
pub fn process_pending_async_writes(shared: &Arc<ServerShared>) {
    let drained = std::mem::take(&mut *shared.pending_async.lock());
    for client in drained {
        let mut state = client.state.lock();
        debug_assert!(state.pending_async_write);
        state.pending_async_write = false;

        if state.close_asap || state.close_after_reply {
            state.async_scratch = Vec::new();
            continue;
        }

        let staged = std::mem::take(&mut state.async_scratch);
        state.reply.push_block(staged);
        maybe_close_on_output_limit(shared, &client, &mut state);
        if state.close_asap {
            continue;
        }

        if state.async_ops_pending > 0 {
            // An install is already in flight on the owner; it will pick these bytes up.
            continue;
        }
        if on_owner_thread(&client) {
            if !state.pending_write {
                state.pending_write = true;
                if let Some(set) = shared.pending_write.get(usize::from(client.worker())) {
                    set.lock().push(Arc::clone(&client));
                }
            }
        } else {
            state.async_ops_pending += 1;
            let message = WorkerMessage::InstallWriteHandler(Arc::clone(&client));
            if shared.post_to_worker(client.worker(), message).is_err() {
                state.async_ops_pending -= 1;
                tracing::warn!(
                    client = client.id(),
                    "posting write-handler install to owner failed"
                );
            }
        }
    }
}

/// Pure soft/hard limit evaluation; updates the continuous-breach timestamp.
///
/// Returns `true` when the client must be scheduled for closure.
pub fn output_limit_breached(
    config: &RuntimeConfig,
    usage: usize,
    now: Instant,
    soft_limit_since: &mut Option<Instant>,
) -> bool {
    if config.obuf_hard_limit_bytes != 0 && usage >= config.obuf_hard_limit_bytes {
        return true;
    }
    if config.obuf_soft_limit_bytes != 0 && usage >= config.obuf_soft_limit_bytes {
        match *soft_limit_since {
            None => {
                *soft_limit_since = Some(now);
                false
            }
            Some(since) => now.duration_since(since) >= config.obuf_soft_limit_grace,
        }
    } else {
        *soft_limit_since = None;
        false
    }
}

/// Schedules deferred closure when the output buffer exceeds its limits.
///
/// Deferred rather than synchronous: this runs inside the buffering calls themselves, where
/// the client must stay valid for the remainder of the call stack.
pub fn maybe_close_on_output_limit(
    shared: &Arc<ServerShared>,
    client: &Arc<Client>,
    state: &mut ClientState,
) {
    if client.is_detached() || state.close_asap {
        return;
    }
    if state.reply.chain_bytes() == 0 && state.async_scratch.is_empty() {
        return;
    }
    let usage = output_buffer_memory_usage(state);
    let mut since = state.soft_limit_since;
    let breached = output_limit_breached(&shared.config, usage, Instant::now(), &mut since);
    state.soft_limit_since = since;
    if breached {
        tracing::warn!(
            client = client.id(),
            usage,
            "closing client for overcoming of output buffer limits"
        );
        free_client_async_locked(shared, client, state);
    }
}

/// Queues bytes to a client from any thread, choosing the correct path automatically.
///
/// Convenience wrapper for collaborators delivering cross-client side effects.
pub fn add_reply_from_any_thread(shared: &Arc<ServerShared>, client: &Arc<Client>, bytes: &[u8]) {
    let mut state = client.state.lock();
    add_reply(shared, client, &mut state, bytes);
}

#[cfg(test)]
mod tests {
    use super::{
        DeferredReply, add_reply, handle_pending_writes, output_limit_breached,
        patch_deferred_reply, process_pending_async_writes, reserve_deferred_reply,
        write_to_client, WriteOutcome,
    };
    use crate::app::{ServerShared, set_current_worker};
    use crate::commands::ConnectionCommands;
    use crate::testkit;
    use googletest::prelude::*;
    use orca_common::config::RuntimeConfig;
    use orca_protocol::reply::AggregateKind;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn shared() -> Arc<ServerShared> {
        Arc::new(ServerShared::new(
            RuntimeConfig::default(),
            Box::new(ConnectionCommands),
        ))
    }

    #[rstest]
    fn first_sync_reply_queues_the_client_exactly_once() {
        let shared = shared();
        set_current_worker(Some(0));
        let (client, mut peer) = testkit::connected_client(&shared, 0);
        {
            let mut state = client.state.lock();
            add_reply(&shared, &client, &mut state, b"+one\r\n");
            add_reply(&shared, &client, &mut state, b"+two\r\n");
            assert_that!(state.pending_write, eq(true));
        }
        assert_that!(shared.pending_write[0].lock().len(), eq(1_usize));

        let processed = handle_pending_writes(&shared, 0);
        assert_that!(processed, eq(1_usize));
        assert_that!(client.state.lock().pending_write, eq(false));
        let received = testkit::read_exactly(&mut peer, 12);
        assert_that!(&received, eq(&b"+one\r\n+two\r\n".to_vec()));
        set_current_worker(None);
    }

    #[rstest]
    fn cross_thread_replies_merge_before_the_owner_flush_observes_them() {
        let shared = shared();
        set_current_worker(Some(0));
        let (client, mut peer) = testkit::connected_client(&shared, 0);
        {
            let mut state = client.state.lock();
            add_reply(&shared, &client, &mut state, b"+sync\r\n");
        }

        // A different worker thread context stages bytes without touching the normal buffers.
        set_current_worker(Some(1));
        {
            let mut state = client.state.lock();
            add_reply(&shared, &client, &mut state, b"+async\r\n");
            assert_that!(&state.async_scratch, eq(&b"+async\r\n".to_vec()));
            assert_that!(state.pending_async_write, eq(true));
        }
        assert_that!(shared.pending_async.lock().len(), eq(1_usize));

        // The drain step merges staged bytes into the normal chain under the client lock.
        process_pending_async_writes(&shared);
        {
            let state = client.state.lock();
            assert_that!(state.async_scratch.is_empty(), eq(true));
            assert_that!(state.pending_async_write, eq(false));
        }

        // The owning thread's flush sees sync bytes first, then the merged async bytes.
        set_current_worker(Some(0));
        {
            let mut state = client.state.lock();
            assert_that!(
                write_to_client(&shared, &client, &mut state),
                eq(WriteOutcome::Alive)
            );
        }
        let received = testkit::read_exactly(&mut peer, 15);
        assert_that!(&received, eq(&b"+sync\r\n+async\r\n".to_vec()));
        set_current_worker(None);
    }

    #[rstest]
    fn async_deferred_length_is_spliced_into_the_scratch_buffer() {
        let shared = shared();
        set_current_worker(Some(0));
        let (client, _peer) = testkit::connected_client(&shared, 0);

        set_current_worker(Some(1));
        let mut state = client.state.lock();
        let handle = reserve_deferred_reply(&shared, &client, &mut state);
        assert_that!(&handle, eq(&DeferredReply::Async(0)));
        add_reply(&shared, &client, &mut state, b"+one\r\n");
        add_reply(&shared, &client, &mut state, b"+two\r\n");
        patch_deferred_reply(&shared, &client, &mut state, handle, AggregateKind::Array, 2);
        assert_that!(&state.async_scratch, eq(&b"*2\r\n+one\r\n+two\r\n".to_vec()));
        drop(state);
        set_current_worker(None);
    }

    #[rstest]
    fn reply_suppression_discards_bytes_without_scheduling() {
        let shared = shared();
        set_current_worker(Some(0));
        let (client, _peer) = testkit::connected_client(&shared, 0);
        {
            let mut state = client.state.lock();
            state.reply_mode = crate::client::ReplyMode::Off;
            add_reply(&shared, &client, &mut state, b"+dropped\r\n");
            assert_that!(state.reply.has_pending(), eq(false));
            assert_that!(state.pending_write, eq(false));
        }
        assert_that!(shared.pending_write[0].lock().is_empty(), eq(true));
        set_current_worker(None);
    }

    #[rstest]
    fn master_links_never_receive_replies() {
        let shared = shared();
        set_current_worker(Some(0));
        let (client, _peer) = testkit::connected_client(&shared, 0);
        {
            let mut state = client.state.lock();
            state.role = crate::client::ClientRole::Master;
            add_reply(&shared, &client, &mut state, b"+nope\r\n");
            assert_that!(state.reply.has_pending(), eq(false));
        }
        set_current_worker(None);
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            obuf_hard_limit_bytes: 1024 * 1024,
            obuf_soft_limit_bytes: 64 * 1024,
            obuf_soft_limit_grace: Duration::from_millis(100),
            ..RuntimeConfig::default()
        }
    }

    #[rstest]
    fn hard_limit_breach_closes_immediately() {
        let config = config();
        let mut since = None;
        assert_that!(
            output_limit_breached(&config, 1024 * 1024, Instant::now(), &mut since),
            eq(true)
        );
    }

    #[rstest]
    fn soft_limit_requires_sustained_breach() {
        let config = config();
        let mut since = None;
        let start = Instant::now();
        // First observation arms the timer but does not close.
        assert_that!(
            output_limit_breached(&config, 64 * 1024, start, &mut since),
            eq(false)
        );
        // Still inside the grace period.
        assert_that!(
            output_limit_breached(
                &config,
                64 * 1024,
                start + Duration::from_millis(50),
                &mut since
            ),
            eq(false)
        );
        // Dropping below the threshold resets the timer.
        assert_that!(
            output_limit_breached(
                &config,
                1024,
                start + Duration::from_millis(60),
                &mut since
            ),
            eq(false)
        );
        assert_that!(since, eq(None));
        // A fresh breach must run the full grace period again before closing.
        assert_that!(
            output_limit_breached(
                &config,
                64 * 1024,
                start + Duration::from_millis(70),
                &mut since
            ),
            eq(false)
        );
        assert_that!(
            output_limit_breached(
                &config,
                64 * 1024,
                start + Duration::from_millis(171),
                &mut since
            ),
            eq(true)
        );
    }

    #[rstest]
    fn disabled_limits_never_close() {
        let config = RuntimeConfig {
            obuf_hard_limit_bytes: 0,
            obuf_soft_limit_bytes: 0,
            ..RuntimeConfig::default()
        };
        let mut since = None;
        assert_that!(
            output_limit_breached(&config, usize::MAX, Instant::now(), &mut since),
            eq(false)
        );
    }
}
