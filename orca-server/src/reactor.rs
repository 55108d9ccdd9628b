//! Per-worker event loop.
//!
//! One reactor per worker thread, each owning a disjoint subset of connections. Readiness
//! events drive parsing and flushing; a typed inbox plus poll waker carries cross-thread
//! requests; the pre-wait step runs the opportunistic flush, the async-write transfer, and
//! the deferred-free drain.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use orca_common::error::{OrcaError, OrcaResult};
use orca_common::ids::{ClientId, WorkerId};

use crate::app::{ServerShared, WorkerHandle, WorkerMessage, set_current_worker};
use crate::client::{Client, ClientRole, reply_mode_epilogue};
use crate::commands::CommandContext;
use crate::lifecycle::{
    create_client, drain_async_free_queue, free_client, free_client_async,
};
use crate::scheduler::{
    handle_pending_writes, process_pending_async_writes, set_socket_interest, write_to_client,
    WriteOutcome,
};

const WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const CLIENT_TOKEN_BASE: usize = 2;
const READ_CHUNK_BYTES: usize = 16 * 1024;
const MAX_ACCEPTS_PER_CYCLE: usize = 1000;
const PROTOCOL_ERROR_SAMPLE_BYTES: usize = 128;

/// Maps a client id to its stable poll token on the owning worker.
pub(crate) fn client_token(id: ClientId) -> Token {
    Token(usize::try_from(id).unwrap_or(usize::MAX - CLIENT_TOKEN_BASE) + CLIENT_TOKEN_BASE)
}

/// One event-loop worker: poller, inbox, and the connections it owns.
pub struct WorkerReactor {
    worker: WorkerId,
    shared: Arc<ServerShared>,
    poll: Poll,
    events: Events,
    ready: Vec<(Token, bool, bool, bool)>,
    inbox: Receiver<WorkerMessage>,
    listener: Option<TcpListener>,
    clients_by_token: HashMap<Token, Arc<Client>>,
    next_accept_worker: WorkerId,
    pause_observed: bool,
    shutdown: bool,
}

impl WorkerReactor {
    /// Builds one reactor per configured worker and installs their posting handles into the
    /// shared state. Worker 0 owns the listener when an address is given.
    ///
    /// # Errors
    ///
    /// Returns socket and poller errors observed while building the pool.
    pub fn build_pool(
        shared: &Arc<ServerShared>,
        listen_addr: Option<SocketAddr>,
    ) -> OrcaResult<Vec<WorkerReactor>> {
        let worker_count = shared.config.worker_threads.get();
        let mut handles = Vec::with_capacity(usize::from(worker_count));
        let mut reactors = Vec::with_capacity(usize::from(worker_count));

        for worker in 0..worker_count {
            let poll = Poll::new()
                .map_err(|error| OrcaError::Io(format!("create poll failed: {error}")))?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|error| OrcaError::Io(format!("create poll waker failed: {error}")))?;
            let registry = poll
                .registry()
                .try_clone()
                .map_err(|error| OrcaError::Io(format!("clone poll registry failed: {error}")))?;
            let (sender, receiver) = channel();
            handles.push(WorkerHandle {
                sender,
                waker: Arc::new(waker),
                registry,
            });
            reactors.push(WorkerReactor {
                worker,
                shared: Arc::clone(shared),
                poll,
                events: Events::with_capacity(1024),
                ready: Vec::new(),
                inbox: receiver,
                listener: None,
                clients_by_token: HashMap::new(),
                next_accept_worker: 0,
                pause_observed: false,
                shutdown: false,
            });
        }

        if let Some(addr) = listen_addr {
            let mut listener = TcpListener::bind(addr)
                .map_err(|error| OrcaError::Io(format!("bind listener failed: {error}")))?;
            let accepting = reactors
                .first_mut()
                .ok_or(OrcaError::InvalidState("worker pool cannot be empty"))?;
            accepting
                .poll
                .registry()
                .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
                .map_err(|error| {
                    OrcaError::Io(format!("register listener in poll failed: {error}"))
                })?;
            accepting.listener = Some(listener);
        }

        shared.install_workers(handles)?;
        Ok(reactors)
    }

    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Bound address of this worker's listener, when it has one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for non-listening workers.
    pub fn local_addr(&self) -> OrcaResult<SocketAddr> {
        let listener = self
            .listener
            .as_ref()
            .ok_or(OrcaError::InvalidState("this worker has no listener"))?;
        listener
            .local_addr()
            .map_err(|error| OrcaError::Io(format!("query listener address failed: {error}")))
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.clients_by_token.len()
    }

    /// Runs the event loop until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns poller failures; connection-level errors never escape the loop.
    pub fn run(mut self) -> OrcaResult<()> {
        while !self.shutdown && !self.shared.is_shutting_down() {
            let _ = self.run_once(Some(Duration::from_millis(100)))?;
        }
        set_current_worker(None);
        Ok(())
    }

    /// Processes one readiness cycle plus the pre-wait scheduler work.
    ///
    /// # Errors
    ///
    /// Returns `OrcaError::Io` when the poll wait itself fails.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> OrcaResult<usize> {
        set_current_worker(Some(self.worker));
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) => return Err(OrcaError::Io(format!("poll wait failed: {error}"))),
        }

        self.ready.clear();
        for event in &self.events {
            self.ready.push((
                event.token(),
                event.is_readable(),
                event.is_writable(),
                event.is_read_closed() || event.is_write_closed() || event.is_error(),
            ));
        }

        let ready_count = self.ready.len();
        for index in 0..ready_count {
            let (token, readable, writable, closed_or_error) = self.ready[index];
            match token {
                WAKER_TOKEN => {}
                LISTENER_TOKEN if self.listener.is_some() => self.accept_new_connections(),
                _ => self.handle_client_event(token, readable, writable, closed_or_error),
            }
        }

        self.drain_inbox();

        // Pre-wait work: direct flush attempts, cross-thread write transfer, deferred frees.
        let _ = handle_pending_writes(&self.shared, self.worker);
        process_pending_async_writes(&self.shared);
        let _ = drain_async_free_queue(&self.shared, self.worker);
        self.resume_after_pause();

        Ok(ready_count)
    }

    /// When a pause just expired, clients may hold fully-buffered commands that no further
    /// readiness event will ever deliver; re-run their input processing once.
    fn resume_after_pause(&mut self) {
        if self.shared.clients_paused() {
            self.pause_observed = true;
            return;
        }
        if !self.pause_observed {
            return;
        }
        self.pause_observed = false;
        let clients = self.clients_by_token.values().cloned().collect::<Vec<_>>();
        for client in clients {
            self.process_input(&client);
        }
    }

    fn accept_new_connections(&mut self) {
        let worker_count = self.shared.config.worker_threads.get();
        for _ in 0..MAX_ACCEPTS_PER_CYCLE {
            let accept_result = {
                let Some(listener) = self.listener.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accept_result {
                Ok((mut socket, peer)) => {
                    let linked = self.shared.registry.lock().len();
                    if linked >= self.shared.config.max_clients {
                        // Best-effort error straight onto the raw socket; the client was
                        // never linked, so there is nothing to tear down.
                        let _ = socket.write(b"-ERR max number of clients reached\r\n");
                        tracing::warn!(%peer, "rejecting connection: max clients reached");
                        continue;
                    }

                    let target = self.next_accept_worker;
                    self.next_accept_worker = (self.next_accept_worker + 1) % worker_count;
                    tracing::debug!(%peer, worker = target, "accepted connection");
                    let client = create_client(&self.shared, socket, target);
                    if target == self.worker {
                        self.adopt_client(client);
                    } else if self
                        .shared
                        .post_to_worker(target, WorkerMessage::AdoptClient(Arc::clone(&client)))
                        .is_err()
                    {
                        free_client_async(&self.shared, &client);
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    tracing::warn!(%error, "accepting client connection failed");
                    return;
                }
            }
        }
    }

    /// Registers an owned client's socket for readable events and starts tracking it.
    fn adopt_client(&mut self, client: Arc<Client>) {
        let mut state = client.state.lock();
        match set_socket_interest(&self.shared, &client, &mut state, Some(Interest::READABLE)) {
            Ok(()) => {
                drop(state);
                let _ = self
                    .clients_by_token
                    .insert(client_token(client.id()), client);
            }
            Err(error) => {
                tracing::warn!(client = client.id(), %error, "adopting client failed");
                drop(state);
                let _ = free_client(&self.shared, &client);
            }
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                WorkerMessage::AdoptClient(client) => self.adopt_client(client),
                WorkerMessage::InstallWriteHandler(client) => {
                    let mut state = client.state.lock();
                    state.async_ops_pending = state.async_ops_pending.saturating_sub(1);
                    if state.close_asap || state.socket.is_none() {
                        continue;
                    }
                    if Client::has_pending_replies(&state) {
                        let _ = set_socket_interest(
                            &self.shared,
                            &client,
                            &mut state,
                            Some(Interest::READABLE | Interest::WRITABLE),
                        );
                    }
                }
                WorkerMessage::ForgetClient(id) => {
                    let _ = self.clients_by_token.remove(&client_token(id));
                }
                WorkerMessage::Shutdown => self.shutdown = true,
            }
        }
    }

    fn handle_client_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        closed_or_error: bool,
    ) {
        let Some(client) = self.clients_by_token.get(&token).cloned() else {
            return;
        };

        if readable || closed_or_error {
            self.read_query_from_client(&client);
        }
        if writable {
            self.send_reply_to_client(&client);
        }
    }

    /// Writable-event handler: flush, then tear down on error or completed drain.
    fn send_reply_to_client(&mut self, client: &Arc<Client>) {
        let outcome = {
            let mut state = client.state.lock();
            write_to_client(&self.shared, client, &mut state)
        };
        if outcome == WriteOutcome::MustClose {
            let _ = free_client(&self.shared, client);
        }
    }

    /// Readable-event handler: drain the socket into the parser, then process complete
    /// commands. The read size shrinks when the tail of a large bulk argument is expected,
    /// so the payload can land exactly at the buffer boundary and be adopted without a copy.
    fn read_query_from_client(&mut self, client: &Arc<Client>) {
        let mut state = client.state.lock();
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            let mut read_len = READ_CHUNK_BYTES;
            if let Some(remaining) = state.parser.pending_big_bulk_remaining() {
                if remaining > 0 && remaining < read_len {
                    read_len = remaining;
                }
            }
            let Some(socket) = state.socket.as_mut() else {
                return;
            };
            match socket.read(&mut chunk[..read_len]) {
                Ok(0) => {
                    tracing::debug!(client = client.id(), "client closed connection");
                    drop(state);
                    free_client_async(&self.shared, client);
                    return;
                }
                Ok(read) => {
                    state.parser.feed(&chunk[..read]);
                    state.last_interaction = Instant::now();
                    if state.parser.buffered_bytes() > self.shared.config.max_querybuf_bytes {
                        tracing::warn!(
                            client = client.id(),
                            buffered = state.parser.buffered_bytes(),
                            "closing client that reached max query buffer length"
                        );
                        drop(state);
                        free_client_async(&self.shared, client);
                        return;
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => {
                    tracing::debug!(client = client.id(), %error, "reading from client failed");
                    drop(state);
                    free_client_async(&self.shared, client);
                    return;
                }
            }
        }
        drop(state);
        self.process_input(client);
    }

    /// Extracts and executes every complete command buffered for this client.
    ///
    /// Parsing runs under the client's own lock; each execution re-enters under the
    /// registry lock first, so command code observes the same lock order everywhere.
    fn process_input(&self, client: &Arc<Client>) {
        enum Step {
            Stop,
            Empty,
            Execute(Vec<Vec<u8>>),
        }

        loop {
            let step = {
                let mut state = client.state.lock();
                if state.close_after_reply || state.close_asap {
                    Step::Stop
                } else if self.shared.clients_paused()
                    && !matches!(state.role, ClientRole::Replica { .. })
                {
                    Step::Stop
                } else {
                    match state.parser.try_next() {
                        Ok(orca_protocol::ParseStatus::Incomplete) => Step::Stop,
                        Ok(orca_protocol::ParseStatus::Ready(request)) => {
                            if request.args.is_empty() {
                                // An empty line from a replica doubles as a liveness ping.
                                if let ClientRole::Replica { last_ack, .. } = &mut state.role {
                                    *last_ack = Instant::now();
                                }
                                Step::Empty
                            } else {
                                Step::Execute(request.args)
                            }
                        }
                        Err(error) => {
                            self.record_protocol_error(client, &mut state, &error);
                            Step::Stop
                        }
                    }
                }
            };

            match step {
                Step::Stop => return,
                Step::Empty => {}
                Step::Execute(args) => self.dispatch_command(client, args),
            }
        }
    }

    fn dispatch_command(&self, client: &Arc<Client>, args: Vec<Vec<u8>>) {
        let mut registry = self.shared.registry.lock();
        let mut state = client.state.lock();
        if state.close_after_reply || state.close_asap {
            return;
        }
        if let Some(name) = args.first() {
            state.last_command = String::from_utf8_lossy(name).to_ascii_lowercase();
        }
        {
            let mut ctx = CommandContext {
                shared: &self.shared,
                registry: &mut registry,
                client,
                state: &mut state,
            };
            self.shared.dispatcher.dispatch(&mut ctx, args);
        }
        reply_mode_epilogue(&mut state);
    }

    /// Logs a sampled, printable view of the offending bytes, queues the error reply, and
    /// flags the connection to close once that reply is flushed.
    fn record_protocol_error(
        &self,
        client: &Arc<Client>,
        state: &mut crate::client::ClientState,
        error: &OrcaError,
    ) {
        let sample = state
            .parser
            .unconsumed_slice()
            .iter()
            .take(PROTOCOL_ERROR_SAMPLE_BYTES)
            .map(|byte| {
                if byte.is_ascii_graphic() || *byte == b' ' {
                    char::from(*byte)
                } else {
                    '.'
                }
            })
            .collect::<String>();
        tracing::debug!(client = client.id(), %error, sample, "protocol error from client");
        crate::scheduler::add_reply_error(&self.shared, client, state, &error.to_string());
        state.close_after_reply = true;
    }
}
