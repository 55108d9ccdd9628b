//! Per-connection client model.
//!
//! A client's mutable state lives behind its own fair mutex: buffers and parse state are only
//! ever touched by whichever execution context holds that lock, whether that is the owning
//! worker's readiness handler or another thread staging a cross-thread write.

use std::net::SocketAddr;
use std::time::Instant;

use mio::Interest;
use mio::net::TcpStream;
use orca_common::ids::{ClientId, WorkerId};
use orca_lock::FairMutex;
use orca_protocol::ProtocolVersion;
use orca_protocol::parser::RequestParser;

use crate::reply_buffer::ReplyBuffer;

/// How a client came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// A real accepted connection with a socket.
    Connection,
    /// A socketless client used to execute commands outside a live connection.
    Detached,
}

/// Connection role, matched exhaustively instead of testing flag bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRole {
    /// Ordinary request/response client.
    Normal,
    /// Downstream replica link; `monitor` marks command-echo observers.
    Replica {
        monitor: bool,
        /// Refreshed by empty inline newlines, the replica keepalive convention.
        last_ack: Instant,
    },
    /// Upstream master link; masters do not receive replies.
    Master,
}

/// Reply suppression negotiated via `CLIENT REPLY`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyMode {
    #[default]
    On,
    Off,
    /// Suppress the reply of the command currently being processed.
    Skip,
    /// Arm `Skip` for the next command once the current one finishes.
    SkipNext,
}

/// Type filter used by `CLIENT LIST` and `CLIENT KILL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTypeFilter {
    Normal,
    Replica,
    Pubsub,
    Master,
}

impl ClientTypeFilter {
    /// Parses the wire spelling; `slave` is accepted as the historical alias of `replica`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "normal" => Some(Self::Normal),
            "replica" | "slave" => Some(Self::Replica),
            "pubsub" => Some(Self::Pubsub),
            "master" => Some(Self::Master),
            _ => None,
        }
    }
}

/// Mutable, lock-guarded half of a client.
#[derive(Debug)]
pub struct ClientState {
    /// Connection socket; `None` for detached clients and after unlink.
    pub socket: Option<TcpStream>,
    /// Cached peer address captured at accept time.
    pub peer_addr: Option<SocketAddr>,
    /// Name assigned via `CLIENT SETNAME`; empty means unnamed.
    pub name: String,
    /// Reply protocol negotiated via `HELLO`.
    pub version: ProtocolVersion,
    pub parser: RequestParser,
    pub reply: ReplyBuffer,
    /// Staging buffer for replies produced off the owning thread; merged into `reply` at a
    /// safe point by the async-write drain.
    pub async_scratch: Vec<u8>,
    pub role: ClientRole,
    pub reply_mode: ReplyMode,
    /// Queued in the owning worker's pending-write set.
    pub pending_write: bool,
    /// Queued in the cross-thread pending-async-write set.
    pub pending_async_write: bool,
    /// Close the connection once every queued reply byte has been flushed.
    pub close_after_reply: bool,
    /// Queued for deferred destruction; terminal.
    pub close_asap: bool,
    /// Synchronous destruction is refused while set.
    pub protected: bool,
    /// Cross-thread operations posted to the owner and not yet executed.
    pub async_ops_pending: u32,
    /// Detached clients accumulate replies despite having no socket when set.
    pub force_reply: bool,
    /// Poll interest currently registered for the socket.
    pub interest: Option<Interest>,
    pub last_interaction: Instant,
    /// Start of a continuous output-buffer soft limit breach.
    pub soft_limit_since: Option<Instant>,
    /// Name of the last dispatched command, for introspection output.
    pub last_command: String,
}

/// One client connection (or detached execution context).
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    worker: WorkerId,
    kind: ClientKind,
    created_at: Instant,
    /// Guards every mutable field; see the module invariant.
    pub state: FairMutex<ClientState>,
}

impl Client {
    /// Builds a client around an accepted socket. Poll registration happens later on the
    /// owning worker thread.
    #[must_use]
    pub fn from_socket(
        id: ClientId,
        worker: WorkerId,
        socket: TcpStream,
        parser: RequestParser,
    ) -> Self {
        let peer_addr = socket.peer_addr().ok();
        Self::new(
            id,
            worker,
            ClientKind::Connection,
            ClientState {
                socket: Some(socket),
                peer_addr,
                name: String::new(),
                version: ProtocolVersion::Resp2,
                parser,
                reply: ReplyBuffer::new(),
                async_scratch: Vec::new(),
                role: ClientRole::Normal,
                reply_mode: ReplyMode::On,
                pending_write: false,
                pending_async_write: false,
                close_after_reply: false,
                close_asap: false,
                protected: false,
                async_ops_pending: 0,
                force_reply: false,
                interest: None,
                last_interaction: Instant::now(),
                soft_limit_since: None,
                last_command: String::new(),
            },
        )
    }

    /// Builds a detached client that executes commands with no connection; replies are
    /// captured in its buffers so the caller can inspect them.
    #[must_use]
    pub fn detached(id: ClientId, worker: WorkerId, parser: RequestParser) -> Self {
        Self::new(
            id,
            worker,
            ClientKind::Detached,
            ClientState {
                socket: None,
                peer_addr: None,
                name: String::new(),
                version: ProtocolVersion::Resp2,
                parser,
                reply: ReplyBuffer::new(),
                async_scratch: Vec::new(),
                role: ClientRole::Normal,
                reply_mode: ReplyMode::On,
                pending_write: false,
                pending_async_write: false,
                close_after_reply: false,
                close_asap: false,
                protected: false,
                async_ops_pending: 0,
                force_reply: true,
                interest: None,
                last_interaction: Instant::now(),
                soft_limit_since: None,
                last_command: String::new(),
            },
        )
    }

    fn new(id: ClientId, worker: WorkerId, kind: ClientKind, state: ClientState) -> Self {
        Self {
            id,
            worker,
            kind,
            created_at: Instant::now(),
            state: FairMutex::new(state),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    #[must_use]
    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.kind == ClientKind::Detached
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Classifies a client for type filters; monitors intentionally fall into the normal
    /// class, matching the introspection conventions clients rely on.
    #[must_use]
    pub fn type_of(state: &ClientState) -> ClientTypeFilter {
        match &state.role {
            ClientRole::Master => ClientTypeFilter::Master,
            ClientRole::Replica { monitor: false, .. } => ClientTypeFilter::Replica,
            ClientRole::Replica { monitor: true, .. } | ClientRole::Normal => {
                ClientTypeFilter::Normal
            }
        }
    }

    /// Formats the peer as `ip:port`, or `?:0` when unknown.
    #[must_use]
    pub fn peer_id(state: &ClientState) -> String {
        state
            .peer_addr
            .map_or_else(|| "?:0".to_owned(), |addr| addr.to_string())
    }

    /// One `key=value` introspection line, shared by `CLIENT LIST` and log output.
    #[must_use]
    pub fn info_line(&self, state: &ClientState) -> String {
        let now = Instant::now();
        let mut flags = String::new();
        match &state.role {
            ClientRole::Replica { monitor: true, .. } => flags.push('O'),
            ClientRole::Replica { monitor: false, .. } => flags.push('S'),
            ClientRole::Master => flags.push('M'),
            ClientRole::Normal => {}
        }
        if state.close_after_reply {
            flags.push('c');
        }
        if state.close_asap {
            flags.push('A');
        }
        if flags.is_empty() {
            flags.push('N');
        }

        let mut events = String::new();
        if let Some(interest) = state.interest {
            if interest.is_readable() {
                events.push('r');
            }
            if interest.is_writable() {
                events.push('w');
            }
        }

        let fd = state
            .socket
            .as_ref()
            .map_or(-1, |socket| {
                use std::os::unix::io::AsRawFd;
                socket.as_raw_fd()
            });

        format!(
            "id={} addr={} fd={} name={} age={} idle={} flags={} db=0 sub=0 psub=0 multi=-1 \
             qbuf={} qbuf-free={} obl={} oll={} omem={} events={} cmd={}",
            self.id,
            Self::peer_id(state),
            fd,
            state.name,
            now.duration_since(self.created_at).as_secs(),
            now.duration_since(state.last_interaction).as_secs(),
            flags,
            state.parser.buffered_bytes(),
            state.parser.spare_capacity(),
            state.reply.inline_used(),
            state.reply.chain_len(),
            output_buffer_memory_usage(state),
            events,
            if state.last_command.is_empty() {
                "NULL"
            } else {
                &state.last_command
            },
        )
    }

    /// Whether reply bytes are queued and the client is still expected to receive them.
    #[must_use]
    pub fn has_pending_replies(state: &ClientState) -> bool {
        state.reply.has_pending() && !state.close_asap
    }
}

/// Post-command reply-mode sequencing: `SkipNext` arms suppression for exactly the next
/// command, after which replies resume. `Off` is sticky until `CLIENT REPLY ON`.
pub fn reply_mode_epilogue(state: &mut ClientState) {
    state.reply_mode = match state.reply_mode {
        ReplyMode::SkipNext => ReplyMode::Skip,
        ReplyMode::Skip => ReplyMode::On,
        other => other,
    };
}

/// Bytes attributable to a client's output path, the basis for buffer-limit enforcement.
#[must_use]
pub fn output_buffer_memory_usage(state: &ClientState) -> usize {
    const NODE_OVERHEAD: usize = 32;
    state.reply.chain_bytes()
        + state.reply.chain_len() * NODE_OVERHEAD
        + state.async_scratch.capacity()
}
