//! Process composition root: shared state, worker handles, and server bootstrap.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use mio::{Registry, Waker};
use orca_common::config::RuntimeConfig;
use orca_common::error::{OrcaError, OrcaResult};
use orca_common::ids::{ClientId, WorkerId};
use orca_lock::FairMutex;

use crate::client::Client;
use crate::commands::{CommandDispatcher, ConnectionCommands};
use crate::reactor::WorkerReactor;
use crate::registry::ClientRegistry;

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Marks the calling thread as an event-loop worker; set once at thread start.
pub fn set_current_worker(worker: Option<WorkerId>) {
    CURRENT_WORKER.with(|current| current.set(worker));
}

/// The worker identity of the calling thread, when it is an event-loop thread.
#[must_use]
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(Cell::get)
}

/// Whether the calling thread owns `client`'s connection.
#[must_use]
pub fn on_owner_thread(client: &Client) -> bool {
    current_worker() == Some(client.worker())
}

/// Typed message posted into a worker's inbox and drained once per loop iteration.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Register a freshly accepted client's socket in the owning worker's poller.
    AdoptClient(Arc<Client>),
    /// Install the writable-event handler after a cross-thread write was merged.
    InstallWriteHandler(Arc<Client>),
    /// Drop the worker-local token mapping of a destroyed client.
    ForgetClient(ClientId),
    /// Leave the event loop.
    Shutdown,
}

/// Per-worker posting endpoints owned by the shared state.
#[derive(Debug)]
pub struct WorkerHandle {
    pub sender: Sender<WorkerMessage>,
    pub waker: Arc<Waker>,
    /// Clone of the worker's poll registry for interest changes and deregistration.
    pub registry: Registry,
}

/// State shared by every worker thread and every client operation.
pub struct ServerShared {
    pub config: RuntimeConfig,
    /// Coarse lock over the client registry; taken before any client lock when both are needed.
    pub registry: FairMutex<ClientRegistry>,
    /// Deferred-free queue, drained per owning worker once per loop iteration. Leaf lock.
    pub(crate) to_close: FairMutex<Vec<Arc<Client>>>,
    /// Clients with staged cross-thread writes awaiting transfer. Leaf lock.
    pub(crate) pending_async: FairMutex<Vec<Arc<Client>>>,
    /// Per-worker pending-write sets for the opportunistic pre-poll flush. Leaf locks.
    pub(crate) pending_write: Vec<FairMutex<Vec<Arc<Client>>>>,
    workers: OnceLock<Vec<WorkerHandle>>,
    next_client_id: AtomicU64,
    /// Pause deadline in milliseconds since `started_at`; 0 means not paused.
    pause_until_ms: AtomicU64,
    started_at: Instant,
    shutdown: AtomicBool,
    pub(crate) dispatcher: Box<dyn CommandDispatcher>,
}

impl std::fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerShared")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServerShared {
    /// Creates shared state for the configured worker count.
    #[must_use]
    pub fn new(config: RuntimeConfig, dispatcher: Box<dyn CommandDispatcher>) -> Self {
        let workers = usize::from(config.worker_threads.get());
        Self {
            registry: FairMutex::new(ClientRegistry::new(workers)),
            to_close: FairMutex::new(Vec::new()),
            pending_async: FairMutex::new(Vec::new()),
            pending_write: (0..workers).map(|_| FairMutex::new(Vec::new())).collect(),
            workers: OnceLock::new(),
            next_client_id: AtomicU64::new(1),
            pause_until_ms: AtomicU64::new(0),
            started_at: Instant::now(),
            shutdown: AtomicBool::new(false),
            dispatcher,
            config,
        }
    }

    /// Allocates the next monotonically increasing client id.
    pub fn allocate_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs worker posting endpoints once during bootstrap.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when called twice or with the wrong handle count.
    pub fn install_workers(&self, handles: Vec<WorkerHandle>) -> OrcaResult<()> {
        if handles.len() != self.pending_write.len() {
            return Err(OrcaError::InvalidState(
                "worker handle count must match configured worker threads",
            ));
        }
        self.workers
            .set(handles)
            .map_err(|_| OrcaError::InvalidState("worker handles installed twice"))
    }

    /// Posting endpoint for one worker.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before bootstrap completes or for an out-of-range worker.
    pub fn worker(&self, worker: WorkerId) -> OrcaResult<&WorkerHandle> {
        self.workers
            .get()
            .and_then(|handles| handles.get(usize::from(worker)))
            .ok_or(OrcaError::InvalidState("worker handle is not available"))
    }

    /// Enqueues a message into a worker's inbox and interrupts its poll wait.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the worker is gone or its inbox is closed.
    pub fn post_to_worker(&self, worker: WorkerId, message: WorkerMessage) -> OrcaResult<()> {
        let handle = self.worker(worker)?;
        handle
            .sender
            .send(message)
            .map_err(|_| OrcaError::InvalidState("worker inbox is closed"))?;
        handle
            .waker
            .wake()
            .map_err(|error| OrcaError::Io(format!("wake worker poll failed: {error}")))
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Suspends normal-client command processing for `duration`.
    ///
    /// A pause in progress is only ever extended: a shorter overlapping request leaves the
    /// existing deadline in place.
    pub fn pause_clients(&self, duration: Duration) {
        let deadline = self
            .elapsed_ms()
            .saturating_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            .max(1);
        let _ = self
            .pause_until_ms
            .fetch_max(deadline, Ordering::AcqRel);
    }

    /// Lifts an active pause immediately.
    pub fn unpause_clients(&self) {
        self.pause_until_ms.store(0, Ordering::Release);
    }

    /// Whether normal clients are currently paused; clears an expired deadline as a side
    /// effect so later checks stay cheap.
    pub fn clients_paused(&self) -> bool {
        let deadline = self.pause_until_ms.load(Ordering::Acquire);
        if deadline == 0 {
            return false;
        }
        if self.elapsed_ms() >= deadline {
            let _ = self.pause_until_ms.compare_exchange(
                deadline,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            return false;
        }
        true
    }

    /// Flags every worker loop to exit after its current iteration.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handles) = self.workers.get() {
            for handle in handles {
                let _ = handle.sender.send(WorkerMessage::Shutdown);
                let _ = handle.waker.wake();
            }
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Boots the server: builds shared state, binds the listener, runs worker threads.
///
/// Blocks until every worker exits (normally only after [`ServerShared::request_shutdown`]).
///
/// # Errors
///
/// Returns configuration and socket errors observed during bootstrap.
pub fn run(config: RuntimeConfig) -> OrcaResult<()> {
    config.validate()?;
    let port = config.port;
    let shared = Arc::new(ServerShared::new(config, Box::new(ConnectionCommands)));
    let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let reactors = WorkerReactor::build_pool(&shared, Some(listen_addr))?;

    tracing::info!(port, workers = reactors.len(), "orca server listening");

    let mut join_handles = Vec::with_capacity(reactors.len());
    for reactor in reactors {
        let builder = std::thread::Builder::new().name(format!("orca-io-{}", reactor.worker()));
        let handle = builder
            .spawn(move || reactor.run())
            .map_err(|error| OrcaError::Io(format!("spawn worker thread failed: {error}")))?;
        join_handles.push(handle);
    }
    for handle in join_handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(OrcaError::InvalidState("worker thread panicked")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ServerShared;
    use crate::commands::ConnectionCommands;
    use googletest::prelude::*;
    use orca_common::config::RuntimeConfig;
    use rstest::rstest;
    use std::time::Duration;

    fn shared() -> ServerShared {
        ServerShared::new(RuntimeConfig::default(), Box::new(ConnectionCommands))
    }

    #[rstest]
    fn client_ids_are_monotonic_from_one() {
        let shared = shared();
        assert_that!(shared.allocate_client_id(), eq(1_u64));
        assert_that!(shared.allocate_client_id(), eq(2_u64));
    }

    #[rstest]
    fn pause_only_extends_forward() {
        let shared = shared();
        assert_that!(shared.clients_paused(), eq(false));
        shared.pause_clients(Duration::from_secs(60));
        assert_that!(shared.clients_paused(), eq(true));
        // A shorter overlapping pause must not cut the deadline.
        shared.pause_clients(Duration::from_millis(1));
        assert_that!(shared.clients_paused(), eq(true));
        shared.unpause_clients();
        assert_that!(shared.clients_paused(), eq(false));
    }

    #[rstest]
    fn expired_pause_clears_itself() {
        let shared = shared();
        shared.pause_clients(Duration::from_millis(20));
        assert_that!(shared.clients_paused(), eq(true));
        std::thread::sleep(Duration::from_millis(40));
        assert_that!(shared.clients_paused(), eq(false));
        assert_that!(shared.clients_paused(), eq(false));
    }
}
