//! Runtime configuration shared by module bootstrap code.

use std::time::Duration;

use crate::error::{OrcaError, OrcaResult};
use crate::ids::WorkerCount;

/// Bootstrap configuration used by `orca-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Main RESP listener port.
    pub port: u16,
    /// Number of event-loop worker threads, each owning a disjoint connection set.
    pub worker_threads: WorkerCount,
    /// Maximum simultaneously connected clients before new connections are refused.
    pub max_clients: usize,
    /// Upper bound for an inline request line and for multibulk header lines.
    pub proto_inline_max_bytes: usize,
    /// Upper bound for one bulk argument payload.
    pub proto_max_bulk_bytes: usize,
    /// Upper bound for the element count of one multibulk request.
    pub proto_max_multibulk_elements: usize,
    /// Hard cap on a connection's accumulated input buffer.
    pub max_querybuf_bytes: usize,
    /// Per-flush byte budget so one connection cannot starve its siblings.
    pub max_writes_per_event_bytes: usize,
    /// Output buffer hard limit; breaching it schedules an immediate close. 0 disables.
    pub obuf_hard_limit_bytes: usize,
    /// Output buffer soft limit; must be breached for the full grace period. 0 disables.
    pub obuf_soft_limit_bytes: usize,
    /// How long a soft-limit breach must persist before the client is closed.
    pub obuf_soft_limit_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 6379,
            worker_threads: WorkerCount::new(4).expect("literal worker count must be non-zero"),
            max_clients: 10_000,
            proto_inline_max_bytes: 64 * 1024,
            proto_max_bulk_bytes: 512 * 1024 * 1024,
            proto_max_multibulk_elements: 1024 * 1024,
            max_querybuf_bytes: 1024 * 1024 * 1024,
            max_writes_per_event_bytes: 64 * 1024,
            obuf_hard_limit_bytes: 32 * 1024 * 1024,
            obuf_soft_limit_bytes: 8 * 1024 * 1024,
            obuf_soft_limit_grace: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Validates cross-field constraints before the server boots with this config.
    ///
    /// # Errors
    ///
    /// Returns `OrcaError::InvalidConfig` when a limit combination cannot work at runtime.
    pub fn validate(&self) -> OrcaResult<()> {
        if self.max_clients == 0 {
            return Err(OrcaError::InvalidConfig("max_clients must be positive"));
        }
        if self.proto_inline_max_bytes == 0 {
            return Err(OrcaError::InvalidConfig(
                "proto_inline_max_bytes must be positive",
            ));
        }
        if self.proto_max_bulk_bytes == 0 {
            return Err(OrcaError::InvalidConfig(
                "proto_max_bulk_bytes must be positive",
            ));
        }
        if self.max_querybuf_bytes < self.proto_max_bulk_bytes {
            return Err(OrcaError::InvalidConfig(
                "max_querybuf_bytes must hold at least one maximum bulk argument",
            ));
        }
        if self.obuf_hard_limit_bytes != 0
            && self.obuf_soft_limit_bytes > self.obuf_hard_limit_bytes
        {
            return Err(OrcaError::InvalidConfig(
                "obuf_soft_limit_bytes must not exceed obuf_hard_limit_bytes",
            ));
        }
        Ok(())
    }
}
