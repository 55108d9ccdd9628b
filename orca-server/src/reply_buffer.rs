//! Per-client accumulation of outgoing reply bytes.
//!
//! Small replies land in a fixed inline buffer; anything more spills into a FIFO chain of
//! heap blocks. The chain also hosts empty placeholder nodes for aggregate headers whose
//! element count is only known after the elements are serialized; patching such a header
//! prefers splicing into the following block to avoid an extra block on the wire path.

use std::collections::VecDeque;

/// Capacity of the inline reply buffer, used while the block chain is empty.
pub const INLINE_REPLY_BYTES: usize = 16 * 1024;

/// Standard allocation size for chained reply blocks.
pub const REPLY_CHUNK_BYTES: usize = 16 * 1024;

/// Blocks already larger than this are not spliced into when patching a deferred length,
/// keeping the memmove bounded.
const SPLICE_MAX_BLOCK_BYTES: usize = REPLY_CHUNK_BYTES * 4;

/// Opaque handle for a reserved deferred-length node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredNode(u64);

#[derive(Debug)]
enum ChainNode {
    /// A heap chunk with fixed capacity; `data.len()` is the used byte count.
    Block(Vec<u8>),
    /// Empty node reserved for a deferred aggregate header.
    Placeholder(u64),
}

/// Outgoing byte queue for one client.
#[derive(Debug)]
pub struct ReplyBuffer {
    inline: Box<[u8; INLINE_REPLY_BYTES]>,
    inline_used: usize,
    /// Flush cursor within the inline buffer or the head block.
    sent: usize,
    chain: VecDeque<ChainNode>,
    /// Sum of chained block capacities; must return to exactly zero when the chain drains.
    chain_bytes: usize,
    next_serial: u64,
}

impl Default for ReplyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyBuffer {
    /// Creates an empty reply buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inline: Box::new([0; INLINE_REPLY_BYTES]),
            inline_used: 0,
            sent: 0,
            chain: VecDeque::new(),
            chain_bytes: 0,
            next_serial: 0,
        }
    }

    /// Queues reply bytes: inline buffer first, block chain once that overflows.
    pub fn write(&mut self, bytes: &[u8]) {
        if self.chain.is_empty() && self.inline_used + bytes.len() <= INLINE_REPLY_BYTES {
            self.inline[self.inline_used..self.inline_used + bytes.len()].copy_from_slice(bytes);
            self.inline_used += bytes.len();
            return;
        }
        self.append_to_chain(bytes);
    }

    fn append_to_chain(&mut self, mut bytes: &[u8]) {
        // Top up the tail block when it has spare capacity. A placeholder tail is left alone:
        // its header has not been patched in yet.
        if let Some(ChainNode::Block(tail)) = self.chain.back_mut() {
            let spare = tail.capacity() - tail.len();
            let take = spare.min(bytes.len());
            tail.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        if bytes.is_empty() {
            return;
        }
        let capacity = bytes.len().max(REPLY_CHUNK_BYTES);
        let mut block = Vec::with_capacity(capacity);
        block.extend_from_slice(bytes);
        self.chain_bytes += block.capacity();
        self.chain.push_back(ChainNode::Block(block));
    }

    /// Appends an empty placeholder node for an aggregate header patched in later.
    pub fn reserve_deferred(&mut self) -> DeferredNode {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.chain.push_back(ChainNode::Placeholder(serial));
        DeferredNode(serial)
    }

    /// Fills a reserved placeholder with the final aggregate header.
    ///
    /// When the following block has room for the header and is not already large, the header
    /// is spliced into its front and the placeholder removed, saving one block on the flush
    /// path. Otherwise the placeholder itself becomes a minimal block.
    ///
    /// # Panics
    ///
    /// Panics when the handle does not refer to a live placeholder; reserving and patching are
    /// paired within one command execution by contract.
    pub fn patch_deferred(&mut self, node: DeferredNode, header: &[u8]) {
        let index = self
            .chain
            .iter()
            .position(|entry| matches!(entry, ChainNode::Placeholder(serial) if *serial == node.0))
            .expect("deferred reply node must be patched exactly once while still queued");

        if let Some(ChainNode::Block(next)) = self.chain.get_mut(index + 1) {
            if next.capacity() - next.len() >= header.len() && next.len() < SPLICE_MAX_BLOCK_BYTES {
                // Splicing cannot reallocate: the spare capacity was just checked.
                let _ = next.splice(0..0, header.iter().copied());
                let _ = self.chain.remove(index);
                return;
            }
        }

        let mut block = Vec::with_capacity(header.len());
        block.extend_from_slice(header);
        self.chain_bytes += block.capacity();
        self.chain[index] = ChainNode::Block(block);
    }

    /// Returns whether any bytes (or unpatched placeholders) are queued.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.inline_used > 0 || !self.chain.is_empty()
    }

    /// Bytes used in the inline buffer, not yet flushed.
    #[must_use]
    pub fn inline_used(&self) -> usize {
        self.inline_used
    }

    /// Number of queued chain nodes.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// Total capacity of chained blocks, the basis for output-buffer limit accounting.
    #[must_use]
    pub fn chain_bytes(&self) -> usize {
        self.chain_bytes
    }

    /// Returns the next contiguous unsent slice, retiring drained or empty head nodes.
    ///
    /// Empty blocks can legitimately appear at the head (a placeholder whose patch spliced
    /// into its neighbor never does, but a drained block does) and are dropped here.
    pub fn pending_slice(&mut self) -> Option<&[u8]> {
        if self.inline_used > 0 {
            return Some(&self.inline[self.sent..self.inline_used]);
        }
        loop {
            let retire_front = match self.chain.front() {
                None => {
                    assert!(
                        self.chain_bytes == 0,
                        "reply byte accounting must drain to zero with the chain"
                    );
                    return None;
                }
                Some(ChainNode::Placeholder(_)) => true,
                Some(ChainNode::Block(block)) => block.is_empty(),
            };
            if !retire_front {
                break;
            }
            if let Some(ChainNode::Block(block)) = self.chain.pop_front() {
                self.chain_bytes -= block.capacity();
            }
        }
        match self.chain.front() {
            Some(ChainNode::Block(block)) => Some(&block[self.sent..]),
            _ => None,
        }
    }

    /// Advances the flush cursor after `written` bytes went out on the socket.
    pub fn advance(&mut self, written: usize) {
        if self.inline_used > 0 {
            self.sent += written;
            debug_assert!(self.sent <= self.inline_used);
            if self.sent == self.inline_used {
                self.inline_used = 0;
                self.sent = 0;
            }
            return;
        }

        let Some(ChainNode::Block(block)) = self.chain.front() else {
            panic!("advance without a pending block");
        };
        self.sent += written;
        debug_assert!(self.sent <= block.len());
        if self.sent == block.len() {
            self.chain_bytes -= block.capacity();
            let _ = self.chain.pop_front();
            self.sent = 0;
            if self.chain.is_empty() {
                assert!(
                    self.chain_bytes == 0,
                    "reply byte accounting must drain to zero with the chain"
                );
            }
        }
    }

    /// Drops all queued bytes, e.g. when tearing a client down.
    pub fn clear(&mut self) {
        self.inline_used = 0;
        self.sent = 0;
        self.chain.clear();
        self.chain_bytes = 0;
    }

    /// Copies every queued byte in flush order; test and transfer support.
    #[must_use]
    pub fn queued_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.inline[self.sent..self.inline_used]);
        for node in &self.chain {
            if let ChainNode::Block(block) = node {
                bytes.extend_from_slice(block);
            }
        }
        bytes
    }

    /// Appends a pre-assembled block, taking over its allocation; used when merging staged
    /// cross-thread bytes into the normal chain.
    pub fn push_block(&mut self, block: Vec<u8>) {
        if block.is_empty() {
            return;
        }
        self.chain_bytes += block.capacity();
        self.chain.push_back(ChainNode::Block(block));
    }
}
