//! Shared helpers for unit tests: real loopback socket pairs and state shortcuts.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use orca_common::ids::WorkerId;

use crate::app::ServerShared;
use crate::client::{Client, reply_mode_epilogue};
use crate::lifecycle::create_client;

/// Creates a linked client around one half of a loopback connection and returns the peer
/// socket so tests can observe flushed bytes.
pub fn connected_client(
    shared: &Arc<ServerShared>,
    worker: WorkerId,
) -> (Arc<Client>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("loopback listener must bind");
    let addr = listener
        .local_addr()
        .expect("loopback listener must expose its address");
    let peer = TcpStream::connect(addr).expect("loopback connect must succeed");
    let (accepted, _) = listener.accept().expect("loopback accept must succeed");
    accepted
        .set_nonblocking(true)
        .expect("accepted socket must be switchable to nonblocking");
    peer.set_nonblocking(true)
        .expect("peer socket must be switchable to nonblocking");

    let socket = mio::net::TcpStream::from_std(accepted);
    let client = create_client(shared, socket, worker);
    (client, peer)
}

/// Applies the post-command reply-mode transition the ingress loop performs.
pub fn advance_reply_mode(client: &Arc<Client>) {
    let mut state = client.state.lock();
    reply_mode_epilogue(&mut state);
}

/// Reads from a nonblocking peer until `expected` bytes arrived or a deadline passes.
pub fn read_exactly(peer: &mut TcpStream, expected: usize) -> Vec<u8> {
    use std::io::Read;
    use std::time::{Duration, Instant};

    let deadline = Instant::now() + Duration::from_millis(600);
    let mut received = Vec::new();
    while received.len() < expected && Instant::now() < deadline {
        let mut chunk = [0_u8; 1024];
        match peer.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => received.extend_from_slice(&chunk[..read]),
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(error) => panic!("read from peer socket failed: {error}"),
        }
    }
    received
}
