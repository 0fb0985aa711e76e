//! TCP framing glue: accept loop, outbound connect, and the per-connection
//! read/write task pair.
//!
//! Grounded in the teacher's `s2s.rs::handle_s2s_connection`: one task owns
//! the write half and drains an `mpsc::Receiver<Message>`, another owns the
//! read half and feeds decoded frames to the dispatcher, and the pair is
//! joined with `tokio::select!` so either side ending tears down the other.

use std::sync::Arc;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::node::NodeState;
use crate::protocol::{self, Address, Message};

/// Outbound queue depth for a single peer connection. Bounded so a stalled
/// peer applies backpressure rather than growing memory without limit.
const OUTBOUND_QUEUE: usize = 256;

/// Bind the P2P listener and accept connections forever, spawning a handler
/// per connection. Runs until the process is torn down.
pub async fn run_accept_loop(node: Arc<NodeState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::debug!(peer = %peer_addr, "accepted P2P connection");
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    handle_connection(node, stream, None, None).await;
                });
            }
            Err(e) => {
                tracing::warn!("P2P accept failed: {e}");
            }
        }
    }
}

/// Connect out to `addr`, send `initial` (a `JoinParent` or `JoinOther`
/// handshake) once registered, and run the connection handler.
pub async fn connect_and_handle(
    node: Arc<NodeState>,
    addr: Address,
    initial: Message,
) -> Result<(), std::io::Error> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    tracing::debug!(peer = %addr, "connected to P2P peer");
    handle_connection(node, stream, Some(addr), Some(initial)).await;
    Ok(())
}

/// Run a single connection to completion: spawn the writer, register the
/// peer once its address is known, read frames and dispatch them, then
/// clean up on close.
async fn handle_connection(
    node: Arc<NodeState>,
    stream: TcpStream,
    known_as: Option<Address>,
    initial: Option<Message>,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    let mut kill_tx = Some(kill_tx);
    let mut current_generation: Option<u64> = None;
    if let Some(addr) = &known_as {
        if let Some(kill) = kill_tx.take() {
            current_generation = Some(node.peers.insert(addr.clone(), tx.clone(), kill));
        }
    }

    let write_peer_label = known_as.clone();
    let write_handle = tokio::spawn(run_writer(write_half, rx, write_peer_label));

    if let Some(msg) = initial {
        if tx.send(msg).await.is_err() {
            tracing::warn!(peer = ?known_as, "failed to queue initial handshake");
        }
    }

    let mut current_addr = known_as;
    run_reader(
        &node,
        read_half,
        &tx,
        &mut current_addr,
        &mut kill_tx,
        &mut current_generation,
        kill_rx,
    )
    .await;

    // Mirrors the teacher's `write_handle.abort()` at the end of its own
    // inline connection handler: a lingering clone of `tx` elsewhere (e.g. a
    // broadcast snapshot taken moments earlier) would otherwise keep the
    // writer's `rx.recv()` alive past this connection's natural end.
    write_handle.abort();

    if let (Some(addr), Some(generation)) = (current_addr, current_generation) {
        if node.peers.remove_if_current(&addr, generation) {
            tracing::info!(peer = %addr, "P2P peer disconnected");
            node.reassign_jobs_of(&addr);
        } else {
            tracing::debug!(
                peer = %addr,
                "stale connection closed; a newer connection for this address is still active"
            );
        }
    }
}

async fn run_writer(
    mut write_half: WriteHalf<TcpStream>,
    mut rx: mpsc::Receiver<Message>,
    peer_label: Option<Address>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = protocol::write_frame(&mut write_half, &msg).await {
            tracing::warn!(peer = ?peer_label, "P2P write failed, dropping connection: {e}");
            break;
        }
    }
}

/// Read frames until the connection closes, a frame is malformed, or the
/// peer table's dead-peer sweep fires this connection's kill switch (§4.4).
/// `current_addr` starts as whatever was already known and is updated to
/// the sender's advertised address the first time a `JoinParent`/`JoinOther`
/// frame arrives; `kill_tx` is handed to [`NodeState::dispatch`] so it can be
/// stored alongside that same peer-table entry, and `current_generation` is
/// set to the generation [`crate::peer::PeerTable::insert`] hands back at
/// that same moment, so this connection's own cleanup can tell whether it is
/// still the live entry for its address (§ peer.rs `remove_if_current`).
async fn run_reader(
    node: &Arc<NodeState>,
    mut read_half: ReadHalf<TcpStream>,
    reply_tx: &mpsc::Sender<Message>,
    current_addr: &mut Option<Address>,
    kill_tx: &mut Option<oneshot::Sender<()>>,
    current_generation: &mut Option<u64>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    loop {
        let frame = tokio::select! {
            frame = protocol::read_frame(&mut read_half) => frame,
            _ = &mut kill_rx => {
                tracing::info!(peer = ?current_addr, "P2P connection killed by dead-peer sweep");
                return;
            }
        };
        match frame {
            Ok(Some(msg)) => {
                if let Some(addr) = current_addr {
                    node.peers.touch(addr);
                }
                node.dispatch(msg, reply_tx, current_addr, kill_tx, current_generation)
                    .await;
            }
            Ok(None) => {
                tracing::debug!(peer = ?current_addr, "P2P connection closed");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = ?current_addr, "P2P frame error, dropping connection: {e}");
                return;
            }
        }
    }
}
