//! Process-wide shared state: global counters, peer table, session table,
//! fingerprint cache, and the event dispatcher.
//!
//! Grounded in the teacher's `server.rs::SharedState` (a single struct
//! bundling every node-wide mutable map behind synchronous mutexes) and
//! `s2s.rs`'s `start`/`handle_incoming_s2s`/`connect_peer_with_retry` for
//! the membership/reconnect shape.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::config::NodeConfig;
use crate::peer::{PeerTable, DEAD_PEER_THRESHOLD};
use crate::protocol::{Address, Message};
use crate::session::{FingerprintCache, JobStatus, Session};
use crate::{coordinator, transport, worker};

/// Interval between dead-peer sweeps. The threshold itself
/// ([`DEAD_PEER_THRESHOLD`]) is 3s per spec; sweeping at the same cadence as
/// the heartbeat keeps "last-heard not older than threshold plus one sweep
/// interval" (§3 invariants) tight.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub struct NodeState {
    pub self_addr: Address,
    pub parent: Option<Address>,
    /// Milliseconds; used as `handicap / (zeros + 1)` seconds per
    /// validation, per §6.
    pub handicap_ms: u64,
    pub peers: PeerTable,
    pub sessions: Mutex<HashMap<String, Session>>,
    pub fingerprints: Mutex<FingerprintCache>,
    solved: AtomicU64,
    validations: AtomicU64,
    credited_sessions: Mutex<HashSet<String>>,
}

impl NodeState {
    pub fn new(config: &NodeConfig) -> Arc<Self> {
        Arc::new(NodeState {
            self_addr: config.self_p2p_address(),
            parent: config.parent_address(),
            handicap_ms: config.handicap as u64,
            peers: PeerTable::new(),
            sessions: Mutex::new(HashMap::new()),
            fingerprints: Mutex::new(FingerprintCache::new()),
            solved: AtomicU64::new(0),
            validations: AtomicU64::new(0),
            credited_sessions: Mutex::new(HashSet::new()),
        })
    }

    pub fn solved(&self) -> u64 {
        self.solved.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> u64 {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn record_validation(&self) -> u64 {
        self.validations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Increment `solved` for `session_id`, unless already credited. Returns
    /// whether this call performed the increment (invariant 5, §8).
    pub fn credit_solved_once(&self, session_id: &str) -> bool {
        let mut credited = self.credited_sessions.lock();
        if credited.contains(session_id) {
            false
        } else {
            credited.insert(session_id.to_string());
            self.solved.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    /// Send `msg` to every known peer. Never includes self — the peer
    /// table by construction holds only remote nodes (§9 "Self as a peer").
    pub fn broadcast(&self, msg: Message) {
        for (addr, tx) in self.peers.broadcast_targets() {
            if tx.try_send(msg.clone()).is_err() {
                let err = crate::error::CoreError::ChannelClosed("broadcast");
                tracing::warn!(peer = %addr, "{err}");
            }
        }
    }

    /// Re-announce sweep (SPEC_FULL.md §4.3 "Membership — re-announce"):
    /// when a `StoreSudoku`/`SudokuSolved` payload names an `origin_address`
    /// this node doesn't already have as a peer, connect to it once with a
    /// `JoinOther`. A single attempt, not a retry loop — §4.3's indefinite
    /// backoff retry is reserved for the configured parent bootstrap only.
    pub fn announce_if_unknown(self: &Arc<Self>, addr: Address) {
        if addr == self.self_addr || self.peers.contains(&addr) {
            return;
        }
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let msg = Message::JoinOther {
                sender_address: node.self_addr.clone(),
            };
            if let Err(e) =
                transport::connect_and_handle(Arc::clone(&node), addr.clone(), msg).await
            {
                tracing::warn!(peer = %addr, "re-announce connect failed: {e}");
            }
        });
    }

    /// Revert every job assigned to `addr` across every session back to
    /// PENDING (§4.5 reassignment-on-failure).
    pub fn reassign_jobs_of(&self, addr: &Address) {
        let mut sessions = self.sessions.lock();
        for session in sessions.values_mut() {
            for (index, job) in session.jobs.iter_mut().enumerate() {
                if job.status == JobStatus::InProgress && job.assignee.as_ref() == Some(addr) {
                    job.status = JobStatus::Pending;
                    job.assignee = None;
                    session.assigned_at[index] = None;
                }
            }
        }
    }

    /// Start the node: bind listeners, spawn the accept loop, bootstrap
    /// join (if a parent is configured), and the keep-alive/sweep timers.
    pub async fn start(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let node = Arc::clone(self);
        tokio::spawn(transport::run_accept_loop(node, listener));

        if let Some(parent) = self.parent.clone() {
            let node = Arc::clone(self);
            tokio::spawn(join_parent_with_backoff(node, parent));
        }

        tokio::spawn(heartbeat_loop(Arc::clone(self)));
        tokio::spawn(sweep_loop(Arc::clone(self)));

        Ok(())
    }

    /// Fan incoming frames out to their handlers (§4.7).
    ///
    /// `current_addr` is the connection's identified peer address, if any;
    /// `JoinParent`/`JoinOther` set it the first time they arrive on an
    /// inbound connection. `kill_tx` is this connection's dead-peer-sweep
    /// kill switch (§4.4); it is consumed into the peer table the same
    /// moment the address becomes known, so a later
    /// `PeerTable::remove_if_current` can actually tear this connection down
    /// instead of only forgetting it. `current_generation` is set to the
    /// generation that same `insert` call returns, so this connection's own
    /// cleanup in `transport::handle_connection` can tell whether it is
    /// still the table's current entry for that address before acting on it.
    pub async fn dispatch(
        self: &Arc<Self>,
        msg: Message,
        reply_tx: &mpsc::Sender<Message>,
        current_addr: &mut Option<Address>,
        kill_tx: &mut Option<oneshot::Sender<()>>,
        current_generation: &mut Option<u64>,
    ) {
        match msg {
            Message::JoinParent { sender_address } => {
                let existing_peers = self.peers.addresses();
                let _ = reply_tx
                    .send(Message::JoinParentResponse {
                        peers: existing_peers,
                    })
                    .await;
                if let Some(kill) = kill_tx.take() {
                    *current_generation =
                        Some(self.peers.insert(sender_address.clone(), reply_tx.clone(), kill));
                }
                tracing::info!(peer = %sender_address, "registered peer via JoinParent");
                *current_addr = Some(sender_address);
            }
            Message::JoinParentResponse { peers } => {
                for addr in peers {
                    if addr == self.self_addr {
                        continue;
                    }
                    let node = Arc::clone(self);
                    tokio::spawn(async move {
                        let msg = Message::JoinOther {
                            sender_address: node.self_addr.clone(),
                        };
                        if let Err(e) =
                            transport::connect_and_handle(Arc::clone(&node), addr.clone(), msg)
                                .await
                        {
                            tracing::warn!(peer = %addr, "failed to connect after JoinParentResponse: {e}");
                        }
                    });
                }
            }
            Message::JoinOther { sender_address } => {
                let _ = reply_tx
                    .send(Message::JoinOtherResponse {
                        solved: self.solved(),
                        validations: self.validations(),
                    })
                    .await;
                if let Some(kill) = kill_tx.take() {
                    *current_generation =
                        Some(self.peers.insert(sender_address.clone(), reply_tx.clone(), kill));
                }
                tracing::info!(peer = %sender_address, "registered peer via JoinOther");
                *current_addr = Some(sender_address);
            }
            Message::JoinOtherResponse {
                solved,
                validations,
            } => {
                if let Some(addr) = current_addr {
                    self.peers.set_validations(addr, validations);
                    tracing::debug!(peer = %addr, solved, validations, "peer counters mirrored");
                }
            }
            Message::KeepAlive => {
                // Liveness refresh already happened in the reader loop.
            }
            Message::StoreSudoku {
                id,
                grid,
                origin_address,
            } => {
                self.announce_if_unknown(origin_address.clone());
                worker::handle_store_sudoku(self, id, grid, origin_address);
            }
            Message::WorkRequest {
                id,
                grid,
                jobs,
                square,
            } => {
                let origin = current_addr.clone().unwrap_or_else(|| {
                    let err = crate::error::CoreError::UnknownPeer("<unjoined connection>".into());
                    tracing::warn!("WorkRequest on a connection with no known peer address: {err}");
                    self.self_addr.clone()
                });
                worker::handle_work_request(
                    Arc::clone(self),
                    reply_tx.clone(),
                    origin,
                    id,
                    grid,
                    jobs,
                    square,
                );
            }
            Message::WorkAck { id, square } => {
                tracing::debug!(session = %id, square, peer = ?current_addr, "work acknowledged");
            }
            Message::WorkComplete {
                id,
                grid,
                square,
                validations,
            } => {
                if let Some(addr) = current_addr {
                    self.peers.set_validations(addr, validations);
                }
                coordinator::apply_work_complete(self, &id, &grid, square);
            }
            Message::SudokuSolved {
                id,
                grid,
                origin_address,
            } => {
                self.announce_if_unknown(origin_address);
                coordinator::apply_sudoku_solved(self, &id, &grid);
            }
        }
    }
}

async fn join_parent_with_backoff(node: Arc<NodeState>, parent: Address) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let msg = Message::JoinParent {
            sender_address: node.self_addr.clone(),
        };
        match transport::connect_and_handle(Arc::clone(&node), parent.clone(), msg).await {
            Ok(()) => {
                // The connection ran to completion (peer dropped us); retry
                // the bootstrap from scratch.
                tracing::warn!(parent = %parent, "lost connection to parent, rejoining");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                tracing::warn!(parent = %parent, backoff_secs = backoff.as_secs(), "join failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

async fn heartbeat_loop(node: Arc<NodeState>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        interval.tick().await;
        node.broadcast(Message::KeepAlive);
    }
}

async fn sweep_loop(node: Arc<NodeState>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        for (addr, generation) in node.peers.dead_peers() {
            // Remove first, gated on the generation observed at scan time:
            // if a reconnect landed between the scan and here, this peer is
            // no longer the one we judged dead, and its jobs must not be
            // reassigned out from under it.
            if node.peers.remove_if_current(&addr, generation) {
                tracing::info!(peer = %addr, "peer declared dead, reassigning its jobs");
                node.reassign_jobs_of(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Job;

    fn cfg(parent: Option<&str>) -> NodeConfig {
        NodeConfig {
            port: 8000,
            service: 7000,
            address: parent.map(|s| s.to_string()),
            handicap: 0,
        }
    }

    #[test]
    fn credit_solved_once_only_increments_first_time() {
        let node = NodeState::new(&cfg(None));
        assert!(node.credit_solved_once("abc"));
        assert_eq!(node.solved(), 1);
        assert!(!node.credit_solved_once("abc"));
        assert_eq!(node.solved(), 1);
        assert!(node.credit_solved_once("def"));
        assert_eq!(node.solved(), 2);
    }

    #[test]
    fn reassign_jobs_of_reverts_in_progress_jobs_to_pending() {
        let node = NodeState::new(&cfg(None));
        let dead = Address::new("127.0.0.1", 7002);
        let grid = [[0u8; 9]; 9];
        let mut session = Session::new("s1".into(), grid, Address::new("127.0.0.1", 8000));
        session.jobs[2] = Job {
            status: JobStatus::InProgress,
            assignee: Some(dead.clone()),
        };
        session.jobs[5] = Job {
            status: JobStatus::InProgress,
            assignee: Some(Address::new("127.0.0.1", 7003)),
        };
        node.sessions.lock().insert(session.id.clone(), session);

        node.reassign_jobs_of(&dead);

        let sessions = node.sessions.lock();
        let session = &sessions["s1"];
        assert_eq!(session.jobs[2].status, JobStatus::Pending);
        assert_eq!(session.jobs[2].assignee, None);
        assert_eq!(session.jobs[5].status, JobStatus::InProgress);
    }
}
