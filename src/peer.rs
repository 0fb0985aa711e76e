//! The peer table: known remote nodes, their outbound transport handles,
//! mirrored validation counters, and liveness timestamps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::protocol::{Address, Message};

/// How long since the last heard-from timestamp before a peer is declared
/// dead (§4.4).
pub const DEAD_PEER_THRESHOLD: Duration = Duration::from_secs(3);

/// One known remote node.
pub struct PeerEntry {
    /// Outbound message queue for this peer's connection-writer task.
    pub tx: mpsc::Sender<Message>,
    /// Mirrored `validations` counter, last reported by the peer.
    pub validations: u64,
    pub last_heard: Instant,
    /// Fires once to tear down this peer's connection task (reader select
    /// branch in `transport::run_reader`) when the entry is removed —
    /// dropped from the table no longer means the socket is actually
    /// closed on its own.
    kill: oneshot::Sender<()>,
    /// Generation this connection was registered under, mirroring the
    /// teacher's `s2s.rs` `PeerEntry.conn_gen`. Two connections to the same
    /// address can race (an inbound `JoinParent`/`JoinOther` registering at
    /// nearly the same moment as an outbound re-announce connect); whichever
    /// `insert` lands last wins the table slot, but the loser's own
    /// `handle_connection` cleanup must not be allowed to tear down the
    /// winner's entry just because it shares the same address. Every removal
    /// is therefore gated on "is the generation I registered still current".
    generation: u64,
}

/// The set of known peers, guarded by a synchronous mutex: entries are
/// small and contention is low, matching the teacher's `parking_lot::Mutex`
/// choice for node-wide maps of this shape (`server.rs`'s channel/session
/// maps).
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<Address, PeerEntry>>,
    next_generation: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr`'s connection and return the generation it was
    /// registered under. Any existing entry for `addr` is replaced — its
    /// `kill` sender is dropped, which itself resolves that old connection's
    /// `run_reader` kill-switch select branch — but the caller holding the
    /// *new* generation is the only one allowed to remove this slot later
    /// (see [`PeerTable::remove_if_current`]).
    pub fn insert(&self, addr: Address, tx: mpsc::Sender<Message>, kill: oneshot::Sender<()>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.peers.lock().insert(
            addr,
            PeerEntry {
                tx,
                validations: 0,
                last_heard: Instant::now(),
                kill,
                generation,
            },
        );
        generation
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.peers.lock().contains_key(addr)
    }

    /// Drop the table entry for `addr` and signal its connection task to
    /// tear down (§4.4: a dead peer's transport must actually close, not
    /// just disappear from bookkeeping) — but only if the entry currently at
    /// `addr` is still the one registered under `generation`. If a newer
    /// connection has since replaced it, this is a no-op that returns
    /// `false`: the caller's own connection is stale and must not evict a
    /// live peer out from under a fresher connection to the same address.
    pub fn remove_if_current(&self, addr: &Address, generation: u64) -> bool {
        let mut peers = self.peers.lock();
        let current_matches = matches!(peers.get(addr), Some(entry) if entry.generation == generation);
        if !current_matches {
            return false;
        }
        let entry = peers.remove(addr).expect("checked Some above");
        drop(peers);
        let _ = entry.kill.send(());
        true
    }

    /// Refresh `addr`'s last-heard timestamp. Any inbound message does
    /// this, not only `KeepAlive` (§4.4).
    pub fn touch(&self, addr: &Address) {
        if let Some(entry) = self.peers.lock().get_mut(addr) {
            entry.last_heard = Instant::now();
        }
    }

    pub fn set_validations(&self, addr: &Address, validations: u64) {
        if let Some(entry) = self.peers.lock().get_mut(addr) {
            entry.validations = validations;
            entry.last_heard = Instant::now();
        }
    }

    /// Sum of all mirrored peer `validations` counters.
    pub fn total_validations(&self) -> u64 {
        self.peers.lock().values().map(|e| e.validations).sum()
    }

    /// Addresses of all known peers, in an unspecified but stable-per-call
    /// order.
    pub fn addresses(&self) -> Vec<Address> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn get_sender(&self, addr: &Address) -> Option<mpsc::Sender<Message>> {
        self.peers.lock().get(addr).map(|e| e.tx.clone())
    }

    pub fn per_peer_validations(&self) -> Vec<(Address, u64)> {
        self.peers
            .lock()
            .iter()
            .map(|(a, e)| (a.clone(), e.validations))
            .collect()
    }

    /// Addresses (with the generation they were last observed under) whose
    /// last-heard timestamp is older than [`DEAD_PEER_THRESHOLD`]. Does not
    /// remove them — the caller must call [`PeerTable::remove_if_current`]
    /// with the paired generation, so a reconnect that lands between this
    /// scan and the caller's removal is never mistaken for the stale entry.
    pub fn dead_peers(&self) -> Vec<(Address, u64)> {
        let now = Instant::now();
        self.peers
            .lock()
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heard) > DEAD_PEER_THRESHOLD)
            .map(|(a, e)| (a.clone(), e.generation))
            .collect()
    }

    pub fn broadcast_targets(&self) -> Vec<(Address, mpsc::Sender<Message>)> {
        self.peers
            .lock()
            .iter()
            .map(|(a, e)| (a.clone(), e.tx.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn insert_then_contains() {
        let table = PeerTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let (kill, _kill_rx) = oneshot::channel();
        table.insert(addr(7001), tx, kill);
        assert!(table.contains(&addr(7001)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn remove_if_current_drops_the_entry_and_signals_its_kill_switch() {
        let table = PeerTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let (kill, kill_rx) = oneshot::channel();
        let generation = table.insert(addr(7001), tx, kill);
        assert!(table.remove_if_current(&addr(7001), generation));
        assert!(!table.contains(&addr(7001)));
        assert!(!table.remove_if_current(&addr(7001), generation));
        assert!(
            kill_rx.await.is_ok(),
            "remove_if_current should fire the kill switch"
        );
    }

    #[tokio::test]
    async fn remove_if_current_is_a_noop_against_a_stale_generation() {
        let table = PeerTable::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (kill1, kill_rx1) = oneshot::channel();
        let stale_generation = table.insert(addr(7001), tx1, kill1);

        // A second connection registers at the same address (e.g. an
        // outbound re-announce racing an inbound JoinOther) and wins the
        // table slot.
        let (tx2, _rx2) = mpsc::channel(1);
        let (kill2, _kill_rx2) = oneshot::channel();
        let current_generation = table.insert(addr(7001), tx2, kill2);
        assert_ne!(stale_generation, current_generation);

        // The stale (superseded) connection's own cleanup must not evict
        // the live one.
        assert!(!table.remove_if_current(&addr(7001), stale_generation));
        assert!(table.contains(&addr(7001)), "the newer connection must survive");

        assert!(table.remove_if_current(&addr(7001), current_generation));
        assert!(!table.contains(&addr(7001)));
        assert!(
            kill_rx1.await.is_ok(),
            "the superseded entry's kill switch still fires when insert overwrites it"
        );
    }

    #[tokio::test]
    async fn set_validations_accumulates_into_total() {
        let table = PeerTable::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let (kill1, _kr1) = oneshot::channel();
        let (kill2, _kr2) = oneshot::channel();
        table.insert(addr(7001), tx1, kill1);
        table.insert(addr(7002), tx2, kill2);
        table.set_validations(&addr(7001), 10);
        table.set_validations(&addr(7002), 5);
        assert_eq!(table.total_validations(), 15);
    }

    #[tokio::test]
    async fn fresh_peer_is_not_dead() {
        let table = PeerTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let (kill, _kill_rx) = oneshot::channel();
        table.insert(addr(7001), tx, kill);
        assert!(table.dead_peers().is_empty());
    }

    #[tokio::test]
    async fn successive_inserts_for_the_same_address_yield_distinct_generations() {
        let table = PeerTable::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let (kill1, _kr1) = oneshot::channel();
        let (kill2, _kr2) = oneshot::channel();
        let g1 = table.insert(addr(7001), tx1, kill1);
        let g2 = table.insert(addr(7001), tx2, kill2);
        assert_ne!(g1, g2);
    }
}
