//! Per-puzzle session state: jobs, job status, and the fingerprint cache.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::board::Grid;
use crate::protocol::Address;

/// Status of one sub-square's job within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
}

/// One sub-square's unit of work within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub status: JobStatus,
    /// `None` iff `status == Pending`.
    pub assignee: Option<Address>,
}

impl Job {
    pub fn pending() -> Self {
        Job {
            status: JobStatus::Pending,
            assignee: None,
        }
    }
}

/// Nine jobs, one per sub-square, indexed 0..9 in row-major order.
pub fn fresh_jobs() -> Vec<Job> {
    (0..9).map(|_| Job::pending()).collect()
}

/// A single solve attempt, identified by a UUID string.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Current, authoritative grid for this session; mutated as sub-squares
    /// complete.
    pub grid: Grid,
    pub jobs: Vec<Job>,
    /// Address of the node that accepted the originating HTTP request or
    /// `StoreSudoku`.
    pub origin: Address,
    /// Immutable snapshot of the grid as submitted — used for duplicate
    /// detection and fingerprint caching.
    pub initial_grid: Grid,
    /// Set once the coordinator has broadcast `SudokuSolved` for this
    /// session, so a duplicate broadcast never double-increments `solved`.
    pub solved_locally: bool,
    /// When each IN_PROGRESS job was last assigned; `None` for PENDING and
    /// COMPLETED jobs. Local-only bookkeeping (never serialized onto the
    /// wire, unlike [`Job`] itself) that lets the coordinator's assignment
    /// loop notice a job that has sat IN_PROGRESS too long — a remote
    /// worker that silently self-abandons (§4.6 divergence check, or §9
    /// retry exhaustion) never tells the coordinator, and no dead-peer sweep
    /// fires for a peer that is still alive and heartbeating, so without
    /// this the job would stay IN_PROGRESS forever.
    pub assigned_at: [Option<Instant>; 9],
}

impl Session {
    pub fn new(id: String, grid: Grid, origin: Address) -> Self {
        Session {
            id,
            grid,
            jobs: fresh_jobs(),
            origin,
            initial_grid: grid,
            solved_locally: false,
            assigned_at: [None; 9],
        }
    }

    pub fn all_completed(&self) -> bool {
        self.jobs.iter().all(|j| j.status == JobStatus::Completed)
    }
}

/// Maps a sub-square's pre-solve snapshot to its post-solve snapshot,
/// observed within some session. See SPEC_FULL.md §9 — this is a heuristic
/// short-circuit, not a sound cache: a 3x3 sub-square's completion in
/// general depends on its row/column context outside the sub-square, so a
/// hit is applied as a candidate and still validated by the normal
/// completion path (`check()` at end-of-session).
#[derive(Debug, Default)]
pub struct FingerprintCache {
    entries: HashMap<String, [[u8; 3]; 3]>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<[[u8; 3]; 3]> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: String, value: [[u8; 3]; 3]) {
        self.entries.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_jobs_has_nine_pending_entries() {
        let jobs = fresh_jobs();
        assert_eq!(jobs.len(), 9);
        assert!(jobs
            .iter()
            .all(|j| j.status == JobStatus::Pending && j.assignee.is_none()));
    }

    #[test]
    fn new_session_starts_with_no_completed_jobs() {
        let grid = [[0u8; 9]; 9];
        let origin = Address::new("127.0.0.1", 8000);
        let session = Session::new("id-1".into(), grid, origin);
        assert!(!session.all_completed());
        assert_eq!(session.initial_grid, session.grid);
    }

    #[test]
    fn all_completed_true_only_when_every_job_is_completed() {
        let grid = [[0u8; 9]; 9];
        let mut session = Session::new("id-2".into(), grid, Address::new("h", 1));
        for j in session.jobs.iter_mut() {
            j.status = JobStatus::Completed;
        }
        assert!(session.all_completed());
        session.jobs[0].status = JobStatus::Pending;
        assert!(!session.all_completed());
    }

    #[test]
    fn fingerprint_cache_round_trips() {
        let mut cache = FingerprintCache::new();
        let sq = [[1u8, 2, 3], [4, 5, 6], [7, 8, 9]];
        cache.insert("key".into(), sq);
        assert_eq!(cache.get("key"), Some(sq));
        assert_eq!(cache.get("missing"), None);
    }
}
