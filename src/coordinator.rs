//! The coordinator side of the protocol (§4.5): accepting a puzzle,
//! splitting it into nine sub-square jobs, scheduling those jobs across free
//! peers (falling back to running a job itself when none are free), and
//! merging completions until the puzzle is solved.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::board::{self, Grid};
use crate::error::CoreError;
use crate::node::NodeState;
use crate::protocol::{Address, Message};
use crate::session::{Job, JobStatus, Session};
use crate::worker;

/// Cadence of the assignment loop's scheduling tick.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long an IN_PROGRESS job may sit unfinished before the assignment loop
/// treats it as abandoned and reassigns it, regardless of whether its peer
/// is still alive (§4.6, §9: a remote worker that self-abandons — divergence
/// or retry exhaustion — never reports back, and the dead-peer sweep never
/// fires for a peer that is still heartbeating). A worker's own fill loop
/// sleeps at most roughly `handicap_ms` total per square (§4.6's per-step
/// divisor keeps the sum of per-cell sleeps under the handicap), so this
/// allows several multiples of that plus a flat margin for scheduling and
/// network delay before declaring a job stale.
fn assignment_stale_after(handicap_ms: u64) -> Duration {
    Duration::from_millis(handicap_ms.saturating_mul(4)) + Duration::from_secs(5)
}

/// Accept a puzzle, drive it to completion, and return the solved grid — or
/// `None` if the final grid fails validation (§4.5 step 5).
///
/// If an existing session was already started for this exact grid, its
/// current grid is returned immediately rather than starting a second
/// solve (§4.5 step 1).
pub async fn solve(node: Arc<NodeState>, grid: Grid) -> Option<Grid> {
    {
        let sessions = node.sessions.lock();
        if let Some(existing) = sessions.values().find(|s| s.initial_grid == grid) {
            return Some(existing.grid);
        }
    }

    let id = Uuid::new_v4().to_string();
    let session = Session::new(id.clone(), grid, node.self_addr.clone());
    node.sessions.lock().insert(id.clone(), session);

    node.broadcast(Message::StoreSudoku {
        id: id.clone(),
        grid,
        origin_address: node.self_addr.clone(),
    });

    run_assignment_loop(Arc::clone(&node), id.clone()).await;

    let final_grid = {
        let sessions = node.sessions.lock();
        sessions.get(&id).map(|s| s.grid)
    }?;

    if !board::check(&final_grid) {
        tracing::warn!(session = %id, "final grid failed validation");
        return None;
    }

    {
        let mut sessions = node.sessions.lock();
        let mut cache = node.fingerprints.lock();
        if let Some(session) = sessions.get_mut(&id) {
            for s in 0..9 {
                let key = board::encode_square(&board::return_square(s, &session.initial_grid));
                let value = board::return_square(s, &session.grid);
                cache.insert(key, value);
            }
            session.solved_locally = true;
        }
    }

    node.credit_solved_once(&id);
    node.broadcast(Message::SudokuSolved {
        id: id.clone(),
        grid: final_grid,
        origin_address: node.self_addr.clone(),
    });

    Some(final_grid)
}

/// Tick the scheduler until every job in `session_id` is COMPLETED.
async fn run_assignment_loop(node: Arc<NodeState>, session_id: String) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        if run_tick(&node, &session_id).await {
            return;
        }
    }
}

/// One scheduling pass (§4.5 step 4): sub-squares are visited in ascending
/// zero-count order; a sub-square with zero empty cells is marked COMPLETED
/// outright, a fingerprint-cache hit is applied as a candidate fill, and at
/// most one PENDING job is assigned per tick — to a free peer if one exists
/// for this session, or run inline on this same tick if the peer set is
/// literally empty (§9 "Self as a peer": self-execution is the empty-overlay
/// fallback, not a way to skip over peers that merely happen to be busy
/// elsewhere in this session; those squares just wait for the next tick).
/// Returns whether the session is now fully completed.
async fn run_tick(node: &Arc<NodeState>, session_id: &str) -> bool {
    let order = {
        let sessions = node.sessions.lock();
        let Some(session) = sessions.get(session_id) else {
            return true;
        };
        if session.all_completed() {
            return true;
        }
        let mut by_zeros: Vec<(usize, usize)> = (0..9)
            .map(|s| (s, board::number_of_zeros_in_square(s, &session.grid)))
            .collect();
        by_zeros.sort_by_key(|&(_, zeros)| zeros);
        by_zeros.into_iter().map(|(s, _)| s).collect::<Vec<_>>()
    };

    for square in order {
        let mut sessions = node.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return true;
        };

        let zeros = board::number_of_zeros_in_square(square, &session.grid);
        if zeros == 0 {
            session.jobs[square].status = JobStatus::Completed;
            session.assigned_at[square] = None;
            continue;
        }

        let key = board::encode_square(&board::return_square(square, &session.grid));
        if let Some(cached) = node.fingerprints.lock().get(&key) {
            board::replace_square(square, &cached, &mut session.grid);
        }

        if session.jobs[square].status == JobStatus::InProgress {
            let stale = session.assigned_at[square]
                .map(|at| at.elapsed() > assignment_stale_after(node.handicap_ms))
                .unwrap_or(false);
            if stale {
                tracing::warn!(
                    square,
                    assignee = ?session.jobs[square].assignee,
                    "job stale past its assignment timeout, reassigning"
                );
                session.jobs[square] = Job::pending();
                session.assigned_at[square] = None;
            }
        }

        if session.jobs[square].status != JobStatus::Pending {
            continue;
        }

        let busy: HashSet<Address> = session
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::InProgress)
            .filter_map(|j| j.assignee.clone())
            .collect();
        let free_peer = node
            .peers
            .addresses()
            .into_iter()
            .find(|addr| !busy.contains(addr));

        if let Some(peer) = free_peer {
            session.jobs[square] = Job {
                status: JobStatus::InProgress,
                assignee: Some(peer.clone()),
            };
            session.assigned_at[square] = Some(std::time::Instant::now());
            let grid_snapshot = session.grid;
            let jobs_snapshot = session.jobs.clone();
            drop(sessions);
            if let Some(tx) = node.peers.get_sender(&peer) {
                let msg = Message::WorkRequest {
                    id: session_id.to_string(),
                    grid: grid_snapshot,
                    jobs: jobs_snapshot,
                    square,
                };
                if tx.try_send(msg).is_err() {
                    let err = CoreError::ChannelClosed("WorkRequest");
                    tracing::warn!(peer = %peer, square, "{err}");
                }
            }
            return false;
        }

        if node.peers.is_empty() {
            session.jobs[square] = Job {
                status: JobStatus::InProgress,
                assignee: Some(node.self_addr.clone()),
            };
            session.assigned_at[square] = Some(std::time::Instant::now());
            let grid_snapshot = session.grid;
            drop(sessions);
            run_self_job(node, session_id, square, &grid_snapshot).await;
            return false;
        }

        // Every known peer is busy with another square of this session;
        // leave this one PENDING and see if a different square can be
        // assigned to one of them this tick instead.
    }

    let sessions = node.sessions.lock();
    sessions.get(session_id).map(|s| s.all_completed()).unwrap_or(true)
}

/// Run a job in-process, as its own worker, on the assignment task itself —
/// only reached when the peer set is literally empty (§9 "Self as a peer").
/// Reuses [`worker::run_fill_loop`] exactly as a remote worker would, with
/// no divergence check: this node already owns the authoritative grid, so
/// there is nothing to diverge from.
async fn run_self_job(node: &Arc<NodeState>, session_id: &str, square: usize, grid: &Grid) {
    let original = board::return_square(square, grid);
    let zeros = board::number_of_zeros_in_square(square, grid);
    let divisor = zeros as u64 + 1;

    let result = worker::run_fill_loop(
        node,
        session_id,
        square,
        divisor,
        node.handicap_ms,
        original,
        |_| false,
    )
    .await;

    match result {
        worker::FillResult::Completed => {
            let grid_snapshot = {
                let mut sessions = node.sessions.lock();
                sessions.get_mut(session_id).map(|session| {
                    session.jobs[square] = Job {
                        status: JobStatus::Completed,
                        assignee: Some(node.self_addr.clone()),
                    };
                    session.assigned_at[square] = None;
                    session.grid
                })
            };
            if let Some(grid) = grid_snapshot {
                node.broadcast(Message::WorkComplete {
                    id: session_id.to_string(),
                    grid,
                    square,
                    validations: node.validations(),
                });
            }
        }
        worker::FillResult::Abandoned => {
            // Randomized filler exhausted its retry budget (§9); revert
            // to PENDING so the next tick reassigns it.
            let mut sessions = node.sessions.lock();
            if let Some(session) = sessions.get_mut(session_id) {
                session.jobs[square] = Job::pending();
                session.assigned_at[square] = None;
            }
        }
    }
}

/// On `WorkComplete` receipt: merge the sender's sub-square into the local
/// session grid and mark the job COMPLETED, wherever this node's own mirror
/// of the session stands (§4.6 "Merge the sender's 3x3 sub-square").
pub fn apply_work_complete(node: &Arc<NodeState>, id: &str, grid: &Grid, square: usize) {
    let mut sessions = node.sessions.lock();
    let Some(session) = sessions.get_mut(id) else {
        let err = CoreError::UnknownSession(id.to_string());
        tracing::debug!(session = %id, "{err}, ignoring WorkComplete");
        return;
    };
    let sq = board::return_square(square, grid);
    board::replace_square(square, &sq, &mut session.grid);
    session.jobs[square].status = JobStatus::Completed;
    session.assigned_at[square] = None;
}

/// On `SudokuSolved` receipt: credit `solved` once, overwrite the session
/// grid, and mark every job COMPLETED (§4.6, invariant 5).
pub fn apply_sudoku_solved(node: &Arc<NodeState>, id: &str, grid: &Grid) {
    node.credit_solved_once(id);
    let mut sessions = node.sessions.lock();
    if let Some(session) = sessions.get_mut(id) {
        session.grid = *grid;
        for job in session.jobs.iter_mut() {
            job.status = JobStatus::Completed;
        }
        session.assigned_at = [None; 9];
        session.solved_locally = true;
    }
}
