//! The worker side of the protocol (§4.6): accepting a sub-square
//! assignment, filling it cell-by-cell with the randomized filler, and
//! reporting back. Also runs, unmodified, as the coordinator's own
//! in-process fallback when a puzzle has no free remote peers — see
//! [`crate::coordinator`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::board::{self, Grid};
use crate::node::NodeState;
use crate::protocol::{Address, Message};
use crate::session::{Job, JobStatus, Session};

/// Outcome of [`run_fill_loop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResult {
    Completed,
    Abandoned,
}

/// Repeatedly call [`board::update_square`] on session `session_id`'s
/// sub-square `square` until it completes, `should_abandon` trips, or the
/// filler exhausts its retry budget.
///
/// `divisor` is fixed for the lifetime of one job — the incoming zero-count
/// plus one — per §4.6 ("this sets the per-step handicap divisor"), not
/// recomputed as cells fill in. On any abandonment the sub-square is
/// restored to `original`, its state when the job began, so a retried
/// assignment starts clean.
pub async fn run_fill_loop(
    node: &Arc<NodeState>,
    session_id: &str,
    square: usize,
    divisor: u64,
    handicap_ms: u64,
    original: [[u8; 3]; 3],
    mut should_abandon: impl FnMut(&Grid) -> bool,
) -> FillResult {
    loop {
        let outcome = {
            let mut sessions = node.sessions.lock();
            let Some(session) = sessions.get_mut(session_id) else {
                return FillResult::Abandoned;
            };
            if should_abandon(&session.grid) {
                board::replace_square(square, &original, &mut session.grid);
                return FillResult::Abandoned;
            }
            board::update_square(square, &mut session.grid)
        };

        match outcome {
            board::FillOutcome::AlreadyComplete => return FillResult::Completed,
            board::FillOutcome::Completed => {
                node.record_validation();
                return FillResult::Completed;
            }
            board::FillOutcome::Progressed => {
                node.record_validation();
                if handicap_ms > 0 {
                    let secs = (handicap_ms as f64 / 1000.0) / divisor.max(1) as f64;
                    if secs > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                    }
                }
            }
            board::FillOutcome::Exhausted => {
                let mut sessions = node.sessions.lock();
                if let Some(session) = sessions.get_mut(session_id) {
                    board::replace_square(square, &original, &mut session.grid);
                }
                return FillResult::Abandoned;
            }
        }
    }
}

/// On `StoreSudoku` receipt: create or refresh this node's own mirror of the
/// session. A node that already holds the session (e.g. it previously saw a
/// `WorkRequest` for it) keeps its own grid rather than being clobbered by a
/// stale re-broadcast.
pub fn handle_store_sudoku(node: &Arc<NodeState>, id: String, grid: Grid, origin: Address) {
    let mut sessions = node.sessions.lock();
    sessions
        .entry(id.clone())
        .or_insert_with(|| Session::new(id, grid, origin));
}

/// On `WorkRequest` receipt: store/overwrite the local session mirror with
/// the incoming grid and jobs, ack, then run the fill loop for `square` in
/// its own task so the connection's reader keeps processing other frames.
pub fn handle_work_request(
    node: Arc<NodeState>,
    reply_tx: mpsc::Sender<Message>,
    origin: Address,
    id: String,
    grid: Grid,
    jobs: Vec<Job>,
    square: usize,
) {
    tokio::spawn(async move {
        let upstream = grid;
        {
            let mut sessions = node.sessions.lock();
            let session = sessions
                .entry(id.clone())
                .or_insert_with(|| Session::new(id.clone(), upstream, origin));
            session.grid = upstream;
            session.jobs = jobs;
        }

        if reply_tx
            .send(Message::WorkAck {
                id: id.clone(),
                square,
            })
            .await
            .is_err()
        {
            tracing::warn!(session = %id, square, "failed to send WorkAck, connection gone");
            return;
        }

        let original = board::return_square(square, &upstream);
        let zeros = board::number_of_zeros_in_square(square, &upstream);
        let divisor = zeros as u64 + 1;

        let result = run_fill_loop(
            &node,
            &id,
            square,
            divisor,
            node.handicap_ms,
            original,
            |current| board::square_context_diverged(square, &upstream, current),
        )
        .await;

        match result {
            FillResult::Completed => {
                let grid_snapshot = {
                    let mut sessions = node.sessions.lock();
                    sessions.get_mut(&id).map(|session| {
                        session.jobs[square] = Job {
                            status: JobStatus::Completed,
                            assignee: Some(node.self_addr.clone()),
                        };
                        session.grid
                    })
                };
                if let Some(grid) = grid_snapshot {
                    node.broadcast(Message::WorkComplete {
                        id,
                        grid,
                        square,
                        validations: node.validations(),
                    });
                }
            }
            FillResult::Abandoned => {
                // No wire message reports this back to the origin (§5: no
                // explicit cancel); the origin's own assignment loop notices
                // via its staleness timeout on the IN_PROGRESS job instead.
                tracing::debug!(session = %id, square, "abandoned work request, origin will reassign on staleness timeout");
            }
        }
    });
}
