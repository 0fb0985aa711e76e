//! The HTTP control surface (§6): three read/write endpoints wrapping core
//! operations, plus a JSON 404 fallback. Grounded in the teacher's
//! `web.rs::router` (axum `Router` built with `.route(...).with_state(...)`)
//! and its REST handlers' `State<Arc<SharedState>> -> Json<T>` shape.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::board::Grid;
use crate::coordinator;
use crate::node::NodeState;

pub fn router(node: Arc<NodeState>) -> Router {
    // `.fallback(not_found)` on the `Router` only catches unmatched *paths* —
    // a registered path hit with the wrong method falls through to axum's
    // built-in 405 instead. spec.md §6 wants wrong method to 404 the same
    // way, so each route also gets its own `MethodRouter::fallback`.
    Router::new()
        .route("/stats", get(stats).fallback(not_found))
        .route("/network", get(network).fallback(not_found))
        .route("/solve", post(solve).fallback(not_found))
        .fallback(not_found)
        .with_state(node)
}

#[derive(Serialize)]
struct StatsResponse {
    all: AllCounters,
    nodes: Vec<NodeCounters>,
}

#[derive(Serialize)]
struct AllCounters {
    solved: u64,
    validations: u64,
}

#[derive(Serialize)]
struct NodeCounters {
    address: String,
    validations: u64,
}

async fn stats(State(node): State<Arc<NodeState>>) -> Json<StatsResponse> {
    let self_validations = node.validations();
    let peer_validations = node.peers.per_peer_validations();
    let total_validations: u64 =
        self_validations + peer_validations.iter().map(|(_, v)| v).sum::<u64>();

    let mut nodes = vec![NodeCounters {
        address: node.self_addr.to_string(),
        validations: self_validations,
    }];
    nodes.extend(
        peer_validations
            .into_iter()
            .map(|(addr, validations)| NodeCounters {
                address: addr.to_string(),
                validations,
            }),
    );

    Json(StatsResponse {
        all: AllCounters {
            solved: node.solved(),
            validations: total_validations,
        },
        nodes,
    })
}

async fn network(State(node): State<Arc<NodeState>>) -> Json<serde_json::Value> {
    let mut known: Vec<String> = node.peers.addresses().iter().map(ToString::to_string).collect();
    known.push(node.self_addr.to_string());

    let mut map = serde_json::Map::new();
    for addr in &known {
        let others: Vec<&String> = known.iter().filter(|a| *a != addr).collect();
        map.insert(addr.clone(), serde_json::json!(others));
    }
    Json(serde_json::Value::Object(map))
}

#[derive(Deserialize)]
struct SolveRequest {
    sudoku: Grid,
}

#[derive(Serialize)]
struct SolveResponse {
    sudoku: Option<Grid>,
}

async fn solve(
    State(node): State<Arc<NodeState>>,
    Json(req): Json<SolveRequest>,
) -> Json<SolveResponse> {
    let sudoku = coordinator::solve(node, req.sudoku).await;
    Json(SolveResponse { sudoku })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "message": "not found" })),
    )
}
