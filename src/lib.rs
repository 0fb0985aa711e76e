//! Core of a peer-to-peer distributed Sudoku solver node.
//!
//! A node exposes a small HTTP control surface ([`web`]) and participates in
//! a fully connected overlay of sibling nodes ([`node`], [`transport`]).
//! When a client submits a puzzle, the accepting node becomes the
//! coordinator for a solve session ([`coordinator`]): it splits the grid
//! into nine 3x3 sub-squares ([`board`]), farms them out to peers as jobs
//! ([`session`]), and collects the results back from workers ([`worker`]).

pub mod board;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod web;
pub mod worker;

pub use config::NodeConfig;
pub use node::NodeState;
