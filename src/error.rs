//! Typed errors for the P2P core.
//!
//! Transport and HTTP glue use `anyhow::Result`; these variants are for
//! failures the core itself needs to pattern-match on (see §7 of
//! SPEC_FULL.md).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("peer {0} is not known")]
    UnknownPeer(String),

    #[error("session {0} is not known")]
    UnknownSession(String),

    #[error("channel closed while sending {0}")]
    ChannelClosed(&'static str),
}
