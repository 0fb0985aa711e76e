//! CLI flags (§6), parsed with `clap`'s derive macros — the same pattern
//! the teacher uses for `ServerConfig::parse()` in `main.rs`.

use clap::Parser;

use crate::protocol::Address;

#[derive(Debug, Clone, Parser)]
#[command(name = "sudoku-node", about = "Peer-to-peer distributed Sudoku solver node")]
pub struct NodeConfig {
    /// Node's HTTP port.
    #[arg(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Node's P2P TCP port.
    #[arg(short, long, default_value_t = 7000)]
    pub service: u16,

    /// Optional bootstrap parent, in `host:port` form.
    #[arg(short, long)]
    pub address: Option<String>,

    /// Per-validation handicap in milliseconds (sleep divisor); see §6.
    ///
    /// The original implementation binds this to `-h`, which would shadow
    /// `--help`; we keep only the long form.
    #[arg(long, default_value_t = 0)]
    pub handicap: i64,
}

impl NodeConfig {
    /// This node's own advertised P2P address. The reference scenarios
    /// (§8) all run on loopback, so peers advertise themselves as
    /// `127.0.0.1:<service>`.
    pub fn self_p2p_address(&self) -> Address {
        Address::new("127.0.0.1", self.service)
    }

    pub fn parent_address(&self) -> Option<Address> {
        self.address.as_deref().and_then(|s| s.parse().ok())
    }
}
