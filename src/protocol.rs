//! Wire protocol: message variants and length-prefixed framing.
//!
//! One frame is a 2-byte big-endian length `n` followed by `n` bytes of a
//! JSON-encoded [`Message`]. A zero-length frame signals orderly close.
//! This mirrors the original implementation's `P2PProtocol.send_msg`/
//! `recv_msg` (2-byte header, `pickle` payload) but swaps `pickle` for
//! `serde_json`, the encoding the teacher's S2S link (`s2s.rs`) uses for its
//! own tagged message enum.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::board::Grid;
use crate::error::CoreError;
use crate::session::Job;

/// `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::Framing(format!("not a host:port address: {s}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| CoreError::Framing(format!("invalid port in address: {s}")))?;
        Ok(Address::new(host, port))
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(addr: std::net::SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port())
    }
}

/// §4.2 message variants. Tagged by `type` in the JSON payload; the tag
/// values are cosmetic (unlike the original's integer `Command` enum, a
/// string tag needs no separate mapping table) but the variant set and
/// field lists match spec.md exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    JoinParent {
        sender_address: Address,
    },
    JoinParentResponse {
        peers: Vec<Address>,
    },
    JoinOther {
        sender_address: Address,
    },
    JoinOtherResponse {
        solved: u64,
        validations: u64,
    },
    KeepAlive,
    StoreSudoku {
        id: String,
        grid: Grid,
        origin_address: Address,
    },
    WorkRequest {
        id: String,
        grid: Grid,
        jobs: Vec<Job>,
        square: usize,
    },
    WorkAck {
        id: String,
        square: usize,
    },
    WorkComplete {
        id: String,
        grid: Grid,
        square: usize,
        validations: u64,
    },
    SudokuSolved {
        id: String,
        grid: Grid,
        origin_address: Address,
    },
}

const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Encode `msg` as a length-prefixed frame and write it to `writer`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), CoreError> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| CoreError::Framing(format!("failed to encode message: {e}")))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CoreError::Framing(format!(
            "payload too large for 2-byte length prefix: {} bytes",
            payload.len()
        )));
    }
    let len = payload.len() as u16;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| CoreError::Framing(format!("write failed: {e}")))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| CoreError::Framing(format!("write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::Framing(format!("flush failed: {e}")))?;
    Ok(())
}

/// Read one frame from `reader`. Returns `Ok(None)` on a zero-length frame
/// (orderly close) or clean EOF before any bytes are read. Any other
/// failure — truncated frame, invalid JSON — is a [`CoreError::Framing`]
/// fatal to the connection, per spec.md §4.2.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, CoreError> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::Framing(format!("read failed: {e}"))),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| CoreError::Framing(format!("truncated frame: {e}")))?;
    let msg = serde_json::from_slice(&payload)
        .map_err(|e| CoreError::Framing(format!("invalid payload: {e}")))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_string() {
        let a = Address::new("127.0.0.1", 7000);
        let s = a.to_string();
        let parsed: Address = s.parse().unwrap();
        assert_eq!(a, parsed);
    }

    #[tokio::test]
    async fn message_round_trips_through_a_frame() {
        let msg = Message::JoinOtherResponse {
            solved: 3,
            validations: 42,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        match decoded {
            Message::JoinOtherResponse {
                solved,
                validations,
            } => {
                assert_eq!(solved, 3);
                assert_eq!(validations, 42);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_length_frame_signals_close() {
        let buf = 0u16.to_be_bytes().to_vec();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_a_framing_error() {
        let mut buf = 10u16.to_be_bytes().to_vec();
        buf.extend_from_slice(b"short");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn invalid_json_payload_is_a_framing_error() {
        let payload = b"not json";
        let mut buf = (payload.len() as u16).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
