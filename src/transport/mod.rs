//! Datagram submission protocol between producers and the agent.
//!
//! One event per datagram, 16 bytes, big-endian:
//! `[u32 command][u32 key][i64 value]`.

pub mod client;

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::net::{UdpSocket, UnixDatagram};

use crate::table::CounterKey;

pub use client::SubmissionClient;

/// Exact size of a valid submission datagram.
pub const DATAGRAM_LEN: usize = 16;

/// Receive buffer size; anything larger than a datagram is read so oversized
/// payloads can be detected instead of silently truncated.
pub const RECV_BUFFER_LEN: usize = 64;

const CMD_ADD: u32 = 0;

/// A decoded submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Add `value` to the counter `key` in the current bucket.
    Add { key: CounterKey, value: i64 },
}

/// Why a received datagram was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram too short: {len} bytes, want {DATAGRAM_LEN}")]
    Truncated { len: usize },
    #[error("datagram too long: {len} bytes, want {DATAGRAM_LEN}")]
    Oversized { len: usize },
    #[error("unknown command tag {tag}")]
    UnknownCommand { tag: u32 },
}

impl DecodeError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::Oversized { .. } => "oversized",
            Self::UnknownCommand { .. } => "unknown_command",
        }
    }
}

/// Encodes a command into its wire representation.
pub fn encode(cmd: &Command) -> [u8; DATAGRAM_LEN] {
    let mut buf = [0u8; DATAGRAM_LEN];
    match *cmd {
        Command::Add { key, value } => {
            buf[0..4].copy_from_slice(&CMD_ADD.to_be_bytes());
            buf[4..8].copy_from_slice(&key.to_be_bytes());
            buf[8..16].copy_from_slice(&value.to_be_bytes());
        }
    }
    buf
}

/// Decodes one datagram. Anything other than exactly 16 bytes with a known
/// command tag is rejected.
pub fn decode(buf: &[u8]) -> Result<Command, DecodeError> {
    let frame: &[u8; DATAGRAM_LEN] = match buf.len() {
        DATAGRAM_LEN => buf
            .try_into()
            .map_err(|_| DecodeError::Truncated { len: buf.len() })?,
        len if len < DATAGRAM_LEN => return Err(DecodeError::Truncated { len }),
        len => return Err(DecodeError::Oversized { len }),
    };

    let tag = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    match tag {
        CMD_ADD => {
            let key = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
            let mut value = [0u8; 8];
            value.copy_from_slice(&frame[8..16]);
            Ok(Command::Add {
                key,
                value: i64::from_be_bytes(value),
            })
        }
        tag => Err(DecodeError::UnknownCommand { tag }),
    }
}

/// Where the agent listens for submissions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListenConfig {
    /// Unix datagram socket. A stale socket file is removed before binding.
    Unix { path: PathBuf },
    /// UDP socket, e.g. `127.0.0.1:8125`.
    Udp { addr: String },
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self::Unix {
            path: PathBuf::from("/tmp/tallyd.sock"),
        }
    }
}

impl std::fmt::Display for ListenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Udp { addr } => write!(f, "udp://{addr}"),
        }
    }
}

/// Bound receiving socket.
#[derive(Debug)]
pub enum Listener {
    Unix { socket: UnixDatagram, path: PathBuf },
    Udp(UdpSocket),
}

impl Listener {
    pub async fn bind(cfg: &ListenConfig) -> Result<Self> {
        match cfg {
            ListenConfig::Unix { path } => {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("removing stale socket {}", path.display())
                        })
                    }
                }
                let socket = UnixDatagram::bind(path)
                    .with_context(|| format!("binding unix socket {}", path.display()))?;
                Ok(Self::Unix {
                    socket,
                    path: path.clone(),
                })
            }
            ListenConfig::Udp { addr } => {
                let socket = UdpSocket::bind(addr.as_str())
                    .await
                    .with_context(|| format!("binding udp socket {addr}"))?;
                Ok(Self::Udp(socket))
            }
        }
    }

    /// Receives one datagram into `buf`, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix { socket, .. } => socket.recv(buf).await,
            Self::Udp(socket) => socket.recv(buf).await,
        }
    }

    /// Human-readable local address for logging.
    pub fn local_addr(&self) -> String {
        match self {
            Self::Unix { path, .. } => format!("unix://{}", path.display()),
            Self::Udp(socket) => socket
                .local_addr()
                .map(|a| format!("udp://{a}"))
                .unwrap_or_else(|_| "udp://unknown".to_string()),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_is_big_endian() {
        let buf = encode(&Command::Add {
            key: 100,
            value: -2,
        });
        assert_eq!(&buf[0..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 100]);
        assert_eq!(&buf[8..16], &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]);
    }

    #[test]
    fn test_decode_valid() {
        let mut buf = [0u8; DATAGRAM_LEN];
        buf[4..8].copy_from_slice(&7u32.to_be_bytes());
        buf[8..16].copy_from_slice(&12_345i64.to_be_bytes());
        assert_eq!(
            decode(&buf),
            Ok(Command::Add {
                key: 7,
                value: 12_345
            })
        );
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(decode(&[0u8; 15]), Err(DecodeError::Truncated { len: 15 }));
        assert_eq!(decode(&[]), Err(DecodeError::Truncated { len: 0 }));
        assert_eq!(decode(&[0u8; 17]), Err(DecodeError::Oversized { len: 17 }));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut buf = [0u8; DATAGRAM_LEN];
        buf[0..4].copy_from_slice(&3u32.to_be_bytes());
        let err = decode(&buf).unwrap_err();
        assert_eq!(err, DecodeError::UnknownCommand { tag: 3 });
        assert_eq!(err.kind(), "unknown_command");
    }

    #[test]
    fn test_listen_config_yaml() {
        let unix: ListenConfig =
            serde_yaml::from_str("kind: unix\npath: /run/tallyd.sock").expect("parse unix");
        assert_eq!(
            unix,
            ListenConfig::Unix {
                path: PathBuf::from("/run/tallyd.sock")
            }
        );

        let udp: ListenConfig =
            serde_yaml::from_str("kind: udp\naddr: 127.0.0.1:8125").expect("parse udp");
        assert_eq!(udp.to_string(), "udp://127.0.0.1:8125");
    }

    #[tokio::test]
    async fn test_unix_listener_replaces_stale_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.sock");
        std::fs::write(&path, b"stale").expect("write stale file");

        let cfg = ListenConfig::Unix { path: path.clone() };
        let listener = Listener::bind(&cfg).await.expect("bind over stale file");

        let client = SubmissionClient::connect(&cfg).expect("client");
        client.send(9, 4).expect("send");

        let mut buf = [0u8; RECV_BUFFER_LEN];
        let n = listener.recv(&mut buf).await.expect("recv");
        assert_eq!(decode(&buf[..n]), Ok(Command::Add { key: 9, value: 4 }));

        drop(listener);
        assert!(!path.exists());
    }
}
