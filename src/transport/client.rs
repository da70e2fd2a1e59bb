use std::io;
use std::net::UdpSocket;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use anyhow::{Context, Result};

use super::{encode, Command, ListenConfig};
use crate::table::CounterKey;

/// Producer-side sender for `add(key, value)` events.
///
/// Fire-and-forget: there is no acknowledgement, and a send that fails
/// because the agent is down is simply lost.
#[derive(Debug)]
pub enum SubmissionClient {
    Unix { socket: UnixDatagram, path: PathBuf },
    Udp(UdpSocket),
}

impl SubmissionClient {
    /// Opens an unconnected socket aimed at the agent's listen address.
    pub fn connect(target: &ListenConfig) -> Result<Self> {
        match target {
            ListenConfig::Unix { path } => {
                let socket = UnixDatagram::unbound().context("creating unix datagram socket")?;
                Ok(Self::Unix {
                    socket,
                    path: path.clone(),
                })
            }
            ListenConfig::Udp { addr } => {
                let bind = if addr.starts_with('[') {
                    "[::]:0"
                } else {
                    "0.0.0.0:0"
                };
                let socket = UdpSocket::bind(bind).context("binding udp client socket")?;
                socket
                    .connect(addr.as_str())
                    .with_context(|| format!("resolving agent address {addr}"))?;
                Ok(Self::Udp(socket))
            }
        }
    }

    /// Sends one event.
    pub fn send(&self, key: CounterKey, value: i64) -> io::Result<()> {
        let buf = encode(&Command::Add { key, value });
        match self {
            Self::Unix { socket, path } => socket.send_to(&buf, path).map(|_| ()),
            Self::Udp(socket) => socket.send(&buf).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{decode, Listener, RECV_BUFFER_LEN};

    #[tokio::test]
    async fn test_udp_round_trip() {
        let listener = Listener::bind(&ListenConfig::Udp {
            addr: "127.0.0.1:0".to_string(),
        })
        .await
        .expect("bind");

        let addr = listener
            .local_addr()
            .trim_start_matches("udp://")
            .to_string();
        let client = SubmissionClient::connect(&ListenConfig::Udp { addr }).expect("connect");
        client.send(100, -5).expect("send");

        let mut buf = [0u8; RECV_BUFFER_LEN];
        let n = listener.recv(&mut buf).await.expect("recv");
        assert_eq!(
            decode(&buf[..n]),
            Ok(Command::Add {
                key: 100,
                value: -5
            })
        );
    }

    #[test]
    fn test_send_to_missing_agent_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = SubmissionClient::connect(&ListenConfig::Unix {
            path: dir.path().join("nobody.sock"),
        })
        .expect("connect");
        assert!(client.send(1, 1).is_err());
    }
}
