//! Exclusive access to the controller channel.
//!
//! The protocol has no request IDs: a reply is matched to a command only by
//! order. `ChannelGate` therefore owns the one channel handle and performs the
//! write and the read of a round trip under a single `tokio::sync::Mutex`
//! guard. The telemetry loop and every HTTP request go through it.
//!
//! On any transport failure the handle is dropped and a fresh one is
//! acquired through the [`ChannelConnector`] before the guard is released,
//! so the next caller starts on a clean channel.
//!
//! A caller may be cancelled between the write and the read (a confirmation
//! deadline, an HTTP client going away). The reply is then still owed by the
//! device, so the gate records it and the next caller reads and discards that
//! line, bounded by the read timeout, before sending its own command.

use crate::error::ChannelError;
use crate::hardware::serial::DynSerial;
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::instrument;

/// Produces a fresh device channel. Called at startup and after every failure.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a new channel to the device.
    async fn connect(&self) -> Result<DynSerial, ChannelError>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

/// Default time allowed for the reply line to arrive.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

struct GateState {
    port: Option<BufReader<DynSerial>>,
    connections: u64,
    /// Set while a command is on the wire and its reply has not been read.
    owes_reply: bool,
}

/// Serializes every command/reply pair on the controller channel.
pub struct ChannelGate {
    connector: Arc<dyn ChannelConnector>,
    read_timeout: Duration,
    state: Mutex<GateState>,
}

impl ChannelGate {
    /// Acquire the channel. Failure here is a startup failure.
    pub async fn open(
        connector: Arc<dyn ChannelConnector>,
        read_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let port = connector.connect().await?;
        tracing::info!(channel = %connector.describe(), "Device channel acquired");
        Ok(Self {
            connector,
            read_timeout,
            state: Mutex::new(GateState {
                port: Some(BufReader::new(port)),
                connections: 1,
                owes_reply: false,
            }),
        })
    }

    /// Write `command` and read exactly one reply line, without the line ending.
    ///
    /// A `ChannelError` means the round trip did not happen as a pair; retry it.
    #[instrument(skip(self), level = "trace", err)]
    pub async fn round_trip(&self, command: &str) -> Result<String, ChannelError> {
        let mut state = self.state.lock().await;

        if state.owes_reply {
            self.settle_abandoned(&mut state).await;
        }
        if state.port.is_none() {
            self.reconnect(&mut state).await?;
        }

        state.owes_reply = true;
        let Some(port) = state.port.as_mut() else {
            return Err(ChannelError::Closed);
        };
        let result = exchange(port, command, self.read_timeout).await;
        state.owes_reply = false;

        match result {
            Ok(reply) => Ok(reply),
            Err(err) => {
                tracing::warn!(error = %err, command, "Channel failure, re-acquiring");
                state.port = None;
                if let Err(reconnect_err) = self.reconnect(&mut state).await {
                    tracing::warn!(error = %reconnect_err, "Re-acquisition failed, next caller retries");
                }
                Err(err)
            }
        }
    }

    /// Number of times a channel was acquired, including the initial open.
    pub async fn connections(&self) -> u64 {
        self.state.lock().await.connections
    }

    /// Identity of the underlying channel, for logs.
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Consume the reply of a round trip whose caller was cancelled.
    ///
    /// If the line does not arrive within the read timeout the port is
    /// dropped, and the caller reconnects before writing.
    async fn settle_abandoned(&self, state: &mut GateState) {
        if let Some(port) = state.port.as_mut() {
            let mut raw = Vec::with_capacity(256);
            match tokio::time::timeout(self.read_timeout, port.read_until(b'\n', &mut raw)).await {
                Ok(Ok(n)) if n > 0 => {
                    tracing::debug!(discarded = n, "Discarded reply of cancelled round trip");
                }
                _ => {
                    tracing::warn!("Reply of cancelled round trip never arrived, re-acquiring");
                    state.port = None;
                }
            }
        }
        state.owes_reply = false;
    }

    async fn reconnect(&self, state: &mut GateState) -> Result<(), ChannelError> {
        let port = self.connector.connect().await?;
        state.port = Some(BufReader::new(port));
        state.connections += 1;
        tracing::info!(
            channel = %self.connector.describe(),
            connections = state.connections,
            "Device channel re-acquired"
        );
        Ok(())
    }
}

async fn exchange(
    port: &mut BufReader<DynSerial>,
    command: &str,
    read_timeout: Duration,
) -> Result<String, ChannelError> {
    let discarded = discard_pending(port);
    if discarded > 0 {
        tracing::debug!(discarded, "Discarded stale bytes before command");
    }

    let writer = port.get_mut();
    writer
        .write_all(command.as_bytes())
        .await
        .map_err(ChannelError::Write)?;
    writer.flush().await.map_err(ChannelError::Write)?;

    let mut raw = Vec::with_capacity(256);
    let n = tokio::time::timeout(read_timeout, port.read_until(b'\n', &mut raw))
        .await
        .map_err(|_| ChannelError::ReadTimeout(read_timeout))?
        .map_err(ChannelError::Read)?;
    if n == 0 {
        return Err(ChannelError::Closed);
    }

    let line = String::from_utf8(raw).map_err(|_| ChannelError::NotUtf8)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Drop buffered bytes and anything the device already sent, without waiting.
fn discard_pending(port: &mut BufReader<DynSerial>) -> usize {
    let buffered = port.buffer().len();
    port.consume(buffered);

    let mut total = buffered;
    let mut scratch = [0u8; 256];
    while let Some(Ok(n)) = port.get_mut().read(&mut scratch).now_or_never() {
        if n == 0 {
            break;
        }
        total += n;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::DuplexStream;

    /// Device that answers each `<...>` command with `ACK:<...>`.
    fn spawn_echo(mut device: DuplexStream) {
        tokio::spawn(async move {
            let mut pending = Vec::new();
            let mut buf = [0u8; 64];
            loop {
                let n = match device.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Some(end) = pending.iter().position(|b| *b == b'>') {
                    let cmd: Vec<u8> = pending.drain(..=end).collect();
                    let mut reply = b"ACK:".to_vec();
                    reply.extend_from_slice(&cmd);
                    reply.extend_from_slice(b"\r\n");
                    if device.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    struct EchoConnector {
        connects: AtomicU32,
        silent_first: bool,
    }

    #[async_trait]
    impl ChannelConnector for EchoConnector {
        async fn connect(&self) -> Result<DynSerial, ChannelError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            let (host, device) = tokio::io::duplex(256);
            if self.silent_first && n == 0 {
                // Keep the device end alive but never answer.
                tokio::spawn(async move {
                    let _device = device;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            } else {
                spawn_echo(device);
            }
            Ok(Box::new(host))
        }

        fn describe(&self) -> String {
            "echo".into()
        }
    }

    #[tokio::test]
    async fn round_trip_returns_reply_without_line_ending() {
        let connector = Arc::new(EchoConnector {
            connects: AtomicU32::new(0),
            silent_first: false,
        });
        let gate = ChannelGate::open(connector, DEFAULT_READ_TIMEOUT).await.unwrap();
        let reply = gate.round_trip("<GET_ALL;>").await.unwrap();
        assert_eq!(reply, "ACK:<GET_ALL;>");
        assert_eq!(gate.connections().await, 1);
    }

    #[tokio::test]
    async fn timeout_reports_error_and_reacquires() {
        let connector = Arc::new(EchoConnector {
            connects: AtomicU32::new(0),
            silent_first: true,
        });
        let gate = ChannelGate::open(connector, Duration::from_millis(50))
            .await
            .unwrap();

        let err = gate.round_trip("<GET_ALL;>").await.unwrap_err();
        assert!(matches!(err, ChannelError::ReadTimeout(_)));
        assert_eq!(gate.connections().await, 2);

        let reply = gate.round_trip("<GET_ALL;>").await.unwrap();
        assert_eq!(reply, "ACK:<GET_ALL;>");
    }

    #[tokio::test]
    async fn stale_bytes_are_discarded_before_command() {
        let (host, mut device) = tokio::io::duplex(256);
        let mut port: BufReader<DynSerial> = BufReader::new(Box::new(host));
        device.write_all(b"late reply\n").await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(discard_pending(&mut port), 11);
        assert_eq!(discard_pending(&mut port), 0);
    }
}
