//! Shared test doubles for the integration tests.
#![allow(dead_code, clippy::unwrap_used, missing_docs)]

use async_trait::async_trait;
use graphitizer::confirmation::{ConfirmationSchedule, RetryBudget};
use graphitizer::error::ChannelError;
use graphitizer::hardware::{ChannelConnector, DynSerial, SimulatedDevice};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Schedule with 1 ms delays so tests run fast.
pub fn fast_schedule(budget: RetryBudget) -> ConfirmationSchedule {
    ConfirmationSchedule {
        settle_delay: Duration::from_millis(1),
        level_poll_delay: Duration::from_millis(1),
        toggle_poll_delay: Duration::from_millis(1),
        snapshot_retry_delay: Duration::from_millis(1),
        budget,
    }
}

/// Power-on frame with `changes` applied, in wire format.
pub fn frame_line(changes: &[(&str, i64)]) -> String {
    let device = SimulatedDevice::new();
    for (field, value) in changes {
        device.set_field(field, *value);
    }
    device.frame_line()
}

/// A well-formed looking line with only 20 `name=value;` segments.
pub fn twenty_segment_line() -> String {
    (0..20).map(|i| format!("V{:02}=ffff;", i)).collect()
}

/// Answers each command with the next scripted line; the last line repeats.
pub struct ScriptedConnector {
    script: Arc<Mutex<VecDeque<String>>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Arc::new(Mutex::new(lines.into_iter().map(Into::into).collect())),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl ChannelConnector for ScriptedConnector {
    async fn connect(&self) -> Result<DynSerial, ChannelError> {
        let (host, mut device) = tokio::io::duplex(1024);
        let script = self.script.clone();
        let received = self.received.clone();
        tokio::spawn(async move {
            let mut pending = Vec::new();
            let mut buf = [0u8; 128];
            loop {
                let n = match device.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Some(end) = pending.iter().position(|b| *b == b'>') {
                    let raw: Vec<u8> = pending.drain(..=end).collect();
                    received.lock().push(String::from_utf8_lossy(&raw).to_string());
                    let line = {
                        let mut script = script.lock();
                        if script.len() > 1 {
                            script.pop_front()
                        } else {
                            script.front().cloned()
                        }
                    };
                    let Some(line) = line else { continue };
                    let reply = format!("{line}\r\n");
                    if device.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(Box::new(host))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
