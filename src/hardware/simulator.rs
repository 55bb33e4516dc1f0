//! In-process controller simulator.
//!
//! `SimulatedDevice` speaks the same line protocol as the board, over a
//! `tokio::io::duplex` pair instead of a serial port. It is used by the test
//! suite and by `graphitizer --simulate` for running without hardware.
//!
//! Behaviour:
//! - `<GET_ALL;>` answers with a full 28-field frame
//! - `<SET_Xnn=V;>`, `<PUMP_ON;>`, `<PUMP_OFF;>` are accepted, take effect after
//!   `settle_polls` further commands, and are answered with the current frame
//! - anything else is answered with a short invalid line
//!
//! # Example
//!
//! ```rust,ignore
//! use graphitizer::hardware::simulator::{SimulatedConnector, SimulatedDevice};
//!
//! let device = SimulatedDevice::new().with_settle_polls(2);
//! let gate = ChannelGate::open(Arc::new(SimulatedConnector::new(device.clone())), timeout).await?;
//! ```

use crate::error::ChannelError;
use crate::hardware::gate::ChannelConnector;
use crate::hardware::serial::DynSerial;
use crate::protocol::codec::FrameCodec;
use crate::protocol::registry::PUMP_STATE_FIELD;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Reply sent for commands the controller does not understand.
pub const UNKNOWN_COMMAND_REPLY: &str = "ERR;";

#[derive(Debug)]
struct PendingWrite {
    field: String,
    value: i64,
    commands_left: u32,
}

#[derive(Debug)]
struct DeviceState {
    fields: IndexMap<String, i64>,
    pending: Vec<PendingWrite>,
    received: Vec<String>,
    settle_polls: u32,
    garbled_replies: u32,
    silent_replies: u32,
}

/// Shared handle to one simulated controller.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
    reply_delay: Duration,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Controller in its power-on state: levels 0, thresholds 0, readings 20, pump off.
    pub fn new() -> Self {
        let mut fields = IndexMap::new();
        for i in 0..=8 {
            fields.insert(format!("V{:02}", i), 0);
        }
        for i in 1..=8 {
            fields.insert(format!("T{:02}", i), 0);
        }
        for i in 1..=8 {
            fields.insert(format!("R{:02}", i), 20);
        }
        fields.insert("S01".to_string(), 0);
        fields.insert("S02".to_string(), 0);
        fields.insert(PUMP_STATE_FIELD.to_string(), 0);

        Self {
            state: Arc::new(Mutex::new(DeviceState {
                fields,
                pending: Vec::new(),
                received: Vec::new(),
                settle_polls: 0,
                garbled_replies: 0,
                silent_replies: 0,
            })),
            reply_delay: Duration::ZERO,
        }
    }

    /// Writes become visible only after this many further commands.
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.state.lock().settle_polls = polls;
        self
    }

    /// Delay before each reply.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Corrupt the next `count` replies (truncated frames).
    pub fn garble_next(&self, count: u32) {
        self.state.lock().garbled_replies += count;
    }

    /// Swallow the next `count` commands without replying.
    pub fn silence_next(&self, count: u32) {
        self.state.lock().silent_replies += count;
    }

    /// Change a field immediately, as if the hardware moved on its own.
    pub fn set_field(&self, field: &str, value: i64) {
        self.state.lock().fields.insert(field.to_string(), value);
    }

    /// Stop reporting `field`.
    pub fn remove_field(&self, field: &str) {
        self.state.lock().fields.shift_remove(field);
    }

    /// Current value of `field`.
    pub fn field(&self, field: &str) -> Option<i64> {
        self.state.lock().fields.get(field).copied()
    }

    /// Every command received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// Current frame in wire format.
    pub fn frame_line(&self) -> String {
        let state = self.state.lock();
        encode_fields(&state.fields)
    }

    /// Handle one command; `None` means no reply is sent.
    pub fn respond(&self, command: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.received.push(command.to_string());

        for write in &mut state.pending {
            write.commands_left = write.commands_left.saturating_sub(1);
        }
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|w| w.commands_left == 0);
        state.pending = waiting;
        for write in due {
            state.fields.insert(write.field, write.value);
        }

        let accepted = match parse_command(command) {
            Some(Command::Snapshot) => true,
            Some(Command::Set { field, value }) if state.fields.contains_key(&field) => {
                schedule(&mut state, field, value);
                true
            }
            Some(Command::Pump(on)) => {
                schedule(&mut state, PUMP_STATE_FIELD.to_string(), i64::from(on));
                true
            }
            _ => false,
        };

        if state.silent_replies > 0 {
            state.silent_replies -= 1;
            return None;
        }
        if !accepted {
            return Some(UNKNOWN_COMMAND_REPLY.to_string());
        }
        let line = encode_fields(&state.fields);
        if state.garbled_replies > 0 {
            state.garbled_replies -= 1;
            return Some(line[..line.len() / 2].to_string());
        }
        Some(line)
    }

    /// Serve the protocol on `stream` until it closes or `alive` returns false.
    async fn serve(self, mut stream: DuplexStream, alive: impl Fn() -> bool) {
        let mut pending = Vec::new();
        let mut buf = [0u8; 128];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);

            while let Some(end) = pending.iter().position(|b| *b == b'>') {
                let raw: Vec<u8> = pending.drain(..=end).collect();
                if !alive() {
                    return;
                }
                let command = String::from_utf8_lossy(&raw).trim().to_string();
                let Some(reply) = self.respond(&command) else {
                    continue;
                };
                if !self.reply_delay.is_zero() {
                    tokio::time::sleep(self.reply_delay).await;
                }
                let mut out = reply.into_bytes();
                out.extend_from_slice(b"\r\n");
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn schedule(state: &mut DeviceState, field: String, value: i64) {
    if state.settle_polls == 0 {
        state.fields.insert(field, value);
    } else {
        state.pending.retain(|w| w.field != field);
        state.pending.push(PendingWrite {
            field,
            value,
            commands_left: state.settle_polls,
        });
    }
}

fn encode_fields(fields: &IndexMap<String, i64>) -> String {
    FrameCodec::default().encode_reply(fields.iter().map(|(k, v)| (k.as_str(), *v)))
}

enum Command {
    Snapshot,
    Set { field: String, value: i64 },
    Pump(bool),
}

fn parse_command(command: &str) -> Option<Command> {
    let inner = command.strip_prefix('<')?.strip_suffix(";>")?;
    match inner {
        "GET_ALL" => Some(Command::Snapshot),
        "PUMP_ON" => Some(Command::Pump(true)),
        "PUMP_OFF" => Some(Command::Pump(false)),
        _ => {
            let (field, value) = inner.strip_prefix("SET_")?.split_once('=')?;
            Some(Command::Set {
                field: field.to_string(),
                value: value.parse().ok()?,
            })
        }
    }
}

/// [`ChannelConnector`] that attaches a fresh in-memory stream to a [`SimulatedDevice`].
pub struct SimulatedConnector {
    device: SimulatedDevice,
    connects: AtomicU32,
    refuse_next: AtomicU32,
    generation: Arc<AtomicU64>,
}

impl SimulatedConnector {
    /// Connector for `device`. Every connection shares its state.
    pub fn new(device: SimulatedDevice) -> Self {
        Self {
            device,
            connects: AtomicU32::new(0),
            refuse_next: AtomicU32::new(0),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The simulated controller.
    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }

    /// Fail the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_next.fetch_add(count, Ordering::SeqCst);
    }

    /// Drop every open stream at its next command, as if the cable were pulled.
    pub fn disconnect_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for SimulatedConnector {
    async fn connect(&self) -> Result<DynSerial, ChannelError> {
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Acquire("simulated device unplugged".into()));
        }

        let (host, device_end) = tokio::io::duplex(1024);
        let generation = self.generation.clone();
        let born = generation.load(Ordering::SeqCst);
        tokio::spawn(
            self.device
                .clone()
                .serve(device_end, move || generation.load(Ordering::SeqCst) == born),
        );
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(host))
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}
