//! Background telemetry: one snapshot per interval, forwarded to the sink.
//!
//! A cycle never fails the loop. Decode failures skip the cycle, channel
//! failures are left to the gate's reconnection, and sink failures are logged.

use crate::hardware::gate::ChannelGate;
use crate::protocol::codec::{FrameCodec, SNAPSHOT_COMMAND};
use crate::storage::TelemetrySink;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

/// Default measurement name for telemetry points.
pub const DEFAULT_MEASUREMENT: &str = "outputs";

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryStats {
    /// Cycles started.
    pub cycles: u64,
    /// Frames written to the sink.
    pub forwarded: u64,
    /// Replies that were not a valid frame.
    pub decode_failures: u64,
    /// Round trips that failed on the channel.
    pub channel_failures: u64,
    /// Frames the sink failed to store.
    pub sink_failures: u64,
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The frame reached the sink.
    Forwarded,
    /// The reply was not a valid frame; nothing was written.
    DecodeFailed,
    /// The round trip failed.
    ChannelFailed,
    /// The sink refused the point.
    SinkFailed,
}

/// Polls the device at a fixed interval and forwards each frame to a sink.
pub struct TelemetryLoop {
    gate: Arc<ChannelGate>,
    codec: FrameCodec,
    sink: Arc<dyn TelemetrySink>,
    interval: Duration,
    measurement: String,
}

impl TelemetryLoop {
    /// Loop reading through `gate` every `interval`.
    pub fn new(
        gate: Arc<ChannelGate>,
        codec: FrameCodec,
        sink: Arc<dyn TelemetrySink>,
        interval: Duration,
    ) -> Self {
        Self {
            gate,
            codec,
            sink,
            interval,
            measurement: DEFAULT_MEASUREMENT.to_string(),
        }
    }

    /// Override the measurement name.
    pub fn with_measurement(mut self, measurement: impl Into<String>) -> Self {
        self.measurement = measurement.into();
        self
    }

    /// Run one cycle: snapshot, decode, forward.
    pub async fn cycle(&self, stats: &mut TelemetryStats) -> CycleOutcome {
        stats.cycles += 1;

        let reply = match self.gate.round_trip(SNAPSHOT_COMMAND).await {
            Ok(reply) => reply,
            Err(err) => {
                stats.channel_failures += 1;
                tracing::warn!(error = %err, "Telemetry snapshot failed, retrying next cycle");
                return CycleOutcome::ChannelFailed;
            }
        };

        let frame = match self.codec.decode(&reply) {
            Ok(frame) => frame,
            Err(err) => {
                stats.decode_failures += 1;
                tracing::warn!(error = %err, len = reply.len(), "Invalid telemetry frame, skipping cycle");
                return CycleOutcome::DecodeFailed;
            }
        };

        let point = frame.into_point(&self.measurement, Utc::now());
        match self.sink.write_point(&point).await {
            Ok(()) => {
                stats.forwarded += 1;
                CycleOutcome::Forwarded
            }
            Err(err) => {
                stats.sink_failures += 1;
                tracing::error!(sink = self.sink.name(), error = %err, "Failed to write telemetry point");
                CycleOutcome::SinkFailed
            }
        }
    }

    /// Start the loop on its own task.
    pub fn spawn(self) -> TelemetryHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        TelemetryHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> TelemetryStats {
        tracing::info!(
            interval = ?self.interval,
            sink = self.sink.name(),
            channel = %self.gate.describe(),
            "Telemetry loop started"
        );
        let mut stats = TelemetryStats::default();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.cycle(&mut stats).await;
                }
            }
        }
        tracing::info!(?stats, "Telemetry loop stopped");
        stats
    }
}

/// Controls a running [`TelemetryLoop`].
pub struct TelemetryHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<TelemetryStats>,
}

impl TelemetryHandle {
    /// Signal shutdown and wait for the current cycle to finish.
    pub async fn stop(self) -> Result<TelemetryStats, JoinError> {
        let _ = self.shutdown.send(());
        self.task.await
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::gate::DEFAULT_READ_TIMEOUT;
    use crate::hardware::simulator::{SimulatedConnector, SimulatedDevice};
    use crate::storage::MemorySink;

    async fn telemetry(device: SimulatedDevice, sink: Arc<MemorySink>) -> TelemetryLoop {
        let gate = ChannelGate::open(
            Arc::new(SimulatedConnector::new(device)),
            DEFAULT_READ_TIMEOUT,
        )
        .await
        .unwrap();
        TelemetryLoop::new(
            Arc::new(gate),
            FrameCodec::default(),
            sink,
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn valid_frame_is_forwarded_with_measurement() {
        let device = SimulatedDevice::new();
        device.set_field("V03", 0xab);
        let sink = Arc::new(MemorySink::new());
        let telemetry = telemetry(device, sink.clone()).await.with_measurement("graphite");

        let mut stats = TelemetryStats::default();
        assert_eq!(telemetry.cycle(&mut stats).await, CycleOutcome::Forwarded);

        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "graphite");
        assert_eq!(points[0].fields["V03"], 0xab);
        assert_eq!(points[0].fields.len(), 28);
    }

    #[tokio::test]
    async fn garbled_frame_skips_cycle() {
        let device = SimulatedDevice::new();
        device.garble_next(1);
        let sink = Arc::new(MemorySink::new());
        let telemetry = telemetry(device, sink.clone()).await;

        let mut stats = TelemetryStats::default();
        assert_eq!(telemetry.cycle(&mut stats).await, CycleOutcome::DecodeFailed);
        assert!(sink.is_empty());
        assert_eq!(telemetry.cycle(&mut stats).await, CycleOutcome::Forwarded);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.forwarded, 1);
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_loop() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(2);
        let handle = telemetry(SimulatedDevice::new(), sink.clone()).await.spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = handle.stop().await.unwrap();

        assert_eq!(stats.sink_failures, 2);
        assert!(stats.forwarded >= 1);
        assert_eq!(stats.forwarded as usize, sink.len());
    }
}
