//! Persistence sinks for telemetry points.
//!
//! The telemetry loop writes one point per cycle and the service writes one per
//! confirmed write. Nothing reads back from a sink.

pub mod influx;

use crate::error::SinkError;
use crate::protocol::frame::TelemetryPoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

pub use influx::{to_line_protocol, InfluxSink};

/// A destination for telemetry points.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Persist one point. Errors are reported to the caller, which logs them.
    async fn write_point(&self, point: &TelemetryPoint) -> Result<(), SinkError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Keeps every point in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<Vec<TelemetryPoint>>,
    fail_next: AtomicU32,
}

impl MemorySink {
    /// Empty sink that accepts every write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` writes with a 503.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.fetch_add(count, Ordering::SeqCst);
    }

    /// Points written so far, oldest first.
    pub fn points(&self) -> Vec<TelemetryPoint> {
        self.points.lock().clone()
    }

    /// Number of points written.
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    /// True until the first write succeeds.
    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn write_point(&self, point: &TelemetryPoint) -> Result<(), SinkError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Rejected {
                status: 503,
                body: "memory sink unavailable".to_string(),
            });
        }
        self.points.lock().push(point.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Logs points at debug level instead of storing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn write_point(&self, point: &TelemetryPoint) -> Result<(), SinkError> {
        tracing::debug!(point = %to_line_protocol(point), "Telemetry point");
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
