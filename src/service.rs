//! Request-layer operations: confirmed writes and snapshots.

use crate::confirmation::{ConfirmationEngine, ConfirmationOutcome};
use crate::error::{AppResult, ServiceError};
use crate::protocol::frame::Frame;
use crate::protocol::registry::ParameterRegistry;
use crate::storage::TelemetrySink;
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

/// Validates, sends, and confirms writes; every confirmed frame is also persisted.
pub struct DeviceService {
    registry: Arc<ParameterRegistry>,
    engine: ConfirmationEngine,
    sink: Arc<dyn TelemetrySink>,
    measurement: String,
}

impl DeviceService {
    /// Service persisting confirmed frames to `sink` under `measurement`.
    pub fn new(
        registry: Arc<ParameterRegistry>,
        engine: ConfirmationEngine,
        sink: Arc<dyn TelemetrySink>,
        measurement: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            engine,
            sink,
            measurement: measurement.into(),
        }
    }

    /// Registry used for validation.
    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// `Set(parameter, value?)`. Validation failures never reach the channel.
    #[instrument(skip(self))]
    pub async fn set(&self, parameter: &str, value: Option<&str>) -> AppResult<Frame> {
        let command = self.registry.validate(parameter, value)?;
        let frame = into_frame(self.engine.confirm(&command).await)?;
        self.persist(&frame).await;
        Ok(frame)
    }

    /// `GetSnapshot()`: one fresh valid frame.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> AppResult<Frame> {
        into_frame(self.engine.fresh_frame().await)
    }

    async fn persist(&self, frame: &Frame) {
        let point = frame.clone().into_point(&self.measurement, Utc::now());
        if let Err(err) = self.sink.write_point(&point).await {
            tracing::error!(sink = self.sink.name(), error = %err, "Failed to write confirmed frame");
        }
    }
}

fn into_frame(outcome: ConfirmationOutcome) -> AppResult<Frame> {
    match outcome {
        ConfirmationOutcome::Confirmed(frame) => Ok(frame),
        ConfirmationOutcome::Rejected(reason) => Err(ServiceError::Rejected(reason)),
        ConfirmationOutcome::TimedOut { attempts } => Err(ServiceError::TimedOut { attempts }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::{ConfirmationSchedule, RetryBudget};
    use crate::error::ValidationError;
    use crate::hardware::gate::{ChannelGate, DEFAULT_READ_TIMEOUT};
    use crate::hardware::simulator::{SimulatedConnector, SimulatedDevice};
    use crate::protocol::codec::FrameCodec;
    use crate::storage::MemorySink;
    use std::time::Duration;

    async fn service(device: SimulatedDevice, sink: Arc<MemorySink>) -> DeviceService {
        let gate = ChannelGate::open(
            Arc::new(SimulatedConnector::new(device)),
            DEFAULT_READ_TIMEOUT,
        )
        .await
        .unwrap();
        let schedule = ConfirmationSchedule {
            settle_delay: Duration::from_millis(1),
            level_poll_delay: Duration::from_millis(1),
            toggle_poll_delay: Duration::from_millis(1),
            snapshot_retry_delay: Duration::from_millis(1),
            budget: RetryBudget {
                max_attempts: Some(5),
                deadline: None,
            },
        };
        let engine = ConfirmationEngine::new(Arc::new(gate), FrameCodec::default(), schedule);
        DeviceService::new(Arc::new(ParameterRegistry::new()), engine, sink, "outputs")
    }

    #[tokio::test]
    async fn confirmed_write_is_persisted() {
        let sink = Arc::new(MemorySink::new());
        let service = service(SimulatedDevice::new(), sink.clone()).await;

        let frame = service.set("PUMP_ON", None).await.unwrap();
        assert_eq!(frame.get("PUMP"), Some(1));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.points()[0].fields["PUMP"], 1);
    }

    #[tokio::test]
    async fn invalid_value_never_reaches_device() {
        let device = SimulatedDevice::new();
        let sink = Arc::new(MemorySink::new());
        let service = service(device.clone(), sink.clone()).await;

        let err = service.set("T01", Some("1000")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::OutOfRange { .. })
        ));
        assert!(device.received().is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_timeout() {
        let device = SimulatedDevice::new().with_settle_polls(u32::MAX);
        let service = service(device, Arc::new(MemorySink::new())).await;

        let err = service.set("V02", Some("7")).await.unwrap_err();
        assert!(matches!(err, ServiceError::TimedOut { attempts: 5 }));
    }

    #[tokio::test]
    async fn snapshot_is_not_persisted() {
        let sink = Arc::new(MemorySink::new());
        let service = service(SimulatedDevice::new(), sink.clone()).await;

        let frame = service.snapshot().await.unwrap();
        assert_eq!(frame.len(), 28);
        assert!(sink.is_empty());
    }
}
