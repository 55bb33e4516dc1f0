//! Write confirmation.
//!
//! After a write is sent the controller gives no acknowledgement beyond its
//! next snapshot, so "accepted" means "a later frame shows the effect":
//!
//! ```text
//! Sent ──► Polling ──► Confirmed(frame)
//!              │  └──► Rejected(reason)
//!              └─────► TimedOut
//! ```
//!
//! | Policy        | Done when                          | Poll delay |
//! |---------------|------------------------------------|------------|
//! | `MatchValue`  | frame[field] == requested value    | 50 ms      |
//! | `MatchState`  | frame[field] == toggle's target    | 80 ms      |
//! | `Snapshot`    | any fresh valid frame              | 20 ms      |
//!
//! Channel and decode failures while polling are transient: they use up one
//! attempt and polling continues. The whole confirmation runs under a
//! [`RetryBudget`]; dropping the future cancels it.

use crate::hardware::gate::ChannelGate;
use crate::protocol::codec::{FrameCodec, SNAPSHOT_COMMAND};
use crate::protocol::frame::Frame;
use crate::protocol::registry::{ConfirmationPolicy, ValidatedCommand};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Limits on how long a confirmation may run. `None` means unlimited.
///
/// In configuration files a limit of `0` (`max_attempts = 0`, `deadline = "0s"`)
/// stands for `None`, since TOML has no null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    /// Maximum channel round trips, including the write itself.
    #[serde(default = "default_max_attempts", with = "zero_is_unlimited::attempts")]
    pub max_attempts: Option<u32>,
    /// Wall-clock limit for the whole confirmation.
    #[serde(default = "default_deadline", with = "zero_is_unlimited::deadline")]
    pub deadline: Option<Duration>,
}

mod zero_is_unlimited {
    pub mod attempts {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_u32(value.unwrap_or(0))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
            let n = u32::deserialize(d)?;
            Ok((n != 0).then_some(n))
        }
    }

    pub mod deadline {
        use serde::{Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            humantime_serde::serialize(&value.unwrap_or(Duration::ZERO), s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            let limit: Duration = humantime_serde::deserialize(d)?;
            Ok((!limit.is_zero()).then_some(limit))
        }
    }
}

fn default_max_attempts() -> Option<u32> {
    Some(200)
}

fn default_deadline() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            deadline: default_deadline(),
        }
    }
}

impl RetryBudget {
    /// Retry until the device shows the effect, however long that takes.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            deadline: None,
        }
    }
}

/// Delays between confirmation steps, plus the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationSchedule {
    /// Pause between sending a write and the first poll.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Pause between level polls.
    #[serde(default = "default_level_poll_delay", with = "humantime_serde")]
    pub level_poll_delay: Duration,
    /// Toggles drive a pump relay and settle more slowly than levels.
    #[serde(default = "default_toggle_poll_delay", with = "humantime_serde")]
    pub toggle_poll_delay: Duration,
    /// Pause after an invalid snapshot before asking again.
    #[serde(default = "default_snapshot_retry_delay", with = "humantime_serde")]
    pub snapshot_retry_delay: Duration,
    /// Limits on the whole confirmation.
    #[serde(default)]
    pub budget: RetryBudget,
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_level_poll_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_toggle_poll_delay() -> Duration {
    Duration::from_millis(80)
}

fn default_snapshot_retry_delay() -> Duration {
    Duration::from_millis(20)
}

impl Default for ConfirmationSchedule {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
            level_poll_delay: default_level_poll_delay(),
            toggle_poll_delay: default_toggle_poll_delay(),
            snapshot_retry_delay: default_snapshot_retry_delay(),
            budget: RetryBudget::default(),
        }
    }
}

/// Terminal state of a confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// A frame showing the intended effect (or, for snapshots, any valid frame).
    Confirmed(Frame),
    /// The device can never show the effect.
    Rejected(String),
    /// The budget ran out first.
    TimedOut {
        /// Round trips used.
        attempts: u32,
    },
}

impl ConfirmationOutcome {
    /// True for [`ConfirmationOutcome::Confirmed`].
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmationOutcome::Confirmed(_))
    }
}

struct Attempts {
    used: u32,
    max: Option<u32>,
}

impl Attempts {
    fn new(budget: &RetryBudget) -> Self {
        Self {
            used: 0,
            max: budget.max_attempts,
        }
    }

    fn take(&mut self) -> bool {
        if self.max.is_some_and(|max| self.used >= max) {
            return false;
        }
        self.used += 1;
        true
    }
}

/// What a poll is waiting for.
#[derive(Debug, Clone, Copy)]
struct Expectation<'a> {
    field: &'a str,
    value: i64,
}

enum Verdict {
    Matched,
    Mismatch(i64),
    Missing,
}

impl Expectation<'_> {
    fn check(&self, frame: &Frame) -> Verdict {
        match frame.get(self.field) {
            Some(v) if v == self.value => Verdict::Matched,
            Some(v) => Verdict::Mismatch(v),
            None => Verdict::Missing,
        }
    }
}

/// Runs the confirmation state machine over the shared [`ChannelGate`].
pub struct ConfirmationEngine {
    gate: Arc<ChannelGate>,
    codec: FrameCodec,
    schedule: ConfirmationSchedule,
}

impl ConfirmationEngine {
    /// Engine polling through `gate`.
    pub fn new(gate: Arc<ChannelGate>, codec: FrameCodec, schedule: ConfirmationSchedule) -> Self {
        Self {
            gate,
            codec,
            schedule,
        }
    }

    /// Delays and budget in use.
    pub fn schedule(&self) -> &ConfirmationSchedule {
        &self.schedule
    }

    /// Send `command` and wait until its effect is observed.
    #[instrument(skip(self, command), fields(command = %command))]
    pub async fn confirm(&self, command: &ValidatedCommand) -> ConfirmationOutcome {
        let mut attempts = Attempts::new(&self.schedule.budget);
        let outcome = self
            .within_deadline(self.run(command, &mut attempts))
            .await;
        outcome.unwrap_or(ConfirmationOutcome::TimedOut {
            attempts: attempts.used,
        })
    }

    /// Read one fresh valid frame, retrying invalid replies within the budget.
    #[instrument(skip(self))]
    pub async fn fresh_frame(&self) -> ConfirmationOutcome {
        let mut attempts = Attempts::new(&self.schedule.budget);
        let outcome = self
            .within_deadline(self.poll(&mut attempts, None, self.schedule.snapshot_retry_delay))
            .await;
        outcome.unwrap_or(ConfirmationOutcome::TimedOut {
            attempts: attempts.used,
        })
    }

    /// `None` when the deadline passed first.
    async fn within_deadline(
        &self,
        work: impl std::future::Future<Output = ConfirmationOutcome>,
    ) -> Option<ConfirmationOutcome> {
        match self.schedule.budget.deadline {
            Some(limit) => tokio::time::timeout_at(Instant::now() + limit, work)
                .await
                .ok(),
            None => Some(work.await),
        }
    }

    async fn run(&self, command: &ValidatedCommand, attempts: &mut Attempts) -> ConfirmationOutcome {
        let line = self.codec.encode_command(command);

        // Sent: a write that did not complete as a round trip is resent.
        let reply = loop {
            if !attempts.take() {
                return ConfirmationOutcome::TimedOut {
                    attempts: attempts.used,
                };
            }
            match self.gate.round_trip(&line).await {
                Ok(reply) => break reply,
                Err(err) => {
                    tracing::warn!(error = %err, command = %line, "Command not delivered, resending");
                    tokio::time::sleep(self.schedule.settle_delay).await;
                }
            }
        };
        tracing::info!(command = %line, "Command sent");

        let (expectation, delay) = match command.policy() {
            ConfirmationPolicy::Snapshot => {
                tokio::time::sleep(self.schedule.settle_delay).await;
                return self
                    .poll(attempts, None, self.schedule.snapshot_retry_delay)
                    .await;
            }
            ConfirmationPolicy::MatchValue { field } => {
                let Some(value) = command.value() else {
                    return ConfirmationOutcome::Rejected(format!(
                        "{} has no value to confirm",
                        command.name()
                    ));
                };
                (
                    Expectation {
                        field: field.as_str(),
                        value,
                    },
                    self.schedule.level_poll_delay,
                )
            }
            ConfirmationPolicy::MatchState { field, expected } => (
                Expectation {
                    field: field.as_str(),
                    value: *expected,
                },
                self.schedule.toggle_poll_delay,
            ),
        };

        // The reply to the write is the first observation.
        if let Ok(frame) = self.codec.decode(&reply) {
            if let Some(outcome) = self.evaluate(frame, expectation) {
                return outcome;
            }
        }

        tokio::time::sleep(self.schedule.settle_delay).await;
        self.poll(attempts, Some(expectation), delay).await
    }

    /// Polling: request snapshots until `expectation` holds (or any valid frame, if `None`).
    async fn poll(
        &self,
        attempts: &mut Attempts,
        expectation: Option<Expectation<'_>>,
        delay: Duration,
    ) -> ConfirmationOutcome {
        loop {
            if !attempts.take() {
                return ConfirmationOutcome::TimedOut {
                    attempts: attempts.used,
                };
            }

            match self.gate.round_trip(SNAPSHOT_COMMAND).await {
                Ok(reply) => match self.codec.decode(&reply) {
                    Ok(frame) => match expectation {
                        None => return ConfirmationOutcome::Confirmed(frame),
                        Some(expectation) => {
                            if let Some(outcome) = self.evaluate(frame, expectation) {
                                return outcome;
                            }
                        }
                    },
                    Err(err) => {
                        tracing::debug!(error = %err, attempt = attempts.used, "Invalid snapshot, reading again");
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, attempt = attempts.used, "Snapshot round trip failed");
                }
            }

            tokio::time::sleep(delay).await;
        }
    }

    /// `None` means keep polling.
    fn evaluate(&self, frame: Frame, expectation: Expectation<'_>) -> Option<ConfirmationOutcome> {
        match expectation.check(&frame) {
            Verdict::Matched => {
                tracing::info!(field = expectation.field, value = expectation.value, "Valid response received");
                Some(ConfirmationOutcome::Confirmed(frame))
            }
            Verdict::Mismatch(observed) => {
                tracing::debug!(
                    field = expectation.field,
                    observed,
                    expected = expectation.value,
                    "Response does not match yet, reading again"
                );
                None
            }
            Verdict::Missing => Some(ConfirmationOutcome::Rejected(format!(
                "device does not report field {}",
                expectation.field
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::gate::DEFAULT_READ_TIMEOUT;
    use crate::hardware::simulator::{SimulatedConnector, SimulatedDevice};
    use crate::protocol::registry::ParameterRegistry;

    fn fast_schedule(budget: RetryBudget) -> ConfirmationSchedule {
        ConfirmationSchedule {
            settle_delay: Duration::from_millis(1),
            level_poll_delay: Duration::from_millis(1),
            toggle_poll_delay: Duration::from_millis(1),
            snapshot_retry_delay: Duration::from_millis(1),
            budget,
        }
    }

    async fn engine_for(device: SimulatedDevice, budget: RetryBudget) -> ConfirmationEngine {
        let connector = Arc::new(SimulatedConnector::new(device));
        let gate = ChannelGate::open(connector, DEFAULT_READ_TIMEOUT).await.unwrap();
        ConfirmationEngine::new(Arc::new(gate), FrameCodec::default(), fast_schedule(budget))
    }

    #[test]
    fn attempts_respect_budget() {
        let mut attempts = Attempts::new(&RetryBudget {
            max_attempts: Some(2),
            deadline: None,
        });
        assert!(attempts.take());
        assert!(attempts.take());
        assert!(!attempts.take());
        assert_eq!(attempts.used, 2);

        let mut unbounded = Attempts::new(&RetryBudget::unbounded());
        for _ in 0..1000 {
            assert!(unbounded.take());
        }
    }

    #[tokio::test]
    async fn level_write_confirmed_from_write_reply() {
        let device = SimulatedDevice::new();
        let engine = engine_for(device.clone(), RetryBudget::default()).await;
        let command = ParameterRegistry::new().validate("V00", Some("255")).unwrap();

        let outcome = engine.confirm(&command).await;
        let ConfirmationOutcome::Confirmed(frame) = outcome else {
            panic!("expected confirmation, got {outcome:?}");
        };
        assert_eq!(frame.get("V00"), Some(255));
        assert_eq!(device.received(), vec!["<SET_V00=255;>".to_string()]);
    }

    #[tokio::test]
    async fn level_write_polls_until_device_settles() {
        let device = SimulatedDevice::new().with_settle_polls(3);
        let engine = engine_for(device.clone(), RetryBudget::default()).await;
        let command = ParameterRegistry::new().validate("V04", Some("17")).unwrap();

        assert!(engine.confirm(&command).await.is_confirmed());
        let polls = device
            .received()
            .iter()
            .filter(|c| c.as_str() == SNAPSHOT_COMMAND)
            .count();
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn missing_field_is_rejected() {
        let device = SimulatedDevice::new();
        device.remove_field("V08");
        device.set_field("X01", 0);
        let engine = engine_for(device, RetryBudget::default()).await;
        let command = ParameterRegistry::new().validate("V08", Some("3")).unwrap();

        assert!(matches!(
            engine.confirm(&command).await,
            ConfirmationOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn deadline_bounds_unreachable_target() {
        let device = SimulatedDevice::new().with_settle_polls(u32::MAX);
        let engine = engine_for(
            device,
            RetryBudget {
                max_attempts: None,
                deadline: Some(Duration::from_millis(100)),
            },
        )
        .await;
        let command = ParameterRegistry::new().validate("V01", Some("9")).unwrap();

        assert!(matches!(
            engine.confirm(&command).await,
            ConfirmationOutcome::TimedOut { .. }
        ));
    }

    #[tokio::test]
    async fn fresh_frame_skips_invalid_replies() {
        let device = SimulatedDevice::new();
        device.garble_next(2);
        let engine = engine_for(device.clone(), RetryBudget::default()).await;

        assert!(engine.fresh_frame().await.is_confirmed());
        assert_eq!(device.received().len(), 3);
    }
}
