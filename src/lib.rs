//! # Graphitizer Middleware
//!
//! Sits between the graphitizer microcontroller (reached over a USB serial
//! line) and its user interface. It serves confirmed writes and snapshots
//! over HTTP and forwards one telemetry frame per second to InfluxDB.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: the parameter registry, the `Frame` value type, and the
//!   line codec (`FrameCodec`). No I/O.
//! - **`hardware`**: `ChannelGate`, the mutex-guarded owner of the one device
//!   channel, plus serial port discovery and an in-memory simulator.
//! - **`confirmation`**: the `ConfirmationEngine` state machine that polls until a
//!   write is observed, under a `RetryBudget`.
//! - **`telemetry`**: the background `TelemetryLoop`.
//! - **`storage`**: the `TelemetrySink` trait and its InfluxDB, memory and log sinks.
//! - **`service`**: `DeviceService`, the `Set`/`GetSnapshot` operations.
//! - **`api`**: the axum HTTP front end.
//! - **`config`**: figment-based `Settings`.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: one `thiserror` enum per layer.

pub mod api;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod storage;
pub mod telemetry;
