//! Error types for the gateway.
//!
//! Each layer owns a `thiserror` enum so callers can decide, on the type alone,
//! whether a failure is final or transient:
//!
//! - **`ValidationError`**: an unknown parameter or a malformed/out-of-range value.
//!   Raised before anything touches the channel and never retried.
//! - **`DecodeError`**: a reply line that does not look like a full frame. Transient;
//!   the telemetry loop skips the cycle and confirmation keeps polling.
//! - **`ChannelError`**: a write/read failure on the device transport. The gate
//!   reconnects and the caller retries the whole round trip.
//! - **`SinkError`**: the time-series store refused or failed a write. Logged, never fatal.
//! - **`ServiceError`**: what the request layer sees after confirmation has run.
//! - **`ConfigError`**: configuration could not be loaded or is semantically wrong.
//!
//! Only construction-time failures (config, initial channel acquisition) abort the process.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the service error type.
pub type AppResult<T> = std::result::Result<T, ServiceError>;

/// Rejections produced by the parameter registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The name is not in the registry.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    /// A level or threshold was sent without a value.
    #[error("parameter '{name}' requires a value")]
    MissingValue {
        /// Parameter name.
        name: String,
    },

    /// A toggle was sent with a value.
    #[error("parameter '{name}' does not take a value (got '{value}')")]
    UnexpectedValue {
        /// Parameter name.
        name: String,
        /// The rejected value text.
        value: String,
    },

    /// The value text is not a base-10 integer.
    #[error("value '{value}' for '{name}' is not a decimal integer")]
    NotNumeric {
        /// Parameter name.
        name: String,
        /// The rejected value text.
        value: String,
    },

    /// The value parsed but lies outside the parameter's domain.
    #[error("value {value} for '{name}' is outside {min}..={max}")]
    OutOfRange {
        /// Parameter name.
        name: String,
        /// The parsed value.
        value: i64,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },
}

impl ValidationError {
    /// True when the parameter name itself was the problem (as opposed to its value).
    pub fn is_parameter_error(&self) -> bool {
        matches!(self, ValidationError::UnknownParameter(_))
    }
}

/// Reasons a reply line is not accepted as a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than a full frame, usually a truncated read.
    #[error("reply too short: {len} bytes (minimum {min})")]
    TooShort {
        /// Line length in bytes.
        len: usize,
        /// Configured minimum.
        min: usize,
    },

    /// Longer than any frame the controller sends.
    #[error("reply too long: {len} bytes (maximum {max})")]
    TooLong {
        /// Line length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The line does not begin with the first field.
    #[error("reply does not start with sentinel '{sentinel}'")]
    MissingSentinel {
        /// Expected prefix.
        sentinel: &'static str,
    },

    /// The line does not end in `;`.
    #[error("reply does not end with field terminator")]
    MissingTerminator,

    /// Too few `name=value;` segments for a full frame.
    #[error("reply has {found} well-formed fields (minimum {min})")]
    TooFewFields {
        /// Segments matching the field pattern.
        found: usize,
        /// Required count.
        min: usize,
    },

    /// A segment without `=`.
    #[error("malformed field segment '{0}'")]
    MalformedSegment(String),

    /// The value text does not parse in the field's base.
    #[error("field '{name}' has unparseable value '{value}'")]
    InvalidValue {
        /// Field name.
        name: String,
        /// Raw value text.
        value: String,
    },
}

/// Transport failures on the device channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No port could be opened or located.
    #[error("failed to acquire device channel: {0}")]
    Acquire(String),

    /// Writing or flushing the command failed.
    #[error("channel write failed: {0}")]
    Write(#[source] std::io::Error),

    /// Reading the reply failed.
    #[error("channel read failed: {0}")]
    Read(#[source] std::io::Error),

    /// End of stream, e.g. the cable was pulled.
    #[error("channel closed by device")]
    Closed,

    /// The reply line did not arrive within the read timeout.
    #[error("no reply within {0:?}")]
    ReadTimeout(Duration),

    /// The reply bytes are not text.
    #[error("reply is not valid UTF-8")]
    NotUtf8,
}

/// Failures writing to the time-series store.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The request did not complete.
    #[error("sink request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("sink rejected write with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for the log.
        body: String,
    },
}

/// Errors surfaced to the request layer.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The request never reached the device.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The device can never show the requested effect.
    #[error("device rejected command: {0}")]
    Rejected(String),

    /// The retry budget ran out before the effect was observed.
    #[error("device did not confirm within budget after {attempts} attempts")]
    TimedOut {
        /// Round trips used.
        attempts: u32,
    },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or parsed.
    #[error("configuration error: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parsed but are unusable.
    #[error("configuration validation error: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        ConfigError::Load(Box::new(value))
    }
}
