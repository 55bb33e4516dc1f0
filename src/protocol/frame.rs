//! Validated device snapshot.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

/// One decoded snapshot of device state, fields in wire order.
///
/// Only [`crate::protocol::FrameCodec::decode`] builds frames from device
/// replies, so every `Frame` passed the sentinel, length and field-count checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Frame {
    fields: IndexMap<String, i64>,
}

impl Frame {
    pub(crate) fn from_fields(fields: IndexMap<String, i64>) -> Self {
        Self { fields }
    }

    /// Decoded value of `field`, if present.
    pub fn get(&self, field: &str) -> Option<i64> {
        self.fields.get(field).copied()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True only for a frame with no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Underlying ordered map.
    pub fn fields(&self) -> &IndexMap<String, i64> {
        &self.fields
    }

    /// Turn the frame into a sink point stamped with `timestamp`.
    pub fn into_point(self, measurement: &str, timestamp: DateTime<Utc>) -> TelemetryPoint {
        TelemetryPoint {
            measurement: measurement.to_string(),
            fields: self.fields,
            timestamp,
        }
    }
}

/// Flat set of integer fields written to the time-series store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryPoint {
    /// Measurement (table) name.
    pub measurement: String,
    /// Every frame field, in wire order.
    pub fields: IndexMap<String, i64>,
    /// When the frame was read.
    pub timestamp: DateTime<Utc>,
}
