//! Line codec for the controller's ASCII protocol.
//!
//! Protocol Overview:
//! - Commands: `<NAME;>` (toggles, queries) or `<SET_NAME=VALUE;>` (decimal value)
//! - Snapshot query: `<GET_ALL;>`
//! - Replies: `V00=ff;V01=0;...;PUMP=1;` terminated by LF, no framing, no request IDs
//! - `V`-prefixed fields are hex, all others decimal
//!
//! A reply is trusted only if it passes every shape check; any bad segment
//! rejects the whole line.

use crate::error::DecodeError;
use crate::protocol::frame::Frame;
use crate::protocol::registry::{field_base, EncodingBase, ValidatedCommand};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Command that asks the controller for a full snapshot.
pub const SNAPSHOT_COMMAND: &str = "<GET_ALL;>";
/// First field of every valid reply.
pub const FRAME_SENTINEL: &str = "V00=";
/// Terminator following every field.
pub const FIELD_TERMINATOR: char = ';';
/// Minimum number of well-formed `name=value;` segments.
pub const MIN_FIELD_COUNT: usize = 28;

#[allow(clippy::expect_used)]
static FIELD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w{3,4}=\w{1,4};").expect("field pattern is a valid literal"));

/// Accepted reply length window, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLimits {
    /// Shortest acceptable reply.
    #[serde(default = "default_min_len")]
    pub min_len: usize,
    /// Longest acceptable reply; `None` disables the cap.
    #[serde(default = "default_max_len")]
    pub max_len: Option<usize>,
}

fn default_min_len() -> usize {
    169
}

fn default_max_len() -> Option<usize> {
    Some(214)
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            min_len: default_min_len(),
            max_len: default_max_len(),
        }
    }
}

/// Parses replies into [`Frame`]s and formats commands.
///
/// The codec does not validate commands; run them through
/// [`crate::protocol::ParameterRegistry::validate`] first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    limits: FrameLimits,
}

impl FrameCodec {
    /// Codec checking replies against `limits`.
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }

    /// Length bounds in use.
    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    /// Validate and decode a reply line.
    pub fn decode(&self, line: &str) -> Result<Frame, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.len() < self.limits.min_len {
            return Err(DecodeError::TooShort {
                len: line.len(),
                min: self.limits.min_len,
            });
        }
        if let Some(max) = self.limits.max_len {
            if line.len() > max {
                return Err(DecodeError::TooLong {
                    len: line.len(),
                    max,
                });
            }
        }
        if !line.starts_with(FRAME_SENTINEL) {
            return Err(DecodeError::MissingSentinel {
                sentinel: FRAME_SENTINEL,
            });
        }
        if !line.ends_with(FIELD_TERMINATOR) {
            return Err(DecodeError::MissingTerminator);
        }

        let found = FIELD_PATTERN.find_iter(line).count();
        if found < MIN_FIELD_COUNT {
            return Err(DecodeError::TooFewFields {
                found,
                min: MIN_FIELD_COUNT,
            });
        }

        // Every segment must parse: no partial frames.
        let body = &line[..line.len() - FIELD_TERMINATOR.len_utf8()];
        let mut fields = IndexMap::with_capacity(found);
        for segment in body.split(FIELD_TERMINATOR) {
            let (name, value) = segment
                .split_once('=')
                .filter(|(name, value)| !name.is_empty() && !value.contains('='))
                .ok_or_else(|| DecodeError::MalformedSegment(segment.to_string()))?;
            let parsed = i64::from_str_radix(value, field_base(name).radix()).map_err(|_| {
                DecodeError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                }
            })?;
            fields.insert(name.to_string(), parsed);
        }

        Ok(Frame::from_fields(fields))
    }

    /// Format an outbound command line for `parameter`.
    pub fn encode(&self, parameter: &str, value: Option<i64>) -> String {
        match value {
            None => format!("<{};>", parameter),
            Some(v) => format!("<SET_{}={};>", parameter, v),
        }
    }

    /// Wire form of a validated command.
    pub fn encode_command(&self, command: &ValidatedCommand) -> String {
        self.encode(command.name(), command.value())
    }

    /// Format fields the way the controller reports them.
    pub fn encode_reply<'a>(&self, fields: impl IntoIterator<Item = (&'a str, i64)>) -> String {
        let mut line = String::with_capacity(self.limits.min_len + 32);
        for (name, value) in fields {
            line.push_str(name);
            line.push('=');
            match field_base(name) {
                EncodingBase::Hexadecimal => line.push_str(&format!("{:x}", value)),
                EncodingBase::Decimal => line.push_str(&value.to_string()),
            }
            line.push(FIELD_TERMINATOR);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::registry::ParameterRegistry;

    /// 28 fields in the controller's layout.
    fn reference_fields(v00: i64) -> Vec<(String, i64)> {
        let mut fields = Vec::new();
        fields.push(("V00".to_string(), v00));
        for i in 1..=8 {
            fields.push((format!("V{:02}", i), 0));
        }
        for i in 1..=8 {
            fields.push((format!("T{:02}", i), 80));
        }
        for i in 1..=8 {
            fields.push((format!("R{:02}", i), 21));
        }
        fields.push(("S01".to_string(), 0));
        fields.push(("S02".to_string(), 0));
        fields.push(("PUMP".to_string(), 1));
        fields
    }

    fn reference_line(v00: i64) -> String {
        let fields = reference_fields(v00);
        FrameCodec::default().encode_reply(fields.iter().map(|(k, v)| (k.as_str(), *v)))
    }

    #[test]
    fn decodes_reference_reply() {
        let codec = FrameCodec::default();
        let frame = codec.decode(&reference_line(0xff)).unwrap();
        assert_eq!(frame.len(), 28);
        assert_eq!(frame.get("V00"), Some(255));
        assert_eq!(frame.get("T03"), Some(80));
        assert_eq!(frame.get("PUMP"), Some(1));
        let first = frame.iter().next().unwrap();
        assert_eq!(first, ("V00", 255));
    }

    #[test]
    fn every_level_value_survives_command_and_reply() {
        let codec = FrameCodec::default();
        let registry = ParameterRegistry::new();
        for v in 0..=255i64 {
            let command = registry.validate("V00", Some(&v.to_string())).unwrap();
            let wire = codec.encode_command(&command);
            assert_eq!(wire, format!("<SET_V00={v};>"));

            // The controller echoes the applied value back in hex.
            let applied: i64 = wire["<SET_V00=".len()..wire.len() - 2].parse().unwrap();
            let reply = reference_line(applied);
            assert!(reply.starts_with(&format!("V00={v:x};")), "{reply}");
            assert_eq!(codec.decode(&reply).unwrap().get("V00"), Some(v));
        }
    }

    #[test]
    fn tolerates_line_ending() {
        let codec = FrameCodec::default();
        let line = format!("{}\r\n", reference_line(3));
        assert!(codec.decode(&line).is_ok());
    }

    #[test]
    fn rejects_short_line() {
        let codec = FrameCodec::default();
        let err = codec.decode("V00=0;V01=0;").unwrap_err();
        assert!(matches!(err, DecodeError::TooShort { .. }));
    }

    #[test]
    fn rejects_long_line_when_capped() {
        let codec = FrameCodec::default();
        let mut line = reference_line(0);
        while line.len() <= 214 {
            line.push_str("X01=1;");
        }
        assert!(matches!(
            codec.decode(&line).unwrap_err(),
            DecodeError::TooLong { .. }
        ));

        let uncapped = FrameCodec::new(FrameLimits {
            min_len: 169,
            max_len: None,
        });
        assert!(uncapped.decode(&line).is_ok());
    }

    #[test]
    fn rejects_missing_sentinel() {
        let codec = FrameCodec::default();
        let line = reference_line(0).replacen("V00=", "V99=", 1);
        assert_eq!(
            codec.decode(&line).unwrap_err(),
            DecodeError::MissingSentinel {
                sentinel: FRAME_SENTINEL
            }
        );
    }

    #[test]
    fn rejects_missing_terminator() {
        let codec = FrameCodec::default();
        let mut line = reference_line(0);
        line.pop();
        assert_eq!(codec.decode(&line).unwrap_err(), DecodeError::MissingTerminator);
    }

    #[test]
    fn rejects_too_few_segments() {
        let codec = FrameCodec::default();
        // 20 fields padded with long values to pass the length check.
        let mut line = String::from("V00=0;");
        for i in 1..20 {
            line.push_str(&format!("T{:02}=1;", i));
        }
        while line.len() < 180 {
            line.push_str("--------;");
        }
        assert!(matches!(
            codec.decode(&line).unwrap_err(),
            DecodeError::TooFewFields { found: 20, .. }
        ));
    }

    #[test]
    fn malformed_trailing_content_fails_closed() {
        let codec = FrameCodec::default();
        let line = format!("{}garbage;", reference_line(0));
        assert_eq!(
            codec.decode(&line).unwrap_err(),
            DecodeError::MalformedSegment("garbage".into())
        );
    }

    #[test]
    fn bad_field_value_rejects_whole_frame() {
        let codec = FrameCodec::default();
        let line = reference_line(0).replace("T01=80;", "T01=8a;");
        assert_eq!(
            codec.decode(&line).unwrap_err(),
            DecodeError::InvalidValue {
                name: "T01".into(),
                value: "8a".into()
            }
        );
    }

    #[test]
    fn encodes_commands() {
        let codec = FrameCodec::default();
        let registry = ParameterRegistry::new();
        let level = registry.validate("V00", Some("255")).unwrap();
        assert_eq!(codec.encode_command(&level), "<SET_V00=255;>");
        let threshold = registry.validate("T01", Some("80")).unwrap();
        assert_eq!(codec.encode_command(&threshold), "<SET_T01=80;>");
        let toggle = registry.validate("PUMP_OFF", None).unwrap();
        assert_eq!(codec.encode_command(&toggle), "<PUMP_OFF;>");
    }
}
