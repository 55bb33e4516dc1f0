//! Parameter registry: which fields can be written, how they are encoded,
//! and how a write is confirmed.
//!
//! Three disjoint classes exist:
//!
//! | Class     | Names           | Domain   | Wire base | Confirmation                 |
//! |-----------|-----------------|----------|-----------|------------------------------|
//! | Level     | `V00`..`V08`    | 0..=255  | hex       | poll until field == value    |
//! | Threshold | `T01`..`T08`    | 0..=999  | decimal   | single fresh frame           |
//! | Toggle    | `PUMP_ON/_OFF`  | no value | n/a       | poll until `PUMP` == 1 / 0   |
//!
//! The registry is built once and shared read-only (`Arc<ParameterRegistry>`).

use crate::error::ValidationError;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Numeric base of a field's value text on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EncodingBase {
    /// Base 10: thresholds, temperatures and the pump state.
    Decimal,
    /// Base 16: the `V` level fields.
    Hexadecimal,
}

impl EncodingBase {
    /// Radix for `i64::from_str_radix`.
    pub fn radix(self) -> u32 {
        match self {
            EncodingBase::Decimal => 10,
            EncodingBase::Hexadecimal => 16,
        }
    }
}

/// Parameter class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterClass {
    /// `V00`..`V08`, 0..=255.
    Level,
    /// `T01`..`T08`, 0..=999.
    Threshold,
    /// `PUMP_ON` / `PUMP_OFF`, no value.
    Toggle,
}

/// How a write to a parameter is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    /// Poll until the frame's value for `field` equals the requested value.
    MatchValue { field: String },
    /// Poll until `field` reads `expected`.
    MatchState { field: String, expected: i64 },
    /// Return one fresh frame without waiting for the effect.
    Snapshot,
}

/// Describes one writable parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterSpec {
    /// Name as sent in commands.
    pub name: String,
    /// Level, threshold or toggle.
    pub class: ParameterClass,
    /// Inclusive value domain; `None` for toggles.
    pub range: Option<(i64, i64)>,
    /// How a write is observed.
    pub policy: ConfirmationPolicy,
}

impl ParameterSpec {
    fn level(name: &str) -> Self {
        Self {
            name: name.to_string(),
            class: ParameterClass::Level,
            range: Some((0, LEVEL_MAX)),
            policy: ConfirmationPolicy::MatchValue {
                field: name.to_string(),
            },
        }
    }

    fn threshold(name: &str) -> Self {
        Self {
            name: name.to_string(),
            class: ParameterClass::Threshold,
            range: Some((0, THRESHOLD_MAX)),
            policy: ConfirmationPolicy::Snapshot,
        }
    }

    fn toggle(name: &str, field: &str, expected: i64) -> Self {
        Self {
            name: name.to_string(),
            class: ParameterClass::Toggle,
            range: None,
            policy: ConfirmationPolicy::MatchState {
                field: field.to_string(),
                expected,
            },
        }
    }
}

/// Highest legal level value.
pub const LEVEL_MAX: i64 = 255;
/// Highest legal threshold value.
pub const THRESHOLD_MAX: i64 = 999;
/// Field names beginning with this prefix carry hexadecimal values on the wire.
pub const LEVEL_FIELD_PREFIX: char = 'V';
/// Frame field holding the pump state.
pub const PUMP_STATE_FIELD: &str = "PUMP";

/// A write request that passed validation. Only the registry constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    spec: ParameterSpec,
    value: Option<i64>,
}

impl ValidatedCommand {
    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Class of the parameter.
    pub fn class(&self) -> ParameterClass {
        self.spec.class
    }

    /// How confirmation observes this write.
    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.spec.policy
    }

    /// Requested value, absent for toggles.
    pub fn value(&self) -> Option<i64> {
        self.value
    }
}

impl fmt::Display for ValidatedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(v) => write!(f, "{}={}", self.spec.name, v),
            None => write!(f, "{}", self.spec.name),
        }
    }
}

/// Static catalogue of writable parameters.
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    specs: IndexMap<String, ParameterSpec>,
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterRegistry {
    /// Build the graphitizer controller catalogue.
    pub fn new() -> Self {
        let mut specs = IndexMap::new();
        for i in 0..=8 {
            let spec = ParameterSpec::level(&format!("V{:02}", i));
            specs.insert(spec.name.clone(), spec);
        }
        for i in 1..=8 {
            let spec = ParameterSpec::threshold(&format!("T{:02}", i));
            specs.insert(spec.name.clone(), spec);
        }
        for spec in [
            ParameterSpec::toggle("PUMP_ON", PUMP_STATE_FIELD, 1),
            ParameterSpec::toggle("PUMP_OFF", PUMP_STATE_FIELD, 0),
        ] {
            specs.insert(spec.name.clone(), spec);
        }
        Self { specs }
    }

    /// Whether `name` is writable.
    pub fn is_known_parameter(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Full description of `name`.
    pub fn spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.specs.get(name)
    }

    /// All parameters in registration order.
    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.specs.values()
    }

    /// Whether `raw` is an acceptable value for `name`. `None` and `""` both mean "no value".
    pub fn is_valid_value(&self, name: &str, raw: Option<&str>) -> bool {
        self.validate(name, raw).is_ok()
    }

    /// Base used when encoding a value of this parameter into a *frame* field.
    ///
    /// Commands always carry decimal text; only the device's replies use hex for levels.
    pub fn encoding_base(&self, name: &str) -> Option<EncodingBase> {
        self.spec(name).map(|_| field_base(name))
    }

    /// How a write to `name` is confirmed.
    pub fn confirmation_policy(&self, name: &str) -> Option<&ConfirmationPolicy> {
        self.spec(name).map(|s| &s.policy)
    }

    /// Validate a raw request into a command ready for encoding.
    pub fn validate(
        &self,
        name: &str,
        raw: Option<&str>,
    ) -> Result<ValidatedCommand, ValidationError> {
        let spec = self
            .spec(name)
            .ok_or_else(|| ValidationError::UnknownParameter(name.to_string()))?;
        let raw = raw.filter(|v| !v.is_empty());

        let value = match (spec.range, raw) {
            (None, None) => None,
            (None, Some(v)) => {
                return Err(ValidationError::UnexpectedValue {
                    name: name.to_string(),
                    value: v.to_string(),
                })
            }
            (Some(_), None) => {
                return Err(ValidationError::MissingValue {
                    name: name.to_string(),
                })
            }
            (Some((min, max)), Some(v)) => {
                let parsed: i64 = v.parse().map_err(|_| ValidationError::NotNumeric {
                    name: name.to_string(),
                    value: v.to_string(),
                })?;
                if !(min..=max).contains(&parsed) {
                    return Err(ValidationError::OutOfRange {
                        name: name.to_string(),
                        value: parsed,
                        min,
                        max,
                    });
                }
                Some(parsed)
            }
        };

        Ok(ValidatedCommand {
            spec: spec.clone(),
            value,
        })
    }
}

/// Wire base of any frame field, known parameter or not.
pub fn field_base(field: &str) -> EncodingBase {
    if field.starts_with(LEVEL_FIELD_PREFIX) {
        EncodingBase::Hexadecimal
    } else {
        EncodingBase::Decimal
    }
}
