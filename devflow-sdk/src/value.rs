use crate::{Register, RegisterType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payload of a stored register value.
///
/// Numbers are already scaled (`raw / factor + offset`); enum payloads carry
/// the index into the register's enum map.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuePayload {
    Text(String),
    Numeric(f64),
    Enum(i64),
}

impl ValuePayload {
    /// Strict equality used for idempotent fills: same variant and
    /// bit-identical payload (floats compare by bits, so NaN == NaN and
    /// -0.0 != 0.0).
    pub fn bit_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValuePayload::Text(a), ValuePayload::Text(b)) => a == b,
            (ValuePayload::Numeric(a), ValuePayload::Numeric(b)) => a.to_bits() == b.to_bits(),
            (ValuePayload::Enum(a), ValuePayload::Enum(b)) => a == b,
            _ => false,
        }
    }

    #[inline]
    pub fn register_type(&self) -> RegisterType {
        match self {
            ValuePayload::Text(_) => RegisterType::Text,
            ValuePayload::Numeric(_) => RegisterType::Number,
            ValuePayload::Enum(_) => RegisterType::Enum,
        }
    }
}

impl fmt::Display for ValuePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValuePayload::Text(v) => write!(f, "{v}"),
            ValuePayload::Numeric(v) => write!(f, "{v}"),
            ValuePayload::Enum(v) => write!(f, "{v}"),
        }
    }
}

/// Latest value of one register, as stored and fanned out.
#[derive(Debug, Clone)]
pub struct Value {
    register: Register,
    payload: ValuePayload,
    timestamp: DateTime<Utc>,
}

impl Value {
    /// Create a value stamped with the current wall clock.
    pub fn new(register: Register, payload: ValuePayload) -> Self {
        Self::with_timestamp(register, payload, Utc::now())
    }

    pub fn with_timestamp(register: Register, payload: ValuePayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            register,
            payload,
            timestamp,
        }
    }

    /// Re-stamp with the current wall clock; the storage does this at store
    /// time.
    pub fn stamped_now(mut self) -> Self {
        self.timestamp = Utc::now();
        self
    }

    pub fn text(register: Register, text: impl Into<String>) -> Self {
        Self::new(register, ValuePayload::Text(text.into()))
    }

    pub fn numeric(register: Register, value: f64) -> Self {
        Self::new(register, ValuePayload::Numeric(value))
    }

    pub fn enumeration(register: Register, index: i64) -> Self {
        Self::new(register, ValuePayload::Enum(index))
    }

    #[inline]
    pub fn register(&self) -> &Register {
        &self.register
    }

    #[inline]
    pub fn device_name(&self) -> &str {
        self.register.device_name()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.register.name()
    }

    #[inline]
    pub fn payload(&self) -> &ValuePayload {
        &self.payload
    }

    #[inline]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the payload variant matches the register's declared type.
    #[inline]
    pub fn type_matches_register(&self) -> bool {
        self.payload.register_type() == self.register.register_type()
    }

    /// For enum values, the mapped label, if any.
    pub fn enum_label(&self) -> Option<&str> {
        match &self.payload {
            ValuePayload::Enum(idx) => self
                .register
                .enum_map()
                .and_then(|m| m.get(idx))
                .map(String::as_str),
            _ => None,
        }
    }

    /// Plain JSON rendering for the read API: number, string or enum index.
    pub fn generic_json(&self) -> serde_json::Value {
        match &self.payload {
            ValuePayload::Text(v) => serde_json::Value::String(v.clone()),
            ValuePayload::Numeric(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            ValuePayload::Enum(v) => serde_json::Value::Number((*v).into()),
        }
    }

    /// Realtime wire rendering, optionally carrying the register attributes
    /// (sent on the first appearance of a register on a topic).
    pub fn realtime_message(&self, with_attributes: bool) -> RealtimeMessage {
        let mut msg = RealtimeMessage::default();
        match &self.payload {
            ValuePayload::Text(v) => msg.text_value = Some(v.clone()),
            ValuePayload::Numeric(v) => msg.numeric_value = Some(*v),
            ValuePayload::Enum(v) => msg.enum_idx = Some(*v),
        }
        if with_attributes {
            msg.category = Some(self.register.category().to_string());
            msg.description = Some(self.register.description().to_string());
            msg.unit = self.register.unit().map(str::to_string);
            msg.sort = Some(self.register.sort());
        }
        msg
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.register, self.payload)
    }
}

/// JSON payload published on realtime topics and parsed back by the inbound
/// MQTT driver. Exactly one of `NumVal` / `TextVal` / `EnumIdx` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "NumVal", skip_serializing_if = "Option::is_none")]
    pub numeric_value: Option<f64>,
    #[serde(rename = "TextVal", skip_serializing_if = "Option::is_none")]
    pub text_value: Option<String>,
    #[serde(rename = "EnumIdx", skip_serializing_if = "Option::is_none")]
    pub enum_idx: Option<i64>,
    #[serde(rename = "Cat", skip_serializing_if = "Option::is_none", default)]
    pub category: Option<String>,
    #[serde(rename = "Desc", skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(rename = "Unit", skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    #[serde(rename = "Sort", skip_serializing_if = "Option::is_none", default)]
    pub sort: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn number_register() -> Register {
        Register::number(
            Arc::from("dev0"),
            "Essential",
            "Power",
            "Power",
            Some("W".into()),
            0,
            false,
            Default::default(),
        )
    }

    #[test]
    fn bit_eq_distinguishes_float_representations() {
        assert!(ValuePayload::Numeric(1.5).bit_eq(&ValuePayload::Numeric(1.5)));
        assert!(!ValuePayload::Numeric(0.0).bit_eq(&ValuePayload::Numeric(-0.0)));
        assert!(ValuePayload::Numeric(f64::NAN).bit_eq(&ValuePayload::Numeric(f64::NAN)));
        assert!(!ValuePayload::Numeric(1.0).bit_eq(&ValuePayload::Enum(1)));
    }

    #[test]
    fn realtime_message_carries_exactly_one_value() {
        let v = Value::numeric(number_register(), 42.5);
        let msg = v.realtime_message(false);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"NumVal": 42.5}));

        let msg = v.realtime_message(true);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["Cat"], "Essential");
        assert_eq!(json["Unit"], "W");
    }
}
