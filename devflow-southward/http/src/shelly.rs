use crate::driver::HttpCodec;
use devflow_sdk::{DriverError, DriverResult, NumberMeta, Register, Value, ValuePayload};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, Deserialize)]
struct ShellyRelay {
    ison: bool,
}

#[derive(Debug, Deserialize)]
struct ShellyEmeter {
    power: f64,
    current: f64,
    voltage: f64,
    #[serde(default)]
    pf: f64,
    #[serde(default)]
    total: f64,
    #[serde(default)]
    total_returned: f64,
}

/// Shelly 3EM `/status` document, subset the driver consumes.
#[derive(Debug, Deserialize)]
struct ShellyStatus {
    #[serde(default)]
    relays: Vec<ShellyRelay>,
    #[serde(default)]
    emeters: Vec<ShellyEmeter>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    uptime: Option<u64>,
}

fn on_off_map() -> BTreeMap<i64, String> {
    let mut map = BTreeMap::new();
    map.insert(0, "off".to_string());
    map.insert(1, "on".to_string());
    map
}

fn meter_register(
    device: &Arc<str>,
    name: String,
    description: String,
    unit: &str,
    sort: i32,
) -> Register {
    Register::number(
        Arc::clone(device),
        "Meter",
        name,
        description,
        (!unit.is_empty()).then(|| unit.to_string()),
        sort,
        false,
        NumberMeta::default(),
    )
}

/// Shelly 3EM three-phase energy meter polled via `/status`.
pub(crate) struct Shelly3emCodec;

impl HttpCodec for Shelly3emCodec {
    fn model(&self) -> String {
        "Shelly 3EM".to_string()
    }

    fn status_path(&self) -> &str {
        "status"
    }

    fn parse_status(&self, body: &[u8], device: &Arc<str>) -> DriverResult<Vec<Value>> {
        let status: ShellyStatus = serde_json::from_slice(body)
            .map_err(|e| DriverError::CodecError(format!("cannot parse json: {e}")))?;

        let mut out = Vec::new();

        for (i, emeter) in status.emeters.iter().enumerate() {
            let phase = i as i32;
            out.push(Value::numeric(
                meter_register(device, format!("Power{i}"), format!("Phase {i} power"), "W", phase * 10),
                emeter.power,
            ));
            out.push(Value::numeric(
                meter_register(device, format!("Voltage{i}"), format!("Phase {i} voltage"), "V", phase * 10 + 1),
                emeter.voltage,
            ));
            out.push(Value::numeric(
                meter_register(device, format!("Current{i}"), format!("Phase {i} current"), "A", phase * 10 + 2),
                emeter.current,
            ));
            out.push(Value::numeric(
                meter_register(device, format!("PowerFactor{i}"), format!("Phase {i} power factor"), "", phase * 10 + 3),
                emeter.pf,
            ));
            out.push(Value::numeric(
                meter_register(device, format!("Total{i}"), format!("Phase {i} energy total"), "Wh", phase * 10 + 4),
                emeter.total,
            ));
            out.push(Value::numeric(
                meter_register(
                    device,
                    format!("TotalReturned{i}"),
                    format!("Phase {i} energy returned"),
                    "Wh",
                    phase * 10 + 5,
                ),
                emeter.total_returned,
            ));
        }

        for (i, relay) in status.relays.iter().enumerate() {
            let register = Register::enumeration(
                Arc::clone(device),
                "Relays",
                format!("Relay{i}"),
                format!("Relay {i}"),
                on_off_map(),
                100 + i as i32,
                true,
            );
            out.push(Value::enumeration(register, i64::from(relay.ison)));
        }

        if let Some(temperature) = status.temperature {
            out.push(Value::numeric(
                Register::number(
                    Arc::clone(device),
                    "Device",
                    "Temperature",
                    "Device temperature",
                    Some("°C".to_string()),
                    200,
                    false,
                    NumberMeta::default(),
                ),
                temperature,
            ));
        }
        if let Some(uptime) = status.uptime {
            out.push(Value::numeric(
                Register::number(
                    Arc::clone(device),
                    "Device",
                    "Uptime",
                    "Uptime",
                    Some("s".to_string()),
                    201,
                    false,
                    NumberMeta::default(),
                ),
                uptime as f64,
            ));
        }

        Ok(out)
    }

    fn command_path(&self, register: &Register, payload: &ValuePayload) -> Option<String> {
        let channel: usize = register.name().strip_prefix("Relay")?.parse().ok()?;
        if !register.controllable() {
            return None;
        }
        let turn = match payload {
            ValuePayload::Enum(0) => "off",
            ValuePayload::Enum(_) => "on",
            _ => return None,
        };
        Some(format!("/relay/{channel}?turn={turn}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "relays": [{"ison": true}],
        "emeters": [
            {"power": 230.5, "current": 1.0, "voltage": 231.0, "pf": 0.98, "total": 12345.6, "total_returned": 17.2},
            {"power": -12.3, "current": 0.1, "voltage": 230.2, "pf": 0.5, "total": 100.0, "total_returned": 0.0},
            {"power": 0.0, "current": 0.0, "voltage": 229.8, "pf": 0.0, "total": 0.0, "total_returned": 0.0}
        ],
        "temperature": 31.2,
        "uptime": 86400
    }"#;

    #[test]
    fn parses_three_phases() {
        let device: Arc<str> = Arc::from("shelly0");
        let values = Shelly3emCodec.parse_status(SAMPLE.as_bytes(), &device).unwrap();

        let by_name: std::collections::HashMap<&str, &Value> =
            values.iter().map(|v| (v.name(), v)).collect();

        assert_eq!(by_name["Power0"].payload(), &ValuePayload::Numeric(230.5));
        assert_eq!(by_name["Power1"].payload(), &ValuePayload::Numeric(-12.3));
        assert_eq!(by_name["Voltage2"].payload(), &ValuePayload::Numeric(229.8));
        assert_eq!(by_name["Relay0"].payload(), &ValuePayload::Enum(1));
        assert_eq!(by_name["Temperature"].payload(), &ValuePayload::Numeric(31.2));
        assert_eq!(values.len(), 3 * 6 + 1 + 2);
    }

    #[test]
    fn relay_commands_use_the_turn_endpoint() {
        let device: Arc<str> = Arc::from("shelly0");
        let values = Shelly3emCodec.parse_status(SAMPLE.as_bytes(), &device).unwrap();
        let relay = values
            .iter()
            .find(|v| v.name() == "Relay0")
            .unwrap()
            .register()
            .clone();

        assert_eq!(
            Shelly3emCodec.command_path(&relay, &ValuePayload::Enum(1)),
            Some("/relay/0?turn=on".to_string())
        );
        assert_eq!(
            Shelly3emCodec.command_path(&relay, &ValuePayload::Enum(0)),
            Some("/relay/0?turn=off".to_string())
        );
    }
}
