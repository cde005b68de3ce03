use crate::driver::HttpCodec;
use devflow_sdk::{DriverError, DriverResult, NumberMeta, Register, Value, ValuePayload};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};

fn category_sort(category: &str) -> i32 {
    match category {
        "Sensors" => 0,
        "Analog Inputs" => 1,
        "Digital Inputs" => 2,
        "Relays" => 3,
        "General" => 4,
        "Device Info" => 5,
        _ => 9,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SensorItem {
    value: String,
    unit: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Sensor {
    description: String,
    item1: SensorItem,
    item2: SensorItem,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Analog {
    description: String,
    value: String,
    unit: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Digital {
    description: String,
    valuebin: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Relay {
    description: String,
    valuebin: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct DeviceInfo {
    device_name: String,
    host_name: String,
    #[serde(rename = "ID")]
    id: String,
    fw_ver: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Sensors {
    #[serde(rename = "S1")]
    s1: Sensor,
    #[serde(rename = "S2")]
    s2: Sensor,
    #[serde(rename = "S3")]
    s3: Sensor,
    #[serde(rename = "S4")]
    s4: Sensor,
    #[serde(rename = "S5")]
    s5: Sensor,
    #[serde(rename = "S6")]
    s6: Sensor,
    #[serde(rename = "S7")]
    s7: Sensor,
    #[serde(rename = "S8")]
    s8: Sensor,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Analogs {
    #[serde(rename = "AI1")]
    ai1: Analog,
    #[serde(rename = "AI2")]
    ai2: Analog,
    #[serde(rename = "AI3")]
    ai3: Analog,
    #[serde(rename = "AI4")]
    ai4: Analog,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Digitals {
    #[serde(rename = "DI1")]
    di1: Digital,
    #[serde(rename = "DI2")]
    di2: Digital,
    #[serde(rename = "DI3")]
    di3: Digital,
    #[serde(rename = "DI4")]
    di4: Digital,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Relays {
    #[serde(rename = "R1")]
    r1: Relay,
    #[serde(rename = "R2")]
    r2: Relay,
    #[serde(rename = "R3")]
    r3: Relay,
    #[serde(rename = "R4")]
    r4: Relay,
}

/// Teracom `status.xml` document, subset of the fields the driver consumes.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TeracomStatus {
    #[serde(rename = "DeviceInfo")]
    device_info: DeviceInfo,
    #[serde(rename = "S")]
    sensors: Sensors,
    #[serde(rename = "AI")]
    analogs: Analogs,
    #[serde(rename = "DI")]
    digitals: Digitals,
    #[serde(rename = "R")]
    relays: Relays,
}

fn open_closed_map() -> BTreeMap<i64, String> {
    let mut map = BTreeMap::new();
    map.insert(0, "open".to_string());
    map.insert(1, "closed".to_string());
    map
}

/// Teracom TCW-series industrial I/O module polled via `status.xml`.
pub(crate) struct TeracomCodec;

impl TeracomCodec {
    fn sensor_values(device: &Arc<str>, index: usize, sensor: &Sensor, out: &mut Vec<Value>) {
        for (slot, item) in [(1, &sensor.item1), (2, &sensor.item2)] {
            let Ok(value) = item.value.parse::<f64>() else {
                // "---" marks a disconnected sensor
                continue;
            };
            let name = format!("S{index}Item{slot}");
            let description = if sensor.description.is_empty() {
                name.clone()
            } else {
                format!("{} {slot}", sensor.description)
            };
            let register = Register::number(
                Arc::clone(device),
                "Sensors",
                name,
                description,
                (!item.unit.is_empty()).then(|| item.unit.clone()),
                category_sort("Sensors") * 100 + index as i32 * 2 + slot,
                false,
                NumberMeta::default(),
            );
            out.push(Value::numeric(register, value));
        }
    }
}

impl HttpCodec for TeracomCodec {
    fn model(&self) -> String {
        "Teracom".to_string()
    }

    fn status_path(&self) -> &str {
        "status.xml"
    }

    fn parse_status(&self, body: &[u8], device: &Arc<str>) -> DriverResult<Vec<Value>> {
        let text = String::from_utf8_lossy(body);
        let status: TeracomStatus = quick_xml::de::from_str(&text)
            .map_err(|e| DriverError::CodecError(format!("cannot parse xml: {e}")))?;

        let mut out = Vec::new();

        let sensors = [
            &status.sensors.s1,
            &status.sensors.s2,
            &status.sensors.s3,
            &status.sensors.s4,
            &status.sensors.s5,
            &status.sensors.s6,
            &status.sensors.s7,
            &status.sensors.s8,
        ];
        for (i, sensor) in sensors.iter().enumerate() {
            Self::sensor_values(device, i + 1, sensor, &mut out);
        }

        let analogs = [
            &status.analogs.ai1,
            &status.analogs.ai2,
            &status.analogs.ai3,
            &status.analogs.ai4,
        ];
        for (i, analog) in analogs.iter().enumerate() {
            let Ok(value) = analog.value.parse::<f64>() else {
                continue;
            };
            let name = format!("AI{}", i + 1);
            let description = if analog.description.is_empty() {
                name.clone()
            } else {
                analog.description.clone()
            };
            let register = Register::number(
                Arc::clone(device),
                "Analog Inputs",
                name,
                description,
                (!analog.unit.is_empty()).then(|| analog.unit.clone()),
                category_sort("Analog Inputs") * 100 + i as i32,
                false,
                NumberMeta::default(),
            );
            out.push(Value::numeric(register, value));
        }

        let digitals = [
            &status.digitals.di1,
            &status.digitals.di2,
            &status.digitals.di3,
            &status.digitals.di4,
        ];
        for (i, digital) in digitals.iter().enumerate() {
            let Ok(state) = digital.valuebin.parse::<i64>() else {
                continue;
            };
            let name = format!("DI{}", i + 1);
            let description = if digital.description.is_empty() {
                name.clone()
            } else {
                digital.description.clone()
            };
            let register = Register::enumeration(
                Arc::clone(device),
                "Digital Inputs",
                name,
                description,
                open_closed_map(),
                category_sort("Digital Inputs") * 100 + i as i32,
                false,
            );
            out.push(Value::enumeration(register, state));
        }

        let relays = [
            &status.relays.r1,
            &status.relays.r2,
            &status.relays.r3,
            &status.relays.r4,
        ];
        for (i, relay) in relays.iter().enumerate() {
            let Ok(state) = relay.valuebin.parse::<i64>() else {
                continue;
            };
            let name = format!("R{}", i + 1);
            let description = if relay.description.is_empty() {
                name.clone()
            } else {
                relay.description.clone()
            };
            let register = Register::enumeration(
                Arc::clone(device),
                "Relays",
                name,
                description,
                open_closed_map(),
                category_sort("Relays") * 100 + i as i32,
                true,
            );
            out.push(Value::enumeration(register, state));
        }

        let info = [
            ("DeviceName", &status.device_info.device_name),
            ("HostName", &status.device_info.host_name),
            ("Id", &status.device_info.id),
            ("FirmwareVersion", &status.device_info.fw_ver),
        ];
        for (i, (name, value)) in info.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let register = Register::text(
                Arc::clone(device),
                "Device Info",
                *name,
                *name,
                category_sort("Device Info") * 100 + i as i32,
                false,
            );
            out.push(Value::text(register, (*value).clone()));
        }

        Ok(out)
    }

    fn command_path(&self, register: &Register, payload: &ValuePayload) -> Option<String> {
        // relays are named R1..R4 and toggled via status.xml?rN=0|1
        let channel: usize = register.name().strip_prefix('R')?.parse().ok()?;
        if !(1..=4).contains(&channel) || !register.controllable() {
            return None;
        }
        let state = match payload {
            ValuePayload::Enum(idx) => (*idx != 0) as u8,
            _ => return None,
        };
        Some(format!("/status.xml?r{channel}={state}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_sdk::RegisterType;

    const SAMPLE: &str = r#"<Monitor>
  <DeviceInfo>
    <DeviceName>TCW241</DeviceName>
    <HostName>TCW241</HostName>
    <ID>00:04:A3:F0:00:01</ID>
    <FwVer>TCW241-v1.23</FwVer>
  </DeviceInfo>
  <S>
    <S1>
      <description>Temperature</description>
      <item1><value>23.4</value><unit>°C</unit></item1>
      <item2><value>---</value><unit></unit></item2>
    </S1>
    <S2>
      <description></description>
      <item1><value>---</value><unit></unit></item1>
      <item2><value>---</value><unit></unit></item2>
    </S2>
  </S>
  <AI>
    <AI1><description>Tank level</description><value>7.25</value><unit>V</unit></AI1>
    <AI2><description></description><value>---</value><unit>V</unit></AI2>
  </AI>
  <DI>
    <DI1><description>Door</description><valuebin>1</valuebin></DI1>
  </DI>
  <R>
    <R1><description>Pump</description><valuebin>0</valuebin></R1>
  </R>
</Monitor>"#;

    #[test]
    fn parses_the_status_document() {
        let device: Arc<str> = Arc::from("tcw241");
        let values = TeracomCodec.parse_status(SAMPLE.as_bytes(), &device).unwrap();

        let by_name: std::collections::HashMap<&str, &Value> =
            values.iter().map(|v| (v.name(), v)).collect();

        let s1 = by_name["S1Item1"];
        assert_eq!(s1.payload(), &ValuePayload::Numeric(23.4));
        assert_eq!(s1.register().unit(), Some("°C"));
        // disconnected probes are skipped
        assert!(!by_name.contains_key("S1Item2"));
        assert!(!by_name.contains_key("S2Item1"));
        assert!(!by_name.contains_key("AI2"));

        let door = by_name["DI1"];
        assert_eq!(door.register().register_type(), RegisterType::Enum);
        assert_eq!(door.payload(), &ValuePayload::Enum(1));
        assert!(!door.register().controllable());

        let pump = by_name["R1"];
        assert!(pump.register().controllable());
        assert_eq!(pump.payload(), &ValuePayload::Enum(0));

        assert_eq!(
            by_name["DeviceName"].payload(),
            &ValuePayload::Text("TCW241".to_string())
        );
    }

    #[test]
    fn relay_commands_map_to_query_paths() {
        let device: Arc<str> = Arc::from("tcw241");
        let values = TeracomCodec.parse_status(SAMPLE.as_bytes(), &device).unwrap();
        let relay = values
            .iter()
            .find(|v| v.name() == "R1")
            .unwrap()
            .register()
            .clone();

        assert_eq!(
            TeracomCodec.command_path(&relay, &ValuePayload::Enum(1)),
            Some("/status.xml?r1=1".to_string())
        );
        assert_eq!(
            TeracomCodec.command_path(&relay, &ValuePayload::Enum(0)),
            Some("/status.xml?r1=0".to_string())
        );
        assert_eq!(TeracomCodec.command_path(&relay, &ValuePayload::Numeric(1.0)), None);
    }
}
