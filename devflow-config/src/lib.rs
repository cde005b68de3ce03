mod duration;
mod sections;

pub use duration::parse_duration;
pub use sections::*;

use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use std::{collections::HashMap, collections::HashSet, fs, path::Path};
use thiserror::Error;
use uuid::Uuid;

/// The only supported configuration document version.
pub const SUPPORTED_VERSION: u32 = 1;

/// Invalid or unsupported configuration document. Carries every validation
/// failure found so the operator can fix them in one pass.
#[derive(Debug, Error)]
#[error("invalid configuration:\n  {}", errors.join("\n  "))]
pub struct ConfigError {
    pub errors: Vec<String>,
}

impl ConfigError {
    fn single(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
        }
    }
}

/// Frozen, typed configuration tree. Built once at startup, shared as
/// `Arc<Config>`, never reloaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default = "Config::default_project_title")]
    pub project_title: String,
    #[serde(default)]
    pub log_config: bool,
    #[serde(default)]
    pub log_worker_start: bool,
    #[serde(default)]
    pub log_storage_debug: bool,

    #[serde(default)]
    pub http_server: Option<HttpServerSection>,
    #[serde(default)]
    pub authentication: Option<AuthenticationSection>,
    #[serde(default)]
    pub modbus: HashMap<String, ModbusBusSection>,
    #[serde(default)]
    pub mqtt_clients: HashMap<String, MqttClientSection>,
    #[serde(default)]
    pub hass_discovery: Vec<HassDiscoverySection>,
    #[serde(default)]
    pub victron_devices: HashMap<String, VictronDeviceSection>,
    #[serde(default)]
    pub modbus_devices: HashMap<String, ModbusDeviceSection>,
    #[serde(default)]
    pub http_devices: HashMap<String, HttpDeviceSection>,
    #[serde(default)]
    pub mqtt_devices: HashMap<String, MqttDeviceSection>,
    #[serde(default)]
    pub gensets: HashMap<String, GensetSection>,
    #[serde(default)]
    pub views: Vec<ViewSection>,
}

impl Config {
    fn default_project_title() -> String {
        "devflow".to_string()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::single(format!(
                "cannot read {}: {e}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        Self::from_str(&text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| ConfigError::single(format!("invalid yaml: {e}")))?;
        if value.is_null() {
            return Err(ConfigError::single("version must be defined"));
        }

        let mut config: Config = serde_yaml::from_value(value)
            .map_err(|e| ConfigError::single(format!("invalid document: {e}")))?;

        // Version is gated before anything else; an unsupported document is
        // reported as exactly one error.
        match config.version {
            None => return Err(ConfigError::single("version must be defined")),
            Some(SUPPORTED_VERSION) => {}
            Some(v) => return Err(ConfigError::single(format!("version={v} is not supported"))),
        }

        config.apply_generated_defaults();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError { errors })
        }
    }

    /// Fill in the secrets and identifiers that default to random values.
    fn apply_generated_defaults(&mut self) {
        if let Some(auth) = &mut self.authentication {
            if auth.jwt_secret.as_deref().map_or(true, str::is_empty) {
                let secret: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(32)
                    .map(char::from)
                    .collect();
                auth.jwt_secret = Some(secret);
            }
        }
        for client in self.mqtt_clients.values_mut() {
            if client.client_id.as_deref().map_or(true, str::is_empty) {
                client.client_id = Some(format!("devflow-{}", Uuid::new_v4().simple()));
            }
        }
    }

    /// All configured device names, including the synthetic genset output
    /// devices.
    pub fn device_names(&self) -> HashSet<&str> {
        let mut names: HashSet<&str> = HashSet::new();
        names.extend(self.victron_devices.keys().map(String::as_str));
        names.extend(self.modbus_devices.keys().map(String::as_str));
        names.extend(self.http_devices.keys().map(String::as_str));
        names.extend(self.mqtt_devices.keys().map(String::as_str));
        for (name, genset) in &self.gensets {
            names.insert(genset.output_device.as_deref().unwrap_or(name.as_str()));
        }
        names
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(http) = &self.http_server {
            let proxy_set = http.frontend_proxy.as_deref().is_some_and(|s| !s.is_empty());
            let path_set = http.frontend_path.as_deref().is_some_and(|s| !s.is_empty());
            if proxy_set && path_set {
                errors.push(
                    "HttpServer: FrontendProxy and FrontendPath are mutually exclusive".to_string(),
                );
            }
        }

        for (name, client) in &self.mqtt_clients {
            if client.broker.is_empty() {
                errors.push(format!("MqttClients[{name}]: Broker must be defined"));
            } else if let Err(e) = parse_broker_url(&client.broker) {
                errors.push(format!("MqttClients[{name}]: {e}"));
            }
            if client.protocol_version != 5 {
                errors.push(format!(
                    "MqttClients[{name}]: ProtocolVersion={} is not supported, must be 5",
                    client.protocol_version
                ));
            }
            if client.qos > 2 {
                errors.push(format!("MqttClients[{name}]: Qos must be 0, 1 or 2"));
            }
        }

        let client_names: HashSet<&str> = self.mqtt_clients.keys().map(String::as_str).collect();
        let check_clients = |errors: &mut Vec<String>, context: &str, names: &[String]| {
            for n in names {
                if !client_names.contains(n.as_str()) {
                    errors.push(format!("{context}: unknown mqtt client '{n}'"));
                }
            }
        };

        for (name, device) in &self.victron_devices {
            if device.kind == VictronDeviceKind::Vedirect
                && device.device.as_deref().map_or(true, str::is_empty)
            {
                errors.push(format!(
                    "VictronDevices[{name}]: Device must be defined for Kind=Vedirect"
                ));
            }
            check_clients(
                &mut errors,
                &format!("VictronDevices[{name}]"),
                &device.general.telemetry_via_mqtt_clients,
            );
        }

        for (name, device) in &self.modbus_devices {
            if !self.modbus.contains_key(&device.bus) {
                errors.push(format!(
                    "ModbusDevices[{name}]: unknown bus '{}'",
                    device.bus
                ));
            }
            if device.poll_interval.is_zero() {
                errors.push(format!("ModbusDevices[{name}]: PollInterval must be > 0"));
            }
        }

        for (name, device) in &self.http_devices {
            if !device.url.starts_with("http://") && !device.url.starts_with("https://") {
                errors.push(format!(
                    "HttpDevices[{name}]: Url must start with http:// or https://"
                ));
            }
            if device.poll_interval.is_zero() {
                errors.push(format!("HttpDevices[{name}]: PollInterval must be > 0"));
            }
        }

        for (name, device) in &self.mqtt_devices {
            if device.mqtt_topics.is_empty() {
                errors.push(format!("MqttDevices[{name}]: MqttTopics must not be empty"));
            }
            check_clients(
                &mut errors,
                &format!("MqttDevices[{name}]"),
                &device.mqtt_clients,
            );
        }

        for (idx, entry) in self.hass_discovery.iter().enumerate() {
            check_clients(
                &mut errors,
                &format!("HassDiscovery[{idx}]"),
                &entry.via_mqtt_clients,
            );
            for (list, what) in [
                (&entry.devices, "Devices"),
                (&entry.categories, "Categories"),
                (&entry.registers, "Registers"),
            ] {
                for pattern in list {
                    if let Err(e) = regex::Regex::new(pattern) {
                        errors.push(format!(
                            "HassDiscovery[{idx}]: invalid {what} regexp '{pattern}': {e}"
                        ));
                    }
                }
            }
        }

        let device_names = self.device_names();
        let mut seen_views = HashSet::new();
        for view in &self.views {
            if view.name.is_empty() {
                errors.push("Views: Name must not be empty".to_string());
            }
            if !seen_views.insert(view.name.as_str()) {
                errors.push(format!("Views[{}]: duplicate view name", view.name));
            }
            for device in &view.devices {
                if !device_names.contains(device.name.as_str()) {
                    errors.push(format!(
                        "Views[{}]: unknown device '{}'",
                        view.name, device.name
                    ));
                }
            }
        }

        for (name, genset) in &self.gensets {
            if !device_names.contains(genset.input_device.as_str()) {
                errors.push(format!(
                    "Gensets[{name}]: unknown InputDevice '{}'",
                    genset.input_device
                ));
            }
        }

        errors
    }
}

/// Split a broker URL of the form `scheme://host:port` into its parts.
/// Supported schemes: `tcp` and `mqtt` (plain), `ssl`, `tls` and `mqtts`
/// (TLS).
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool), String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| format!("invalid Broker url '{url}': missing scheme"))?;
    let tls = match scheme {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        other => return Err(format!("invalid Broker url '{url}': unknown scheme '{other}'")),
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid Broker url '{url}': missing port"))?;
    if host.is_empty() {
        return Err(format!("invalid Broker url '{url}': missing host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid Broker url '{url}': invalid port '{port}'"))?;
    Ok((host.to_string(), port, tls))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unsupported_version_is_a_single_error() {
        let err = Config::from_str("Version: 42\n").unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0], "version=42 is not supported");
    }

    #[test]
    fn empty_document_requires_version() {
        let err = Config::from_str("").unwrap_err();
        assert!(err.to_string().contains("version must be defined"));
    }

    #[test]
    fn minimal_document_applies_defaults() {
        let config = Config::from_str("Version: 1\n").unwrap();
        assert_eq!(config.project_title, "devflow");
        assert!(config.mqtt_clients.is_empty());
        assert!(!config.log_config);
    }

    #[test]
    fn frontend_proxy_and_path_are_exclusive() {
        let err = Config::from_str(
            "Version: 1\nHttpServer:\n  FrontendProxy: http://127.0.0.1:3000/\n  FrontendPath: ./frontend\n",
        )
        .unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert!(err.errors[0].contains("mutually exclusive"));
    }

    #[test]
    fn broker_urls_parse() {
        assert_eq!(
            parse_broker_url("tcp://mqtt.example.com:1883").unwrap(),
            ("mqtt.example.com".to_string(), 1883, false)
        );
        assert_eq!(
            parse_broker_url("ssl://eu1.cloud.example:8883").unwrap(),
            ("eu1.cloud.example".to_string(), 8883, true)
        );
        assert!(parse_broker_url("mqtt.example.com").is_err());
        assert!(parse_broker_url("ftp://x:21").is_err());
    }

    #[test]
    fn complex_document_parses() {
        let text = r#"
Version: 1
ProjectTitle: Test Project
LogConfig: true

HttpServer:
  Bind: "::1"
  Port: 8000
  FrontendPath: ./frontend-build/
  FrontendExpires: 1m
  ConfigExpires: 2m

Authentication:
  JwtValidityPeriod: 2h
  HtaccessFile: ./auth.passwd

Modbus:
  bus0:
    Device: /dev/ttyACM0
    BaudRate: 9600
    ReadTimeout: 100ms

MqttClients:
  local:
    Broker: tcp://mqtt.example.com:1883
    User: dev
    Password: secret
    Qos: 1
    KeepAlive: 2m
    AvailabilityTopic: "%Prefix%%ClientId%/status"
    TelemetryInterval: 20s
    TelemetryTopic: "%Prefix%tele/%DeviceName%/state"
    RealtimeEnable: true
    TopicPrefix: my-prefix/

HassDiscovery:
  - TopicPrefix: homeassistant
    ViaMqttClients: [local]
    Devices: [bmv0]
    Registers: ["Voltage$"]

VictronDevices:
  bmv0:
    General:
      SkipFields: [AuxVoltage]
      RestartInterval: 200ms
      RestartIntervalMaxBackoff: 1m
    Device: /dev/ttyUSB0
    Kind: Vedirect

ModbusDevices:
  relays0:
    Bus: bus0
    Kind: WaveshareRtuRelay8
    Address: "0x01"
    Relays:
      CH1:
        Description: Lamp
        OpenLabel: "off"
        ClosedLabel: "on"
    PollInterval: 1s

HttpDevices:
  tcw241:
    Url: http://control0/
    Kind: Teracom
    Username: admin
    Password: secret

MqttDevices:
  bmv1:
    MqttTopics: ["stat/bmv1/+"]
    MqttClients: [local]

Views:
  - Name: main
    Title: Main
    Devices:
      - Name: bmv0
      - Name: relays0
        SkipCategories: [Settings]
    AllowedUsers: [admin]
"#;
        let config = Config::from_str(text).unwrap();
        assert_eq!(config.project_title, "Test Project");

        let client = &config.mqtt_clients["local"];
        assert_eq!(client.keep_alive, Duration::from_secs(120));
        assert_eq!(client.qos, 1);
        assert!(client.availability_enabled());
        assert!(client.client_id.as_deref().unwrap().starts_with("devflow-"));

        let bmv = &config.victron_devices["bmv0"];
        assert_eq!(bmv.general.skip_fields, vec!["AuxVoltage".to_string()]);
        assert_eq!(
            bmv.general.settings().restart.restart_interval,
            Duration::from_millis(200)
        );

        let relays = &config.modbus_devices["relays0"];
        assert_eq!(relays.address, 0x01);
        assert_eq!(relays.relays["CH1"].closed_label, "on");

        assert!(!config.views[0].is_public());
        assert_eq!(config.views[0].devices[1].skip_categories, vec!["Settings"]);
    }

    #[test]
    fn cross_references_are_checked() {
        let text = r#"
Version: 1
ModbusDevices:
  relays0:
    Bus: missing-bus
    Kind: WaveshareRtuRelay8
    Address: 0x01
Views:
  - Name: main
    Title: Main
    Devices:
      - Name: no-such-device
"#;
        let err = Config::from_str(text).unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert!(err.errors.iter().any(|e| e.contains("unknown bus")));
        assert!(err.errors.iter().any(|e| e.contains("unknown device")));
    }
}
