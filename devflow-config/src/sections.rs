use crate::duration;
use devflow_sdk::{DeviceSettings, RestartPolicy};
use serde::{de, Deserialize, Deserializer};
use std::{collections::HashMap, time::Duration};

fn default_true() -> bool {
    true
}

/// HTTP surface. `FrontendProxy` and `FrontendPath` are mutually exclusive;
/// both set is rejected during validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct HttpServerSection {
    #[serde(default = "HttpServerSection::default_bind")]
    pub bind: String,
    #[serde(default = "HttpServerSection::default_port")]
    pub port: u16,
    #[serde(default)]
    pub frontend_proxy: Option<String>,
    #[serde(default)]
    pub frontend_path: Option<String>,
    #[serde(
        default = "HttpServerSection::default_frontend_expires",
        deserialize_with = "duration::deserialize"
    )]
    pub frontend_expires: Duration,
    #[serde(
        default = "HttpServerSection::default_config_expires",
        deserialize_with = "duration::deserialize"
    )]
    pub config_expires: Duration,
    #[serde(default = "default_true")]
    pub log_requests: bool,
    #[serde(default)]
    pub log_debug: bool,
}

impl HttpServerSection {
    fn default_bind() -> String {
        "::1".to_string()
    }

    fn default_port() -> u16 {
        8000
    }

    fn default_frontend_expires() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_config_expires() -> Duration {
        Duration::from_secs(60)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AuthenticationSection {
    /// Generated at load time when absent.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(
        default = "AuthenticationSection::default_jwt_validity_period",
        deserialize_with = "duration::deserialize"
    )]
    pub jwt_validity_period: Duration,
    pub htaccess_file: String,
}

impl AuthenticationSection {
    fn default_jwt_validity_period() -> Duration {
        Duration::from_secs(3600)
    }
}

/// Named RS-485 bus shared by the modbus devices referencing it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ModbusBusSection {
    pub device: String,
    pub baud_rate: u32,
    #[serde(
        default = "ModbusBusSection::default_read_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub read_timeout: Duration,
    #[serde(default)]
    pub log_debug: bool,
}

impl ModbusBusSection {
    fn default_read_timeout() -> Duration {
        Duration::from_millis(100)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MqttClientSection {
    pub broker: String,
    #[serde(default = "MqttClientSection::default_protocol_version")]
    pub protocol_version: u8,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Generated (`devflow-<uuid>`) when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "MqttClientSection::default_qos")]
    pub qos: u8,
    #[serde(
        default = "MqttClientSection::default_keep_alive",
        deserialize_with = "duration::deserialize"
    )]
    pub keep_alive: Duration,
    #[serde(
        default = "MqttClientSection::default_connect_retry_delay",
        deserialize_with = "duration::deserialize"
    )]
    pub connect_retry_delay: Duration,
    #[serde(
        default = "MqttClientSection::default_connect_timeout",
        deserialize_with = "duration::deserialize"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "MqttClientSection::default_max_backlog_size")]
    pub max_backlog_size: usize,

    #[serde(default)]
    pub availability_topic: Option<String>,
    #[serde(default = "default_true")]
    pub availability_retain: bool,
    #[serde(default = "MqttClientSection::default_availability_device_topic")]
    pub availability_device_topic: String,
    #[serde(default = "default_true")]
    pub availability_device_retain: bool,

    #[serde(
        default = "MqttClientSection::default_telemetry_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub telemetry_interval: Duration,
    #[serde(default = "MqttClientSection::default_telemetry_topic")]
    pub telemetry_topic: String,
    #[serde(default)]
    pub telemetry_retain: bool,

    #[serde(default)]
    pub realtime_enable: bool,
    #[serde(default = "MqttClientSection::default_realtime_topic")]
    pub realtime_topic: String,
    #[serde(default = "default_true")]
    pub realtime_retain: bool,
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub realtime_interval: Duration,
    #[serde(default)]
    pub realtime_repeat: bool,

    #[serde(default)]
    pub structure_enable: bool,
    #[serde(default = "MqttClientSection::default_structure_topic")]
    pub structure_topic: String,
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub structure_interval: Duration,
    #[serde(default = "default_true")]
    pub structure_retain: bool,

    #[serde(default)]
    pub topic_prefix: String,
    #[serde(default)]
    pub log_debug: bool,
    #[serde(default)]
    pub log_messages: bool,
}

impl MqttClientSection {
    fn default_protocol_version() -> u8 {
        5
    }

    fn default_qos() -> u8 {
        1
    }

    fn default_keep_alive() -> Duration {
        Duration::from_secs(60)
    }

    fn default_connect_retry_delay() -> Duration {
        Duration::from_secs(10)
    }

    fn default_connect_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_backlog_size() -> usize {
        256
    }

    fn default_telemetry_interval() -> Duration {
        Duration::from_secs(10)
    }

    fn default_availability_device_topic() -> String {
        "%Prefix%avail/%DeviceName%".to_string()
    }

    fn default_telemetry_topic() -> String {
        "%Prefix%tele/%DeviceName%/state".to_string()
    }

    fn default_realtime_topic() -> String {
        "%Prefix%stat/%DeviceName%/%ValueName%".to_string()
    }

    fn default_structure_topic() -> String {
        "%Prefix%struct/%DeviceName%".to_string()
    }

    #[inline]
    pub fn availability_enabled(&self) -> bool {
        self.availability_topic.as_deref().is_some_and(|t| !t.is_empty())
    }

    #[inline]
    pub fn telemetry_enabled(&self) -> bool {
        !self.telemetry_interval.is_zero()
    }
}

/// One home-assistant discovery advertiser entry. The three matcher lists
/// are regular expressions ANDed together; an empty list matches everything.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct HassDiscoverySection {
    #[serde(default = "HassDiscoverySection::default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub via_mqtt_clients: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub registers: Vec<String>,
    /// Republish period; zero selects on-update mode.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub interval: Duration,
}

impl HassDiscoverySection {
    fn default_topic_prefix() -> String {
        "homeassistant".to_string()
    }
}

/// Per-device settings shared by every device kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GeneralSection {
    #[serde(default)]
    pub skip_fields: Vec<String>,
    #[serde(default)]
    pub skip_categories: Vec<String>,
    #[serde(default)]
    pub telemetry_via_mqtt_clients: Vec<String>,
    #[serde(default)]
    pub realtime_via_mqtt_clients: Vec<String>,
    #[serde(
        default = "GeneralSection::default_restart_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub restart_interval: Duration,
    #[serde(
        default = "GeneralSection::default_restart_interval_max_backoff",
        deserialize_with = "duration::deserialize"
    )]
    pub restart_interval_max_backoff: Duration,
    #[serde(default)]
    pub log_debug: bool,
    #[serde(default)]
    pub log_com_debug: bool,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            skip_fields: Vec::new(),
            skip_categories: Vec::new(),
            telemetry_via_mqtt_clients: Vec::new(),
            realtime_via_mqtt_clients: Vec::new(),
            restart_interval: Self::default_restart_interval(),
            restart_interval_max_backoff: Self::default_restart_interval_max_backoff(),
            log_debug: false,
            log_com_debug: false,
        }
    }
}

impl GeneralSection {
    fn default_restart_interval() -> Duration {
        Duration::from_millis(200)
    }

    fn default_restart_interval_max_backoff() -> Duration {
        Duration::from_secs(60)
    }

    /// Runtime view handed to drivers and the runner.
    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            skip_fields: self.skip_fields.clone(),
            skip_categories: self.skip_categories.clone(),
            restart: RestartPolicy {
                restart_interval: self.restart_interval,
                max_backoff: self.restart_interval_max_backoff,
            },
            log_debug: self.log_debug,
            log_com_debug: self.log_com_debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VictronDeviceKind {
    Vedirect,
    RandomBmv,
    RandomSolar,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct VictronDeviceSection {
    #[serde(default)]
    pub general: GeneralSection,
    /// Serial device path; required unless the kind is a random simulation.
    #[serde(default)]
    pub device: Option<String>,
    pub kind: VictronDeviceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ModbusDeviceKind {
    WaveshareRtuRelay8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RelaySection {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "RelaySection::default_open_label")]
    pub open_label: String,
    #[serde(default = "RelaySection::default_closed_label")]
    pub closed_label: String,
}

impl RelaySection {
    fn default_open_label() -> String {
        "open".to_string()
    }

    fn default_closed_label() -> String {
        "closed".to_string()
    }
}

fn deserialize_modbus_address<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u8),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => {
            let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
            u8::from_str_radix(digits, 16)
                .map_err(|_| de::Error::custom(format!("invalid modbus address '{s}'")))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ModbusDeviceSection {
    #[serde(default)]
    pub general: GeneralSection,
    pub bus: String,
    pub kind: ModbusDeviceKind,
    #[serde(deserialize_with = "deserialize_modbus_address")]
    pub address: u8,
    #[serde(default)]
    pub relays: HashMap<String, RelaySection>,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HttpDeviceKind {
    Teracom,
    Shelly3m,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct HttpDeviceSection {
    #[serde(default)]
    pub general: GeneralSection,
    pub url: String,
    pub kind: HttpDeviceKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MqttDeviceSection {
    #[serde(default)]
    pub general: GeneralSection,
    pub mqtt_topics: Vec<String>,
    /// Pool clients to subscribe on; empty selects all.
    #[serde(default)]
    pub mqtt_clients: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ViewDeviceSection {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub skip_fields: Vec<String>,
    #[serde(default)]
    pub skip_categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ViewSection {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub devices: Vec<ViewDeviceSection>,
    #[serde(default = "default_true")]
    pub autoplay: bool,
    /// Empty list makes the view public.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub hidden: bool,
}

impl ViewSection {
    #[inline]
    pub fn is_public(&self) -> bool {
        self.allowed_users.is_empty()
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|d| d.name.as_str())
    }
}

/// Genset controller thresholds and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GensetParamsSection {
    #[serde(deserialize_with = "duration::deserialize")]
    pub priming_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub cranking_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub warm_up_timeout: Duration,
    pub warm_up_temp: f64,
    pub engine_cool_down_temp: f64,
    #[serde(deserialize_with = "duration::deserialize")]
    pub engine_cool_down_timeout: Duration,
    pub enclosure_cool_down_temp: f64,
    #[serde(deserialize_with = "duration::deserialize")]
    pub enclosure_cool_down_timeout: Duration,

    #[serde(default = "GensetParamsSection::default_temp_min")]
    pub engine_temp_min: f64,
    #[serde(default = "GensetParamsSection::default_temp_max")]
    pub engine_temp_max: f64,
    #[serde(default = "GensetParamsSection::default_temp_min")]
    pub aux_temp0_min: f64,
    #[serde(default = "GensetParamsSection::default_temp_max")]
    pub aux_temp0_max: f64,
    #[serde(default = "GensetParamsSection::default_temp_min")]
    pub aux_temp1_min: f64,
    #[serde(default = "GensetParamsSection::default_temp_max")]
    pub aux_temp1_max: f64,

    pub u_min: f64,
    pub u_max: f64,
    pub f_min: f64,
    pub f_max: f64,
    pub p_max: f64,
    pub p_tot_max: f64,
}

impl GensetParamsSection {
    fn default_temp_min() -> f64 {
        0.0
    }

    fn default_temp_max() -> f64 {
        100.0
    }
}

/// Register names of the input device feeding each controller input.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GensetInputsSection {
    #[serde(default)]
    pub arm_switch: Option<String>,
    #[serde(default)]
    pub command_switch: Option<String>,
    #[serde(default)]
    pub reset_switch: Option<String>,
    #[serde(default, rename = "IOAvailable")]
    pub io_available: Option<String>,
    #[serde(default)]
    pub engine_temp: Option<String>,
    #[serde(default)]
    pub aux_temp0: Option<String>,
    #[serde(default)]
    pub aux_temp1: Option<String>,
    #[serde(default)]
    pub output_available: Option<String>,
    #[serde(default)]
    pub u0: Option<String>,
    #[serde(default)]
    pub u1: Option<String>,
    #[serde(default)]
    pub u2: Option<String>,
    #[serde(default)]
    pub f: Option<String>,
    #[serde(default)]
    pub l0: Option<String>,
    #[serde(default)]
    pub l1: Option<String>,
    #[serde(default)]
    pub l2: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GensetSection {
    /// Device whose storage rows feed the controller inputs.
    pub input_device: String,
    /// Synthetic device name used to publish state and outputs; defaults to
    /// the genset name.
    #[serde(default)]
    pub output_device: Option<String>,
    pub params: GensetParamsSection,
    #[serde(default)]
    pub inputs: GensetInputsSection,
}
