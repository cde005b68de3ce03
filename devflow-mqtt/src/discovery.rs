use crate::{
    client::MqttClient,
    pool::ClientPool,
    topics::{TopicContext, TopicTemplate},
};
use devflow_config::HassDiscoverySection;
use devflow_core::{DevicePool, StorageError, ValueStorage};
use devflow_sdk::{Register, RegisterType, ValueFilter};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fmt::Write as _,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Compiled advertiser entry: three regex lists ANDed together; an empty
/// list matches everything.
#[derive(Debug, Clone)]
pub struct DiscoveryEntry {
    pub topic_prefix: String,
    pub via_mqtt_clients: Vec<String>,
    pub interval: Duration,
    devices: Vec<Regex>,
    categories: Vec<Regex>,
    registers: Vec<Regex>,
}

impl DiscoveryEntry {
    pub fn from_section(section: &HassDiscoverySection) -> Result<Self, regex::Error> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, regex::Error> {
            patterns.iter().map(|p| Regex::new(p)).collect()
        };
        Ok(Self {
            topic_prefix: section.topic_prefix.clone(),
            via_mqtt_clients: section.via_mqtt_clients.clone(),
            interval: section.interval,
            devices: compile(&section.devices)?,
            categories: compile(&section.categories)?,
            registers: compile(&section.registers)?,
        })
    }

    pub fn applies_to_client(&self, name: &str) -> bool {
        self.via_mqtt_clients.is_empty() || self.via_mqtt_clients.iter().any(|c| c == name)
    }

    pub fn matches(&self, device: &str, register: &Register) -> bool {
        let any = |list: &[Regex], value: &str| list.is_empty() || list.iter().any(|r| r.is_match(value));
        any(&self.devices, device)
            && any(&self.categories, register.category())
            && any(&self.registers, register.name())
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct AvailabilityEntry {
    #[serde(rename = "t")]
    pub topic: String,
}

/// Home-assistant discovery payload.
#[derive(Debug, Serialize, PartialEq)]
pub struct DiscoveryMessage {
    #[serde(rename = "uniq_id")]
    pub unique_id: String,
    pub name: String,
    #[serde(rename = "stat_t")]
    pub state_topic: String,
    #[serde(rename = "avty")]
    pub availability: Vec<AvailabilityEntry>,
    #[serde(rename = "avty_mode")]
    pub availability_mode: &'static str,
    #[serde(rename = "val_tpl")]
    pub value_template: String,
    #[serde(rename = "unit_of_meas", skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
}

/// One broker client's view used when rendering discovery payloads.
#[derive(Debug, Clone)]
pub struct DiscoveryTarget {
    pub client_name: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub realtime_topic: TopicTemplate,
    pub device_availability_topic: TopicTemplate,
    pub client_availability_topic: Option<String>,
    pub qos: u8,
}

impl DiscoveryTarget {
    pub fn from_client(client: &MqttClient) -> Self {
        let cfg = client.config();
        Self {
            client_name: client.name().to_string(),
            client_id: client.client_id().to_string(),
            topic_prefix: cfg.topic_prefix.clone(),
            realtime_topic: TopicTemplate::compile(&cfg.realtime_topic),
            device_availability_topic: TopicTemplate::compile(&cfg.availability_device_topic),
            client_availability_topic: client.availability_topic().map(str::to_string),
            qos: cfg.qos,
        }
    }
}

/// `MainVoltage` -> `main_voltage`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn value_template_for(register: &Register) -> String {
    match register.register_type() {
        RegisterType::Number => "{{ value_json.NumVal }}".to_string(),
        RegisterType::Text => "{{ value_json.TextVal }}".to_string(),
        RegisterType::Enum => {
            // conditional expression mapping EnumIdx to the enum labels
            let mut template = String::new();
            let mut op = "if";
            if let Some(map) = register.enum_map() {
                for (idx, label) in map {
                    let _ = write!(template, "{{% {op} value_json.EnumIdx == {idx} %}}{label}");
                    op = "elif";
                }
            }
            template.push_str("{% endif %}");
            template
        }
    }
}

/// Build the discovery topic and payload for one register on one target.
pub fn discovery_message(
    discovery_prefix: &str,
    target: &DiscoveryTarget,
    device: &str,
    register: &Register,
) -> (String, DiscoveryMessage) {
    let unique_id = format!("{device}-{}", camel_to_snake(register.name()));
    let topic = format!(
        "{discovery_prefix}/sensor/{}/{unique_id}/config",
        target.client_id
    );

    let mut availability = Vec::new();
    if let Some(client_topic) = &target.client_availability_topic {
        availability.push(AvailabilityEntry {
            topic: client_topic.clone(),
        });
    }
    availability.push(AvailabilityEntry {
        topic: target.device_availability_topic.render(&TopicContext {
            prefix: &target.topic_prefix,
            client_id: &target.client_id,
            device_name: device,
            value_name: "",
        }),
    });

    let message = DiscoveryMessage {
        unique_id,
        name: format!("{device} {}", register.description()),
        state_topic: target.realtime_topic.render(&TopicContext {
            prefix: &target.topic_prefix,
            client_id: &target.client_id,
            device_name: device,
            value_name: register.name(),
        }),
        availability,
        availability_mode: "all",
        value_template: value_template_for(register),
        unit_of_measurement: register.unit().map(str::to_string),
    };
    (topic, message)
}

/// Run one advertise cycle over the given entries. A `(client, topic)` pair
/// receives at most one payload per cycle even when multiple entries match
/// the same register.
pub fn advertise_cycle<F>(
    entries: &[&DiscoveryEntry],
    targets: &[DiscoveryTarget],
    devices: &[(String, Vec<Register>)],
    seen: &mut HashSet<(String, String)>,
    mut publish: F,
) where
    F: FnMut(&DiscoveryTarget, String, DiscoveryMessage),
{
    for entry in entries {
        for target in targets
            .iter()
            .filter(|t| entry.applies_to_client(&t.client_name))
        {
            for (device, registers) in devices {
                for register in registers {
                    if !entry.matches(device, register) {
                        continue;
                    }
                    let (topic, message) =
                        discovery_message(&entry.topic_prefix, target, device, register);
                    if seen.insert((target.client_name.clone(), topic.clone())) {
                        publish(target, topic, message);
                    }
                }
            }
        }
    }
}

fn device_registers(devices: &DevicePool) -> Vec<(String, Vec<Register>)> {
    devices
        .iter()
        .map(|runner| {
            let mut registers = runner.driver().registers();
            registers.push(Register::availability(Arc::from(runner.name())));
            (runner.name().to_string(), registers)
        })
        .collect()
}

fn publish_via_pool(
    pool: &ClientPool,
    target: &DiscoveryTarget,
    topic: String,
    message: &DiscoveryMessage,
) {
    let Some(client) = pool.get_by_name(&target.client_name) else {
        return;
    };
    match serde_json::to_vec(message) {
        Ok(payload) => {
            debug!(client = %target.client_name, topic = %topic, "publishing discovery message");
            client.publish(&topic, payload, target.qos, true);
        }
        Err(e) => warn!(error = %e, "cannot encode discovery message"),
    }
}

/// Emits home-assistant discovery payloads for every matching register.
///
/// Entries with an interval republish periodically (defense against broker
/// retained-message loss, grouped by interval so overlapping entries
/// deduplicate within one cycle); entries without an interval publish once
/// per register as the register set becomes visible in the storage.
pub struct DiscoveryAdvertiser;

impl DiscoveryAdvertiser {
    pub fn start(
        entries: Vec<DiscoveryEntry>,
        pool: Arc<ClientPool>,
        devices: Arc<DevicePool>,
        storage: Arc<ValueStorage>,
        cancel: CancellationToken,
    ) {
        let targets: Vec<DiscoveryTarget> =
            pool.iter().map(|c| DiscoveryTarget::from_client(c)).collect();

        let mut periodic: HashMap<Duration, Vec<DiscoveryEntry>> = HashMap::new();
        let mut on_update: Vec<DiscoveryEntry> = Vec::new();
        for entry in entries {
            if entry.interval.is_zero() {
                on_update.push(entry);
            } else {
                periodic.entry(entry.interval).or_default().push(entry);
            }
        }

        for (interval, group) in periodic {
            let pool = Arc::clone(&pool);
            let devices = Arc::clone(&devices);
            let targets = targets.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                info!(interval = ?interval, entries = group.len(), "discovery advertiser started");
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let entry_refs: Vec<&DiscoveryEntry> = group.iter().collect();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let mut seen = HashSet::new();
                            advertise_cycle(
                                &entry_refs,
                                &targets,
                                &device_registers(&devices),
                                &mut seen,
                                |target, topic, message| {
                                    publish_via_pool(&pool, target, topic, &message);
                                },
                            );
                        }
                    }
                }
            });
        }

        if !on_update.is_empty() {
            let pool = Arc::clone(&pool);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                info!(entries = on_update.len(), "discovery advertiser started in on-update mode");
                let sub = storage.subscribe(cancel.child_token(), ValueFilter::all());
                let entry_refs: Vec<&DiscoveryEntry> = on_update.iter().collect();
                // persistent across updates: each register advertises once
                let mut seen: HashSet<(String, String)> = HashSet::new();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = sub.recv() => match received {
                            Ok(value) => {
                                let device = value.device_name().to_string();
                                let registers = vec![(device, vec![value.register().clone()])];
                                advertise_cycle(
                                    &entry_refs,
                                    &targets,
                                    &registers,
                                    &mut seen,
                                    |target, topic, message| {
                                        publish_via_pool(&pool, target, topic, &message);
                                    },
                                );
                            }
                            Err(StorageError::Closed) => break,
                            Err(StorageError::SubscriberOverflow) => {
                                warn!("discovery subscription overflowed");
                                break;
                            }
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn section(registers: Vec<&str>) -> HassDiscoverySection {
        let yaml = "TopicPrefix: homeassistant";
        let mut section: HassDiscoverySection = serde_yaml::from_str(yaml).unwrap();
        section.registers = registers.into_iter().map(str::to_string).collect();
        section
    }

    fn target() -> DiscoveryTarget {
        DiscoveryTarget {
            client_name: "local".to_string(),
            client_id: "server42".to_string(),
            topic_prefix: "p/".to_string(),
            realtime_topic: TopicTemplate::compile("%Prefix%stat/%DeviceName%/%ValueName%"),
            device_availability_topic: TopicTemplate::compile("%Prefix%avail/%DeviceName%"),
            client_availability_topic: Some("p/server42/status".to_string()),
            qos: 1,
        }
    }

    fn number(device: &str, name: &str) -> Register {
        Register::number(
            Arc::from(device),
            "Essential",
            name,
            name,
            Some("V".into()),
            0,
            false,
            Default::default(),
        )
    }

    #[test]
    fn register_regexes_select_topics() {
        let entry = DiscoveryEntry::from_section(&section(vec!["Voltage$"])).unwrap();
        let devices = vec![(
            "bmv1".to_string(),
            vec![
                number("bmv1", "MainVoltage"),
                number("bmv1", "AuxVoltage"),
                number("bmv1", "Current"),
            ],
        )];

        let mut topics = Vec::new();
        let mut seen = HashSet::new();
        advertise_cycle(&[&entry], &[target()], &devices, &mut seen, |_, topic, _| {
            topics.push(topic)
        });

        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/server42/bmv1-main_voltage/config".to_string(),
                "homeassistant/sensor/server42/bmv1-aux_voltage/config".to_string(),
            ]
        );
    }

    #[test]
    fn overlapping_entries_publish_once_per_cycle() {
        let a = DiscoveryEntry::from_section(&section(vec!["Voltage$"])).unwrap();
        let b = DiscoveryEntry::from_section(&section(vec!["^Main"])).unwrap();
        let devices = vec![("bmv1".to_string(), vec![number("bmv1", "MainVoltage")])];

        let mut count = 0;
        let mut seen = HashSet::new();
        advertise_cycle(&[&a, &b], &[target()], &devices, &mut seen, |_, _, _| {
            count += 1
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn value_templates_follow_register_type() {
        let target = target();
        let number = number("bmv1", "MainVoltage");
        let (_, msg) = discovery_message("homeassistant", &target, "bmv1", &number);
        assert_eq!(msg.value_template, "{{ value_json.NumVal }}");
        assert_eq!(msg.state_topic, "p/stat/bmv1/MainVoltage");
        assert_eq!(msg.availability_mode, "all");
        assert_eq!(msg.availability.len(), 2);
        assert_eq!(msg.unit_of_measurement.as_deref(), Some("V"));

        let mut map = BTreeMap::new();
        map.insert(0, "open".to_string());
        map.insert(1, "closed".to_string());
        let relay = Register::enumeration(Arc::from("r0"), "Relays", "CH1", "Lamp", map, 0, true);
        let (_, msg) = discovery_message("homeassistant", &target, "r0", &relay);
        assert_eq!(
            msg.value_template,
            "{% if value_json.EnumIdx == 0 %}open{% elif value_json.EnumIdx == 1 %}closed{% endif %}"
        );

        let text = Register::text(Arc::from("d"), "Product", "Model", "Model", 0, false);
        let (_, msg) = discovery_message("homeassistant", &target, "d", &text);
        assert_eq!(msg.value_template, "{{ value_json.TextVal }}");
    }

    #[test]
    fn camel_to_snake_cases() {
        assert_eq!(camel_to_snake("MainVoltage"), "main_voltage");
        assert_eq!(camel_to_snake("Power"), "power");
        assert_eq!(camel_to_snake("CH1"), "c_h1");
    }
}
