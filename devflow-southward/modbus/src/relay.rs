use crate::bus::ModbusBus;
use async_trait::async_trait;
use devflow_config::RelaySection;
use devflow_core::ValueStorage;
use devflow_sdk::{
    CommandSink, DeviceContext, Driver, DriverResult, Register, RunFailure, Value, ValuePayload,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNELS: usize = 8;

const RELAY_OPEN: i64 = 0;
const RELAY_CLOSED: i64 = 1;

/// Waveshare RTU relay-8 board: eight controllable relay channels read as
/// coils and written one at a time.
pub struct WaveshareRelayDriver {
    context: Arc<DeviceContext>,
    storage: Arc<ValueStorage>,
    bus: Arc<ModbusBus>,
    address: u8,
    poll_interval: Duration,
    registers: HashMap<String, (usize, Register)>,
    command_tx: CommandSink,
    command_rx: Mutex<Option<mpsc::Receiver<Value>>>,
}

impl WaveshareRelayDriver {
    pub fn new(
        context: Arc<DeviceContext>,
        storage: Arc<ValueStorage>,
        bus: Arc<ModbusBus>,
        address: u8,
        poll_interval: Duration,
        relays: &HashMap<String, RelaySection>,
    ) -> Arc<Self> {
        let settings = context.settings();
        let device_name = Arc::clone(context.name());
        let mut registers = HashMap::new();
        for channel in 0..CHANNELS {
            let name = format!("CH{}", channel + 1);
            let relay = relays.get(&name);
            let description = relay
                .and_then(|r| r.description.clone())
                .unwrap_or_else(|| name.clone());
            let mut map = BTreeMap::new();
            map.insert(
                RELAY_OPEN,
                relay.map_or("open".to_string(), |r| r.open_label.clone()),
            );
            map.insert(
                RELAY_CLOSED,
                relay.map_or("closed".to_string(), |r| r.closed_label.clone()),
            );
            let register = Register::enumeration(
                Arc::clone(&device_name),
                "Relays",
                name.clone(),
                description,
                map,
                channel as i32,
                true,
            );
            if settings.skip_fields.contains(&name)
                || settings.skip_categories.iter().any(|c| c == "Relays")
            {
                continue;
            }
            registers.insert(name, (channel, register));
        }

        let (command_tx, command_rx) = mpsc::channel(16);
        Arc::new(Self {
            context,
            storage,
            bus,
            address,
            poll_interval,
            registers,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        })
    }

    async fn read_states(&self) -> DriverResult<Vec<bool>> {
        self.bus
            .read_coils(self.address, 0x0000, CHANNELS as u16)
            .await
    }

    async fn write_relay(&self, channel: usize, closed: bool) -> DriverResult<()> {
        self.bus
            .write_single_coil(self.address, channel as u16, closed)
            .await
    }

    fn fill_states(&self, states: &[bool]) {
        for (channel, register) in self.registers.values() {
            let closed = states.get(*channel).copied().unwrap_or(false);
            let idx = if closed { RELAY_CLOSED } else { RELAY_OPEN };
            self.storage.fill(Value::enumeration(register.clone(), idx));
        }
        self.context.touch();
    }
}

#[async_trait]
impl Driver for WaveshareRelayDriver {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn model(&self) -> String {
        "Waveshare RTU Relay 8CH".to_string()
    }

    fn registers(&self) -> Vec<Register> {
        self.registers.values().map(|(_, r)| r.clone()).collect()
    }

    fn get_register(&self, name: &str) -> Option<Register> {
        self.registers.get(name).map(|(_, r)| r.clone())
    }

    fn command_sink(&self) -> Option<CommandSink> {
        Some(self.command_tx.clone())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), RunFailure> {
        // the first read doubles as the address/bus sanity check
        let states = self.read_states().await.map_err(RunFailure::immediate)?;
        self.fill_states(&states);

        let mut commands = self.command_rx.lock().await;
        let commands = commands.as_mut().expect("command receiver exists");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let states = self.read_states().await.map_err(RunFailure::transient)?;
                    self.fill_states(&states);
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    let Some((channel, _)) = self.registers.get(command.name()) else {
                        warn!(device = self.name(), register = command.name(), "command for unknown relay");
                        continue;
                    };
                    let closed = matches!(command.payload(), ValuePayload::Enum(idx) if *idx == RELAY_CLOSED);
                    debug!(device = self.name(), relay = command.name(), closed, "switching relay");
                    self.write_relay(*channel, closed)
                        .await
                        .map_err(RunFailure::transient)?;
                    // read back so the storage reflects the actual state
                    let states = self.read_states().await.map_err(RunFailure::transient)?;
                    self.fill_states(&states);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_sdk::{DeviceSettings, RegisterType};

    fn bus() -> Arc<ModbusBus> {
        Arc::new(ModbusBus::new(
            "bus0",
            "/dev/null",
            9600,
            Duration::from_millis(100),
            false,
        ))
    }

    #[test]
    fn builds_a_register_per_channel_with_configured_labels() {
        let mut relays = HashMap::new();
        relays.insert(
            "CH1".to_string(),
            RelaySection {
                description: Some("Lamp".to_string()),
                open_label: "off".to_string(),
                closed_label: "on".to_string(),
            },
        );

        let context = DeviceContext::new("relays0", DeviceSettings::default());
        let driver = WaveshareRelayDriver::new(
            context,
            ValueStorage::new(false),
            bus(),
            0x01,
            Duration::from_secs(1),
            &relays,
        );

        let registers = driver.registers();
        assert_eq!(registers.len(), CHANNELS);
        assert!(driver.command_sink().is_some());

        let ch1 = driver.get_register("CH1").unwrap();
        assert_eq!(ch1.register_type(), RegisterType::Enum);
        assert_eq!(ch1.description(), "Lamp");
        assert!(ch1.controllable());
        let map = ch1.enum_map().unwrap();
        assert_eq!(map[&RELAY_OPEN], "off");
        assert_eq!(map[&RELAY_CLOSED], "on");

        // channels without an entry fall back to the default labels
        let ch2 = driver.get_register("CH2").unwrap();
        assert_eq!(ch2.enum_map().unwrap()[&RELAY_OPEN], "open");
    }

    #[test]
    fn skip_lists_drop_channels() {
        let context = DeviceContext::new(
            "relays0",
            DeviceSettings {
                skip_fields: vec!["CH3".to_string()],
                ..Default::default()
            },
        );
        let driver = WaveshareRelayDriver::new(
            context,
            ValueStorage::new(false),
            bus(),
            0x01,
            Duration::from_secs(1),
            &HashMap::new(),
        );

        assert_eq!(driver.registers().len(), CHANNELS - 1);
        assert!(driver.get_register("CH3").is_none());
    }
}
