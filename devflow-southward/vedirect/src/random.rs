use crate::registers::{registers_for_product, VeRegisterDef};
use async_trait::async_trait;
use devflow_core::ValueStorage;
use devflow_sdk::{
    filter_registers, DeviceContext, Driver, Register, RegisterType, RunFailure, Value,
};
use rand::Rng;
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomKind {
    Bmv,
    Solar,
}

impl RandomKind {
    fn product_id(self) -> u16 {
        match self {
            RandomKind::Bmv => 0x0204,
            RandomKind::Solar => 0xA050,
        }
    }
}

/// Simulation driver synthesizing plausible values for development setups
/// without hardware attached.
pub struct RandomDriver {
    context: Arc<DeviceContext>,
    storage: Arc<ValueStorage>,
    kind: RandomKind,
    model: String,
    catalog: Vec<(Register, VeRegisterDef)>,
    registers: RwLock<Vec<Register>>,
}

impl RandomDriver {
    pub fn new(
        context: Arc<DeviceContext>,
        storage: Arc<ValueStorage>,
        kind: RandomKind,
    ) -> Arc<Self> {
        let (model, defs) =
            registers_for_product(kind.product_id()).expect("simulation catalog exists");
        let settings = context.settings().clone();
        let device_name = Arc::clone(context.name());
        let catalog: Vec<(Register, VeRegisterDef)> = defs
            .into_iter()
            .filter_map(|def| {
                let register = def.to_register(&device_name);
                filter_registers(
                    vec![register],
                    &settings.skip_fields,
                    &settings.skip_categories,
                )
                .pop()
                .map(|r| (r, def))
            })
            .collect();
        let registers = catalog.iter().map(|(r, _)| r.clone()).collect();
        context.set_model(format!("Random {model}"));
        Arc::new(Self {
            context,
            storage,
            kind,
            model: format!("Random {model}"),
            catalog,
            registers: RwLock::new(registers),
        })
    }

    fn synthesize(&self, register: &Register, def: &VeRegisterDef) -> Value {
        let mut rng = rand::thread_rng();
        match register.register_type() {
            RegisterType::Number => {
                let base = match def.name {
                    "MainVoltage" | "BatteryVoltage" => 12.8,
                    "AuxVoltage" | "MidPointVoltage" => 12.4,
                    "PanelVoltage" => 36.0,
                    "Current" | "ChargerCurrent" => 4.0,
                    "Power" | "PanelPower" | "MaximumPowerToday" => 55.0,
                    "StateOfCharge" => 84.0,
                    "BatteryTemperature" => 295.0,
                    _ => 10.0,
                };
                Value::numeric(register.clone(), base + rng.gen_range(-1.0..1.0))
            }
            RegisterType::Enum => {
                let keys: Vec<i64> = register
                    .enum_map()
                    .map(|m| m.keys().copied().collect())
                    .unwrap_or_default();
                let idx = keys
                    .get(rng.gen_range(0..keys.len().max(1)))
                    .copied()
                    .unwrap_or(0);
                Value::enumeration(register.clone(), idx)
            }
            RegisterType::Text => Value::text(register.clone(), "SIM0000000"),
        }
    }
}

#[async_trait]
impl Driver for RandomDriver {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn registers(&self) -> Vec<Register> {
        self.registers.read().expect("lock poisoned").clone()
    }

    fn get_register(&self, name: &str) -> Option<Register> {
        self.registers
            .read()
            .expect("lock poisoned")
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), RunFailure> {
        debug!(device = self.name(), kind = ?self.kind, "random driver started");
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    for (register, def) in &self.catalog {
                        self.storage.fill(self.synthesize(register, def));
                    }
                    self.context.touch();
                }
            }
        }
    }
}
