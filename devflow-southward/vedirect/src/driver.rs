use crate::{
    protocol::VeDirect,
    registers::{registers_for_product, VeRegisterDef},
};
use async_trait::async_trait;
use devflow_core::ValueStorage;
use devflow_sdk::{
    filter_registers, DeviceContext, Driver, DriverError, Register, RegisterType, RunFailure,
    Value,
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Static registers are read once every this many poll cycles.
const STATIC_FETCH_CYCLES: u64 = 60;

/// VE.Direct serial device driver: identify the product, build the register
/// set from the catalog and poll on a 100 ms tick.
pub struct VedirectDriver {
    context: Arc<DeviceContext>,
    storage: Arc<ValueStorage>,
    device_path: String,
    registers: RwLock<Vec<Register>>,
}

impl VedirectDriver {
    pub fn new(
        context: Arc<DeviceContext>,
        storage: Arc<ValueStorage>,
        device_path: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            storage,
            device_path,
            registers: RwLock::new(Vec::new()),
        })
    }

    async fn poll_cycle(
        &self,
        vd: &mut VeDirect,
        registers: &HashMap<String, (Register, VeRegisterDef)>,
        fetch_static: bool,
    ) -> Result<(), RunFailure> {
        // flush async data, then ping at the beginning and after each error
        vd.recv_flush();
        let mut ping_needed = true;

        for (register, def) in registers.values() {
            if def.is_static() && !fetch_static {
                continue;
            }
            if ping_needed {
                vd.ping().await.map_err(RunFailure::transient)?;
            }

            let mut errored = false;
            match def.register_type() {
                RegisterType::Number => {
                    let raw = if def.is_signed() {
                        vd.get_int(def.address).await.map(|v| v as f64)
                    } else {
                        vd.get_uint(def.address).await.map(|v| v as f64)
                    };
                    match raw {
                        Ok(raw) => self
                            .storage
                            .fill(Value::numeric(register.clone(), register.scale(raw))),
                        Err(e) => {
                            debug!(device = self.name(), register = def.name, error = %e, "number read failed");
                            errored = true;
                        }
                    }
                }
                RegisterType::Text => match vd.get_string(def.address).await {
                    Ok(text) => self.storage.fill(Value::text(register.clone(), text)),
                    Err(e) => {
                        debug!(device = self.name(), register = def.name, error = %e, "text read failed");
                        errored = true;
                    }
                },
                RegisterType::Enum => match vd.get_uint(def.address).await {
                    Ok(idx) => self
                        .storage
                        .fill(Value::enumeration(register.clone(), idx as i64)),
                    Err(e) => {
                        debug!(device = self.name(), register = def.name, error = %e, "enum read failed");
                        errored = true;
                    }
                },
            }
            ping_needed = errored;
        }

        self.context.touch();
        Ok(())
    }
}

#[async_trait]
impl Driver for VedirectDriver {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn model(&self) -> String {
        self.context.model().unwrap_or_else(|| "vedirect".to_string())
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
        let settings = self.context.settings();
        let mut vd = VeDirect::open(&self.device_path, settings.log_com_debug)
            .await
            .map_err(RunFailure::immediate)?;

        vd.ping().await.map_err(RunFailure::immediate)?;

        let product_id = vd.product_id().await.map_err(RunFailure::immediate)?;
        let (model, defs) = registers_for_product(product_id).ok_or_else(|| {
            RunFailure::immediate(DriverError::UnknownProduct(format!(
                "product id 0x{product_id:04X}"
            )))
        })?;
        self.context.set_model(model);
        info!(device = self.name(), model, "connected");

        // build the filtered register set and register it with the runner
        let device_name = Arc::clone(self.context.name());
        let registers: HashMap<String, (Register, VeRegisterDef)> = defs
            .into_iter()
            .filter_map(|def| {
                let register = def.to_register(&device_name);
                filter_registers(
                    vec![register.clone()],
                    &settings.skip_fields,
                    &settings.skip_categories,
                )
                .pop()
                .map(|r| (def.name.to_string(), (r, def)))
            })
            .collect();
        *self.registers.write().expect("lock poisoned") =
            registers.values().map(|(r, _)| r.clone()).collect();

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cycle: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let fetch_static = cycle % STATIC_FETCH_CYCLES == 0;
                    if let Err(failure) = self.poll_cycle(&mut vd, &registers, fetch_static).await {
                        warn!(device = self.name(), error = %failure, "poll cycle failed");
                        return Err(failure);
                    }
                    cycle += 1;
                    if settings.log_debug {
                        debug!(device = self.name(), cycle, "registers fetched");
                    }
                }
            }
        }
    }
}
