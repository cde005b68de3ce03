use async_trait::async_trait;
use devflow_core::ValueStorage;
use devflow_mqtt::ClientPool;
use devflow_sdk::{
    DeviceContext, Driver, DriverError, NumberMeta, RealtimeMessage, Register, RunFailure, Value,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Derive the register name from the last topic segment.
fn register_name_from_topic(topic: &str) -> Option<&str> {
    let name = topic.rsplit('/').next().unwrap_or(topic);
    (!name.is_empty()).then_some(name)
}

/// Peered inbound device: receives realtime messages another instance
/// publishes and learns its register set from them.
///
/// The schema is sticky: once a register name has been observed with a set
/// of attributes, later messages with different attributes are ignored for
/// the schema, but their values are still stored.
pub struct MqttDeviceDriver {
    context: Arc<DeviceContext>,
    storage: Arc<ValueStorage>,
    pool: Arc<ClientPool>,
    topics: Vec<String>,
    client_names: Vec<String>,
    registers: Arc<RwLock<HashMap<String, Register>>>,
    routes_installed: AtomicBool,
}

impl MqttDeviceDriver {
    pub fn new(
        context: Arc<DeviceContext>,
        storage: Arc<ValueStorage>,
        pool: Arc<ClientPool>,
        topics: Vec<String>,
        client_names: Vec<String>,
    ) -> Arc<Self> {
        context.set_model("mqtt");
        Arc::new(Self {
            context,
            storage,
            pool,
            topics,
            client_names,
            registers: Arc::new(RwLock::new(HashMap::new())),
            routes_installed: AtomicBool::new(false),
        })
    }

    /// Look up or create the register for an incoming message; returns
    /// `None` when the register is excluded by the skip lists.
    fn add_ignore_register(
        context: &DeviceContext,
        registers: &RwLock<HashMap<String, Register>>,
        name: &str,
        message: &RealtimeMessage,
    ) -> Option<Register> {
        if let Some(existing) = registers.read().expect("lock poisoned").get(name) {
            return Some(existing.clone());
        }

        let category = message.category.clone().unwrap_or_default();
        let settings = context.settings();
        if settings.skip_fields.iter().any(|f| f == name)
            || settings.skip_categories.iter().any(|c| *c == category)
        {
            return None;
        }

        let description = message.description.clone().unwrap_or_else(|| name.to_string());
        let sort = message.sort.unwrap_or(0);
        let register = if message.numeric_value.is_some() {
            Register::number(
                Arc::clone(context.name()),
                category,
                name,
                description,
                message.unit.clone(),
                sort,
                false,
                NumberMeta::default(),
            )
        } else {
            Register::text(
                Arc::clone(context.name()),
                category,
                name,
                description,
                sort,
                false,
            )
        };

        registers
            .write()
            .expect("lock poisoned")
            .insert(name.to_string(), register.clone());
        Some(register)
    }

    fn handle_message(
        context: &Arc<DeviceContext>,
        storage: &Arc<ValueStorage>,
        registers: &Arc<RwLock<HashMap<String, Register>>>,
        topic: &str,
        payload: &[u8],
    ) {
        let Some(name) = register_name_from_topic(topic) else {
            warn!(device = context.name().as_ref(), topic, "cannot extract register name");
            return;
        };
        let message: RealtimeMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(device = context.name().as_ref(), topic, error = %e, "cannot parse payload");
                return;
            }
        };

        let Some(register) = Self::add_ignore_register(context, registers, name, &message) else {
            return;
        };

        if let Some(value) = message.numeric_value {
            storage.fill(Value::numeric(register, value));
        } else if let Some(text) = message.text_value {
            storage.fill(Value::text(register, text));
        } else {
            debug!(device = context.name().as_ref(), topic, "message without a value");
            return;
        }
        context.touch();
    }
}

#[async_trait]
impl Driver for MqttDeviceDriver {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn model(&self) -> String {
        "mqtt".to_string()
    }

    fn registers(&self) -> Vec<Register> {
        self.registers
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn get_register(&self, name: &str) -> Option<Register> {
        self.registers.read().expect("lock poisoned").get(name).cloned()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), RunFailure> {
        // routes survive on the clients; install them only once
        if !self.routes_installed.load(Ordering::Acquire) {
            let mut installed = 0usize;
            for client in self.pool.get_by_names(&self.client_names) {
                for topic in &self.topics {
                    info!(
                        device = self.name(),
                        client = client.name(),
                        topic = %topic,
                        "subscribing"
                    );
                    let context = Arc::clone(&self.context);
                    let storage = Arc::clone(&self.storage);
                    let registers = Arc::clone(&self.registers);
                    client.add_route(
                        topic.clone(),
                        Arc::new(move |topic, payload| {
                            Self::handle_message(&context, &storage, &registers, topic, payload);
                        }),
                    );
                    installed += 1;
                }
            }
            if installed == 0 {
                return Err(RunFailure::immediate(DriverError::ConfigurationError(
                    "no mqtt listener could be installed".to_string(),
                )));
            }
            self.routes_installed.store(true, Ordering::Release);
        }

        cancel.cancelled().await;
        Ok(())
    }
}
