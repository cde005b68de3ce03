use async_trait::async_trait;
use devflow_core::ValueStorage;
use devflow_sdk::{
    CommandSink, DeviceContext, Driver, DriverError, DriverResult, Register, RunFailure, Value,
    ValuePayload,
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Model-specific status parsing and command encoding behind the shared
/// polling shell.
pub(crate) trait HttpCodec: Send + Sync {
    fn model(&self) -> String;

    /// Path of the status document relative to the configured base url.
    fn status_path(&self) -> &str;

    /// Parse the status document into register values. Registers are built
    /// by the codec; the shell applies the skip lists and maintains the
    /// register map.
    fn parse_status(&self, body: &[u8], device: &Arc<str>) -> DriverResult<Vec<Value>>;

    /// Relative path (including query) performing a write, or `None` when
    /// the register is not controllable via this codec.
    fn command_path(&self, register: &Register, payload: &ValuePayload) -> Option<String>;
}

/// Polling driver shell shared by all HTTP device kinds.
pub struct HttpDriver {
    context: Arc<DeviceContext>,
    storage: Arc<ValueStorage>,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    poll_interval: Duration,
    codec: Box<dyn HttpCodec>,
    client: reqwest::Client,
    registers: RwLock<HashMap<String, Register>>,
    command_tx: CommandSink,
    command_rx: Mutex<Option<mpsc::Receiver<Value>>>,
}

impl HttpDriver {
    pub(crate) fn create(
        context: Arc<DeviceContext>,
        storage: Arc<ValueStorage>,
        base_url: String,
        username: Option<String>,
        password: Option<String>,
        poll_interval: Duration,
        codec: Box<dyn HttpCodec>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(16);
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds");
        context.set_model(codec.model());
        Arc::new(Self {
            context,
            storage,
            base_url,
            username,
            password,
            poll_interval,
            codec,
            client,
            registers: RwLock::new(HashMap::new()),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str) -> DriverResult<Vec<u8>> {
        let mut request = self.client.get(self.url(path));
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| DriverError::SessionError(format!("http request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DriverError::SessionError(format!(
                "http status {} for {path}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| DriverError::SessionError(format!("http body read failed: {e}")))
    }

    async fn poll(&self) -> DriverResult<()> {
        let body = self.get(&format!("/{}", self.codec.status_path())).await?;
        let values = self.codec.parse_status(&body, self.context.name())?;

        let settings = self.context.settings();
        let mut registers = self.registers.write().expect("lock poisoned");
        for value in values {
            let register = value.register();
            if settings.skip_fields.iter().any(|f| f == register.name())
                || settings
                    .skip_categories
                    .iter()
                    .any(|c| c == register.category())
            {
                continue;
            }
            registers
                .entry(register.name().to_string())
                .or_insert_with(|| register.clone());
            self.storage.fill(value.clone());
        }
        drop(registers);
        self.context.touch();
        Ok(())
    }
}

#[async_trait]
impl Driver for HttpDriver {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn model(&self) -> String {
        self.codec.model()
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

    fn command_sink(&self) -> Option<CommandSink> {
        Some(self.command_tx.clone())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), RunFailure> {
        // the first poll doubles as the url/credentials sanity check
        self.poll().await.map_err(RunFailure::immediate)?;

        let mut commands = self.command_rx.lock().await;
        let commands = commands.as_mut().expect("command receiver exists");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.poll().await.map_err(RunFailure::transient)?;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    let Some(register) = self.get_register(command.name()) else {
                        warn!(device = self.name(), register = command.name(), "command for unknown register");
                        continue;
                    };
                    match self.codec.command_path(&register, command.payload()) {
                        Some(path) => {
                            debug!(device = self.name(), register = command.name(), path, "writing command");
                            self.get(&path).await.map_err(RunFailure::transient)?;
                            self.poll().await.map_err(RunFailure::transient)?;
                        }
                        None => {
                            warn!(device = self.name(), register = command.name(), "register does not accept commands");
                        }
                    }
                }
            }
        }
    }
}
