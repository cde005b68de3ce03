use crate::{DriverError, Register, RestartPolicy, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sender side of a driver's command channel. The runner feeds it with
/// values taken from the command storage, filtered to the driver's device.
pub type CommandSink = mpsc::Sender<Value>;

/// Failure returned by a driver run.
///
/// `immediate` marks errors raised before any I/O was established
/// (configuration or address problems); the runner surfaces those louder
/// but retries on the same backoff schedule.
#[derive(Debug)]
pub struct RunFailure {
    pub source: DriverError,
    pub immediate: bool,
}

impl RunFailure {
    pub fn transient(source: DriverError) -> Self {
        Self {
            source,
            immediate: false,
        }
    }

    pub fn immediate(source: DriverError) -> Self {
        Self {
            source,
            immediate: true,
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.immediate {
            write!(f, "{} (before I/O was established)", self.source)
        } else {
            write!(f, "{}", self.source)
        }
    }
}

/// Per-device runtime settings shared by all driver kinds.
#[derive(Debug, Clone, Default)]
pub struct DeviceSettings {
    pub skip_fields: Vec<String>,
    pub skip_categories: Vec<String>,
    pub restart: RestartPolicy,
    pub log_debug: bool,
    pub log_com_debug: bool,
}

/// State shared between a driver and its runner: identity, settings and the
/// progress/model fields the runner exposes.
#[derive(Debug)]
pub struct DeviceContext {
    name: Arc<str>,
    settings: DeviceSettings,
    last_updated: RwLock<Option<DateTime<Utc>>>,
    model: RwLock<Option<String>>,
}

impl DeviceContext {
    pub fn new(name: impl Into<Arc<str>>, settings: DeviceSettings) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            settings,
            last_updated: RwLock::new(None),
            model: RwLock::new(None),
        })
    }

    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[inline]
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Record driver progress; read back via `last_updated`.
    pub fn touch(&self) {
        *self.last_updated.write().expect("lock poisoned") = Some(Utc::now());
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.last_updated.read().expect("lock poisoned")
    }

    pub fn set_model(&self, model: impl Into<String>) {
        *self.model.write().expect("lock poisoned") = Some(model.into());
    }

    pub fn model(&self) -> Option<String> {
        self.model.read().expect("lock poisoned").clone()
    }
}

/// Capability every device driver implements.
///
/// `run` owns the device I/O until the token is cancelled (clean stop,
/// return `Ok`) or the transport fails (return the failure for the runner
/// to schedule a restart). Register discovery may be lazy; `registers`
/// reflects what is known so far.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Driver-reported model string once known, e.g. after the identify
    /// handshake.
    fn model(&self) -> String;

    fn registers(&self) -> Vec<Register>;

    fn get_register(&self, name: &str) -> Option<Register>;

    /// Command channel for controllable devices; `None` when the device has
    /// no controllable points.
    fn command_sink(&self) -> Option<CommandSink> {
        None
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), RunFailure>;
}
