use crate::{StorageError, ValueStorage};
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use devflow_sdk::{
    build_restart_backoff, DeviceContext, Driver, Register, Value, ValueFilter,
    AVAILABILITY_CONNECTED, AVAILABILITY_DISCONNECTED,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a supervised device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Stopped,
    Starting,
    Running,
    Failing,
    StoppedFinal,
}

/// Supervised lifecycle wrapper around one device driver.
///
/// Restarts the driver with exponential backoff on failure, publishes the
/// synthetic availability register on every transition into and out of
/// `Running`, pipes command-storage rows into the driver's command sink and
/// clears the device's storage rows on final shutdown.
pub struct DeviceRunner {
    context: Arc<DeviceContext>,
    driver: Arc<dyn Driver>,
    state_storage: Arc<ValueStorage>,
    command_storage: Arc<ValueStorage>,
    cancel: CancellationToken,
    state_tx: watch::Sender<RunnerState>,
    state_rx: watch::Receiver<RunnerState>,
}

impl DeviceRunner {
    pub fn new(
        context: Arc<DeviceContext>,
        driver: Arc<dyn Driver>,
        state_storage: Arc<ValueStorage>,
        command_storage: Arc<ValueStorage>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(RunnerState::Stopped);
        Arc::new(Self {
            context,
            driver,
            state_storage,
            command_storage,
            cancel,
            state_tx,
            state_rx,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.context.name()
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Most recent driver-reported progress.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.context.last_updated()
    }

    /// Driver-reported model string once known.
    pub fn model(&self) -> String {
        self.driver.model()
    }

    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state_rx.clone()
    }

    pub fn is_available(&self) -> bool {
        *self.state_rx.borrow() == RunnerState::Running
    }

    fn set_availability(&self, connected: bool) {
        let register = Register::availability(Arc::clone(self.context.name()));
        let idx = if connected {
            AVAILABILITY_CONNECTED
        } else {
            AVAILABILITY_DISCONNECTED
        };
        self.state_storage.fill(Value::enumeration(register, idx));
    }

    /// Run the supervision loop until the cancel token fires. Spawned as a
    /// background task; returns when the runner reached `StoppedFinal`.
    pub async fn run(self: Arc<Self>) {
        let policy = self.context.settings().restart;
        let mut backoff = build_restart_backoff(&policy);
        let mut last_immediate_error: Option<String> = None;

        let command_pipe = self.driver.command_sink().map(|sink| {
            let storage = Arc::clone(&self.command_storage);
            let filter = ValueFilter::device(self.context.name().as_ref());
            let cancel = self.cancel.child_token();
            let device = Arc::clone(self.context.name());
            tokio::spawn(async move {
                let sub = storage.subscribe(cancel, filter);
                loop {
                    match sub.recv().await {
                        Ok(value) => {
                            if sink.try_send(value).is_err() {
                                warn!(device = device.as_ref(), "command dropped, driver busy");
                            }
                        }
                        Err(StorageError::Closed) => break,
                        Err(StorageError::SubscriberOverflow) => {
                            warn!(device = device.as_ref(), "command subscription overflowed");
                            break;
                        }
                    }
                }
            })
        });

        while !self.cancel.is_cancelled() {
            let _ = self.state_tx.send(RunnerState::Starting);
            debug!(device = self.name(), "starting driver");

            let started = Instant::now();
            let _ = self.state_tx.send(RunnerState::Running);
            self.set_availability(true);

            let result = self.driver.run(self.cancel.child_token()).await;

            self.set_availability(false);
            let ran_for = started.elapsed();

            match result {
                Ok(()) if self.cancel.is_cancelled() => break,
                Ok(()) => {
                    // Driver returned without being asked to; treat like a
                    // transient failure and restart.
                    warn!(device = self.name(), "driver returned unexpectedly");
                }
                Err(failure) => {
                    if failure.immediate {
                        let msg = failure.to_string();
                        if last_immediate_error.as_deref() != Some(msg.as_str()) {
                            warn!(device = self.name(), error = %msg, "driver failed");
                            last_immediate_error = Some(msg);
                        } else {
                            debug!(device = self.name(), error = %msg, "driver failed again");
                        }
                    } else {
                        last_immediate_error = None;
                        warn!(device = self.name(), error = %failure, "driver failed");
                    }
                }
            }

            let _ = self.state_tx.send(RunnerState::Failing);

            // A long healthy run earns a fresh backoff schedule.
            if ran_for >= policy.max_backoff {
                backoff.reset();
            }
            let delay = backoff
                .next_backoff()
                .unwrap_or(policy.max_backoff)
                .max(Duration::from_millis(1));
            debug!(device = self.name(), delay_ms = delay.as_millis() as u64, "restart backoff");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(pipe) = command_pipe {
            pipe.abort();
        }
        self.state_storage.remove_device(self.name());
        let _ = self.state_tx.send(RunnerState::StoppedFinal);
        info!(device = self.name(), "device runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use devflow_sdk::{
        DeviceSettings, DriverError, RestartPolicy, RunFailure, ValuePayload,
        AVAILABILITY_REGISTER,
    };
    use std::sync::Mutex;

    /// Driver that fails immediately on every start and records call times.
    struct FailingDriver {
        context: Arc<DeviceContext>,
        starts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Driver for FailingDriver {
        fn name(&self) -> &str {
            self.context.name()
        }

        fn model(&self) -> String {
            "failing".into()
        }

        fn registers(&self) -> Vec<Register> {
            Vec::new()
        }

        fn get_register(&self, _name: &str) -> Option<Register> {
            None
        }

        async fn run(&self, _cancel: CancellationToken) -> Result<(), RunFailure> {
            self.starts.lock().unwrap().push(Instant::now());
            Err(RunFailure::immediate(DriverError::ConfigurationError(
                "no such port".into(),
            )))
        }
    }

    #[tokio::test]
    async fn restart_delays_double() {
        let settings = DeviceSettings {
            restart: RestartPolicy {
                restart_interval: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
            ..Default::default()
        };
        let context = DeviceContext::new("dev0", settings);
        let driver = Arc::new(FailingDriver {
            context: Arc::clone(&context),
            starts: Mutex::new(Vec::new()),
        });
        let storage = ValueStorage::new(false);
        let commands = ValueStorage::new(false);
        let cancel = CancellationToken::new();

        let runner = DeviceRunner::new(
            context,
            Arc::clone(&driver) as Arc<dyn Driver>,
            storage,
            commands,
            cancel.clone(),
        );
        let handle = tokio::spawn(Arc::clone(&runner).run());

        // wait for the 5th start: delays 10, 20, 40, 40 ms
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let _ = handle.await;

        let starts = driver.starts.lock().unwrap().clone();
        assert!(starts.len() >= 4, "driver restarted {} times", starts.len());
        let gap = |i: usize| starts[i + 1].duration_since(starts[i]);
        // doubling with slack for scheduler jitter
        assert!(gap(0) >= Duration::from_millis(10) && gap(0) < Duration::from_millis(20));
        assert!(gap(1) >= Duration::from_millis(20) && gap(1) < Duration::from_millis(40));
        assert!(gap(2) >= Duration::from_millis(40));
    }

    /// Driver that emits one value per run, then fails.
    struct OneShotDriver {
        context: Arc<DeviceContext>,
        storage: Arc<ValueStorage>,
        register: Register,
    }

    #[async_trait]
    impl Driver for OneShotDriver {
        fn name(&self) -> &str {
            self.context.name()
        }

        fn model(&self) -> String {
            "oneshot".into()
        }

        fn registers(&self) -> Vec<Register> {
            vec![self.register.clone()]
        }

        fn get_register(&self, name: &str) -> Option<Register> {
            (self.register.name() == name).then(|| self.register.clone())
        }

        async fn run(&self, _cancel: CancellationToken) -> Result<(), RunFailure> {
            self.storage.fill(Value::numeric(self.register.clone(), 1.0));
            Err(RunFailure::transient(DriverError::SessionError(
                "gone".into(),
            )))
        }
    }

    #[tokio::test]
    async fn values_are_bracketed_by_availability() {
        let settings = DeviceSettings {
            restart: RestartPolicy {
                restart_interval: Duration::from_millis(50),
                max_backoff: Duration::from_millis(50),
            },
            ..Default::default()
        };
        let context = DeviceContext::new("dev0", settings);
        let storage = ValueStorage::new(false);
        let commands = ValueStorage::new(false);

        let register = Register::number(
            Arc::from("dev0"),
            "Essential",
            "Power",
            "Power",
            None,
            0,
            false,
            Default::default(),
        );
        let driver = Arc::new(OneShotDriver {
            context: Arc::clone(&context),
            storage: Arc::clone(&storage),
            register,
        });

        let sub_cancel = CancellationToken::new();
        let sub = storage.subscribe(sub_cancel.clone(), ValueFilter::all());

        let cancel = CancellationToken::new();
        let runner = DeviceRunner::new(
            context,
            driver as Arc<dyn Driver>,
            Arc::clone(&storage),
            commands,
            cancel.clone(),
        );
        let handle = tokio::spawn(Arc::clone(&runner).run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let _ = handle.await;
        sub_cancel.cancel();

        let mut log = Vec::new();
        while let Ok(v) = sub.recv().await {
            log.push(v);
        }

        // first run: Available=1, Power=1.0, Available=0
        assert!(log.len() >= 3);
        assert_eq!(log[0].name(), AVAILABILITY_REGISTER);
        assert_eq!(log[0].payload(), &ValuePayload::Enum(1));
        assert_eq!(log[1].name(), "Power");
        let after = log[2..].iter().find(|v| v.name() == AVAILABILITY_REGISTER);
        assert_eq!(after.unwrap().payload(), &ValuePayload::Enum(0));
    }
}
