use devflow_sdk::{DriverError, DriverResult};
use std::time::Duration;
use tokio::{sync::Mutex, time::timeout};
use tokio_modbus::{
    client::{rtu, Context, Reader, Writer},
    slave::{Slave, SlaveContext as _},
    Exception,
};
use tokio_serial::SerialPortBuilderExt;
use tracing::trace;

/// One RS-485 bus shared by every modbus device configured on it.
///
/// Requests are serialized behind an async mutex; the RTU context is opened
/// lazily and dropped after a transport error or timeout so the next
/// request reopens the port.
pub struct ModbusBus {
    name: String,
    device: String,
    baud_rate: u32,
    read_timeout: Duration,
    log_debug: bool,
    ctx: Mutex<Option<Context>>,
}

impl ModbusBus {
    pub fn new(
        name: impl Into<String>,
        device: impl Into<String>,
        baud_rate: u32,
        read_timeout: Duration,
        log_debug: bool,
    ) -> Self {
        Self {
            name: name.into(),
            device: device.into(),
            baud_rate,
            read_timeout,
            log_debug,
            ctx: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> DriverResult<Context> {
        let stream = tokio_serial::new(&self.device, self.baud_rate)
            .open_native_async()
            .map_err(|e| {
                DriverError::ConfigurationError(format!(
                    "cannot open serial port {}: {e}",
                    self.device
                ))
            })?;
        Ok(rtu::attach(stream))
    }

    /// Map one timed modbus call onto the driver error taxonomy. A slave
    /// exception keeps the context; transport errors and timeouts drop it.
    fn settle<T>(
        &self,
        ctx_slot: &mut Option<Context>,
        op_label: &'static str,
        result: Result<Result<Result<T, Exception>, tokio_modbus::Error>, tokio::time::error::Elapsed>,
    ) -> DriverResult<T> {
        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(code))) => Err(DriverError::ExecutionError(format!(
                "modbus exception on bus {} during {op_label}: {code:?}",
                self.name
            ))),
            Ok(Err(e)) => {
                *ctx_slot = None;
                Err(DriverError::SessionError(format!(
                    "transport error on bus {} during {op_label}: {e}",
                    self.name
                )))
            }
            Err(_) => {
                *ctx_slot = None;
                Err(DriverError::Timeout(self.read_timeout))
            }
        }
    }

    pub async fn read_coils(
        &self,
        slave: u8,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<bool>> {
        let mut guard = self.ctx.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let ctx = guard.as_mut().expect("context just opened");
        ctx.set_slave(Slave(slave));
        if self.log_debug {
            trace!(bus = %self.name, slave, address, count, "read coils");
        }
        let result = timeout(self.read_timeout, ctx.read_coils(address, count)).await;
        self.settle(&mut guard, "ReadCoils", result)
    }

    pub async fn write_single_coil(
        &self,
        slave: u8,
        address: u16,
        value: bool,
    ) -> DriverResult<()> {
        let mut guard = self.ctx.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let ctx = guard.as_mut().expect("context just opened");
        ctx.set_slave(Slave(slave));
        if self.log_debug {
            trace!(bus = %self.name, slave, address, value, "write single coil");
        }
        let result = timeout(self.read_timeout, ctx.write_single_coil(address, value)).await;
        self.settle(&mut guard, "WriteSingleCoil", result)
    }
}
