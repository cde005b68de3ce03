mod driver;
mod error;
mod filter;
mod register;
mod retry;
mod value;

pub type DriverResult<T> = Result<T, DriverError>;

pub use driver::{CommandSink, DeviceContext, DeviceSettings, Driver, RunFailure};
pub use error::DriverError;
pub use filter::ValueFilter;
pub use register::{filter_registers, sort_registers, NumberMeta, Register, RegisterType};
pub use retry::{build_restart_backoff, RestartPolicy};
pub use value::{RealtimeMessage, Value, ValuePayload};

/// Name of the synthetic per-device availability register written by the
/// device runner, never by drivers.
pub const AVAILABILITY_REGISTER: &str = "Available";

/// Enum index published while the device's driver is running.
pub const AVAILABILITY_CONNECTED: i64 = 1;
/// Enum index published while the device's driver is down.
pub const AVAILABILITY_DISCONNECTED: i64 = 0;
