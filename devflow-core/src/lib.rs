mod pool;
mod runner;
mod storage;

pub use pool::DevicePool;
pub use runner::{DeviceRunner, RunnerState};
pub use storage::{StorageError, Subscription, ValueStorage, DEFAULT_SUBSCRIPTION_BUFFER};
