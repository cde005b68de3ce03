use std::time::Duration;
use thiserror::Error;

/// Driver specific errors
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Session error: {0}")]
    SessionError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Read/write timeout after {0:?}")]
    Timeout(Duration),
    #[error("Unknown product: {0}")]
    UnknownProduct(String),
    #[error("Subscription error: {0}")]
    SubscriptionError(String),
}
