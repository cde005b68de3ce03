mod driver;
mod shelly;
mod teracom;

pub use driver::HttpDriver;

use devflow_core::ValueStorage;
use devflow_sdk::DeviceContext;
use std::{sync::Arc, time::Duration};

/// Supported HTTP device models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpDeviceKind {
    Teracom,
    Shelly3em,
}

/// Build a polling driver for the given device kind.
pub fn create_http_driver(
    kind: HttpDeviceKind,
    context: Arc<DeviceContext>,
    storage: Arc<ValueStorage>,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    poll_interval: Duration,
) -> Arc<HttpDriver> {
    let codec: Box<dyn driver::HttpCodec> = match kind {
        HttpDeviceKind::Teracom => Box::new(teracom::TeracomCodec),
        HttpDeviceKind::Shelly3em => Box::new(shelly::Shelly3emCodec),
    };
    HttpDriver::create(
        context,
        storage,
        base_url,
        username,
        password,
        poll_interval,
        codec,
    )
}
