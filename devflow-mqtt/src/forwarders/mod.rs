mod availability;
mod realtime;
mod structure;
mod telemetry;

pub use telemetry::TelemetryMessage;

use crate::client::MqttClient;
use devflow_core::{DeviceRunner, ValueStorage};
use std::sync::Arc;
use tracing::info;

/// Which forwarder disciplines a `(device, client)` pair runs; computed by
/// the caller from the client's enable flags and the device's
/// `TelemetryViaMqttClients`/`RealtimeViaMqttClients` allow-lists.
#[derive(Debug, Clone, Copy)]
pub struct ForwarderSelection {
    pub realtime: bool,
    pub telemetry: bool,
    pub structure: bool,
}

/// Start the forwarders for one `(device, client)` pair. Their lifetime is
/// tied to the device runner's cancel token.
pub fn start_device_forwarders(
    runner: &Arc<DeviceRunner>,
    client: &Arc<MqttClient>,
    storage: &Arc<ValueStorage>,
    selection: ForwarderSelection,
    log_worker_start: bool,
) {
    let cfg = client.config();
    if log_worker_start {
        info!(
            device = runner.name(),
            client = client.name(),
            realtime = selection.realtime && cfg.realtime_enable,
            telemetry = selection.telemetry && cfg.telemetry_enabled(),
            structure = selection.structure && cfg.structure_enable,
            "starting forwarders"
        );
    }

    if selection.realtime && cfg.realtime_enable {
        tokio::spawn(realtime::run(
            Arc::clone(storage),
            Arc::clone(runner),
            Arc::clone(client),
            runner.cancel_token().child_token(),
        ));
    }
    if selection.telemetry && cfg.telemetry_enabled() {
        tokio::spawn(telemetry::run(
            Arc::clone(storage),
            Arc::clone(runner),
            Arc::clone(client),
            runner.cancel_token().child_token(),
        ));
    }
    if selection.structure && cfg.structure_enable {
        tokio::spawn(structure::run(
            Arc::clone(runner),
            Arc::clone(storage),
            Arc::clone(client),
            runner.cancel_token().child_token(),
        ));
    }
    tokio::spawn(availability::run(
        Arc::clone(storage),
        Arc::clone(runner),
        Arc::clone(client),
        runner.cancel_token().child_token(),
    ));
}
