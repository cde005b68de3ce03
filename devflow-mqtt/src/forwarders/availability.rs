use crate::{
    client::MqttClient,
    topics::{TopicContext, TopicTemplate},
    AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE,
};
use devflow_core::{DeviceRunner, StorageError, ValueStorage};
use devflow_sdk::{ValueFilter, ValuePayload, AVAILABILITY_CONNECTED, AVAILABILITY_REGISTER};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Mirrors the runner's synthetic availability register onto the device
/// availability topic as literal `online`/`offline` payloads.
pub(super) async fn run(
    storage: Arc<ValueStorage>,
    runner: Arc<DeviceRunner>,
    client: Arc<MqttClient>,
    cancel: CancellationToken,
) {
    let cfg = client.config().clone();
    let device = runner.name().to_string();
    let topic = TopicTemplate::compile(&cfg.availability_device_topic).render(&TopicContext {
        prefix: client.topic_prefix(),
        client_id: client.client_id(),
        device_name: &device,
        value_name: "",
    });
    let sub = storage.subscribe(cancel.child_token(), ValueFilter::device(&device));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = sub.recv() => match received {
                Ok(value) => {
                    if value.name() != AVAILABILITY_REGISTER {
                        continue;
                    }
                    let online = matches!(value.payload(), ValuePayload::Enum(idx) if *idx == AVAILABILITY_CONNECTED);
                    let payload = if online { AVAILABILITY_ONLINE } else { AVAILABILITY_OFFLINE };
                    client.publish(&topic, payload, cfg.qos, cfg.availability_device_retain);
                }
                Err(StorageError::Closed) => break,
                Err(StorageError::SubscriberOverflow) => {
                    warn!(device = %device, "availability subscription overflowed");
                    break;
                }
            }
        }
    }

    debug!(device = %device, client = client.name(), "availability forwarder stopped");
}
