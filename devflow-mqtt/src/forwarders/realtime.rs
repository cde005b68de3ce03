use crate::{
    client::MqttClient,
    topics::{TopicContext, TopicTemplate},
};
use devflow_core::{DeviceRunner, StorageError, ValueStorage};
use devflow_sdk::{Value, ValueFilter};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-change forwarder: one JSON message per accepted storage change.
///
/// With `RealtimeInterval > 0` changes are coalesced per register to at most
/// one message per interval; `RealtimeRepeat` additionally resends the
/// latest value of every register on each tick, changed or not.
pub(super) async fn run(
    storage: Arc<ValueStorage>,
    runner: Arc<DeviceRunner>,
    client: Arc<MqttClient>,
    cancel: CancellationToken,
) {
    let cfg = client.config().clone();
    let device = runner.name().to_string();
    let template = TopicTemplate::compile(&cfg.realtime_topic);
    let sub = storage.subscribe(cancel.child_token(), ValueFilter::device(&device));
    // registers whose attributes were already sent on this topic
    let mut announced: HashSet<String> = HashSet::new();

    let publish = |announced: &mut HashSet<String>, value: &Value| {
        let topic = template.render(&TopicContext {
            prefix: client.topic_prefix(),
            client_id: client.client_id(),
            device_name: &device,
            value_name: value.name(),
        });
        let first = announced.insert(value.name().to_string());
        match serde_json::to_vec(&value.realtime_message(first)) {
            Ok(payload) => client.publish(&topic, payload, cfg.qos, cfg.realtime_retain),
            Err(e) => warn!(device = %device, error = %e, "cannot encode realtime message"),
        }
    };

    if cfg.realtime_interval.is_zero() {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = sub.recv() => match received {
                    Ok(value) => publish(&mut announced, &value),
                    Err(StorageError::Closed) => break,
                    Err(StorageError::SubscriberOverflow) => {
                        warn!(device = %device, "realtime subscription overflowed");
                        break;
                    }
                }
            }
        }
    } else {
        let mut latest: HashMap<String, Value> = HashMap::new();
        let mut dirty: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(cfg.realtime_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = sub.recv() => match received {
                    Ok(value) => {
                        dirty.insert(value.name().to_string());
                        latest.insert(value.name().to_string(), value);
                    }
                    Err(StorageError::Closed) => break,
                    Err(StorageError::SubscriberOverflow) => {
                        warn!(device = %device, "realtime subscription overflowed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if cfg.realtime_repeat {
                        for value in latest.values() {
                            publish(&mut announced, value);
                        }
                        dirty.clear();
                    } else {
                        for name in dirty.drain() {
                            if let Some(value) = latest.get(&name) {
                                publish(&mut announced, value);
                            }
                        }
                    }
                }
            }
        }
    }

    debug!(device = %device, client = client.name(), "realtime forwarder stopped");
}
