use crate::{
    client::MqttClient,
    topics::{TopicContext, TopicTemplate},
};
use devflow_core::{DeviceRunner, StorageError, ValueStorage};
use devflow_sdk::{sort_registers, Register, ValueFilter};
use std::{collections::HashSet, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn publish_schema(client: &MqttClient, runner: &DeviceRunner, topic: &str) {
    let mut registers = runner.driver().registers();
    registers.push(Register::availability(Arc::from(runner.name())));
    let registers = sort_registers(registers);
    let schemas: Vec<_> = registers.iter().map(|r| r.schema()).collect();
    let cfg = client.config();
    match serde_json::to_vec(&schemas) {
        Ok(payload) => client.publish(topic, payload, cfg.qos, cfg.structure_retain),
        Err(e) => warn!(device = runner.name(), error = %e, "cannot encode structure message"),
    }
}

/// Publishes the device's register schema so downstream consumers can render
/// UIs without prior knowledge: every `StructureInterval`, or on register
/// set changes when the interval is zero.
pub(super) async fn run(
    runner: Arc<DeviceRunner>,
    storage: Arc<ValueStorage>,
    client: Arc<MqttClient>,
    cancel: CancellationToken,
) {
    let cfg = client.config().clone();
    let device = runner.name().to_string();
    let topic = TopicTemplate::compile(&cfg.structure_topic).render(&TopicContext {
        prefix: client.topic_prefix(),
        client_id: client.client_id(),
        device_name: &device,
        value_name: "",
    });

    if cfg.structure_interval.is_zero() {
        // On-update mode: a storage row for an unknown register name means
        // the register set changed.
        let sub = storage.subscribe(cancel.child_token(), ValueFilter::device(&device));
        let mut known: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = sub.recv() => match received {
                    Ok(value) => {
                        if known.insert(value.name().to_string()) {
                            publish_schema(&client, &runner, &topic);
                        }
                    }
                    Err(StorageError::Closed) => break,
                    Err(StorageError::SubscriberOverflow) => {
                        warn!(device = %device, "structure subscription overflowed");
                        break;
                    }
                }
            }
        }
    } else {
        let mut ticker = tokio::time::interval(cfg.structure_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => publish_schema(&client, &runner, &topic),
            }
        }
    }

    debug!(device = %device, client = client.name(), "structure forwarder stopped");
}
