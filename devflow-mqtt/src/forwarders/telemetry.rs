use crate::{
    client::MqttClient,
    topics::{TopicContext, TopicTemplate},
};
use chrono::Utc;
use devflow_core::{DeviceRunner, ValueStorage};
use devflow_sdk::{RealtimeMessage, ValueFilter};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Aggregate snapshot published every `TelemetryInterval`.
#[derive(Debug, Serialize)]
pub struct TelemetryMessage {
    /// RFC 3339 time of this snapshot.
    #[serde(rename = "time")]
    pub time: String,
    /// RFC 3339 time of the next expected snapshot.
    #[serde(rename = "nextTelemetry")]
    pub next_telemetry: String,
    #[serde(rename = "model")]
    pub model: String,
    #[serde(rename = "secondsSinceLastUpdate", skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_update: Option<f64>,
    /// Register name to value-with-attributes map.
    #[serde(rename = "fields")]
    pub fields: BTreeMap<String, RealtimeMessage>,
}

pub(super) async fn run(
    storage: Arc<ValueStorage>,
    runner: Arc<DeviceRunner>,
    client: Arc<MqttClient>,
    cancel: CancellationToken,
) {
    let cfg = client.config().clone();
    let device = runner.name().to_string();
    let topic = TopicTemplate::compile(&cfg.telemetry_topic).render(&TopicContext {
        prefix: client.topic_prefix(),
        client_id: client.client_id(),
        device_name: &device,
        value_name: "",
    });
    let filter = ValueFilter::device(&device);
    let interval = cfg.telemetry_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now();
                let fields: BTreeMap<String, RealtimeMessage> = storage
                    .get_slice(&filter)
                    .iter()
                    .map(|v| (v.name().to_string(), v.realtime_message(true)))
                    .collect();
                let message = TelemetryMessage {
                    time: now.to_rfc3339(),
                    next_telemetry: (now + interval).to_rfc3339(),
                    model: runner.model(),
                    seconds_since_last_update: runner
                        .last_updated()
                        .map(|t| (now - t).num_milliseconds() as f64 / 1000.0),
                    fields,
                };
                match serde_json::to_vec(&message) {
                    Ok(payload) => client.publish(&topic, payload, cfg.qos, cfg.telemetry_retain),
                    Err(e) => warn!(device = %device, error = %e, "cannot encode telemetry message"),
                }
            }
        }
    }

    debug!(device = %device, client = client.name(), "telemetry forwarder stopped");
}
