mod backlog;
mod client;
mod discovery;
mod forwarders;
mod pool;
mod topics;

pub use backlog::Backlog;
pub use client::{MqttClient, MqttMessage, RouteHandler};
pub use discovery::{
    advertise_cycle, camel_to_snake, discovery_message, AvailabilityEntry, DiscoveryAdvertiser,
    DiscoveryEntry, DiscoveryMessage, DiscoveryTarget,
};
pub use forwarders::{start_device_forwarders, ForwarderSelection, TelemetryMessage};
pub use pool::ClientPool;
pub use topics::{topic_matches, TopicContext, TopicTemplate};

/// Literal availability payloads.
pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";
