use crate::{
    backlog::Backlog,
    topics::{topic_matches, TopicContext, TopicTemplate},
    AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE,
};
use arc_swap::ArcSwapOption;
use devflow_config::MqttClientSection;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One queued or outgoing publish.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Handler invoked for every incoming message matching a route's topic
/// filter, in arrival order.
pub type RouteHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Route {
    filter: String,
    handler: RouteHandler,
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Named, long-lived broker session.
///
/// A supervisor task owns the rumqttc event loop and reconnects with
/// `ConnectRetryDelay` between attempts. Publishes are non-blocking: while
/// the session is down they land in a bounded backlog that is drained in
/// insertion order on reconnect, before any new message.
pub struct MqttClient {
    name: String,
    config: MqttClientSection,
    client_id: String,
    availability_topic: Option<String>,
    client: ArcSwapOption<AsyncClient>,
    healthy: AtomicBool,
    backlog: Mutex<Backlog>,
    routes: RwLock<Vec<Route>>,
    cancel: CancellationToken,
}

impl MqttClient {
    pub fn new(name: impl Into<String>, config: MqttClientSection) -> Arc<Self> {
        let name = name.into();
        let client_id = config.client_id.clone().unwrap_or_else(|| name.clone());
        let availability_topic = config.availability_topic.as_deref().and_then(|t| {
            if t.is_empty() {
                return None;
            }
            Some(TopicTemplate::compile(t).render(&TopicContext {
                prefix: &config.topic_prefix,
                client_id: &client_id,
                ..Default::default()
            }))
        });
        Arc::new(Self {
            name,
            backlog: Mutex::new(Backlog::new(config.max_backlog_size)),
            availability_topic,
            client_id,
            config,
            client: ArcSwapOption::from(None),
            healthy: AtomicBool::new(false),
            routes: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &MqttClientSection {
        &self.config
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[inline]
    pub fn topic_prefix(&self) -> &str {
        &self.config.topic_prefix
    }

    /// The rendered client availability topic, when configured.
    pub fn availability_topic(&self) -> Option<&str> {
        self.availability_topic.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Start the connection supervisor.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.supervise().await;
        });
    }

    /// Fire-and-forget publish. `%Prefix%` and `%ClientId%` leftovers in the
    /// topic are substituted from this client's configuration.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: u8, retain: bool) {
        let topic = if topic.contains('%') {
            topic
                .replace("%Prefix%", &self.config.topic_prefix)
                .replace("%ClientId%", &self.client_id)
        } else {
            topic.to_string()
        };
        let message = MqttMessage {
            topic,
            payload: payload.into(),
            qos,
            retain,
        };

        if self.healthy.load(Ordering::Acquire) {
            if let Some(client) = self.client.load_full() {
                match client.try_publish(
                    message.topic.clone(),
                    to_qos(message.qos),
                    message.retain,
                    message.payload.clone(),
                ) {
                    Ok(()) => {
                        if self.config.log_debug {
                            debug!(client = %self.name, topic = %message.topic, "published");
                        }
                        return;
                    }
                    Err(e) => {
                        if self.config.log_debug {
                            debug!(client = %self.name, error = %e, "publish failed, enqueueing to backlog");
                        }
                    }
                }
            }
        }
        self.backlog.lock().expect("lock poisoned").enqueue(message);
    }

    /// Install a subscription route; it is (re)subscribed on every
    /// connection.
    pub fn add_route(&self, filter: impl Into<String>, handler: RouteHandler) {
        let filter = filter.into();
        if self.is_connected() {
            if let Some(client) = self.client.load_full() {
                let _ = client.try_subscribe(filter.clone(), to_qos(self.config.qos));
            }
        }
        self.routes
            .write()
            .expect("lock poisoned")
            .push(Route { filter, handler });
    }

    async fn supervise(self: Arc<Self>) {
        info!(client = %self.name, broker = %self.config.broker, "mqtt client starting");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.session().await;
            self.healthy.store(false, Ordering::Release);
            self.client.store(None);
            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.connect_retry_delay) => {}
            }
        }
        info!(client = %self.name, "mqtt client stopped");
    }

    /// Drive one session: connect, serve events until the connection drops.
    async fn session(self: &Arc<Self>) {
        let (host, port, tls) = match devflow_config::parse_broker_url(&self.config.broker) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(client = %self.name, error = %e, "invalid broker url");
                return;
            }
        };

        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_keep_alive(self.config.keep_alive);
        if let Some(user) = &self.config.user {
            options.set_credentials(
                user.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        if tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: Vec::new(),
                alpn: None,
                client_auth: None,
            }));
        }
        if let Some(topic) = &self.availability_topic {
            options.set_last_will(LastWill::new(
                topic.clone(),
                AVAILABILITY_OFFLINE,
                to_qos(self.config.qos),
                self.config.availability_retain,
            ));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 128);
        let mut connected = false;

        loop {
            let event = if connected {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    event = event_loop.poll() => event,
                }
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    event = timeout(self.config.connect_timeout, event_loop.poll()) => match event {
                        Ok(event) => event,
                        Err(_) => {
                            warn!(client = %self.name, "connect timeout");
                            return;
                        }
                    },
                }
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(client = %self.name, "connected");
                    connected = true;
                    self.client.store(Some(Arc::new(client.clone())));
                    self.subscribe_routes(&client);
                    let this = Arc::clone(self);
                    let drain_client = client.clone();
                    tokio::spawn(async move {
                        this.on_connected(drain_client).await;
                    });
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if self.config.log_messages {
                        debug!(
                            client = %self.name,
                            topic = %publish.topic,
                            len = publish.payload.len(),
                            "message received"
                        );
                    }
                    self.dispatch(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!(client = %self.name, "broker sent disconnect");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    if connected {
                        warn!(client = %self.name, error = %e, "connection lost");
                    } else {
                        warn!(client = %self.name, error = %e, "connect failed");
                    }
                    return;
                }
            }
        }
    }

    fn subscribe_routes(&self, client: &AsyncClient) {
        let routes = self.routes.read().expect("lock poisoned");
        for route in routes.iter() {
            if let Err(e) = client.try_subscribe(route.filter.clone(), to_qos(self.config.qos)) {
                warn!(client = %self.name, filter = %route.filter, error = %e, "subscribe failed");
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let routes = self.routes.read().expect("lock poisoned");
        for route in routes.iter() {
            if topic_matches(&route.filter, topic) {
                (route.handler)(topic, payload);
            }
        }
    }

    /// Publish availability online, then drain the backlog in insertion
    /// order before marking the session healthy for live publishes.
    async fn on_connected(self: Arc<Self>, client: AsyncClient) {
        if let Some(topic) = &self.availability_topic {
            if let Err(e) = client
                .publish(
                    topic.clone(),
                    to_qos(self.config.qos),
                    self.config.availability_retain,
                    AVAILABILITY_ONLINE,
                )
                .await
            {
                warn!(client = %self.name, error = %e, "cannot publish availability");
            }
        }

        let mut marked = false;
        loop {
            let next = self.backlog.lock().expect("lock poisoned").dequeue();
            match next {
                Some(message) => {
                    if let Err(e) = client
                        .publish(
                            message.topic,
                            to_qos(message.qos),
                            message.retain,
                            message.payload,
                        )
                        .await
                    {
                        let dropped = self.backlog.lock().expect("lock poisoned").clear();
                        warn!(
                            client = %self.name,
                            error = %e,
                            dropped,
                            "cannot publish backlog, dropping remainder"
                        );
                        self.healthy.store(true, Ordering::Release);
                        return;
                    }
                    if self.config.log_debug {
                        debug!(client = %self.name, "published backlog message");
                    }
                }
                None if !marked => {
                    // Flip to healthy, then sweep once more to catch a
                    // publish that raced into the backlog.
                    self.healthy.store(true, Ordering::Release);
                    marked = true;
                }
                None => break,
            }
        }
    }

    /// Orderly shutdown: availability offline, disconnect, stop supervisor.
    pub async fn shutdown(&self) {
        if let Some(client) = self.client.load_full() {
            if let Some(topic) = &self.availability_topic {
                let _ = timeout(
                    std::time::Duration::from_secs(1),
                    client.publish(
                        topic.clone(),
                        to_qos(self.config.qos),
                        self.config.availability_retain,
                        AVAILABILITY_OFFLINE,
                    ),
                )
                .await;
            }
            let _ = timeout(std::time::Duration::from_secs(1), client.disconnect()).await;
        }
        self.cancel.cancel();
        info!(client = %self.name, "mqtt client shutdown completed");
    }
}
