use crate::client::MqttClient;
use std::{collections::HashMap, sync::Arc};

/// Name-keyed set of broker clients, read-only after construction.
#[derive(Default)]
pub struct ClientPool {
    clients: HashMap<String, Arc<MqttClient>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: Arc<MqttClient>) {
        self.clients.insert(client.name().to_string(), client);
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Arc<MqttClient>> {
        self.clients.get(name)
    }

    /// Resolve a list of names; an empty list selects every client.
    pub fn get_by_names(&self, names: &[String]) -> Vec<&Arc<MqttClient>> {
        if names.is_empty() {
            return self.clients.values().collect();
        }
        names
            .iter()
            .filter_map(|n| self.clients.get(n.as_str()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MqttClient>> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Orderly shutdown of every session.
    pub async fn shutdown(&self) {
        for client in self.clients.values() {
            client.shutdown().await;
        }
    }
}
