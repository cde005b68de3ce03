use crate::DeviceRunner;
use std::{collections::HashMap, sync::Arc};

/// Name-keyed set of device runners, read-only after construction.
#[derive(Default)]
pub struct DevicePool {
    runners: HashMap<String, Arc<DeviceRunner>>,
}

impl DevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, runner: Arc<DeviceRunner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Arc<DeviceRunner>> {
        self.runners.get(name)
    }

    /// Resolve a list of names; an empty list selects every runner.
    pub fn get_by_names(&self, names: &[String]) -> Vec<&Arc<DeviceRunner>> {
        if names.is_empty() {
            return self.runners.values().collect();
        }
        names
            .iter()
            .filter_map(|n| self.runners.get(n.as_str()))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceRunner>> {
        self.runners.values()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
