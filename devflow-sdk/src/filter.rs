use crate::{Register, Value};
use std::collections::HashSet;

/// Filtered view onto the value storage: a set of device names to include
/// (or all), plus `(device, register)` and `(device, category)` skip sets.
#[derive(Debug, Clone, Default)]
pub struct ValueFilter {
    include_devices: Option<HashSet<String>>,
    skip_registers: HashSet<(String, String)>,
    skip_categories: HashSet<(String, String)>,
}

impl ValueFilter {
    /// Matches every value of every device.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given device names.
    pub fn devices<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            include_devices: Some(names.into_iter().map(|n| n.as_ref().to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn device(name: impl AsRef<str>) -> Self {
        Self::devices([name])
    }

    pub fn skip_register(mut self, device: impl AsRef<str>, register: impl AsRef<str>) -> Self {
        self.skip_registers
            .insert((device.as_ref().to_string(), register.as_ref().to_string()));
        self
    }

    pub fn skip_category(mut self, device: impl AsRef<str>, category: impl AsRef<str>) -> Self {
        self.skip_categories
            .insert((device.as_ref().to_string(), category.as_ref().to_string()));
        self
    }

    pub fn matches_register(&self, register: &Register) -> bool {
        let device = register.device_name().as_ref();
        if let Some(include) = &self.include_devices {
            if !include.contains(device) {
                return false;
            }
        }
        if self
            .skip_registers
            .contains(&(device.to_string(), register.name().to_string()))
        {
            return false;
        }
        if self
            .skip_categories
            .contains(&(device.to_string(), register.category().to_string()))
        {
            return false;
        }
        true
    }

    #[inline]
    pub fn matches(&self, value: &Value) -> bool {
        self.matches_register(value.register())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn register(device: &str, category: &str, name: &str) -> Register {
        Register::text(Arc::from(device), category, name, name, 0, false)
    }

    #[test]
    fn include_devices_limits_scope() {
        let f = ValueFilter::device("a");
        assert!(f.matches_register(&register("a", "Essential", "X")));
        assert!(!f.matches_register(&register("b", "Essential", "X")));
        assert!(ValueFilter::all().matches_register(&register("b", "Essential", "X")));
    }

    #[test]
    fn skip_sets_are_per_device() {
        let f = ValueFilter::all()
            .skip_register("a", "X")
            .skip_category("a", "Settings");
        assert!(!f.matches_register(&register("a", "Essential", "X")));
        assert!(f.matches_register(&register("b", "Essential", "X")));
        assert!(!f.matches_register(&register("a", "Settings", "Y")));
        assert!(f.matches_register(&register("b", "Settings", "Y")));
    }
}
