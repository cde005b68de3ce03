use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Kind of a measurable or controllable point.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Text,
    Number,
    Enum,
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterType::Text => write!(f, "text"),
            RegisterType::Number => write!(f, "number"),
            RegisterType::Enum => write!(f, "enum"),
        }
    }
}

/// Scaling and acquisition metadata carried by number registers only.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberMeta {
    /// Raw values are divided by this factor before the offset is applied.
    pub factor: f64,
    pub offset: f64,
    pub signed: bool,
    /// Static registers change only at boot and are polled seldomly.
    pub static_register: bool,
}

impl Default for NumberMeta {
    fn default() -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
            signed: false,
            static_register: false,
        }
    }
}

#[derive(Debug, PartialEq)]
struct RegisterInner {
    device_name: Arc<str>,
    category: String,
    name: String,
    description: String,
    register_type: RegisterType,
    unit: Option<String>,
    enum_map: Option<BTreeMap<i64, String>>,
    sort: i32,
    controllable: bool,
    number: Option<NumberMeta>,
}

/// Typed description of one measurable/controllable point on a device.
///
/// Immutable once created; clones share the inner allocation. The key is
/// `(device_name, name)`.
#[derive(Debug, Clone)]
pub struct Register {
    inner: Arc<RegisterInner>,
}

impl Register {
    #[allow(clippy::too_many_arguments)]
    fn create(
        device_name: Arc<str>,
        category: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        register_type: RegisterType,
        unit: Option<String>,
        enum_map: Option<BTreeMap<i64, String>>,
        sort: i32,
        controllable: bool,
        number: Option<NumberMeta>,
    ) -> Self {
        Self {
            inner: Arc::new(RegisterInner {
                device_name,
                category: category.into(),
                name: name.into(),
                description: description.into(),
                register_type,
                unit,
                enum_map,
                sort,
                controllable,
                number,
            }),
        }
    }

    pub fn text(
        device_name: Arc<str>,
        category: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        sort: i32,
        controllable: bool,
    ) -> Self {
        Self::create(
            device_name,
            category,
            name,
            description,
            RegisterType::Text,
            None,
            None,
            sort,
            controllable,
            None,
        )
    }

    pub fn number(
        device_name: Arc<str>,
        category: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        unit: Option<String>,
        sort: i32,
        controllable: bool,
        meta: NumberMeta,
    ) -> Self {
        Self::create(
            device_name,
            category,
            name,
            description,
            RegisterType::Number,
            unit,
            None,
            sort,
            controllable,
            Some(meta),
        )
    }

    pub fn enumeration(
        device_name: Arc<str>,
        category: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        enum_map: BTreeMap<i64, String>,
        sort: i32,
        controllable: bool,
    ) -> Self {
        Self::create(
            device_name,
            category,
            name,
            description,
            RegisterType::Enum,
            None,
            Some(enum_map),
            sort,
            controllable,
            None,
        )
    }

    /// The synthetic availability register every device exposes.
    pub fn availability(device_name: Arc<str>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(crate::AVAILABILITY_DISCONNECTED, "disconnected".to_string());
        map.insert(crate::AVAILABILITY_CONNECTED, "connected".to_string());
        Self::enumeration(
            device_name,
            "Availability",
            crate::AVAILABILITY_REGISTER,
            "Availability",
            map,
            i32::MAX,
            false,
        )
    }

    #[inline]
    pub fn device_name(&self) -> &Arc<str> {
        &self.inner.device_name
    }

    #[inline]
    pub fn category(&self) -> &str {
        &self.inner.category
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    #[inline]
    pub fn register_type(&self) -> RegisterType {
        self.inner.register_type
    }

    #[inline]
    pub fn unit(&self) -> Option<&str> {
        self.inner.unit.as_deref()
    }

    #[inline]
    pub fn enum_map(&self) -> Option<&BTreeMap<i64, String>> {
        self.inner.enum_map.as_ref()
    }

    #[inline]
    pub fn sort(&self) -> i32 {
        self.inner.sort
    }

    #[inline]
    pub fn controllable(&self) -> bool {
        self.inner.controllable
    }

    #[inline]
    pub fn number_meta(&self) -> Option<&NumberMeta> {
        self.inner.number.as_ref()
    }

    /// Apply the number scaling `raw / factor + offset`.
    pub fn scale(&self, raw: f64) -> f64 {
        match &self.inner.number {
            Some(meta) => raw / meta.factor + meta.offset,
            None => raw,
        }
    }

    /// Schema payload published on the structure topic (no value).
    pub fn schema(&self) -> RegisterSchema<'_> {
        RegisterSchema {
            category: self.category(),
            name: self.name(),
            description: self.description(),
            register_type: self.register_type(),
            enum_map: self.enum_map(),
            unit: self.unit(),
            sort: self.sort(),
            controllable: self.controllable(),
        }
    }
}

impl PartialEq for Register {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_name(), self.name())
    }
}

/// Serialized register description, consumed by the structure forwarder and
/// the registers endpoint.
#[derive(Debug, Serialize)]
pub struct RegisterSchema<'a> {
    #[serde(rename = "Cat")]
    pub category: &'a str,
    #[serde(rename = "Name")]
    pub name: &'a str,
    #[serde(rename = "Desc")]
    pub description: &'a str,
    #[serde(rename = "Type")]
    pub register_type: RegisterType,
    #[serde(rename = "Enum", skip_serializing_if = "Option::is_none")]
    pub enum_map: Option<&'a BTreeMap<i64, String>>,
    #[serde(rename = "Unit", skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'a str>,
    #[serde(rename = "Sort")]
    pub sort: i32,
    #[serde(rename = "Cmnd")]
    pub controllable: bool,
}

/// Drop registers matching a skip list of names or categories.
pub fn filter_registers(
    input: Vec<Register>,
    skip_fields: &[String],
    skip_categories: &[String],
) -> Vec<Register> {
    input
        .into_iter()
        .filter(|r| !skip_fields.iter().any(|f| f == r.name()))
        .filter(|r| !skip_categories.iter().any(|c| c == r.category()))
        .collect()
}

/// Stable order for display: by sort key, ties keep insertion order.
pub fn sort_registers(mut input: Vec<Register>) -> Vec<Register> {
    input.sort_by_key(|r| r.sort());
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Arc<str> {
        Arc::from("bmv0")
    }

    #[test]
    fn scale_applies_factor_and_offset() {
        let r = Register::number(
            device(),
            "Essential",
            "MainVoltage",
            "Main voltage",
            Some("V".into()),
            0,
            false,
            NumberMeta {
                factor: 100.0,
                offset: 0.5,
                signed: true,
                static_register: false,
            },
        );
        assert_eq!(r.scale(1200.0), 12.5);
    }

    #[test]
    fn filter_drops_names_and_categories() {
        let regs = vec![
            Register::text(device(), "Product", "SerialNumber", "Serial number", 0, false),
            Register::text(device(), "Settings", "Relay", "Relay mode", 1, false),
            Register::text(device(), "Essential", "Alarm", "Alarm reason", 2, false),
        ];
        let out = filter_registers(regs, &["Alarm".to_string()], &["Settings".to_string()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "SerialNumber");
    }

    #[test]
    fn availability_register_shape() {
        let r = Register::availability(device());
        assert_eq!(r.register_type(), RegisterType::Enum);
        assert_eq!(r.enum_map().unwrap().get(&1).unwrap(), "connected");
        assert!(!r.controllable());
    }
}
