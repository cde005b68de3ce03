use devflow_sdk::{NumberMeta, Register, RegisterType};
use std::{collections::BTreeMap, sync::Arc};

/// How a catalog entry is fetched and decoded.
#[derive(Debug, Clone)]
pub enum VeKind {
    Number {
        factor: f64,
        offset: f64,
        signed: bool,
        static_register: bool,
    },
    Enum(BTreeMap<i64, String>),
    Text {
        static_register: bool,
    },
}

/// One entry of a product's register catalog.
#[derive(Debug, Clone)]
pub struct VeRegisterDef {
    pub category: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub address: u16,
    pub unit: Option<&'static str>,
    pub sort: i32,
    pub kind: VeKind,
}

impl VeRegisterDef {
    pub fn to_register(&self, device: &Arc<str>) -> Register {
        match &self.kind {
            VeKind::Number {
                factor,
                offset,
                signed,
                static_register,
            } => Register::number(
                Arc::clone(device),
                self.category,
                self.name,
                self.description,
                self.unit.map(str::to_string),
                self.sort,
                false,
                NumberMeta {
                    factor: *factor,
                    offset: *offset,
                    signed: *signed,
                    static_register: *static_register,
                },
            ),
            VeKind::Enum(map) => Register::enumeration(
                Arc::clone(device),
                self.category,
                self.name,
                self.description,
                map.clone(),
                self.sort,
                false,
            ),
            VeKind::Text { .. } => Register::text(
                Arc::clone(device),
                self.category,
                self.name,
                self.description,
                self.sort,
                false,
            ),
        }
    }

    pub fn register_type(&self) -> RegisterType {
        match &self.kind {
            VeKind::Number { .. } => RegisterType::Number,
            VeKind::Enum(_) => RegisterType::Enum,
            VeKind::Text { .. } => RegisterType::Text,
        }
    }

    pub fn is_static(&self) -> bool {
        match &self.kind {
            VeKind::Number {
                static_register, ..
            } => *static_register,
            VeKind::Text { static_register } => *static_register,
            VeKind::Enum(_) => false,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.kind, VeKind::Number { signed: true, .. })
    }
}

fn number(
    category: &'static str,
    name: &'static str,
    description: &'static str,
    address: u16,
    unit: &'static str,
    factor: f64,
    signed: bool,
    sort: i32,
) -> VeRegisterDef {
    VeRegisterDef {
        category,
        name,
        description,
        address,
        unit: (!unit.is_empty()).then_some(unit),
        sort,
        kind: VeKind::Number {
            factor,
            offset: 0.0,
            signed,
            static_register: false,
        },
    }
}

fn static_text(
    name: &'static str,
    description: &'static str,
    address: u16,
    sort: i32,
) -> VeRegisterDef {
    VeRegisterDef {
        category: "Product",
        name,
        description,
        address,
        unit: None,
        sort,
        kind: VeKind::Text {
            static_register: true,
        },
    }
}

fn bmv_registers(with_aux: bool) -> Vec<VeRegisterDef> {
    let mut defs = vec![
        number("Essential", "MainVoltage", "Main voltage", 0xED8D, "V", 100.0, true, 0),
        number("Essential", "Current", "Current", 0xED8F, "A", 10.0, true, 1),
        number("Essential", "Power", "Power", 0xED8E, "W", 1.0, true, 2),
        number("Essential", "StateOfCharge", "State of charge", 0x0FFF, "%", 100.0, false, 3),
        number("Monitor", "ConsumedAh", "Consumed", 0xEEFF, "Ah", 10.0, true, 10),
        number("Monitor", "TimeToGo", "Time to go", 0x0FFE, "min", 1.0, false, 11),
        number("Monitor", "BatteryTemperature", "Battery temperature", 0xEDEC, "K", 100.0, false, 12),
        number("Statistics", "DepthOfDeepestDischarge", "Depth of the deepest discharge", 0x0300, "Ah", 10.0, true, 20),
        number("Statistics", "NumberOfChargeCycles", "Number of charge cycles", 0x0303, "", 1.0, false, 21),
        number("Statistics", "CumulativeAhDrawn", "Cumulative amp hours drawn", 0x0307, "Ah", 10.0, true, 22),
        static_text("SerialNumber", "Serial number", 0x010A, 100),
        static_text("ModelName", "Model name", 0x010B, 101),
    ];
    if with_aux {
        defs.push(number("Monitor", "AuxVoltage", "Aux (starter) voltage", 0xED7D, "V", 100.0, true, 13));
        defs.push(number("Monitor", "MidPointVoltage", "Mid-point voltage", 0x0382, "V", 100.0, false, 14));
    }
    defs
}

fn solar_registers() -> Vec<VeRegisterDef> {
    let mut charger_state = BTreeMap::new();
    charger_state.insert(0, "off".to_string());
    charger_state.insert(2, "fault".to_string());
    charger_state.insert(3, "bulk".to_string());
    charger_state.insert(4, "absorption".to_string());
    charger_state.insert(5, "float".to_string());

    vec![
        number("Essential", "BatteryVoltage", "Battery voltage", 0xEDD5, "V", 100.0, false, 0),
        number("Essential", "ChargerCurrent", "Charger current", 0xEDD7, "A", 10.0, false, 1),
        number("Essential", "PanelVoltage", "Panel voltage", 0xEDBB, "V", 100.0, false, 2),
        number("Essential", "PanelPower", "Panel power", 0xEDBC, "W", 100.0, false, 3),
        VeRegisterDef {
            category: "Essential",
            name: "ChargerState",
            description: "Charger state",
            address: 0x0201,
            unit: None,
            sort: 4,
            kind: VeKind::Enum(charger_state),
        },
        number("Statistics", "YieldToday", "Yield today", 0xEDD3, "kWh", 100.0, false, 10),
        number("Statistics", "MaximumPowerToday", "Maximum power today", 0xEDD2, "W", 1.0, false, 11),
        number("Statistics", "YieldTotal", "Yield total", 0xEDDC, "kWh", 100.0, false, 12),
        static_text("SerialNumber", "Serial number", 0x010A, 100),
        static_text("ModelName", "Model name", 0x010B, 101),
    ]
}

/// Catalog keyed by the product id read during the identify handshake.
pub fn registers_for_product(product_id: u16) -> Option<(&'static str, Vec<VeRegisterDef>)> {
    match product_id {
        0x0203 => Some(("BMV-700", bmv_registers(false))),
        0x0204 => Some(("BMV-702", bmv_registers(true))),
        0x0205 => Some(("BMV-700H", bmv_registers(false))),
        0xA381 => Some(("BMV-712 Smart", bmv_registers(true))),
        0xA042 | 0xA043 | 0xA044 => Some(("BlueSolar MPPT", solar_registers())),
        0xA050 | 0xA051 | 0xA052 | 0xA053 => Some(("SmartSolar MPPT", solar_registers())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmv_702_has_aux_registers() {
        let (model, defs) = registers_for_product(0x0204).unwrap();
        assert_eq!(model, "BMV-702");
        assert!(defs.iter().any(|d| d.name == "AuxVoltage"));

        let (_, defs) = registers_for_product(0x0203).unwrap();
        assert!(!defs.iter().any(|d| d.name == "AuxVoltage"));
    }

    #[test]
    fn unknown_product_has_no_catalog() {
        assert!(registers_for_product(0xBEEF).is_none());
    }

    #[test]
    fn defs_convert_to_typed_registers() {
        let device: Arc<str> = Arc::from("bmv0");
        let (_, defs) = registers_for_product(0x0204).unwrap();
        let current = defs.iter().find(|d| d.name == "Current").unwrap();
        let register = current.to_register(&device);
        assert_eq!(register.register_type(), RegisterType::Number);
        assert_eq!(register.scale(255.0), 25.5);
        assert!(current.is_signed());
    }
}
