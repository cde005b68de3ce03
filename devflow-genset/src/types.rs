use chrono::{DateTime, Utc};
use std::time::Duration;

/// Sensor and switch inputs, updated atomically through the reducer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inputs {
    pub time: DateTime<Utc>,

    pub arm_switch: bool,
    pub command_switch: bool,
    pub reset_switch: bool,

    pub io_available: bool,
    pub engine_temp: f64,
    pub aux_temp0: f64,
    pub aux_temp1: f64,

    pub output_available: bool,
    pub u0: f64,
    pub u1: f64,
    pub u2: f64,
    pub f: f64,
    pub l0: f64,
    pub l1: f64,
    pub l2: f64,
}

impl Inputs {
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }
}

impl Default for Inputs {
    fn default() -> Self {
        Self {
            time: DateTime::<Utc>::UNIX_EPOCH,
            arm_switch: false,
            command_switch: false,
            reset_switch: false,
            io_available: false,
            engine_temp: 0.0,
            aux_temp0: 0.0,
            aux_temp1: 0.0,
            output_available: false,
            u0: 0.0,
            u1: 0.0,
            u2: 0.0,
            f: 0.0,
            l0: 0.0,
            l1: 0.0,
            l2: 0.0,
        }
    }
}

/// Actuator outputs, a pure function of state and inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outputs {
    pub ignition: bool,
    pub starter: bool,
    pub fan: bool,
    pub pump: bool,
    pub load: bool,
    pub io_check: bool,
    pub output_check: bool,
    pub time_in_state: Duration,
}

/// State machine nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Off,
    Ready,
    Priming,
    Cranking,
    WarmUp,
    Producing,
    EngineCoolDown,
    EnclosureCoolDown,
    Error,
}

impl Node {
    pub fn label(&self) -> &'static str {
        match self {
            Node::Off => "off",
            Node::Ready => "ready",
            Node::Priming => "priming",
            Node::Cranking => "cranking",
            Node::WarmUp => "warm up",
            Node::Producing => "producing",
            Node::EngineCoolDown => "engine cool down",
            Node::EnclosureCoolDown => "enclosure cool down",
            Node::Error => "error",
        }
    }

    /// All nodes in enum-map order; the index doubles as the published
    /// enum value.
    pub fn all() -> [Node; 9] {
        [
            Node::Off,
            Node::Ready,
            Node::Priming,
            Node::Cranking,
            Node::WarmUp,
            Node::Producing,
            Node::EngineCoolDown,
            Node::EnclosureCoolDown,
            Node::Error,
        ]
    }

    pub fn index(&self) -> i64 {
        Self::all().iter().position(|n| n == self).unwrap_or(0) as i64
    }
}

/// Current node plus the input time at which it was entered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct State {
    pub node: Node,
    pub changed: DateTime<Utc>,
}

/// Thresholds and timeouts driving the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Params {
    pub priming_timeout: Duration,
    pub cranking_timeout: Duration,
    pub warm_up_timeout: Duration,
    pub warm_up_temp: f64,
    pub engine_cool_down_temp: f64,
    pub engine_cool_down_timeout: Duration,
    pub enclosure_cool_down_temp: f64,
    pub enclosure_cool_down_timeout: Duration,

    pub engine_temp_min: f64,
    pub engine_temp_max: f64,
    pub aux_temp0_min: f64,
    pub aux_temp0_max: f64,
    pub aux_temp1_min: f64,
    pub aux_temp1_max: f64,

    pub u_min: f64,
    pub u_max: f64,
    pub f_min: f64,
    pub f_max: f64,
    pub p_max: f64,
    pub p_tot_max: f64,
}
