use crate::{Controller, Inputs, Node, Outputs, Params, State};
use chrono::Utc;
use devflow_core::{StorageError, ValueStorage};
use devflow_sdk::{Register, Value, ValueFilter, ValuePayload};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Controller input fed by one storage register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputField {
    ArmSwitch,
    CommandSwitch,
    ResetSwitch,
    IoAvailable,
    EngineTemp,
    AuxTemp0,
    AuxTemp1,
    OutputAvailable,
    U0,
    U1,
    U2,
    F,
    L0,
    L1,
    L2,
}

/// Register names of the input device feeding each controller input.
/// Unmapped inputs keep their zero value.
#[derive(Debug, Clone, Default)]
pub struct InputMapping {
    pub arm_switch: Option<String>,
    pub command_switch: Option<String>,
    pub reset_switch: Option<String>,
    pub io_available: Option<String>,
    pub engine_temp: Option<String>,
    pub aux_temp0: Option<String>,
    pub aux_temp1: Option<String>,
    pub output_available: Option<String>,
    pub u0: Option<String>,
    pub u1: Option<String>,
    pub u2: Option<String>,
    pub f: Option<String>,
    pub l0: Option<String>,
    pub l1: Option<String>,
    pub l2: Option<String>,
}

impl InputMapping {
    fn resolve(&self, register_name: &str) -> Option<InputField> {
        let pairs = [
            (&self.arm_switch, InputField::ArmSwitch),
            (&self.command_switch, InputField::CommandSwitch),
            (&self.reset_switch, InputField::ResetSwitch),
            (&self.io_available, InputField::IoAvailable),
            (&self.engine_temp, InputField::EngineTemp),
            (&self.aux_temp0, InputField::AuxTemp0),
            (&self.aux_temp1, InputField::AuxTemp1),
            (&self.output_available, InputField::OutputAvailable),
            (&self.u0, InputField::U0),
            (&self.u1, InputField::U1),
            (&self.u2, InputField::U2),
            (&self.f, InputField::F),
            (&self.l0, InputField::L0),
            (&self.l1, InputField::L1),
            (&self.l2, InputField::L2),
        ];
        pairs
            .into_iter()
            .find(|(name, _)| name.as_deref() == Some(register_name))
            .map(|(_, field)| field)
    }
}

fn as_number(payload: &ValuePayload) -> f64 {
    match payload {
        ValuePayload::Numeric(v) => *v,
        ValuePayload::Enum(v) => *v as f64,
        ValuePayload::Text(v) => v.parse().unwrap_or(0.0),
    }
}

fn as_switch(payload: &ValuePayload) -> bool {
    match payload {
        ValuePayload::Numeric(v) => *v != 0.0,
        ValuePayload::Enum(v) => *v != 0,
        ValuePayload::Text(v) => matches!(v.as_str(), "on" | "true" | "1"),
    }
}

fn apply_field(mut inputs: Inputs, field: InputField, payload: &ValuePayload) -> Inputs {
    match field {
        InputField::ArmSwitch => inputs.arm_switch = as_switch(payload),
        InputField::CommandSwitch => inputs.command_switch = as_switch(payload),
        InputField::ResetSwitch => inputs.reset_switch = as_switch(payload),
        InputField::IoAvailable => inputs.io_available = as_switch(payload),
        InputField::EngineTemp => inputs.engine_temp = as_number(payload),
        InputField::AuxTemp0 => inputs.aux_temp0 = as_number(payload),
        InputField::AuxTemp1 => inputs.aux_temp1 = as_number(payload),
        InputField::OutputAvailable => inputs.output_available = as_switch(payload),
        InputField::U0 => inputs.u0 = as_number(payload),
        InputField::U1 => inputs.u1 = as_number(payload),
        InputField::U2 => inputs.u2 = as_number(payload),
        InputField::F => inputs.f = as_number(payload),
        InputField::L0 => inputs.l0 = as_number(payload),
        InputField::L1 => inputs.l1 = as_number(payload),
        InputField::L2 => inputs.l2 = as_number(payload),
    }
    inputs
}

fn on_off_map() -> BTreeMap<i64, String> {
    let mut map = BTreeMap::new();
    map.insert(0, "off".to_string());
    map.insert(1, "on".to_string());
    map
}

struct OutputRegisters {
    state: Register,
    ignition: Register,
    starter: Register,
    fan: Register,
    pump: Register,
    load: Register,
    io_check: Register,
    output_check: Register,
    time_in_state: Register,
}

impl OutputRegisters {
    fn new(device: &Arc<str>) -> Self {
        let state_map: BTreeMap<i64, String> = Node::all()
            .iter()
            .map(|n| (n.index(), n.label().to_string()))
            .collect();
        let output = |name: &str, sort: i32| {
            Register::enumeration(
                Arc::clone(device),
                "Outputs",
                name,
                name,
                on_off_map(),
                sort,
                false,
            )
        };
        Self {
            state: Register::enumeration(
                Arc::clone(device),
                "Genset",
                "State",
                "Controller state",
                state_map,
                0,
                false,
            ),
            ignition: output("Ignition", 10),
            starter: output("Starter", 11),
            fan: output("Fan", 12),
            pump: output("Pump", 13),
            load: output("Load", 14),
            io_check: output("IoCheck", 15),
            output_check: output("OutputCheck", 16),
            time_in_state: Register::number(
                Arc::clone(device),
                "Genset",
                "TimeInState",
                "Time in state",
                Some("s".to_string()),
                1,
                false,
                Default::default(),
            ),
        }
    }
}

/// Wires one controller between the value storage and a synthetic output
/// device: input-device rows drive the reducer, state and outputs are
/// published back as registers of the output device.
pub struct GensetService {
    pub params: Params,
    pub mapping: InputMapping,
    pub input_device: String,
    pub output_device: String,
}

impl GensetService {
    /// Run until the token is cancelled. A one second tick advances the
    /// controller clock so timeout transitions fire without input traffic.
    pub async fn run(self, storage: Arc<ValueStorage>, cancel: CancellationToken) {
        let output_device: Arc<str> = Arc::from(self.output_device.as_str());
        let registers = Arc::new(OutputRegisters::new(&output_device));

        let mut controller = Controller::new(self.params, Node::Off, Inputs::at(Utc::now()));
        {
            let storage = Arc::clone(&storage);
            let registers = Arc::clone(&registers);
            controller.on_state_update(move |state: State| {
                debug!(state = state.node.label(), "genset state");
                storage.fill(Value::enumeration(registers.state.clone(), state.node.index()));
            });
        }
        {
            let storage = Arc::clone(&storage);
            let registers = Arc::clone(&registers);
            controller.on_output_update(move |outputs: Outputs| {
                let bit = |b: bool| i64::from(b);
                storage.fill(Value::enumeration(registers.ignition.clone(), bit(outputs.ignition)));
                storage.fill(Value::enumeration(registers.starter.clone(), bit(outputs.starter)));
                storage.fill(Value::enumeration(registers.fan.clone(), bit(outputs.fan)));
                storage.fill(Value::enumeration(registers.pump.clone(), bit(outputs.pump)));
                storage.fill(Value::enumeration(registers.load.clone(), bit(outputs.load)));
                storage.fill(Value::enumeration(registers.io_check.clone(), bit(outputs.io_check)));
                storage.fill(Value::enumeration(
                    registers.output_check.clone(),
                    bit(outputs.output_check),
                ));
                storage.fill(Value::numeric(
                    registers.time_in_state.clone(),
                    outputs.time_in_state.as_secs_f64(),
                ));
            });
        }
        let handle = controller.run();

        let sub = storage.subscribe(cancel.child_token(), ValueFilter::device(&self.input_device));
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            input_device = %self.input_device,
            output_device = %output_device,
            "genset service started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    handle.update_inputs(|mut i| {
                        i.time = Utc::now();
                        i
                    });
                }
                received = sub.recv() => {
                    match received {
                        Ok(value) => {
                            let Some(field) = self.mapping.resolve(value.name()) else {
                                continue;
                            };
                            let payload = value.payload().clone();
                            handle.update_inputs(move |mut i| {
                                i.time = Utc::now();
                                apply_field(i, field, &payload)
                            });
                        }
                        Err(StorageError::Closed) => break,
                        Err(StorageError::SubscriberOverflow) => {
                            warn!(device = %self.input_device, "genset input subscription overflowed");
                            break;
                        }
                    }
                }
            }
        }

        handle.end().await;
        info!(output_device = %output_device, "genset service stopped");
    }
}
