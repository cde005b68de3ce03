mod controller;
mod service;
mod types;

pub use controller::{
    compute_outputs, io_check, output_check, Controller, ControllerHandle, OutputObserver,
    StateObserver,
};
pub use service::{GensetService, InputMapping};
pub use types::{Inputs, Node, Outputs, Params, State};
