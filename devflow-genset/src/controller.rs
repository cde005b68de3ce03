use crate::{Inputs, Node, Outputs, Params, State};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

pub type StateObserver = Box<dyn Fn(State) + Send>;
pub type OutputObserver = Box<dyn Fn(Outputs) + Send>;

type UpdateFn = Box<dyn FnOnce(Inputs) -> Inputs + Send>;

struct Update {
    apply: UpdateFn,
    done: Option<oneshot::Sender<()>>,
}

#[inline]
fn within(v: f64, min: f64, max: f64) -> bool {
    min <= v && v <= max
}

/// IO-check: the I/O module is reachable and all temperatures are in range.
pub fn io_check(params: &Params, i: &Inputs) -> bool {
    i.io_available
        && within(i.engine_temp, params.engine_temp_min, params.engine_temp_max)
        && within(i.aux_temp0, params.aux_temp0_min, params.aux_temp0_max)
        && within(i.aux_temp1, params.aux_temp1_min, params.aux_temp1_max)
}

/// Output-check: the output module is reachable and voltages/frequency are
/// in range.
pub fn output_check(params: &Params, i: &Inputs) -> bool {
    i.output_available
        && within(i.u0, params.u_min, params.u_max)
        && within(i.u1, params.u_min, params.u_max)
        && within(i.u2, params.u_min, params.u_max)
        && within(i.f, params.f_min, params.f_max)
}

fn overloaded(params: &Params, i: &Inputs) -> bool {
    i.l0 > params.p_max
        || i.l1 > params.p_max
        || i.l2 > params.p_max
        || (i.l0 + i.l1 + i.l2) > params.p_tot_max
}

/// Compute the next node, or `None` when the state is stable under the
/// given inputs. `reset_rising` is true only for the update in which the
/// reset switch went from off to on.
fn transition(params: &Params, state: State, i: &Inputs, reset_rising: bool) -> Option<Node> {
    let elapsed = (i.time - state.changed).to_std().unwrap_or(Duration::ZERO);
    let io = io_check(params, i);

    match state.node {
        Node::Off => io.then_some(Node::Ready),
        Node::Ready => {
            if !io {
                Some(Node::Off)
            } else if i.arm_switch && i.command_switch {
                Some(Node::Priming)
            } else {
                None
            }
        }
        Node::Priming => {
            if !io {
                Some(Node::Error)
            } else if !i.command_switch {
                Some(Node::Ready)
            } else if elapsed >= params.priming_timeout {
                Some(Node::Cranking)
            } else {
                None
            }
        }
        Node::Cranking => {
            if !io {
                Some(Node::Error)
            } else if !i.command_switch {
                Some(Node::EnclosureCoolDown)
            } else if output_check(params, i) {
                Some(Node::WarmUp)
            } else if elapsed >= params.cranking_timeout {
                Some(Node::Error)
            } else {
                None
            }
        }
        Node::WarmUp => {
            if !io {
                Some(Node::Error)
            } else if !i.command_switch {
                Some(Node::EngineCoolDown)
            } else if i.engine_temp >= params.warm_up_temp || elapsed >= params.warm_up_timeout {
                Some(Node::Producing)
            } else {
                None
            }
        }
        Node::Producing => {
            if !io {
                Some(Node::Error)
            } else if !i.command_switch || overloaded(params, i) || !output_check(params, i) {
                Some(Node::EngineCoolDown)
            } else {
                None
            }
        }
        Node::EngineCoolDown => {
            if !io {
                Some(Node::Error)
            } else if i.engine_temp <= params.engine_cool_down_temp
                || elapsed >= params.engine_cool_down_timeout
            {
                Some(Node::EnclosureCoolDown)
            } else {
                None
            }
        }
        Node::EnclosureCoolDown => {
            if !io {
                Some(Node::Error)
            } else if i.engine_temp <= params.enclosure_cool_down_temp
                || elapsed >= params.enclosure_cool_down_timeout
            {
                Some(Node::Ready)
            } else {
                None
            }
        }
        Node::Error => reset_rising.then_some(Node::Off),
    }
}

/// Output policy: a pure function of the current state and inputs.
pub fn compute_outputs(params: &Params, state: &State, i: &Inputs) -> Outputs {
    use Node::*;
    Outputs {
        ignition: matches!(state.node, Cranking | WarmUp | Producing | EngineCoolDown),
        starter: state.node == Cranking,
        fan: matches!(
            state.node,
            Priming | Cranking | WarmUp | Producing | EngineCoolDown | EnclosureCoolDown
        ),
        pump: matches!(
            state.node,
            Priming | Cranking | WarmUp | Producing | EngineCoolDown
        ),
        load: state.node == Producing,
        io_check: io_check(params, i),
        output_check: output_check(params, i),
        time_in_state: (i.time - state.changed).to_std().unwrap_or(Duration::ZERO),
    }
}

/// Genset controller: configuration plus the observers to attach before
/// `run` starts the reducer.
pub struct Controller {
    params: Params,
    initial_node: Node,
    initial_inputs: Inputs,
    on_state_update: Option<StateObserver>,
    on_output_update: Option<OutputObserver>,
}

impl Controller {
    pub fn new(params: Params, initial_node: Node, initial_inputs: Inputs) -> Self {
        Self {
            params,
            initial_node,
            initial_inputs,
            on_state_update: None,
            on_output_update: None,
        }
    }

    /// Called on the reducer task whenever the state node changes (and once
    /// with the initial state). Must not submit updates synchronously.
    pub fn on_state_update(&mut self, f: impl Fn(State) + Send + 'static) {
        self.on_state_update = Some(Box::new(f));
    }

    /// Called on the reducer task whenever the outputs change (and once
    /// with the initial outputs). Must not submit updates synchronously.
    pub fn on_output_update(&mut self, f: impl Fn(Outputs) + Send + 'static) {
        self.on_output_update = Some(Box::new(f));
    }

    /// Start the reducer task owning state and outputs.
    pub fn run(self) -> ControllerHandle {
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<Update>();
        let params = self.params;
        let on_state_update = self.on_state_update;
        let on_output_update = self.on_output_update;
        let mut inputs = self.initial_inputs;
        let mut state = State {
            node: self.initial_node,
            changed: inputs.time,
        };

        // initial state and outputs are observable before the first update
        let mut outputs = compute_outputs(&params, &state, &inputs);
        if let Some(cb) = &on_state_update {
            cb(state);
        }
        if let Some(cb) = &on_output_update {
            cb(outputs);
        }

        let join = tokio::spawn(async move {
            let mut prev_reset = inputs.reset_switch;

            while let Some(update) = update_rx.recv().await {
                inputs = (update.apply)(inputs);
                let reset_rising = inputs.reset_switch && !prev_reset;
                prev_reset = inputs.reset_switch;

                // Transitions cascade to a fixpoint within one update; every
                // state entered this way carries the update's input time.
                let mut changed = false;
                for round in 0.. {
                    match transition(&params, state, &inputs, reset_rising) {
                        Some(node) => {
                            state = State {
                                node,
                                changed: inputs.time,
                            };
                            changed = true;
                        }
                        None => break,
                    }
                    if round >= 8 {
                        warn!(node = state.node.label(), "transition fixpoint not reached");
                        break;
                    }
                }
                if changed {
                    if let Some(cb) = &on_state_update {
                        cb(state);
                    }
                }

                let next_outputs = compute_outputs(&params, &state, &inputs);
                if next_outputs != outputs {
                    outputs = next_outputs;
                    if let Some(cb) = &on_output_update {
                        cb(outputs);
                    }
                }

                if let Some(done) = update.done {
                    let _ = done.send(());
                }
            }
        });

        ControllerHandle {
            update_tx,
            join: Some(join),
        }
    }
}

/// Handle for submitting input updates to a running controller.
pub struct ControllerHandle {
    update_tx: mpsc::UnboundedSender<Update>,
    join: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Enqueue a functional input update; returns immediately.
    pub fn update_inputs(&self, f: impl FnOnce(Inputs) -> Inputs + Send + 'static) {
        let _ = self.update_tx.send(Update {
            apply: Box::new(f),
            done: None,
        });
    }

    /// Enqueue a functional input update and wait until the state/output
    /// recomputation and all observer callbacks have completed.
    pub async fn update_inputs_sync(&self, f: impl FnOnce(Inputs) -> Inputs + Send + 'static) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .update_tx
            .send(Update {
                apply: Box::new(f),
                done: Some(done_tx),
            })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    /// Stop the reducer: pending updates are processed first.
    pub async fn end(mut self) {
        // Dropping the sender ends the reducer loop.
        let join = self.join.take();
        drop(self.update_tx);
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}
