use chrono::{DateTime, TimeZone, Utc};
use devflow_genset::{Controller, ControllerHandle, Inputs, Node, Outputs, Params, State};
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

fn params() -> Params {
    Params {
        priming_timeout: Duration::from_secs(10),
        cranking_timeout: Duration::from_secs(20),
        warm_up_timeout: Duration::from_secs(600),
        warm_up_temp: 40.0,
        engine_cool_down_temp: 60.0,
        engine_cool_down_timeout: Duration::from_secs(300),
        enclosure_cool_down_temp: 50.0,
        enclosure_cool_down_timeout: Duration::from_secs(900),

        engine_temp_min: 10.0,
        engine_temp_max: 90.0,
        aux_temp0_min: 0.0,
        aux_temp0_max: 100.0,
        aux_temp1_min: -10.0,
        aux_temp1_max: 150.0,

        u_min: 210.0,
        u_max: 250.0,
        f_min: 45.0,
        f_max: 55.0,
        p_max: 1000.0,
        p_tot_max: 2000.0,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

#[derive(Clone)]
struct Tracker<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + PartialEq + std::fmt::Debug + Send + 'static> Tracker<T> {
    fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn recorder(&self) -> impl Fn(T) + Send + 'static {
        let items = Arc::clone(&self.items);
        move |item| items.lock().unwrap().push(item)
    }

    fn latest(&self) -> Option<T> {
        self.items.lock().unwrap().last().cloned()
    }

    fn all(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    #[track_caller]
    fn assert_latest(&self, expected: T) {
        assert_eq!(self.latest().as_ref(), Some(&expected));
    }
}

fn tracked_controller(
    params: Params,
    initial_node: Node,
    initial_inputs: Inputs,
) -> (ControllerHandle, Tracker<State>, Tracker<Outputs>) {
    let mut controller = Controller::new(params, initial_node, initial_inputs);
    let states = Tracker::new();
    let outputs = Tracker::new();
    controller.on_state_update(states.recorder());
    controller.on_output_update(outputs.recorder());
    (controller.run(), states, outputs)
}

#[tokio::test]
async fn complete_run() {
    let params = params();
    let t0 = t0();
    let (handle, states, outputs) =
        tracked_controller(params, Node::Off, Inputs::at(t0));

    states.assert_latest(State {
        node: Node::Off,
        changed: t0,
    });
    outputs.assert_latest(Outputs::default());

    // go to ready
    handle
        .update_inputs_sync(|mut i| {
            i.io_available = true;
            i.engine_temp = 20.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Ready,
        changed: t0,
    });
    outputs.assert_latest(Outputs {
        io_check: true,
        ..Default::default()
    });

    // arming alone does not start the sequence
    handle
        .update_inputs_sync(|mut i| {
            i.arm_switch = true;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Ready,
        changed: t0,
    });

    // go to priming
    handle
        .update_inputs_sync(|mut i| {
            i.command_switch = true;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Priming,
        changed: t0,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        pump: true,
        io_check: true,
        ..Default::default()
    });

    // stay in priming
    let t1 = t0 + Duration::from_secs(5);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t1;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Priming,
        changed: t0,
    });

    // go to cranking
    let t2 = t0 + params.priming_timeout;
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t2;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Cranking,
        changed: t2,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        pump: true,
        ignition: true,
        starter: true,
        io_check: true,
        ..Default::default()
    });

    // go to warm up
    handle
        .update_inputs_sync(|mut i| {
            i.output_available = true;
            i.u0 = 220.0;
            i.u1 = 220.0;
            i.u2 = 220.0;
            i.f = 50.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::WarmUp,
        changed: t2,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        pump: true,
        ignition: true,
        io_check: true,
        output_check: true,
        ..Default::default()
    });

    // go to producing
    handle
        .update_inputs_sync(|mut i| {
            i.engine_temp = 45.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Producing,
        changed: t2,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        pump: true,
        ignition: true,
        load: true,
        io_check: true,
        output_check: true,
        ..Default::default()
    });

    // running, engine getting warm, frequency fluctuating, full single load
    let t3 = t2 + Duration::from_secs(1);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t3;
            i.engine_temp = 70.0;
            i.f = 48.0;
            i.l0 = 1000.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Producing,
        changed: t2,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        pump: true,
        ignition: true,
        load: true,
        io_check: true,
        output_check: true,
        time_in_state: Duration::from_secs(1),
        ..Default::default()
    });

    let t4 = t3 + Duration::from_secs(1);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t4;
            i.engine_temp = 72.0;
            i.f = 51.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Producing,
        changed: t2,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        pump: true,
        ignition: true,
        load: true,
        io_check: true,
        output_check: true,
        time_in_state: Duration::from_secs(2),
        ..Default::default()
    });

    // go to engine cool down
    let t5 = t4 + Duration::from_secs(1);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t5;
            i.command_switch = false;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::EngineCoolDown,
        changed: t5,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        pump: true,
        ignition: true,
        io_check: true,
        output_check: true,
        ..Default::default()
    });

    // go to enclosure cool down
    let t6 = t5 + Duration::from_secs(1);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t6;
            i.engine_temp = 55.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::EnclosureCoolDown,
        changed: t6,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        io_check: true,
        output_check: true,
        ..Default::default()
    });

    // stay in enclosure cool down, engine has stopped
    let t7 = t6 + Duration::from_secs(1);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t7;
            i.f = 0.0;
            i.u0 = 10.0;
            i.u1 = 10.0;
            i.u2 = 10.0;
            i.l0 = 2.0;
            i.l1 = 2.0;
            i.l2 = 2.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::EnclosureCoolDown,
        changed: t6,
    });
    outputs.assert_latest(Outputs {
        fan: true,
        io_check: true,
        time_in_state: Duration::from_secs(1),
        ..Default::default()
    });

    // go to ready
    let t8 = t7 + Duration::from_secs(60);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t8;
            i.engine_temp = 45.0;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Ready,
        changed: t8,
    });
    outputs.assert_latest(Outputs {
        io_check: true,
        ..Default::default()
    });

    handle.end().await;
}

fn warm_up_inputs(t0: DateTime<Utc>) -> Inputs {
    let mut i = Inputs::at(t0);
    i.arm_switch = true;
    i.command_switch = true;
    i.io_available = true;
    i.engine_temp = 20.0;
    i.output_available = true;
    i.u0 = 220.0;
    i.u1 = 220.0;
    i.u2 = 220.0;
    i.f = 50.0;
    i
}

#[tokio::test]
async fn warm_up_completes_by_time() {
    let params = params();
    let t0 = t0();
    let (handle, states, outputs) =
        tracked_controller(params, Node::WarmUp, warm_up_inputs(t0));

    let t1 = t0 + params.warm_up_timeout;
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t1;
            i
        })
        .await;

    assert_eq!(
        states.all(),
        vec![
            State {
                node: Node::WarmUp,
                changed: t0
            },
            State {
                node: Node::Producing,
                changed: t1
            },
        ]
    );
    assert!(outputs.latest().unwrap().load);
    handle.end().await;
}

#[tokio::test]
async fn warm_up_completes_by_temperature() {
    let params = params();
    let t0 = t0();
    let (handle, states, outputs) =
        tracked_controller(params, Node::WarmUp, warm_up_inputs(t0));

    let t1 = t0 + Duration::from_secs(1);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t1;
            i.engine_temp = 41.0;
            i
        })
        .await;

    assert_eq!(
        states.all(),
        vec![
            State {
                node: Node::WarmUp,
                changed: t0
            },
            State {
                node: Node::Producing,
                changed: t1
            },
        ]
    );
    assert!(outputs.latest().unwrap().load);
    handle.end().await;
}

#[tokio::test]
async fn cranking_times_out_into_error_and_reset_clears_it() {
    let params = params();
    let t0 = t0();
    let mut inputs = warm_up_inputs(t0);
    inputs.output_available = false;
    inputs.u0 = 0.0;
    inputs.u1 = 0.0;
    inputs.u2 = 0.0;
    inputs.f = 0.0;

    let (handle, states, _outputs) = tracked_controller(params, Node::Cranking, inputs);

    let t1 = t0 + params.cranking_timeout;
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t1;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Error,
        changed: t1,
    });

    // reset switch rising edge clears the error; with the IO check passing
    // and the command switch released the controller settles in Ready
    let t2 = t1 + Duration::from_secs(1);
    handle
        .update_inputs_sync(move |mut i| {
            i.time = t2;
            i.reset_switch = true;
            i.command_switch = false;
            i
        })
        .await;
    states.assert_latest(State {
        node: Node::Ready,
        changed: t2,
    });

    handle.end().await;
}

/// Synchronous updates are fully serialized: for every update v the event
/// log contains A(v), B(v), C(v), D(v) in order, so the whole log sorts.
#[tokio::test]
async fn sync_updates_are_serialized() {
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let current = Arc::new(AtomicI64::new(-1));

    let mut controller = Controller::new(Params::default(), Node::Off, Inputs::at(t0()));
    {
        let events = Arc::clone(&events);
        let current = Arc::clone(&current);
        controller.on_output_update(move |_| {
            let v = current.load(Ordering::Acquire);
            if v >= 0 {
                events.lock().unwrap().push(format!("{v:02} C"));
            }
        });
    }
    let handle = controller.run();

    for v in 0..20i64 {
        events.lock().unwrap().push(format!("{v:02} A"));
        let events_inner = Arc::clone(&events);
        let current = Arc::clone(&current);
        handle
            .update_inputs_sync(move |mut i| {
                current.store(v, Ordering::Release);
                events_inner.lock().unwrap().push(format!("{v:02} B"));
                // advance time so the outputs change and the observer fires
                i.time += Duration::from_secs(1);
                i
            })
            .await;
        events.lock().unwrap().push(format!("{v:02} D"));
    }
    handle.end().await;

    let log = events.lock().unwrap().clone();
    let mut sorted = log.clone();
    sorted.sort();
    assert_eq!(log, sorted, "events not fully serialized");
    assert_eq!(log.len(), 80);
}
