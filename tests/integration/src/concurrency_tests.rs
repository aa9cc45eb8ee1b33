//! Concurrent trucks sharing gates and the mission queue

use fleetloop_c2_router::{FleetApp, Message, TruckEvent, TruckState};
use fleetloop_core::{MissionStatus, Position};
use fleetloop_facility::{DeviceAction, GATE_A};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::test_utils::TestFleet;

/// Register an in-process session for `truck_id`
fn attach(app: &FleetApp, truck_id: &str) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    app.dispatcher().register(truck_id, tx);
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
    let mut cmds = Vec::new();
    while let Ok(message) = rx.try_recv() {
        cmds.push(message.cmd);
    }
    cmds
}

/// Every ASSIGNED mission is bound to exactly one truck whose context names it
fn assert_bindings_consistent(app: &FleetApp) {
    let mut per_truck: HashMap<String, usize> = HashMap::new();
    for mission in app.queue().snapshot() {
        if mission.status != MissionStatus::Assigned {
            continue;
        }
        let truck_id = mission.assigned_truck_id.clone().expect("assigned mission without truck");
        *per_truck.entry(truck_id.clone()).or_default() += 1;
        let context = app.contexts().get(&truck_id).expect("assigned truck has no context");
        assert_eq!(context.mission_id.as_deref(), Some(mission.mission_id.as_str()));
    }
    assert!(per_truck.values().all(|count| *count == 1), "truck bound twice: {per_truck:?}");

    for context in app.contexts().all() {
        if let Some(mission_id) = &context.mission_id {
            let mission = app.queue().get(mission_id).expect("context names unknown mission");
            assert_eq!(mission.status, MissionStatus::Assigned);
            assert_eq!(mission.assigned_truck_id.as_deref(), Some(context.truck_id.as_str()));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_gate_requests_reach_hardware_once() {
    let fleet = TestFleet::start(Duration::from_secs(60));
    let app = &fleet.app;
    app.queue().create("gravel", 3, Position::LoadA).unwrap();
    app.queue().create("sand", 2, Position::LoadB).unwrap();

    let mut first = attach(app, "TRUCK_A");
    let mut second = attach(app, "TRUCK_B");
    app.engine().handle("TRUCK_A", TruckEvent::AssignMission).await;
    app.engine().handle("TRUCK_B", TruckEvent::AssignMission).await;
    drain(&mut first);
    drain(&mut second);

    let arrival = || TruckEvent::Arrived {
        position: Position::CheckpointA,
        gate_id: None,
    };
    let engine_a = app.engine().clone();
    let engine_b = app.engine().clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { engine_a.handle("TRUCK_A", arrival()).await }),
        tokio::spawn(async move { engine_b.handle("TRUCK_B", arrival()).await }),
    );
    assert!(a.unwrap().is_applied());
    assert!(b.unwrap().is_applied());

    assert_eq!(fleet.link.commands_for(GATE_A), vec![DeviceAction::Open]);
    for rx in [&mut first, &mut second] {
        assert_eq!(drain(rx), vec!["GATE_OPENED"]);
    }
    assert_eq!(app.contexts().state("TRUCK_A"), TruckState::Waiting);
    assert_eq!(app.contexts().state("TRUCK_B"), TruckState::Waiting);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_bind_each_mission_once() {
    let fleet = TestFleet::start(Duration::from_secs(60));
    let app = &fleet.app;
    for source in [Position::LoadA, Position::LoadB, Position::LoadA] {
        app.queue().create("gravel", 1, source).unwrap();
    }

    let trucks: Vec<String> = (1..=6).map(|n| format!("TRUCK_{n:02}")).collect();
    let mut sessions: Vec<_> = trucks.iter().map(|t| attach(app, t)).collect();

    // Every truck asks three times, in a shuffled interleaving
    let mut requests: Vec<String> = trucks.iter().flat_map(|t| std::iter::repeat(t.clone()).take(3)).collect();
    requests.shuffle(&mut rand::thread_rng());

    let handles: Vec<_> = requests
        .into_iter()
        .map(|truck_id| {
            let engine = app.engine().clone();
            tokio::spawn(async move { engine.handle(&truck_id, TruckEvent::AssignMission).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(app.queue().waiting_count(), 0);
    assert_bindings_consistent(app);
    let bound = app.contexts().all().iter().filter(|c| c.mission_id.is_some()).count();
    assert_eq!(bound, 3);

    for rx in sessions.iter_mut() {
        let assigned = drain(rx).iter().filter(|c| *c == "MISSION_ASSIGNED").count();
        assert!(assigned <= 1);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue(Position),
    Assign(usize),
    Halt(usize),
    Reset(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop_oneof![Just(Position::LoadA), Just(Position::LoadB)].prop_map(Op::Enqueue),
        (0..3usize).prop_map(Op::Assign),
        (0..3usize).prop_map(Op::Halt),
        (0..3usize).prop_map(Op::Reset),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_missions_stay_singly_bound(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let fleet = TestFleet::start(Duration::from_secs(60));
            let app = &fleet.app;
            let trucks = ["TRUCK_01", "TRUCK_02", "TRUCK_03"];
            let _sessions: Vec<_> = trucks.iter().map(|t| attach(app, t)).collect();

            let mut handles = Vec::new();
            for op in ops {
                let engine = app.engine().clone();
                match op {
                    Op::Enqueue(source) => {
                        app.queue().create("gravel", 1, source).unwrap();
                    }
                    Op::Assign(i) => handles.push(tokio::spawn(async move {
                        engine.handle(trucks[i], TruckEvent::AssignMission).await;
                    })),
                    Op::Halt(i) => {
                        engine.trigger_emergency(trucks[i], "OBSTACLE");
                    }
                    Op::Reset(i) => handles.push(tokio::spawn(async move {
                        engine.handle(trucks[i], TruckEvent::Reset).await;
                    })),
                }
            }
            for handle in handles {
                handle.await.unwrap();
            }

            assert_bindings_consistent(app);
        });
    }
}
