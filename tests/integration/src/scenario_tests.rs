//! Truck scenarios driven over TCP sessions
//!
//! Each test starts a dispatcher on an ephemeral port, connects trucks and
//! devices as JSON-line clients and checks both the wire traffic and the
//! resulting truck context.

use fleetloop_c2_router::TruckState;
use fleetloop_core::{Direction, MissionPhase, MissionStatus, Position, Route};
use fleetloop_facility::{DeviceAction, BELT, DISPENSER, GATE_A};
use std::time::Duration;

use crate::test_utils::{cmds, eventually, TestClient, TestFleet};

const TRUCK: &str = "TRUCK_01";

async fn arrive(truck: &mut TestClient, position: Position) {
    let message = truck.message("ARRIVED").with("position", position.as_str());
    truck.send(message).await;
}

/// Assign a LOAD_A mission and drive the truck through GATE_A into MOVING
async fn drive_past_gate_a(fleet: &TestFleet, truck: &mut TestClient) -> String {
    truck.send_cmd("ASSIGN_MISSION").await;
    let assigned = truck.recv_until("RUN").await;
    let mission_id = assigned[0].payload_str("mission_id").unwrap().to_string();

    arrive(truck, Position::CheckpointA).await;
    truck.recv_until("GATE_OPENED").await;
    truck.send_cmd("ACK_GATE_OPENED").await;
    truck.recv_until("RUN").await;
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Moving).await;
    mission_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_happy_path_over_tcp() {
    let fleet = TestFleet::start(Duration::from_millis(150));
    let mission = fleet.app.queue().create("gravel", 3, Position::LoadA).unwrap();
    let addr = fleet.serve().await;
    let mut truck = TestClient::connect(addr, TRUCK).await;

    let reading = truck.message("BATTERY_LEVEL").with("battery_level", 80);
    truck.send(reading).await;
    truck.send_cmd("ASSIGN_MISSION").await;

    let assigned = truck.recv().await;
    assert_eq!(assigned.cmd, "MISSION_ASSIGNED");
    assert_eq!(assigned.payload_str("mission_id"), Some(mission.mission_id.as_str()));
    assert_eq!(assigned.payload_str("source"), Some("LOAD_A"));
    assert_eq!(truck.recv().await.cmd, "RUN");
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Assigned).await;
    assert_eq!(fleet.app.contexts().get(TRUCK).unwrap().battery_level, 80);

    arrive(&mut truck, Position::CheckpointA).await;
    let opened = truck.recv().await;
    assert_eq!(opened.cmd, "GATE_OPENED");
    assert_eq!(opened.payload_str("gate_id"), Some(GATE_A));
    assert_eq!(fleet.link.commands_for(GATE_A), vec![DeviceAction::Open]);
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Waiting).await;

    truck.send_cmd("ACK_GATE_OPENED").await;
    assert_eq!(truck.recv().await.cmd, "RUN");
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Moving).await;

    arrive(&mut truck, Position::CheckpointB).await;
    assert_eq!(cmds(&truck.recv_until("RUN").await), vec!["GATE_CLOSED", "RUN"]);
    assert_eq!(fleet.link.commands_for(GATE_A), vec![DeviceAction::Open, DeviceAction::Close]);

    arrive(&mut truck, Position::LoadA).await;
    let at_bay = truck.recv_until("START_LOADING").await;
    assert_eq!(cmds(&at_bay), vec!["STOP", "START_LOADING"]);
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Waiting).await;

    truck.send_cmd("START_LOADING").await;
    let loaded = truck.recv_until("FINISH_LOADING").await;
    assert_eq!(cmds(&loaded), vec!["FINISH_LOADING"]);
    assert_eq!(truck.recv().await.cmd, "RUN");

    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Moving).await;
    let context = fleet.app.contexts().get(TRUCK).unwrap();
    assert_eq!(context.mission_phase, MissionPhase::ToUnloading);
    assert_eq!(context.direction, Some(Direction::Outbound));
    assert!(context.loading.is_none());

    assert_eq!(
        fleet.link.commands_for(DISPENSER),
        vec![DeviceAction::SetRoute(Route::RouteA), DeviceAction::Open, DeviceAction::Close]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_emergency_halts_until_reset() {
    let fleet = TestFleet::start(Duration::from_secs(60));
    fleet.app.queue().create("sand", 2, Position::LoadB).unwrap();
    let addr = fleet.serve().await;
    let mut truck = TestClient::connect(addr, TRUCK).await;

    let mission_id = drive_past_gate_a(&fleet, &mut truck).await;

    let fault = truck.message("ERROR").with("reason", "MOTOR_FAULT");
    truck.send(fault).await;
    assert_eq!(truck.recv().await.cmd, "STOP");
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Emergency).await;
    eventually(|| fleet.link.commands_for(BELT).contains(&DeviceAction::Stop)).await;

    truck.send_cmd("ASSIGN_MISSION").await;
    truck.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(fleet.app.contexts().state(TRUCK), TruckState::Emergency);
    assert_eq!(fleet.app.queue().get(&mission_id).unwrap().status, MissionStatus::Assigned);

    truck.send_cmd("RESET").await;
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Idle).await;
    assert_eq!(fleet.app.queue().get(&mission_id).unwrap().status, MissionStatus::Canceled);
    let context = fleet.app.contexts().get(TRUCK).unwrap();
    assert!(context.mission_id.is_none());
    assert_eq!(context.mission_phase, MissionPhase::None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_operator_emergency_reaches_named_truck() {
    let fleet = TestFleet::start(Duration::from_secs(60));
    fleet.app.queue().create("sand", 2, Position::LoadA).unwrap();
    let addr = fleet.serve().await;
    let mut truck = TestClient::connect(addr, TRUCK).await;
    let mut console = TestClient::connect(addr, "OPERATOR").await;

    drive_past_gate_a(&fleet, &mut truck).await;

    let halt = console.message("EMERGENCY_TRIGGERED").with("truck_id", TRUCK);
    console.send(halt).await;
    assert_eq!(truck.recv().await.cmd, "STOP");
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Emergency).await;
    assert_eq!(fleet.app.contexts().state("OPERATOR"), TruckState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_mission_or_charge() {
    let fleet = TestFleet::start(Duration::from_secs(60));
    let addr = fleet.serve().await;

    let mut full = TestClient::connect(addr, "TRUCK_01").await;
    full.send_cmd("ASSIGN_MISSION").await;
    let reply = full.recv().await;
    assert_eq!(reply.cmd, "NO_MISSION");
    assert!(reply.payload_i64("wait_time").is_some());
    eventually(|| fleet.app.contexts().state("TRUCK_01") == TruckState::Idle).await;

    let mut drained = TestClient::connect(addr, "TRUCK_02").await;
    let reading = drained.message("BATTERY_LEVEL").with("battery_level", 60);
    drained.send(reading).await;
    drained.send_cmd("ASSIGN_MISSION").await;
    let reply = drained.recv().await;
    assert_eq!(reply.cmd, "START_CHARGING");
    assert_eq!(reply.payload_i64("battery_level"), Some(60));
    eventually(|| fleet.app.contexts().state("TRUCK_02") == TruckState::Charging).await;

    let charged = drained.message("BATTERY_LEVEL").with("battery_level", 100);
    drained.send(charged).await;
    assert_eq!(drained.recv().await.cmd, "CHARGING_COMPLETED");
    eventually(|| fleet.app.contexts().state("TRUCK_02") != TruckState::Charging).await;
    assert!(!fleet.app.contexts().get("TRUCK_02").unwrap().is_charging);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_dispenser_signal_finishes_loading_once() {
    let fleet = TestFleet::start(Duration::from_secs(60));
    fleet.app.queue().create("gravel", 3, Position::LoadA).unwrap();
    let addr = fleet.serve().await;
    let mut truck = TestClient::connect(addr, TRUCK).await;
    let mut dispenser = TestClient::connect(addr, DISPENSER).await;
    assert!(!fleet.app.contexts().contains(DISPENSER));

    drive_past_gate_a(&fleet, &mut truck).await;
    arrive(&mut truck, Position::CheckpointB).await;
    truck.recv_until("RUN").await;
    arrive(&mut truck, Position::LoadA).await;
    truck.recv_until("START_LOADING").await;
    truck.send_cmd("START_LOADING").await;
    eventually(|| fleet.app.contexts().state(TRUCK) == TruckState::Loading).await;

    for _ in 0..2 {
        let signal = dispenser
            .message("DISPENSER_LOADED")
            .with("dispenser_id", DISPENSER)
            .with("route", "ROUTE_A");
        dispenser.send(signal).await;
    }

    assert_eq!(cmds(&truck.recv_until("RUN").await), vec!["FINISH_LOADING", "RUN"]);
    truck.expect_silence(Duration::from_millis(150)).await;
    assert_eq!(fleet.app.contexts().state(TRUCK), TruckState::Moving);
    let closes = fleet
        .link
        .commands_for(DISPENSER)
        .into_iter()
        .filter(|a| *a == DeviceAction::Close)
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_lines_do_not_drop_session() {
    let fleet = TestFleet::start(Duration::from_secs(60));
    let addr = fleet.serve().await;
    let mut truck = TestClient::connect(addr, TRUCK).await;

    truck.send_raw(b"not json\n\n{\"cmd\":\"ARRIVED\"}\n").await;

    truck.send_cmd("ASSIGN_MISSION").await;
    assert_eq!(truck.recv().await.cmd, "NO_MISSION");
}
