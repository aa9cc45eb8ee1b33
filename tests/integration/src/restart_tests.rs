//! Mission reconciliation across a dispatcher restart

use fleetloop_c2_router::TruckEvent;
use fleetloop_core::{FleetStore, MissionStatus, Position, SqliteStore};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::test_utils::{test_config, TestFleet};

struct TempDb(PathBuf);

impl TempDb {
    fn new() -> Self {
        let name = format!("fleetloop-restart-{:016x}.db", rand::thread_rng().gen::<u64>());
        Self(std::env::temp_dir().join(name))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[tokio::test]
async fn test_restart_cancels_in_flight_and_requeues_waiting() {
    let db = TempDb::new();

    let (in_flight, waiting) = {
        let store: Arc<dyn FleetStore> = Arc::new(SqliteStore::open(&db.0).unwrap());
        let fleet = TestFleet::with_store(test_config(), store, Duration::from_secs(60));
        let first = fleet.app.queue().create("gravel", 3, Position::LoadA).unwrap();
        let second = fleet.app.queue().create("sand", 1, Position::LoadB).unwrap();
        fleet.app.engine().handle("TRUCK_01", TruckEvent::AssignMission).await;
        assert_eq!(
            fleet.app.queue().get(&first.mission_id).unwrap().status,
            MissionStatus::Assigned
        );
        (first.mission_id, second.mission_id)
    };

    let store: Arc<dyn FleetStore> = Arc::new(SqliteStore::open(&db.0).unwrap());
    let fleet = TestFleet::with_store(test_config(), store.clone(), Duration::from_secs(60));
    let report = fleet.app.restore_missions().unwrap();
    assert_eq!(report.requeued, vec![waiting.clone()]);
    assert_eq!(report.canceled, vec![in_flight.clone()]);

    let canceled = store.find_mission_by_id(&in_flight).unwrap().unwrap();
    assert_eq!(canceled.status, MissionStatus::Canceled);
    assert_eq!(fleet.app.seed_missions().unwrap(), 0);

    fleet.app.engine().handle("TRUCK_01", TruckEvent::AssignMission).await;
    let context = fleet.app.contexts().get("TRUCK_01").unwrap();
    assert_eq!(context.mission_id.as_deref(), Some(waiting.as_str()));
}
