//! Persistent store for missions and the facility audit trail
//!
//! The store is never authoritative during a session: the mission queue and
//! the facility controllers keep the live state in memory and write through
//! here as a side effect. Callers log write failures and carry on.
//!
//! SQLite backend:
//! - WAL mode for durability
//! - `missions` is an upsert table keyed by mission id
//! - `battery_log`, `position_log` and `facility_log` are append-only

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

use crate::mission::{Mission, MissionStatus};
use crate::types::{ParseTokenError, Position};

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite failure
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Filesystem failure while preparing the database path
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A stored row could not be mapped back to a domain value
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Connection mutex was poisoned by a panicking writer
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl From<ParseTokenError> for StoreError {
    fn from(e: ParseTokenError) -> Self {
        StoreError::CorruptRecord(e.to_string())
    }
}

/// One facility state change, as written to the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityRecord {
    /// GATE, BELT or DISPENSER
    pub resource_kind: String,
    /// Resource identifier (e.g. GATE_A)
    pub resource_id: String,
    /// Resource state after the change
    pub state: String,
    /// Sub-activity at the time of the change
    pub operation: String,
    /// Free-form detail (forced advance, route, ...)
    pub detail: Option<String>,
    /// Unix epoch milliseconds
    pub timestamp: u64,
}

/// Battery telemetry sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatterySample {
    /// Truck identifier
    pub truck_id: String,
    /// Level in percent
    pub level: u8,
    /// Whether the truck was charging
    pub is_charging: bool,
    /// Unix epoch milliseconds
    pub timestamp: u64,
}

/// Persistence interface consumed by the dispatcher core
pub trait FleetStore: Send + Sync {
    /// Insert or replace a mission row
    fn save_mission(&self, mission: &Mission) -> Result<(), StoreError>;

    /// Look a mission up by id
    fn find_mission_by_id(&self, mission_id: &str) -> Result<Option<Mission>, StoreError>;

    /// WAITING missions, oldest first
    fn list_waiting(&self) -> Result<Vec<Mission>, StoreError>;

    /// ASSIGNED and WAITING missions, oldest first
    fn list_assigned_and_waiting(&self) -> Result<Vec<Mission>, StoreError>;

    /// Record a closing status (COMPLETED / CANCELED / ERROR) for a mission
    fn update_mission_completion(
        &self,
        mission_id: &str,
        status: MissionStatus,
        completed_at: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Append a battery sample
    fn append_battery(&self, sample: &BatterySample) -> Result<(), StoreError>;

    /// Append a position report
    fn append_position(
        &self,
        truck_id: &str,
        position: Position,
        state: &str,
        timestamp: u64,
    ) -> Result<(), StoreError>;

    /// Append a facility state change
    fn append_facility(&self, record: &FacilityRecord) -> Result<(), StoreError>;
}

/// SQLite-backed [`FleetStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const MISSION_COLUMNS: &str = "mission_id, cargo_type, cargo_amount, source, destination, \
     status, assigned_truck_id, created_at, assigned_at, completed_at";

impl SqliteStore {
    /// Create or open a store at the specified path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        info!(path = %path.display(), "Opening fleet store");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS missions (
                mission_id TEXT PRIMARY KEY,
                cargo_type TEXT NOT NULL,
                cargo_amount INTEGER NOT NULL,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_truck_id TEXT,
                created_at INTEGER NOT NULL,
                assigned_at INTEGER,
                completed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS battery_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                truck_id TEXT NOT NULL,
                level INTEGER NOT NULL,
                is_charging INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS position_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                truck_id TEXT NOT NULL,
                position TEXT NOT NULL,
                state TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS facility_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_kind TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                state TEXT NOT NULL,
                operation TEXT NOT NULL,
                detail TEXT,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_missions_status ON missions(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_battery_truck ON battery_log(truck_id);
            CREATE INDEX IF NOT EXISTS idx_facility_resource ON facility_log(resource_id);
            "#,
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn missions_with_status(&self, statuses: &[MissionStatus]) -> Result<Vec<Mission>, StoreError> {
        let conn = self.lock()?;
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {MISSION_COLUMNS} FROM missions WHERE status IN ({placeholders}) \
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tokens: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let rows = stmt
            .query_map(rusqlite::params_from_iter(tokens), raw_mission)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawMission::into_mission).collect()
    }

    /// Most recent facility records for a resource, newest first
    pub fn facility_history(
        &self,
        resource_id: &str,
        limit: usize,
    ) -> Result<Vec<FacilityRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT resource_kind, resource_id, state, operation, detail, timestamp
            FROM facility_log
            WHERE resource_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let records = stmt
            .query_map(params![resource_id, limit as i64], |row| {
                Ok(FacilityRecord {
                    resource_kind: row.get(0)?,
                    resource_id: row.get(1)?,
                    state: row.get(2)?,
                    operation: row.get(3)?,
                    detail: row.get(4)?,
                    timestamp: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Most recent battery samples for a truck, newest first
    pub fn battery_history(
        &self,
        truck_id: &str,
        limit: usize,
    ) -> Result<Vec<BatterySample>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT truck_id, level, is_charging, timestamp
            FROM battery_log
            WHERE truck_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let samples = stmt
            .query_map(params![truck_id, limit as i64], |row| {
                Ok(BatterySample {
                    truck_id: row.get(0)?,
                    level: row.get::<_, i64>(1)?.clamp(0, 100) as u8,
                    is_charging: row.get::<_, i64>(2)? != 0,
                    timestamp: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(samples)
    }
}

/// Row as stored, before token parsing
struct RawMission {
    mission_id: String,
    cargo_type: String,
    cargo_amount: i64,
    source: String,
    destination: String,
    status: String,
    assigned_truck_id: Option<String>,
    created_at: i64,
    assigned_at: Option<i64>,
    completed_at: Option<i64>,
}

fn raw_mission(row: &Row<'_>) -> rusqlite::Result<RawMission> {
    Ok(RawMission {
        mission_id: row.get(0)?,
        cargo_type: row.get(1)?,
        cargo_amount: row.get(2)?,
        source: row.get(3)?,
        destination: row.get(4)?,
        status: row.get(5)?,
        assigned_truck_id: row.get(6)?,
        created_at: row.get(7)?,
        assigned_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

impl RawMission {
    fn into_mission(self) -> Result<Mission, StoreError> {
        Ok(Mission {
            mission_id: self.mission_id,
            cargo_type: self.cargo_type,
            cargo_amount: u32::try_from(self.cargo_amount)
                .map_err(|_| StoreError::CorruptRecord(format!("cargo_amount {}", self.cargo_amount)))?,
            source: self.source.parse()?,
            destination: self.destination.parse()?,
            status: self.status.parse()?,
            assigned_truck_id: self.assigned_truck_id,
            created_at: self.created_at as u64,
            assigned_at: self.assigned_at.map(|t| t as u64),
            completed_at: self.completed_at.map(|t| t as u64),
        })
    }
}

impl FleetStore for SqliteStore {
    fn save_mission(&self, mission: &Mission) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO missions ({MISSION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                mission.mission_id,
                mission.cargo_type,
                mission.cargo_amount as i64,
                mission.source.as_str(),
                mission.destination.as_str(),
                mission.status.as_str(),
                mission.assigned_truck_id,
                mission.created_at as i64,
                mission.assigned_at.map(|t| t as i64),
                mission.completed_at.map(|t| t as i64),
            ],
        )?;

        debug!(mission_id = %mission.mission_id, status = %mission.status, "Mission saved");
        Ok(())
    }

    fn find_mission_by_id(&self, mission_id: &str) -> Result<Option<Mission>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MISSION_COLUMNS} FROM missions WHERE mission_id = ?1"
        ))?;

        let raw = stmt.query_row([mission_id], raw_mission).optional()?;
        raw.map(RawMission::into_mission).transpose()
    }

    fn list_waiting(&self) -> Result<Vec<Mission>, StoreError> {
        self.missions_with_status(&[MissionStatus::Waiting])
    }

    fn list_assigned_and_waiting(&self) -> Result<Vec<Mission>, StoreError> {
        self.missions_with_status(&[MissionStatus::Assigned, MissionStatus::Waiting])
    }

    fn update_mission_completion(
        &self,
        mission_id: &str,
        status: MissionStatus,
        completed_at: Option<u64>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE missions SET status = ?1, completed_at = ?2 WHERE mission_id = ?3",
            params![status.as_str(), completed_at.map(|t| t as i64), mission_id],
        )?;

        if changed == 0 {
            return Err(StoreError::CorruptRecord(format!(
                "mission {mission_id} not found"
            )));
        }
        Ok(())
    }

    fn append_battery(&self, sample: &BatterySample) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO battery_log (truck_id, level, is_charging, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                sample.truck_id,
                sample.level as i64,
                sample.is_charging as i64,
                sample.timestamp as i64
            ],
        )?;
        Ok(())
    }

    fn append_position(
        &self,
        truck_id: &str,
        position: Position,
        state: &str,
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO position_log (truck_id, position, state, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![truck_id, position.as_str(), state, timestamp as i64],
        )?;
        Ok(())
    }

    fn append_facility(&self, record: &FacilityRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO facility_log (resource_kind, resource_id, state, operation, detail, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.resource_kind,
                record.resource_id,
                record.state,
                record.operation,
                record.detail,
                record.timestamp as i64,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("test_fleet_store_{}.db", uuid::Uuid::new_v4()))
    }

    fn mission(id: &str, created_at: u64) -> Mission {
        Mission::new(id, "gravel", 5, Position::LoadA, created_at).unwrap()
    }

    #[test]
    fn test_store_creation() {
        let db_path = temp_db_path();

        let store = SqliteStore::open(&db_path).unwrap();
        assert!(store.list_waiting().unwrap().is_empty());

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_save_and_find_mission() {
        let db_path = temp_db_path();
        let store = SqliteStore::open(&db_path).unwrap();

        let mut m = mission("mission-001", 1000);
        store.save_mission(&m).unwrap();

        m.assign("TRUCK_01", 2000).unwrap();
        store.save_mission(&m).unwrap();

        let found = store.find_mission_by_id("mission-001").unwrap().unwrap();
        assert_eq!(found, m);
        assert!(store.find_mission_by_id("missing").unwrap().is_none());

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_missions_survive_reopen() {
        let db_path = temp_db_path();
        {
            let store = SqliteStore::open(&db_path).unwrap();
            store.save_mission(&mission("mission-001", 1000)).unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        assert_eq!(store.list_waiting().unwrap().len(), 1);

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_list_waiting_is_oldest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save_mission(&mission("late", 3000)).unwrap();
        store.save_mission(&mission("early", 1000)).unwrap();

        let mut assigned = mission("busy", 2000);
        assigned.assign("TRUCK_01", 2500).unwrap();
        store.save_mission(&assigned).unwrap();

        let waiting: Vec<String> = store
            .list_waiting()
            .unwrap()
            .into_iter()
            .map(|m| m.mission_id)
            .collect();
        assert_eq!(waiting, vec!["early", "late"]);

        let open = store.list_assigned_and_waiting().unwrap();
        assert_eq!(open.len(), 3);
        assert_eq!(open[1].mission_id, "busy");
    }

    #[test]
    fn test_update_mission_completion() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut m = mission("mission-001", 1000);
        m.assign("TRUCK_01", 2000).unwrap();
        store.save_mission(&m).unwrap();

        store
            .update_mission_completion("mission-001", MissionStatus::Completed, Some(3000))
            .unwrap();

        let found = store.find_mission_by_id("mission-001").unwrap().unwrap();
        assert_eq!(found.status, MissionStatus::Completed);
        assert_eq!(found.completed_at, Some(3000));

        let missing = store.update_mission_completion("nope", MissionStatus::Canceled, None);
        assert!(matches!(missing, Err(StoreError::CorruptRecord(_))));
    }

    #[test]
    fn test_audit_logs_append() {
        let store = SqliteStore::open_in_memory().unwrap();

        for (i, state) in ["OPENING", "OPENED"].iter().enumerate() {
            store
                .append_facility(&FacilityRecord {
                    resource_kind: "GATE".to_string(),
                    resource_id: "GATE_A".to_string(),
                    state: state.to_string(),
                    operation: "OPENING".to_string(),
                    detail: None,
                    timestamp: 1000 + i as u64,
                })
                .unwrap();
        }
        store
            .append_battery(&BatterySample {
                truck_id: "TRUCK_01".to_string(),
                level: 80,
                is_charging: false,
                timestamp: 1000,
            })
            .unwrap();
        store
            .append_position("TRUCK_01", Position::CheckpointA, "WAITING", 1000)
            .unwrap();

        let history = store.facility_history("GATE_A", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, "OPENED");

        let battery = store.battery_history("TRUCK_01", 10).unwrap();
        assert_eq!(battery[0].level, 80);
    }
}
