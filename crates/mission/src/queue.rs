//! FIFO mission queue
//!
//! Invariant: a truck holds at most one ASSIGNED mission at a time.

use fleetloop_core::{
    now_ms, FleetStore, Mission, MissionError, MissionStatus, Position, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// No mission with this id
    #[error("Unknown mission: {0}")]
    UnknownMission(String),

    /// A mission with this id is already queued
    #[error("Duplicate mission id: {0}")]
    DuplicateMission(String),

    /// Only WAITING missions can be enqueued
    #[error("Mission {mission_id} is {status}, expected WAITING")]
    NotWaiting {
        /// Mission identifier
        mission_id: String,
        /// Status found
        status: MissionStatus,
    },

    /// Nothing waiting
    #[error("No waiting mission")]
    Empty,

    /// Truck already holds an active mission
    #[error("Truck {truck_id} already has active mission {mission_id}")]
    TruckBusy {
        /// Truck identifier
        truck_id: String,
        /// Mission it holds
        mission_id: String,
    },

    /// Illegal lifecycle transition
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] MissionError),

    /// Store read failed during restore
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Queue mutex was poisoned
    #[error("Mission queue lock poisoned")]
    LockPoisoned,
}

/// Outcome of reloading the queue from storage after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// WAITING missions put back in the queue
    pub requeued: Vec<String>,
    /// ASSIGNED missions canceled because their truck progress was lost
    pub canceled: Vec<String>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<String>,
    missions: HashMap<String, Mission>,
    active_by_truck: HashMap<String, String>,
}

impl QueueState {
    fn mission_mut(&mut self, mission_id: &str) -> Result<&mut Mission, QueueError> {
        self.missions
            .get_mut(mission_id)
            .ok_or_else(|| QueueError::UnknownMission(mission_id.to_string()))
    }

    fn release_truck(&mut self, mission: &Mission) {
        if let Some(truck_id) = &mission.assigned_truck_id {
            if self.active_by_truck.get(truck_id) == Some(&mission.mission_id) {
                self.active_by_truck.remove(truck_id);
            }
        }
    }
}

/// Mission queue shared by all trucks' transition handlers
pub struct MissionQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn FleetStore>,
}

impl MissionQueue {
    /// Create an empty queue writing through to `store`
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn persist(&self, mission: &Mission) {
        if let Err(e) = self.store.save_mission(mission) {
            warn!(mission_id = %mission.mission_id, error = %e, "Mission write failed");
        }
    }

    fn persist_completion(&self, mission: &Mission) {
        if let Err(e) = self.store.update_mission_completion(
            &mission.mission_id,
            mission.status,
            mission.completed_at,
        ) {
            warn!(mission_id = %mission.mission_id, error = %e, "Mission completion write failed");
        }
    }

    /// Append a WAITING mission to the back of the queue
    pub fn enqueue(&self, mission: Mission) -> Result<(), QueueError> {
        if mission.status != MissionStatus::Waiting {
            return Err(QueueError::NotWaiting {
                mission_id: mission.mission_id,
                status: mission.status,
            });
        }

        let mut state = self.lock()?;
        if state.missions.contains_key(&mission.mission_id) {
            return Err(QueueError::DuplicateMission(mission.mission_id));
        }

        self.persist(&mission);
        info!(
            mission_id = %mission.mission_id,
            source = %mission.source,
            cargo_type = %mission.cargo_type,
            "Mission enqueued"
        );
        state.waiting.push_back(mission.mission_id.clone());
        state.missions.insert(mission.mission_id.clone(), mission);
        Ok(())
    }

    /// Build a mission with a fresh id and enqueue it
    pub fn create(
        &self,
        cargo_type: impl Into<String>,
        cargo_amount: u32,
        source: Position,
    ) -> Result<Mission, QueueError> {
        let mission_id = format!("MISSION_{}", uuid::Uuid::new_v4().simple());
        let mission = Mission::new(mission_id, cargo_type, cargo_amount, source, now_ms())?;
        self.enqueue(mission.clone())?;
        Ok(mission)
    }

    /// Pop the oldest WAITING mission and bind it to `truck_id`
    pub fn assign_next(&self, truck_id: &str) -> Result<Mission, QueueError> {
        let mut state = self.lock()?;

        if let Some(mission_id) = state.active_by_truck.get(truck_id) {
            return Err(QueueError::TruckBusy {
                truck_id: truck_id.to_string(),
                mission_id: mission_id.clone(),
            });
        }

        while let Some(mission_id) = state.waiting.pop_front() {
            let Some(mission) = state.missions.get_mut(&mission_id) else {
                continue;
            };
            if mission.status != MissionStatus::Waiting {
                debug!(mission_id = %mission_id, status = %mission.status, "Skipping stale queue entry");
                continue;
            }

            mission.assign(truck_id, now_ms())?;
            let assigned = mission.clone();
            state
                .active_by_truck
                .insert(truck_id.to_string(), mission_id.clone());
            drop(state);

            self.persist(&assigned);
            info!(mission_id = %assigned.mission_id, truck_id = %truck_id, "Mission assigned");
            return Ok(assigned);
        }

        Err(QueueError::Empty)
    }

    /// Mark an ASSIGNED mission COMPLETED
    pub fn complete(&self, mission_id: &str) -> Result<Mission, QueueError> {
        let mut state = self.lock()?;
        let mission = state.mission_mut(mission_id)?;
        mission.transition(MissionStatus::Completed, now_ms())?;
        let completed = mission.clone();
        state.release_truck(&completed);
        drop(state);

        self.persist_completion(&completed);
        info!(mission_id = %mission_id, "Mission completed");
        Ok(completed)
    }

    /// Cancel a WAITING, ASSIGNED or ERROR mission
    pub fn cancel(&self, mission_id: &str) -> Result<Mission, QueueError> {
        let mut state = self.lock()?;
        let mission = state.mission_mut(mission_id)?;
        let was_waiting = mission.status == MissionStatus::Waiting;
        mission.transition(MissionStatus::Canceled, now_ms())?;
        let canceled = mission.clone();

        if was_waiting {
            state.waiting.retain(|id| id != mission_id);
        }
        state.release_truck(&canceled);
        drop(state);

        self.persist_completion(&canceled);
        info!(mission_id = %mission_id, "Mission canceled");
        Ok(canceled)
    }

    /// Mark an ASSIGNED mission ERROR and release its truck
    pub fn fail(&self, mission_id: &str) -> Result<Mission, QueueError> {
        let mut state = self.lock()?;
        let mission = state.mission_mut(mission_id)?;
        mission.transition(MissionStatus::Error, now_ms())?;
        let failed = mission.clone();
        state.release_truck(&failed);
        drop(state);

        self.persist_completion(&failed);
        warn!(mission_id = %mission_id, "Mission failed");
        Ok(failed)
    }

    /// Reload WAITING missions and cancel ASSIGNED ones after a restart
    pub fn restore(&self) -> Result<RestoreReport, QueueError> {
        let stored = self.store.list_assigned_and_waiting()?;
        let mut report = RestoreReport::default();
        let mut to_close = Vec::new();

        {
            let mut state = self.lock()?;
            for mut mission in stored {
                if state.missions.contains_key(&mission.mission_id) {
                    continue;
                }
                match mission.status {
                    MissionStatus::Waiting => {
                        report.requeued.push(mission.mission_id.clone());
                        state.waiting.push_back(mission.mission_id.clone());
                    }
                    MissionStatus::Assigned => {
                        mission.transition(MissionStatus::Canceled, now_ms())?;
                        report.canceled.push(mission.mission_id.clone());
                        to_close.push(mission.clone());
                    }
                    _ => continue,
                }
                state.missions.insert(mission.mission_id.clone(), mission);
            }
        }

        for mission in &to_close {
            self.persist_completion(mission);
        }

        info!(
            requeued = report.requeued.len(),
            canceled = report.canceled.len(),
            "Mission queue restored"
        );
        Ok(report)
    }

    /// Look a mission up by id
    pub fn get(&self, mission_id: &str) -> Option<Mission> {
        self.lock().ok()?.missions.get(mission_id).cloned()
    }

    /// Number of WAITING missions
    pub fn waiting_count(&self) -> usize {
        self.lock().map(|s| s.waiting.len()).unwrap_or(0)
    }

    /// Whether any mission is WAITING
    pub fn has_waiting(&self) -> bool {
        self.waiting_count() > 0
    }

    /// Mission currently bound to `truck_id`
    pub fn active_for_truck(&self, truck_id: &str) -> Option<Mission> {
        let state = self.lock().ok()?;
        let mission_id = state.active_by_truck.get(truck_id)?;
        state.missions.get(mission_id).cloned()
    }

    /// Every known mission, oldest first
    pub fn snapshot(&self) -> Vec<Mission> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut missions: Vec<Mission> = state.missions.values().cloned().collect();
        missions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.mission_id.cmp(&b.mission_id))
        });
        missions
    }
}
