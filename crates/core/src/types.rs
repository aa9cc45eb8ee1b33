//! Loop topology types
//!
//! The physical loop is fixed:
//! `STANDBY -> CHECKPOINT_A -> CHECKPOINT_B -> LOAD_A|LOAD_B -> CHECKPOINT_C
//! -> CHECKPOINT_D -> BELT -> STANDBY`.
//! Wire names are the uppercase tokens used by truck firmware.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Error returned when a wire token does not name a known topology value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown {kind}: {value}")]
pub struct ParseTokenError {
    /// What was being parsed (position, direction, route)
    pub kind: &'static str,
    /// The rejected token
    pub value: String,
}

/// A physical node on the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Position {
    /// Parking / charging area
    Standby,
    /// First inbound checkpoint (GATE_A side)
    CheckpointA,
    /// Second inbound checkpoint
    CheckpointB,
    /// Load bay served by dispenser route A
    LoadA,
    /// Load bay served by dispenser route B
    LoadB,
    /// First outbound checkpoint (GATE_B side)
    CheckpointC,
    /// Second outbound checkpoint
    CheckpointD,
    /// Unloading conveyor
    Belt,
}

impl Position {
    /// All positions in loop order
    pub const ALL: [Position; 8] = [
        Position::Standby,
        Position::CheckpointA,
        Position::CheckpointB,
        Position::LoadA,
        Position::LoadB,
        Position::CheckpointC,
        Position::CheckpointD,
        Position::Belt,
    ];

    /// Wire token for this position
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Standby => "STANDBY",
            Position::CheckpointA => "CHECKPOINT_A",
            Position::CheckpointB => "CHECKPOINT_B",
            Position::LoadA => "LOAD_A",
            Position::LoadB => "LOAD_B",
            Position::CheckpointC => "CHECKPOINT_C",
            Position::CheckpointD => "CHECKPOINT_D",
            Position::Belt => "BELT",
        }
    }

    /// Whether this node is a checkpoint
    pub fn is_checkpoint(&self) -> bool {
        matches!(
            self,
            Position::CheckpointA
                | Position::CheckpointB
                | Position::CheckpointC
                | Position::CheckpointD
        )
    }

    /// Whether this node is a load bay
    pub fn is_load_bay(&self) -> bool {
        matches!(self, Position::LoadA | Position::LoadB)
    }

    /// Dispenser route serving this load bay
    pub fn route(&self) -> Option<Route> {
        match self {
            Position::LoadA => Some(Route::RouteA),
            Position::LoadB => Some(Route::RouteB),
            _ => None,
        }
    }

    /// Next node on the loop for a truck whose mission collects at `bay`
    pub fn next_stop(&self, bay: Position) -> Position {
        match self {
            Position::Standby => Position::CheckpointA,
            Position::CheckpointA => Position::CheckpointB,
            Position::CheckpointB => bay,
            Position::LoadA | Position::LoadB => Position::CheckpointC,
            Position::CheckpointC => Position::CheckpointD,
            Position::CheckpointD => Position::Belt,
            Position::Belt => Position::Standby,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Position {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_uppercase();
        Position::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == token)
            .ok_or(ParseTokenError {
                kind: "position",
                value: s.to_string(),
            })
    }
}

/// Traversal sense around the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Standby towards the load bays
    Inbound,
    /// Load bays towards the belt
    Outbound,
    /// Belt back to standby
    Return,
}

impl Direction {
    /// Wire token for this direction
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
            Direction::Return => "RETURN",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INBOUND" => Ok(Direction::Inbound),
            "OUTBOUND" => Ok(Direction::Outbound),
            "RETURN" => Ok(Direction::Return),
            _ => Err(ParseTokenError {
                kind: "direction",
                value: s.to_string(),
            }),
        }
    }
}

/// Dispenser alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    /// Aligned to LOAD_A
    RouteA,
    /// Aligned to LOAD_B
    RouteB,
}

impl Route {
    /// Wire token for this route
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::RouteA => "ROUTE_A",
            Route::RouteB => "ROUTE_B",
        }
    }

    /// Load bay this route serves
    pub fn load_bay(&self) -> Position {
        match self {
            Route::RouteA => Position::LoadA,
            Route::RouteB => Position::LoadB,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = ParseTokenError;

    /// Accepts both route tokens and load-bay tokens (`LOAD_A` -> `ROUTE_A`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ROUTE_A" | "LOAD_A" => Ok(Route::RouteA),
            "ROUTE_B" | "LOAD_B" => Ok(Route::RouteB),
            _ => Err(ParseTokenError {
                kind: "route",
                value: s.to_string(),
            }),
        }
    }
}

/// Current wall-clock time as Unix epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_round_trip_tokens() {
        for position in Position::ALL {
            assert_eq!(position.as_str().parse::<Position>().unwrap(), position);
        }
        assert_eq!("checkpoint_a".parse::<Position>().unwrap(), Position::CheckpointA);
        assert!("DOCK_Z".parse::<Position>().is_err());
    }

    #[test]
    fn test_position_classification() {
        assert!(Position::CheckpointC.is_checkpoint());
        assert!(!Position::Belt.is_checkpoint());
        assert!(Position::LoadB.is_load_bay());
        assert_eq!(Position::LoadA.route(), Some(Route::RouteA));
        assert_eq!(Position::Standby.route(), None);
    }

    #[test]
    fn test_next_stop_follows_loop() {
        let mut position = Position::Standby;
        let mut visited = vec![position];
        for _ in 0..6 {
            position = position.next_stop(Position::LoadB);
            visited.push(position);
        }
        assert_eq!(
            visited,
            vec![
                Position::Standby,
                Position::CheckpointA,
                Position::CheckpointB,
                Position::LoadB,
                Position::CheckpointC,
                Position::CheckpointD,
                Position::Belt,
            ]
        );
        assert_eq!(Position::Belt.next_stop(Position::LoadA), Position::Standby);
    }

    #[test]
    fn test_route_accepts_load_bay_tokens() {
        assert_eq!("LOAD_B".parse::<Route>().unwrap(), Route::RouteB);
        assert_eq!("route_a".parse::<Route>().unwrap(), Route::RouteA);
        assert_eq!(Route::RouteB.load_bay(), Position::LoadB);
    }

    #[test]
    fn test_position_serde_uses_wire_names() {
        let json = serde_json::to_string(&Position::CheckpointD).unwrap();
        assert_eq!(json, "\"CHECKPOINT_D\"");
    }
}
