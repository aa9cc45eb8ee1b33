//! Checkpoint gate policy
//!
//! | Checkpoint   | Direction | Action        |
//! |--------------|-----------|---------------|
//! | CHECKPOINT_A | INBOUND   | open GATE_A   |
//! | CHECKPOINT_B | INBOUND   | close GATE_A  |
//! | CHECKPOINT_C | OUTBOUND  | open GATE_B   |
//! | CHECKPOINT_D | OUTBOUND  | close GATE_B  |
//!
//! Every other (checkpoint, direction) pair is a plain waypoint.

use fleetloop_core::{Direction, Position};
use fleetloop_facility::{GATE_A, GATE_B};

/// What to do with a gate when a truck reaches a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// Open the gate and hold the truck until it acknowledges
    Open(&'static str),
    /// Close the gate behind the truck and let it continue
    Close(&'static str),
    /// Waypoint only
    Pass,
}

/// Gate action for a truck arriving at `checkpoint` travelling `direction`
pub fn gate_action(checkpoint: Position, direction: Option<Direction>) -> GateAction {
    match (checkpoint, direction) {
        (Position::CheckpointA, Some(Direction::Inbound)) => GateAction::Open(GATE_A),
        (Position::CheckpointB, Some(Direction::Inbound)) => GateAction::Close(GATE_A),
        (Position::CheckpointC, Some(Direction::Outbound)) => GateAction::Open(GATE_B),
        (Position::CheckpointD, Some(Direction::Outbound)) => GateAction::Close(GATE_B),
        _ => GateAction::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_and_outbound_pairs() {
        assert_eq!(
            gate_action(Position::CheckpointA, Some(Direction::Inbound)),
            GateAction::Open(GATE_A)
        );
        assert_eq!(
            gate_action(Position::CheckpointB, Some(Direction::Inbound)),
            GateAction::Close(GATE_A)
        );
        assert_eq!(
            gate_action(Position::CheckpointC, Some(Direction::Outbound)),
            GateAction::Open(GATE_B)
        );
        assert_eq!(
            gate_action(Position::CheckpointD, Some(Direction::Outbound)),
            GateAction::Close(GATE_B)
        );
    }

    #[test]
    fn test_other_pairs_pass() {
        assert_eq!(gate_action(Position::CheckpointA, Some(Direction::Return)), GateAction::Pass);
        assert_eq!(gate_action(Position::CheckpointC, Some(Direction::Inbound)), GateAction::Pass);
        assert_eq!(gate_action(Position::CheckpointA, None), GateAction::Pass);
        assert_eq!(gate_action(Position::Belt, Some(Direction::Outbound)), GateAction::Pass);
    }

    #[test]
    fn test_each_gate_opened_at_one_checkpoint_only() {
        let directions = [None, Some(Direction::Inbound), Some(Direction::Outbound), Some(Direction::Return)];
        for gate in [GATE_A, GATE_B] {
            let openings = Position::ALL
                .iter()
                .flat_map(|p| directions.iter().map(move |d| gate_action(*p, *d)))
                .filter(|a| *a == GateAction::Open(gate))
                .count();
            assert_eq!(openings, 1);
        }
    }
}
