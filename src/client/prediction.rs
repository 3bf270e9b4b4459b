//! Movement prediction against the server's own rule.
//!
//! The predictor applies each local input immediately, using the same
//! axis-collapse, clamp, and collision checks the zone tick applies, and
//! keeps the input queued until the server acknowledges its sequence.
//! Every authoritative update resets the predicted tile to server truth
//! and replays the still-unacknowledged tail, so the view converges
//! without discarding in-flight intent.

use std::collections::VecDeque;

use crate::net::protocol::MoveVec;
use crate::zones::bounds::Bounds;
use crate::zones::collision::CollisionGrid;
use crate::zones::zone::normalize_move;

#[derive(Debug, Clone)]
pub struct PendingInput {
    pub seq: i64,
    pub mv: MoveVec,
}

#[derive(Default)]
pub struct Predictor {
    predicted: (i32, i32),
    authoritative: (i32, i32),
    pending: VecDeque<PendingInput>,
    last_ack: i64,
    bounds: Option<Bounds>,
    grid: Option<CollisionGrid>,
}

impl Predictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bounds(&mut self, bounds: Bounds) {
        self.bounds = Some(bounds);
    }

    pub fn set_collision(&mut self, grid: CollisionGrid) {
        self.grid = Some(grid);
    }

    pub fn clear_collision(&mut self) {
        self.grid = None;
    }

    pub fn has_collision(&self) -> bool {
        self.grid.is_some()
    }

    /// Queue a local input and step the predicted tile. Returns the new
    /// predicted position.
    pub fn predict(&mut self, seq: i64, mv: MoveVec) -> (i32, i32) {
        self.pending.push_back(PendingInput { seq, mv });
        self.predicted = self.step(self.predicted, mv);
        self.predicted
    }

    /// Fold in a server ack. Stale or repeated acks are ignored; a fresh
    /// one drops every pending input at or below it.
    pub fn process_ack(&mut self, ack: i64) -> bool {
        if ack <= self.last_ack {
            return false;
        }
        self.last_ack = ack;
        while self
            .pending
            .front()
            .is_some_and(|input| input.seq <= self.last_ack)
        {
            self.pending.pop_front();
        }
        true
    }

    /// Accept the server's position for this entity, then replay the
    /// unacknowledged inputs in order on top of it.
    pub fn apply_authoritative(&mut self, x: i32, y: i32) {
        self.authoritative = (x, y);
        self.predicted = self.authoritative;
        for input in self.pending.clone() {
            self.predicted = self.step(self.predicted, input.mv);
        }
    }

    /// Local reposition (spawn request): both tiles jump, nothing pends.
    pub fn force_position(&mut self, x: i32, y: i32) {
        self.predicted = (x, y);
        self.authoritative = (x, y);
        self.pending.clear();
    }

    /// Back to the blank pre-join state. The cached collision grid is left
    /// alone; the owner drops it when the zone changes.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_ack = 0;
        self.predicted = (0, 0);
        self.authoritative = (0, 0);
    }

    /// One step of the shared movement rule: collapse diagonals, clamp to
    /// bounds when known, refuse blocked tiles when a grid is cached.
    fn step(&self, from: (i32, i32), mv: MoveVec) -> (i32, i32) {
        let (dx, dy) = normalize_move(mv);
        if dx == 0 && dy == 0 {
            return from;
        }
        let (mut nx, mut ny) = (from.0 + dx, from.1 + dy);
        if let Some(bounds) = self.bounds {
            let clamped = bounds.clamp(nx, ny);
            nx = clamped.0;
            ny = clamped.1;
        }
        if let Some(grid) = &self.grid {
            if grid.is_blocked(nx, ny) {
                return from;
            }
        }
        (nx, ny)
    }

    pub fn predicted(&self) -> (i32, i32) {
        self.predicted
    }

    pub fn authoritative(&self) -> (i32, i32) {
        self.authoritative
    }

    pub fn last_ack(&self) -> i64 {
        self.last_ack
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn east() -> MoveVec {
        MoveVec { x: 1, y: 0 }
    }

    fn predictor_at(x: i32, y: i32) -> Predictor {
        let mut p = Predictor::new();
        p.set_bounds(Bounds { w: 50, h: 20 });
        p.force_position(x, y);
        p
    }

    #[test]
    fn test_predict_steps_and_queues() {
        let mut p = predictor_at(10, 10);
        assert_eq!(p.predict(1, east()), (11, 10));
        assert_eq!(p.predicted(), (11, 10));
        assert_eq!(p.authoritative(), (10, 10));
        assert_eq!(p.pending_len(), 1);
    }

    #[test]
    fn test_diagonal_collapses_to_horizontal() {
        let mut p = predictor_at(10, 10);
        assert_eq!(p.predict(1, MoveVec { x: 1, y: 1 }), (11, 10));
        assert_eq!(p.predict(2, MoveVec { x: -1, y: -1 }), (10, 10));
    }

    #[test]
    fn test_blocked_tile_refuses_move_but_queues_input() {
        let mut grid = CollisionGrid::empty(50, 20);
        grid.set_blocked_for_test(11, 10);
        let mut p = predictor_at(10, 10);
        p.set_collision(grid);
        assert_eq!(p.predict(1, east()), (10, 10));
        // the input still goes out; the server will agree it was blocked
        assert_eq!(p.pending_len(), 1);
    }

    #[test]
    fn test_bounds_clamp_without_grid_is_permissive() {
        let mut p = predictor_at(0, 0);
        assert_eq!(p.predict(1, MoveVec { x: -1, y: 0 }), (0, 0));
        assert_eq!(p.predict(2, MoveVec { x: 0, y: -1 }), (0, 0));
        // off the far edge clamps too
        let mut p = predictor_at(49, 19);
        assert_eq!(p.predict(1, east()), (49, 19));
    }

    #[test]
    fn test_ack_drops_pending_and_ignores_stale() {
        let mut p = predictor_at(10, 10);
        p.predict(1, east());
        p.predict(2, east());
        p.predict(3, east());
        assert!(p.process_ack(2));
        assert_eq!(p.pending_len(), 1);
        assert_eq!(p.last_ack(), 2);
        // stale and repeated acks change nothing
        assert!(!p.process_ack(2));
        assert!(!p.process_ack(1));
        assert_eq!(p.pending_len(), 1);
        assert_eq!(p.last_ack(), 2);
    }

    #[test]
    fn test_authoritative_update_replays_unacked_tail() {
        let mut p = predictor_at(10, 10);
        p.predict(1, east());
        p.predict(2, east());
        assert_eq!(p.predicted(), (12, 10));
        // server confirms seq 1 at (11,10); seq 2 replays on top
        p.process_ack(1);
        p.apply_authoritative(11, 10);
        assert_eq!(p.predicted(), (12, 10));
        assert_eq!(p.pending_len(), 1);
        // full acknowledgment converges exactly
        p.process_ack(2);
        p.apply_authoritative(12, 10);
        assert_eq!(p.predicted(), (12, 10));
        assert_eq!(p.predicted(), p.authoritative());
        assert_eq!(p.pending_len(), 0);
    }

    #[test]
    fn test_server_correction_wins_over_optimistic_prediction() {
        // client does not know about a wall; server refuses the move
        let mut p = predictor_at(10, 10);
        p.predict(1, east());
        assert_eq!(p.predicted(), (11, 10));
        p.process_ack(1);
        p.apply_authoritative(10, 10);
        assert_eq!(p.predicted(), (10, 10));
        assert_eq!(p.pending_len(), 0);
    }

    #[test]
    fn test_reset_clears_prediction_state() {
        let mut p = predictor_at(10, 10);
        p.predict(1, east());
        p.process_ack(1);
        p.reset();
        assert_eq!(p.predicted(), (0, 0));
        assert_eq!(p.authoritative(), (0, 0));
        assert_eq!(p.pending_len(), 0);
        assert_eq!(p.last_ack(), 0);
    }
}
