//! Counts - store / queue の件数（観測用）

use serde::{Deserialize, Serialize};

use super::state::RecordState;

/// Records per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RecordCounts {
    pub fn add(&mut self, state: RecordState) {
        match state {
            RecordState::Pending => self.pending += 1,
            RecordState::Processing => self.processing += 1,
            RecordState::Completed => self.completed += 1,
            RecordState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Messages per queue position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub ready: usize,
    pub in_flight: usize,
    pub scheduled: usize,
    pub dead_lettered: usize,
}

impl QueueCounts {
    /// Nothing left to deliver (dead letters don't count).
    pub fn is_drained(&self) -> bool {
        self.ready == 0 && self.in_flight == 0 && self.scheduled == 0
    }
}
