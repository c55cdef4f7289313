//! Status - 件数ビュー（観測用）

use serde::{Deserialize, Serialize};

pub use crate::domain::{QueueCounts, RecordCounts};

/// Point-in-time view of both sides of the system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub records: RecordCounts,
    pub queue: QueueCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_both_sides() {
        let snapshot = StatusSnapshot {
            records: RecordCounts {
                completed: 1,
                ..RecordCounts::default()
            },
            queue: QueueCounts::default(),
        };

        let json = serde_json::to_value(snapshot).unwrap();

        assert_eq!(json["records"]["completed"], 1);
        assert_eq!(json["queue"]["dead_lettered"], 0);
    }
}
