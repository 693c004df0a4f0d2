//! Run-level summary types carried by service events

use serde::{Deserialize, Serialize};

/// Per-run outcome tally
///
/// At a terminal state `processed + failed + cancelled` equals the batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub processed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Studies not yet settled (only non-zero while a run is in flight)
    pub pending: usize,
}

impl OutcomeCounts {
    /// Total studies accounted for
    pub fn total(&self) -> usize {
        self.processed + self.failed + self.cancelled + self.pending
    }
}
