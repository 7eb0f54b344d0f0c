#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Download progress as a `(completed, total)` pair of byte counts.
///
/// `total` is zero while the expected length is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TaskProgress {
    pub completed: u64,
    pub total: u64,
}

impl TaskProgress {
    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }

    /// Completed fraction in `0.0..=1.0`, or `None` while the total is
    /// unknown.
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.completed as f64 / self.total as f64)
    }
}
