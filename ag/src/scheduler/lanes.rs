//! Serial lanes: at most one in-flight request per lane name

use std::collections::HashMap;

use tracing::debug;

/// Busy/free state per lane
#[derive(Debug, Default)]
pub struct LaneManager {
    lanes: HashMap<String, bool>,
    serial_bound: bool,
}

impl LaneManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Busy flag of a lane; `None` if the lane was never used
    pub fn state(&self, lane: &str) -> Option<bool> {
        self.lanes.get(lane).copied()
    }

    /// Whether a request on `lane` may be dispatched now
    pub fn is_free(&self, lane: &str) -> bool {
        !self.state(lane).unwrap_or(false)
    }

    /// Set a lane busy or free
    ///
    /// Freeing a lane clears the serial-bound flag so the next pass rescans.
    pub fn set_state(&mut self, lane: &str, busy: bool) {
        debug!(%lane, busy, "LaneManager::set_state");
        self.lanes.insert(lane.to_string(), busy);
        if !busy {
            self.serial_bound = false;
        }
    }

    /// Names of lanes currently busy, sorted
    pub fn busy_lanes(&self) -> Vec<String> {
        let mut busy: Vec<_> = self
            .lanes
            .iter()
            .filter(|(_, busy)| **busy)
            .map(|(name, _)| name.clone())
            .collect();
        busy.sort();
        busy
    }

    /// Set when the last pass found only requests waiting on busy lanes
    pub fn serial_bound(&self) -> bool {
        self.serial_bound
    }

    pub fn mark_serial_bound(&mut self) {
        self.serial_bound = true;
    }
}
