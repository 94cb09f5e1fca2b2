//! Collaborators the scanner consumes from the request/response API layer.

use std::sync::Mutex;
use std::time::SystemTime;

use serde::Deserialize;

use crate::world::coordinate::Coordinate;

/// Last request timestamp, used to pace channel openings.
///
/// The scanner records every channel it opens, so scans sharing a clock are
/// spaced apart. A request/response client sharing the clock records its own
/// calls the same way.
pub trait RequestClock: Send + Sync {
    fn last_request_at(&self) -> Option<SystemTime>;

    fn record_request(&self, at: SystemTime);
}

#[derive(Debug, Default)]
pub struct SharedRequestClock {
    last: Mutex<Option<SystemTime>>,
}

impl SharedRequestClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        self.touch_at(SystemTime::now());
    }

    pub fn touch_at(&self, at: SystemTime) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(at);
        }
    }
}

impl RequestClock for SharedRequestClock {
    fn last_request_at(&self) -> Option<SystemTime> {
        self.last.lock().ok().and_then(|last| *last)
    }

    fn record_request(&self, at: SystemTime) {
        self.touch_at(at);
    }
}

/// The account's own kingdom: where scans start and which field server to use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KingdomProfile {
    pub world_id: i64,
    pub x: u32,
    pub y: u32,
    pub field_url: String,
}

impl KingdomProfile {
    pub fn location(&self) -> Coordinate {
        Coordinate::new(self.world_id, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clock_reports_latest_touch() {
        let clock = SharedRequestClock::new();
        assert!(clock.last_request_at().is_none());
        let earlier = SystemTime::now() - Duration::from_secs(60);
        clock.touch_at(earlier);
        assert_eq!(clock.last_request_at(), Some(earlier));
        clock.touch();
        assert!(clock.last_request_at().expect("touched") > earlier);
    }
}
