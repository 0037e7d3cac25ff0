//! Loop liveness tracking.
//!
//! Each control loop stamps its heartbeat every iteration; the health
//! query derives "loops alive" from heartbeat age, so a stalled loop is
//! visible even while the process itself is healthy.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Default)]
pub struct Heartbeats {
    beats: Mutex<HashMap<&'static str, DateTime<Utc>>>,
}

/// Operational health snapshot served by the HTTP endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Health {
    pub running: bool,
    pub loops_alive: usize,
    pub loops_total: usize,
    /// Age of the stalest heartbeat, None before any loop has beaten.
    pub last_heartbeat_age_secs: Option<i64>,
}

impl Heartbeats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, loop_name: &'static str) {
        self.beats.lock().insert(loop_name, Utc::now());
    }

    #[must_use]
    pub fn age_secs(&self, loop_name: &str, now: DateTime<Utc>) -> Option<i64> {
        self.beats
            .lock()
            .get(loop_name)
            .map(|at| (now - *at).num_seconds())
    }

    /// Health derived from heartbeat ages: a loop is alive if it has
    /// beaten within `stale_secs`.
    #[must_use]
    pub fn health(&self, running: bool, stale_secs: i64, now: DateTime<Utc>) -> Health {
        let beats = self.beats.lock();
        let ages: Vec<i64> = beats.values().map(|at| (now - *at).num_seconds()).collect();
        Health {
            running,
            loops_alive: ages.iter().filter(|age| **age <= stale_secs).count(),
            loops_total: ages.len(),
            last_heartbeat_age_secs: ages.iter().max().copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn stalled_loop_counted_dead() {
        let beats = Heartbeats::new();
        beats.beat("monitor");
        beats.beat("trading");

        let now = Utc::now();
        let health = beats.health(true, 60, now);
        assert_eq!(health.loops_alive, 2);
        assert_eq!(health.loops_total, 2);

        // Pretend an hour passes with no further beats.
        let later = now + Duration::seconds(3600);
        let health = beats.health(true, 60, later);
        assert_eq!(health.loops_alive, 0);
        assert_eq!(health.loops_total, 2);
        assert!(health.last_heartbeat_age_secs.unwrap() >= 3600);
    }

    #[test]
    fn no_beats_yet_reports_none() {
        let beats = Heartbeats::new();
        let health = beats.health(false, 60, Utc::now());
        assert_eq!(health.loops_total, 0);
        assert_eq!(health.last_heartbeat_age_secs, None);
    }
}
