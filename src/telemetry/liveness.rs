//! Source liveness
//!
//! Tracks when each upstream source last reported. A source is online while
//! `now - last_seen < timeout`; a source that never reported is offline.

use serde::Serialize;
use std::collections::HashMap;

/// Liveness view of one source
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLiveness {
    pub source_id: String,
    /// Unix seconds; `None` when never seen
    pub last_seen: Option<f64>,
    pub timeout: f64,
    pub online: bool,
}

/// Last-seen bookkeeping for a fixed set of required sources
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    timeout: f64,
    sources: Vec<String>,
    last_seen: HashMap<String, f64>,
}

impl LivenessTracker {
    pub fn new(timeout: f64, sources: Vec<String>) -> Self {
        Self {
            timeout,
            sources,
            last_seen: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> f64 {
        self.timeout
    }

    /// Required sources, in configured order
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Record a report. Unknown sources are ignored and a report older than
    /// the one already held does not move `last_seen` back. Returns whether
    /// the source is tracked.
    pub fn report(&mut self, source_id: &str, timestamp: f64) -> bool {
        if !self.sources.iter().any(|s| s == source_id) {
            return false;
        }
        let seen = self
            .last_seen
            .entry(source_id.to_string())
            .or_insert(f64::NEG_INFINITY);
        *seen = seen.max(timestamp);
        true
    }

    /// Last report time, negative infinity when never seen
    pub fn last_seen(&self, source_id: &str) -> f64 {
        self.last_seen
            .get(source_id)
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }

    pub fn is_online(&self, source_id: &str, now: f64) -> bool {
        now - self.last_seen(source_id) < self.timeout
    }

    /// Whether every required source is online
    pub fn all_online(&self, now: f64) -> bool {
        self.sources.iter().all(|s| self.is_online(s, now))
    }

    pub fn offline_sources(&self, now: f64) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| !self.is_online(s, now))
            .map(String::as_str)
            .collect()
    }

    pub fn snapshot(&self, now: f64) -> Vec<SourceLiveness> {
        self.sources
            .iter()
            .map(|s| SourceLiveness {
                source_id: s.clone(),
                last_seen: self.last_seen.get(s).copied(),
                timeout: self.timeout,
                online: self.is_online(s, now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> LivenessTracker {
        LivenessTracker::new(1.0, vec!["a".to_string(), "b".to_string()])
    }

    #[test]
    fn test_never_reported_source_is_offline() {
        let mut liveness = tracker();
        liveness.report("a", 0.0);

        assert!(liveness.is_online("a", 0.5));
        assert!(!liveness.is_online("b", 0.5));
        assert!(!liveness.all_online(0.5));
        assert_eq!(liveness.offline_sources(0.5), vec!["b"]);
    }

    #[test]
    fn test_reported_source_expires_after_timeout() {
        let mut liveness = tracker();
        liveness.report("a", 0.0);
        assert!(!liveness.is_online("a", 1.5));
        assert!(!liveness.is_online("a", 1.0));
        assert_eq!(liveness.offline_sources(1.5), vec!["a", "b"]);
    }

    #[test]
    fn test_all_online_when_every_source_is_fresh() {
        let mut liveness = tracker();
        liveness.report("a", 10.0);
        liveness.report("b", 10.2);
        assert!(!liveness.report("stray", 10.2));
        assert!(liveness.all_online(10.9));
        assert!(!liveness.all_online(11.05));

        let snapshot = liveness.snapshot(10.9);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.online));
    }

    #[test]
    fn test_unknown_sources_are_not_stored() {
        let mut liveness = tracker();
        for i in 0..100 {
            assert!(!liveness.report(&format!("ghost{}", i), 1.0));
        }
        assert!(liveness.report("a", 1.0));
        assert_eq!(liveness.last_seen.len(), 1);
        assert_eq!(liveness.last_seen("ghost0"), f64::NEG_INFINITY);
    }

    #[test]
    fn test_stale_report_does_not_rewind() {
        let mut liveness = tracker();
        liveness.report("a", 10.0);
        liveness.report("a", 4.0);
        assert_eq!(liveness.last_seen("a"), 10.0);
        assert!(liveness.is_online("a", 10.5));
    }
}
