//! Authoritative vehicle state.
//!
//! [`VehicleStore`] merges normalized records from every source into one map
//! keyed by canonical id and owns each vehicle's [`TrailHistory`].
//!
//! # Merge policy
//!
//! Field-level upsert: a source overwrites only the fields it covers (see
//! [`SourceTag::coverage`]); everything else is kept from the prior record.
//! An invalid fix never replaces a stored valid one.
//!
//! # Freshness
//!
//! A record is live while `now - last_seen_at <= stale_after`. Consumers only
//! ever see live records that hold a valid fix. Stale records linger for
//! `purge_grace` so a vehicle that reappears keeps its trail, then both are
//! purged.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{ChangeSummary, Fix, SourceTag, VehicleRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub stale_after: Duration,
    pub purge_grace: Duration,
    pub trail_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(90),
            purge_grace: Duration::from_secs(15),
            trail_capacity: 100,
        }
    }
}

// ============================================================================
// Trail History
// ============================================================================

/// Bounded sequence of recent fixes, oldest evicted first.
#[derive(Debug, Clone)]
pub struct TrailHistory {
    fixes: VecDeque<Fix>,
    capacity: usize,
}

impl TrailHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            fixes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends unless the fix repeats the latest one. Returns true if appended.
    pub fn push(&mut self, fix: Fix) -> bool {
        if self.fixes.back() == Some(&fix) {
            return false;
        }
        self.fixes.push_back(fix);
        while self.fixes.len() > self.capacity {
            self.fixes.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn points(&self) -> Vec<[f64; 2]> {
        self.fixes.iter().map(Fix::as_pair).collect()
    }
}

// ============================================================================
// Vehicle Store
// ============================================================================

#[derive(Debug, Clone)]
struct StoreEntry {
    record: VehicleRecord,
    /// Visibility as last reported in a `ChangeSummary`.
    reported_visible: bool,
}

#[derive(Debug)]
pub struct VehicleStore {
    entries: HashMap<String, StoreEntry>,
    trails: HashMap<String, TrailHistory>,
    config: StoreConfig,
}

impl VehicleStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            entries: HashMap::new(),
            trails: HashMap::new(),
            config,
        }
    }

    /// Upsert a batch from one source, then expire whatever went stale.
    pub fn merge(&mut self, records: &[VehicleRecord], tag: SourceTag, now: DateTime<Utc>) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        let coverage = tag.coverage();

        for incoming in records {
            if incoming.id.is_empty() {
                continue;
            }

            let fresh_fix = coverage.position && incoming.has_fix();
            if fresh_fix {
                self.trails
                    .entry(incoming.id.clone())
                    .or_insert_with(|| TrailHistory::new(self.config.trail_capacity))
                    .push(incoming.fix());
            }

            let Some(entry) = self.entries.get_mut(&incoming.id) else {
                let mut record = incoming.clone();
                record.source_tag = tag;
                if !fresh_fix {
                    record.lat = 0.0;
                    record.lon = 0.0;
                }
                let visible = is_visible(&record, now, self.config.stale_after);
                if visible {
                    summary.added.push(record.id.clone());
                }
                self.entries.insert(
                    record.id.clone(),
                    StoreEntry {
                        record,
                        reported_visible: visible,
                    },
                );
                continue;
            };

            let before = entry.record.clone();
            let record = &mut entry.record;
            if coverage.route {
                record.route_id = incoming.route_id.clone();
            }
            if fresh_fix {
                record.lat = incoming.lat;
                record.lon = incoming.lon;
            }
            if coverage.status {
                record.occupancy_or_status = incoming.occupancy_or_status.clone();
            }
            if coverage.trip {
                record.trip_id = incoming.trip_id.clone();
            }
            record.source_tag = tag;
            record.last_seen_at = record.last_seen_at.max(incoming.last_seen_at);

            let visible = is_visible(record, now, self.config.stale_after);
            match (entry.reported_visible, visible) {
                (false, true) => summary.added.push(record.id.clone()),
                (true, false) => summary.removed.push(record.id.clone()),
                (true, true) if record.display_differs(&before) => summary.updated.push(record.id.clone()),
                _ => {}
            }
            entry.reported_visible = visible;
        }

        summary.absorb(self.expire(now));
        summary
    }

    /// Hide records older than `stale_after` and purge those past the grace period.
    pub fn expire(&mut self, now: DateTime<Utc>) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        let purge_after = self.config.stale_after.saturating_add(self.config.purge_grace);

        let mut purged = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if entry.reported_visible && !is_visible(&entry.record, now, self.config.stale_after) {
                entry.reported_visible = false;
                summary.removed.push(id.clone());
            }
            if age(&entry.record, now) > purge_after {
                purged.push(id.clone());
            }
        }

        for id in purged {
            self.entries.remove(&id);
            self.trails.remove(&id);
            tracing::trace!(vehicle = %id, "Purged stale vehicle");
        }

        summary.removed.sort();
        summary
    }

    /// Live records that have a valid fix, ordered by id.
    pub fn visible_records(&self, now: DateTime<Utc>) -> Vec<VehicleRecord> {
        let mut records: Vec<VehicleRecord> = self
            .entries
            .values()
            .filter(|e| is_visible(&e.record, now, self.config.stale_after))
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// A live record, with or without a fix.
    pub fn get(&self, id: &str, now: DateTime<Utc>) -> Option<&VehicleRecord> {
        self.entries
            .get(id)
            .map(|e| &e.record)
            .filter(|r| age(r, now) <= self.config.stale_after)
    }

    pub fn trail(&self, id: &str) -> Vec<[f64; 2]> {
        self.trails.get(id).map(TrailHistory::points).unwrap_or_default()
    }

    /// Records held internally, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn age(record: &VehicleRecord, now: DateTime<Utc>) -> Duration {
    (now - record.last_seen_at).to_std().unwrap_or(Duration::ZERO)
}

fn is_visible(record: &VehicleRecord, now: DateTime<Utc>, stale_after: Duration) -> bool {
    record.has_fix() && age(record, now) <= stale_after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UNKNOWN_STATUS;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(secs)
    }

    fn record(id: &str, route: &str, lat: f64, lon: f64, seen: DateTime<Utc>) -> VehicleRecord {
        VehicleRecord {
            id: id.to_string(),
            route_id: route.to_string(),
            lat,
            lon,
            occupancy_or_status: "MANY_SEATS_AVAILABLE".to_string(),
            trip_id: format!("trip-{}", route),
            source_tag: SourceTag::Position,
            last_seen_at: seen,
        }
    }

    fn store() -> VehicleStore {
        VehicleStore::new(StoreConfig {
            stale_after: Duration::from_secs(45),
            purge_grace: Duration::from_secs(15),
            trail_capacity: 100,
        })
    }

    #[test]
    fn first_sighting_is_added() {
        let mut store = store();
        let summary = store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());

        assert_eq!(summary.added, vec!["1804"]);
        assert!(summary.updated.is_empty());
        assert_eq!(store.visible_records(t0()).len(), 1);
    }

    #[test]
    fn merging_same_record_twice_is_idempotent() {
        let mut store = store();
        let r = record("1804", "7", 43.59, -79.64, t0());
        store.merge(&[r.clone()], SourceTag::Position, t0());

        let again = store.merge(&[r], SourceTag::Position, t0());
        assert!(again.updated.is_empty());
        assert!(again.is_empty());
        assert_eq!(store.trail("1804").len(), 1);
    }

    #[test]
    fn refreshed_timestamp_alone_is_not_an_update() {
        let mut store = store();
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());

        let summary = store.merge(&[record("1804", "7", 43.59, -79.64, at(15))], SourceTag::Position, at(15));
        assert!(summary.is_empty());
        assert_eq!(store.get("1804", at(15)).unwrap().last_seen_at, at(15));
    }

    #[test]
    fn huge_windows_never_expire() {
        let mut store = VehicleStore::new(StoreConfig {
            stale_after: Duration::MAX,
            purge_grace: Duration::from_secs(15),
            trail_capacity: 100,
        });
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());

        assert!(store.expire(at(86_400)).is_empty());
        assert_eq!(store.visible_records(at(86_400)).len(), 1);
    }

    #[test]
    fn moved_vehicle_is_updated() {
        let mut store = store();
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());

        let summary = store.merge(&[record("1804", "7", 43.60, -79.65, at(15))], SourceTag::Position, at(15));
        assert_eq!(summary.updated, vec!["1804"]);
    }

    #[test]
    fn per_route_merge_preserves_position_and_status() {
        let mut store = store();
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());

        let from_route_feed = VehicleRecord {
            id: "1804".to_string(),
            route_id: "7A".to_string(),
            lat: 0.0,
            lon: 0.0,
            occupancy_or_status: UNKNOWN_STATUS.to_string(),
            trip_id: String::new(),
            source_tag: SourceTag::PerRoute,
            last_seen_at: at(5),
        };
        let summary = store.merge(&[from_route_feed], SourceTag::PerRoute, at(5));

        let merged = store.get("1804", at(5)).unwrap();
        assert_eq!(merged.route_id, "7A");
        assert_eq!((merged.lat, merged.lon), (43.59, -79.64));
        assert_eq!(merged.occupancy_or_status, "MANY_SEATS_AVAILABLE");
        assert_eq!(merged.trip_id, "trip-7");
        assert_eq!(merged.source_tag, SourceTag::PerRoute);
        assert_eq!(summary.updated, vec!["1804"]);
    }

    #[test]
    fn invalid_fix_keeps_last_known_position() {
        let mut store = store();
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());
        let summary = store.merge(&[record("1804", "7", 0.0, 0.0, at(15))], SourceTag::Position, at(15));

        assert!(summary.is_empty());
        let kept = store.get("1804", at(15)).unwrap();
        assert_eq!((kept.lat, kept.lon), (43.59, -79.64));
    }

    #[test]
    fn vehicle_without_fix_is_stored_but_not_visible() {
        let mut store = store();
        let summary = store.merge(&[record("1804", "7", 0.0, 0.0, t0())], SourceTag::Position, t0());

        assert!(summary.added.is_empty());
        assert!(store.visible_records(t0()).is_empty());
        assert!(store.get("1804", t0()).is_some());
    }

    #[test]
    fn stale_record_is_hidden_then_purged() {
        let mut store = store();
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());

        assert!(store.expire(at(45)).is_empty());
        assert_eq!(store.visible_records(at(45)).len(), 1);

        let summary = store.expire(at(46));
        assert_eq!(summary.removed, vec!["1804"]);
        assert!(store.visible_records(at(46)).is_empty());
        assert_eq!(store.len(), 1);
        assert_eq!(store.trail("1804").len(), 1);

        // Already reported, not reported twice
        assert!(store.expire(at(50)).is_empty());

        store.expire(at(61));
        assert_eq!(store.len(), 0);
        assert!(store.trail("1804").is_empty());
    }

    #[test]
    fn vehicle_returning_within_grace_keeps_trail() {
        let mut store = store();
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());
        store.expire(at(50));

        let summary = store.merge(&[record("1804", "7", 43.61, -79.66, at(55))], SourceTag::Position, at(55));
        assert_eq!(summary.added, vec!["1804"]);
        assert_eq!(store.trail("1804"), vec![[43.59, -79.64], [43.61, -79.66]]);
    }

    #[test]
    fn merge_reports_other_vehicles_going_stale() {
        let mut store = store();
        store.merge(&[record("1804", "7", 43.59, -79.64, t0())], SourceTag::Position, t0());

        let summary = store.merge(&[record("1805", "1", 43.5, -79.5, at(50))], SourceTag::Snapshot, at(50));
        assert_eq!(summary.added, vec!["1805"]);
        assert_eq!(summary.removed, vec!["1804"]);
    }

    #[test]
    fn trail_keeps_most_recent_hundred_fixes() {
        let mut store = store();
        for i in 0..150 {
            let lat = 43.0 + f64::from(i) * 0.001;
            store.merge(&[record("1804", "7", lat, -79.6, t0())], SourceTag::Position, t0());
        }

        let trail = store.trail("1804");
        assert_eq!(trail.len(), 100);
        assert_eq!(trail[0], [43.0 + 50.0 * 0.001, -79.6]);
        assert_eq!(trail[99], [43.0 + 149.0 * 0.001, -79.6]);
        assert!(trail.windows(2).all(|w| w[0][0] < w[1][0]));
    }

    #[test]
    fn trail_ignores_repeated_fix() {
        let mut trail = TrailHistory::new(3);
        assert!(trail.push(Fix::new(43.0, -79.0)));
        assert!(!trail.push(Fix::new(43.0, -79.0)));
        assert!(trail.push(Fix::new(43.1, -79.0)));
        assert!(trail.push(Fix::new(43.2, -79.0)));
        assert!(trail.push(Fix::new(43.3, -79.0)));
        assert_eq!(trail.points(), vec![[43.1, -79.0], [43.2, -79.0], [43.3, -79.0]]);
    }
}
