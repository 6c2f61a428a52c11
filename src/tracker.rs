//! Application state for the live map.
//!
//! [`Tracker`] is the single owner of every piece of mutable display state:
//! the vehicle store, the search query, what the map currently shows, the
//! route shape selection, the fleet-number table and per-source health.
//! Every mutation goes through one of its methods and yields at most one
//! [`DisplayEvent`]. Readers get an immutable [`ViewSnapshot`].
//!
//! It is synchronous and clock-agnostic (callers pass `now`), which keeps
//! the merge → filter → diff cycle testable without a runtime. The async
//! wiring lives in [`crate::service`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::config::TrackerConfig;
use crate::error::{ConfigError, FetchError, Result, TrackerError};
use crate::models::{ChangeSummary, FleetNumberEntry, RouteShape, SourceTag, VehicleRecord};
use crate::normalizer::{FleetMap, normalize};
use crate::reconciler::{Changeset, MarkerReconciler};
use crate::route_shape::{RouteShapeCache, ShapeRequest, ShapeView};
use crate::scheduler::SourceReport;
use crate::search::SearchFilter;
use crate::store::{StoreConfig, VehicleStore};

// ============================================================================
// Display Types
// ============================================================================

/// Pushed to subscribers after each cycle that changed what is displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DisplayEvent {
    #[serde(rename_all = "camelCase")]
    Vehicles {
        revision: u64,
        changeset: Changeset,
        /// Set while any source is degraded; markers keep last-known-good data.
        advisory: bool,
    },
    Shape(ShapeView),
}

/// Health of one upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub tag: SourceTag,
    /// Whether the latest poll produced usable data.
    pub healthy: bool,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// `last_success_at` in the display timezone.
    pub last_success_local: Option<String>,
    pub consecutive_failures: u32,
    /// Per-route requests that failed in the latest successful poll.
    pub last_partial_failures: usize,
    pub last_count: usize,
    pub polls: u64,
}

impl SourceStatus {
    fn new(tag: SourceTag) -> Self {
        Self {
            tag,
            healthy: true,
            last_error: None,
            last_success_at: None,
            last_success_local: None,
            consecutive_failures: 0,
            last_partial_failures: 0,
            last_count: 0,
            polls: 0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.healthy || self.last_partial_failures > 0
    }

    fn record_success(&mut self, at: DateTime<Utc>, count: usize, partial: Option<FetchError>) {
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_success_at = Some(at);
        self.last_count = count;
        self.last_partial_failures = match &partial {
            Some(FetchError::PartialSourceFailure { failed, .. }) => *failed,
            _ => 0,
        };
        self.last_error = partial.map(|e| e.to_string());
    }

    fn record_failure(&mut self, error: &FetchError) {
        self.healthy = false;
        self.consecutive_failures += 1;
        if let FetchError::PartialSourceFailure { failed, .. } = error {
            self.last_partial_failures = *failed;
        }
        self.last_error = Some(error.to_string());
    }
}

/// Immutable view of the display state at one revision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot {
    pub revision: u64,
    pub generated_at: DateTime<Utc>,
    pub query: String,
    /// Vehicles currently on the map, search applied, ordered by id.
    pub vehicles: Vec<VehicleRecord>,
    #[serde(skip)]
    pub trails: HashMap<String, Vec<[f64; 2]>>,
    pub selected: Option<String>,
    pub shape: ShapeView,
    pub sources: Vec<SourceStatus>,
    pub advisory: bool,
    pub fleet: Vec<FleetNumberEntry>,
    /// Records held by the store, stale ones included.
    pub tracked: usize,
}

impl ViewSnapshot {
    pub fn vehicle(&self, id: &str) -> Option<&VehicleRecord> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    pub fn trail(&self, id: &str) -> Vec<[f64; 2]> {
        self.trails.get(id).cloned().unwrap_or_default()
    }
}

pub fn format_timestamp_full(timestamp: DateTime<Utc>, tz: &Tz) -> String {
    timestamp.with_timezone(tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============================================================================
// Tracker
// ============================================================================

pub struct Tracker {
    store: VehicleStore,
    search: SearchFilter,
    reconciler: MarkerReconciler,
    shapes: RouteShapeCache,
    fleet: FleetMap,
    sources: BTreeMap<SourceTag, SourceStatus>,
    last_seq: HashMap<SourceTag, u64>,
    selected: Option<String>,
    revision: u64,
    advisory: bool,
    tz: Tz,
}

impl Tracker {
    pub fn new(config: &TrackerConfig) -> std::result::Result<Self, ConfigError> {
        let store = VehicleStore::new(StoreConfig {
            stale_after: config.stale_after(),
            purge_grace: config.purge_grace(),
            trail_capacity: config.trail_capacity,
        });

        Ok(Self {
            store,
            search: SearchFilter::new(),
            reconciler: MarkerReconciler::new(),
            shapes: RouteShapeCache::new(config.shape_cache_capacity),
            fleet: FleetMap::new(),
            sources: config
                .enabled_sources()
                .into_iter()
                .map(|tag| (tag, SourceStatus::new(tag)))
                .collect(),
            last_seq: HashMap::new(),
            selected: None,
            revision: 0,
            advisory: false,
            tz: config.display_tz()?,
        })
    }

    /// Merge one poll outcome. Failures only update source health; the store
    /// keeps its last-known-good records until they go stale.
    pub fn apply_report(&mut self, report: SourceReport, now: DateTime<Utc>) -> Option<DisplayEvent> {
        let tag = report.tag;
        let last = self.last_seq.entry(tag).or_insert(0);
        if report.seq <= *last {
            tracing::debug!(source = %tag, seq = report.seq, last = *last, "Dropping out-of-order report");
            return None;
        }
        *last = report.seq;

        let status = self.sources.entry(tag).or_insert_with(|| SourceStatus::new(tag));
        status.polls += 1;

        let summary = match report.outcome {
            Ok(batch) => {
                let normalized = normalize(&batch, &self.fleet, report.completed_at);
                for alias in &normalized.aliases {
                    if self.fleet.register(alias) {
                        tracing::trace!(
                            internal_id = %alias.internal_id,
                            fleet_number = %alias.public_fleet_number,
                            "Fleet number mapped"
                        );
                    }
                }
                if normalized.dropped > 0 {
                    tracing::debug!(source = %tag, dropped = normalized.dropped, "Dropped records without identity");
                }

                status.record_success(report.completed_at, normalized.records.len(), batch.partial_failure());
                let summary = self.store.merge(&normalized.records, tag, now);
                tracing::debug!(
                    source = %tag,
                    seq = report.seq,
                    count = normalized.records.len(),
                    added = summary.added.len(),
                    updated = summary.updated.len(),
                    removed = summary.removed.len(),
                    "Merged batch"
                );
                summary
            }
            Err(e) => {
                status.record_failure(&e);
                tracing::warn!(
                    source = %tag,
                    seq = report.seq,
                    failures = status.consecutive_failures,
                    error = %e,
                    "Source degraded, keeping last known vehicles"
                );
                self.store.expire(now)
            }
        };

        self.publish_vehicles(Some(summary), now)
    }

    /// Hide and purge stale records even when no source is delivering.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Option<DisplayEvent> {
        let summary = self.store.expire(now);
        if !summary.removed.is_empty() {
            tracing::debug!(removed = summary.removed.len(), "Stale vehicles hidden");
        }
        self.publish_vehicles(Some(summary), now)
    }

    pub fn set_search_query(&mut self, query: &str, now: DateTime<Utc>) -> Option<DisplayEvent> {
        if !self.search.set_query(query) {
            return None;
        }
        tracing::debug!(query = %self.search.query(), "Search query changed");
        self.publish_vehicles(None, now)
    }

    /// Select a displayed vehicle and drive the shape cache with its trip or route.
    pub fn select(&mut self, id: &str) -> std::result::Result<(Option<ShapeRequest>, DisplayEvent), TrackerError> {
        let record = self
            .reconciler
            .shown()
            .get(id)
            .ok_or_else(|| TrackerError::UnknownVehicle(id.to_string()))?;

        let key = [record.trip_id.as_str(), record.route_id.as_str()]
            .into_iter()
            .find(|k| !k.is_empty())
            .ok_or_else(|| TrackerError::NoShapeKey(id.to_string()))?
            .to_string();

        self.selected = Some(id.to_string());
        let request = self.shapes.select(&key);
        tracing::info!(vehicle = %id, shape_id = %key, fetch = request.is_some(), "Vehicle selected");

        Ok((request, DisplayEvent::Shape(self.shapes.view())))
    }

    pub fn deselect(&mut self) -> DisplayEvent {
        if let Some(id) = self.selected.take() {
            tracing::info!(vehicle = %id, "Vehicle deselected");
        }
        self.shapes.deselect();
        DisplayEvent::Shape(self.shapes.view())
    }

    pub fn complete_shape(&mut self, token: u64, result: Result<RouteShape>) -> Option<DisplayEvent> {
        self.shapes
            .complete(token, result)
            .then(|| DisplayEvent::Shape(self.shapes.view()))
    }

    pub fn shape_view(&self) -> ShapeView {
        self.shapes.view()
    }

    pub fn visible_count(&self) -> usize {
        self.reconciler.shown().len()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ViewSnapshot {
        let mut vehicles: Vec<VehicleRecord> = self.reconciler.shown().values().cloned().collect();
        vehicles.sort_by(|a, b| a.id.cmp(&b.id));

        let trails = vehicles
            .iter()
            .map(|v| (v.id.clone(), self.store.trail(&v.id)))
            .collect();

        let sources = self
            .sources
            .values()
            .map(|status| SourceStatus {
                last_success_local: status.last_success_at.map(|at| format_timestamp_full(at, &self.tz)),
                ..status.clone()
            })
            .collect();

        ViewSnapshot {
            revision: self.revision,
            generated_at: now,
            query: self.search.query().to_string(),
            vehicles,
            trails,
            selected: self.selected.clone(),
            shape: self.shapes.view(),
            sources,
            advisory: self.advisory,
            fleet: self.fleet.entries(),
            tracked: self.store.len(),
        }
    }

    /// Filter, diff against what is shown and bump the revision if anything changed.
    ///
    /// An empty store summary means nothing visible changed, so the diff is skipped.
    fn publish_vehicles(&mut self, summary: Option<ChangeSummary>, now: DateTime<Utc>) -> Option<DisplayEvent> {
        let advisory = self.sources.values().any(SourceStatus::is_degraded);
        let advisory_changed = advisory != self.advisory;
        self.advisory = advisory;

        let changeset = match summary {
            Some(summary) if summary.is_empty() => Changeset::default(),
            _ => {
                let visible = self.search.apply(self.store.visible_records(now));
                let store = &self.store;
                self.reconciler.reconcile(visible, |id| store.trail(id))
            }
        };

        if changeset.is_empty() && !advisory_changed {
            return None;
        }

        self.revision += 1;
        Some(DisplayEvent::Vehicles {
            revision: self.revision,
            changeset,
            advisory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{PerRouteBatch, RawBatch, RawPosition, RawRouteVehicle};
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(secs)
    }

    fn config() -> TrackerConfig {
        let mut config = TrackerConfig {
            routes: vec!["7".to_string(), "12".to_string()],
            stale_after: Some(Duration::from_secs(45)),
            purge_grace: Some(Duration::from_secs(15)),
            ..TrackerConfig::default()
        };
        config.snapshot.enabled = false;
        config
    }

    fn position(id: &str, route: &str, trip: &str, lat: f32, lon: f32) -> RawPosition {
        RawPosition {
            entity_id: format!("e-{}", id),
            vehicle_id: Some(id.to_string()),
            route_id: Some(route.to_string()),
            trip_id: Some(trip.to_string()),
            latitude: Some(lat),
            longitude: Some(lon),
            ..Default::default()
        }
    }

    fn report(tag: SourceTag, seq: u64, completed_at: DateTime<Utc>, outcome: Result<RawBatch>) -> SourceReport {
        SourceReport {
            tag,
            seq,
            completed_at,
            outcome,
        }
    }

    fn positions(seq: u64, now: DateTime<Utc>, entries: Vec<RawPosition>) -> SourceReport {
        report(SourceTag::Position, seq, now, Ok(RawBatch::Position(entries)))
    }

    fn vehicles_changeset(event: Option<DisplayEvent>) -> (Changeset, bool) {
        match event {
            Some(DisplayEvent::Vehicles { changeset, advisory, .. }) => (changeset, advisory),
            other => panic!("expected a vehicles event, got {:?}", other),
        }
    }

    #[test]
    fn first_batch_adds_markers() {
        let mut tracker = Tracker::new(&config()).unwrap();
        let event = tracker.apply_report(
            positions(1, t0(), vec![position("1804", "7", "t-1", 43.59, -79.64)]),
            t0(),
        );

        let (changeset, advisory) = vehicles_changeset(event);
        assert_eq!(changeset.added_ids(), vec!["1804"]);
        assert_eq!(changeset.trails.len(), 1);
        assert!(!advisory);
        assert_eq!(tracker.snapshot(t0()).revision, 1);
    }

    #[test]
    fn repeated_batch_emits_nothing() {
        let mut tracker = Tracker::new(&config()).unwrap();
        let batch = vec![position("1804", "7", "t-1", 43.59, -79.64)];
        tracker.apply_report(positions(1, t0(), batch.clone()), t0());

        assert_eq!(tracker.apply_report(positions(2, at(15), batch), at(15)), None);
    }

    #[test]
    fn out_of_order_report_is_dropped() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(
            positions(2, at(15), vec![position("1804", "7", "t-1", 43.60, -79.65)]),
            at(15),
        );

        let late = tracker.apply_report(
            positions(1, t0(), vec![position("1804", "7", "t-1", 43.59, -79.64)]),
            at(16),
        );
        assert_eq!(late, None);
        let shown = tracker.snapshot(at(16));
        assert!((shown.vehicles[0].lat - 43.60).abs() < 1e-4);
    }

    #[test]
    fn failure_keeps_markers_and_raises_advisory() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(
            positions(1, t0(), vec![position("1804", "7", "t-1", 43.59, -79.64)]),
            t0(),
        );

        let event = tracker.apply_report(
            report(
                SourceTag::Position,
                2,
                at(15),
                Err(FetchError::MalformedPayload("not a feed".to_string())),
            ),
            at(15),
        );
        let (changeset, advisory) = vehicles_changeset(event);
        assert!(changeset.is_empty());
        assert!(advisory);

        let snapshot = tracker.snapshot(at(15));
        assert_eq!(snapshot.vehicles.len(), 1);
        let status = &snapshot.sources[0];
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.last_error.as_deref(), Some("Malformed payload: not a feed"));

        // Recovery clears the advisory
        let (_, advisory) = vehicles_changeset(tracker.apply_report(
            positions(3, at(30), vec![position("1804", "7", "t-1", 43.59, -79.64)]),
            at(30),
        ));
        assert!(!advisory);
    }

    #[test]
    fn sweep_hides_vehicles_when_sources_go_quiet() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(
            positions(1, t0(), vec![position("1804", "7", "t-1", 43.59, -79.64)]),
            t0(),
        );

        assert_eq!(tracker.sweep(at(30)), None);
        let (changeset, _) = vehicles_changeset(tracker.sweep(at(50)));
        assert_eq!(changeset.removed, vec!["1804"]);
        assert!(tracker.snapshot(at(50)).vehicles.is_empty());
    }

    #[test]
    fn search_change_diffs_the_visible_set() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(
            positions(
                1,
                t0(),
                vec![
                    position("1234", "7", "t-1", 43.59, -79.64),
                    position("7007", "12", "t-2", 43.60, -79.65),
                ],
            ),
            t0(),
        );

        let (changeset, _) = vehicles_changeset(tracker.set_search_query(" 7 ", t0()));
        assert_eq!(changeset.removed, vec!["7007"]);
        assert_eq!(tracker.snapshot(t0()).query, "7");
        assert_eq!(tracker.set_search_query("7", t0()), None);

        let (changeset, _) = vehicles_changeset(tracker.set_search_query("", t0()));
        assert_eq!(changeset.added_ids(), vec!["7007"]);
    }

    #[test]
    fn partial_per_route_failure_is_reported() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(
            positions(1, t0(), vec![position("1804", "7", "t-1", 43.59, -79.64)]),
            t0(),
        );

        let batch = PerRouteBatch {
            vehicles: vec![RawRouteVehicle {
                queried_route: "7".to_string(),
                vehicle_id: Some(json!("9001")),
                fleet_number: Some(json!("1804")),
                route: None,
            }],
            requested: 2,
            failed: vec![("12".to_string(), FetchError::NetworkError("timeout".to_string()))],
        };
        let event = tracker.apply_report(report(SourceTag::PerRoute, 1, at(5), Ok(RawBatch::PerRoute(batch))), at(5));
        let (_, advisory) = vehicles_changeset(event);
        assert!(advisory);

        let snapshot = tracker.snapshot(at(5));
        let per_route = snapshot.sources.iter().find(|s| s.tag == SourceTag::PerRoute).unwrap();
        assert!(per_route.healthy);
        assert_eq!(per_route.last_partial_failures, 1);
        assert_eq!(snapshot.fleet.len(), 1);
        assert_eq!(snapshot.vehicles[0].source_tag, SourceTag::PerRoute);
        assert!((snapshot.vehicles[0].lat - 43.59).abs() < 1e-4);
    }

    #[test]
    fn every_per_route_request_failing_keeps_the_count() {
        let mut tracker = Tracker::new(&config()).unwrap();
        let failure = FetchError::PartialSourceFailure { failed: 2, total: 2 };
        tracker.apply_report(report(SourceTag::PerRoute, 1, t0(), Err(failure)), t0());

        let snapshot = tracker.snapshot(t0());
        let per_route = snapshot.sources.iter().find(|s| s.tag == SourceTag::PerRoute).unwrap();
        assert!(!per_route.healthy);
        assert_eq!(per_route.last_partial_failures, 2);
        assert_eq!(per_route.last_error.as_deref(), Some("2 of 2 per-route requests failed"));
        assert!(snapshot.advisory);
    }

    #[test]
    fn internal_ids_resolve_to_fleet_numbers_once_learned() {
        let mut tracker = Tracker::new(&config()).unwrap();
        let batch = PerRouteBatch {
            vehicles: vec![RawRouteVehicle {
                queried_route: "7".to_string(),
                vehicle_id: Some(json!("9001")),
                fleet_number: Some(json!("1804")),
                route: None,
            }],
            requested: 1,
            failed: Vec::new(),
        };
        tracker.apply_report(report(SourceTag::PerRoute, 1, t0(), Ok(RawBatch::PerRoute(batch))), t0());

        let (changeset, _) = vehicles_changeset(tracker.apply_report(
            positions(1, at(1), vec![position("9001", "7", "t-1", 43.59, -79.64)]),
            at(1),
        ));
        assert_eq!(changeset.added_ids(), vec!["1804"]);
    }

    #[test]
    fn select_uses_trip_then_route() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(
            positions(
                1,
                t0(),
                vec![
                    position("1804", "7", "t-1", 43.59, -79.64),
                    position("1805", "12", "", 43.60, -79.65),
                    position("1806", "", "", 43.61, -79.66),
                ],
            ),
            t0(),
        );

        let (request, _) = tracker.select("1804").unwrap();
        assert_eq!(request.unwrap().id, "t-1");

        let (request, _) = tracker.select("1805").unwrap();
        assert_eq!(request.unwrap().id, "12");

        assert_eq!(
            tracker.select("1806").unwrap_err(),
            TrackerError::NoShapeKey("1806".to_string())
        );
        assert_eq!(
            tracker.select("9999").unwrap_err(),
            TrackerError::UnknownVehicle("9999".to_string())
        );
    }

    #[test]
    fn shape_completion_and_deselect() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(
            positions(1, t0(), vec![position("1804", "7", "t-1", 43.59, -79.64)]),
            t0(),
        );

        let (request, _) = tracker.select("1804").unwrap();
        let request = request.unwrap();
        let shape = RouteShape {
            id: "t-1".to_string(),
            points: vec![[43.59, -79.64]],
        };

        assert!(tracker.complete_shape(request.token + 1, Ok(shape.clone())).is_none());
        let event = tracker.complete_shape(request.token, Ok(shape.clone()));
        assert!(matches!(event, Some(DisplayEvent::Shape(ref view)) if view.shape == Some(shape.clone())));
        assert_eq!(tracker.snapshot(t0()).selected.as_deref(), Some("1804"));

        let DisplayEvent::Shape(view) = tracker.deselect() else {
            panic!("expected a shape event");
        };
        assert_eq!(view, ShapeView::default());
        assert_eq!(tracker.snapshot(t0()).selected, None);
    }

    #[test]
    fn snapshot_formats_local_times() {
        let mut tracker = Tracker::new(&config()).unwrap();
        tracker.apply_report(positions(1, t0(), Vec::new()), t0());

        let snapshot = tracker.snapshot(t0());
        let position = snapshot.sources.iter().find(|s| s.tag == SourceTag::Position).unwrap();
        // 2023-11-14 22:13:20 UTC is 17:13:20 in Toronto (EST)
        assert_eq!(position.last_success_local.as_deref(), Some("2023-11-14 17:13:20"));
    }
}
