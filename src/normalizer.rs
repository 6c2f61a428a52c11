//! Raw feed records → canonical [`VehicleRecord`]s.
//!
//! The three feeds do not share a vocabulary or an identity space:
//!
//! | canonical  | GTFS-RT                     | snapshot        | per-route               |
//! |------------|-----------------------------|-----------------|-------------------------|
//! | `id`       | `vehicle.id` / label / entity | `Bus` / key   | fleet number / `id`     |
//! | `routeId`  | `trip.route_id`             | `Route`         | `route` / queried route |
//! | status     | occupancy enum              | `Model`         | n/a                     |
//! | `tripId`   | `trip.trip_id`              | `Trip`          | n/a                     |
//!
//! Identity prefers the public fleet number. The per-route feed is the only
//! one that pairs a feed-internal id with the fleet number, so it feeds a
//! [`FleetMap`] that later batches from the other feeds are resolved through.
//!
//! Everything here is pure. Records with no usable identity are dropped and
//! counted, never reported as errors.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{FleetNumberEntry, SourceTag, UNKNOWN_STATUS, VehicleRecord};
use crate::sources::{RawBatch, RawPosition, RawRouteVehicle, RawSnapshotVehicle};

const QUOTE_CHARS: [char; 7] = ['"', '\'', '`', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}'];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub tag: Option<SourceTag>,
    pub records: Vec<VehicleRecord>,
    /// Internal id → fleet number pairs learned from this batch.
    pub aliases: Vec<FleetNumberEntry>,
    /// Records discarded for lack of identity.
    pub dropped: usize,
}

/// Dispatch a raw batch to the normalizer for its feed.
pub fn normalize(raw: &RawBatch, fleet: &FleetMap, seen_at: DateTime<Utc>) -> NormalizedBatch {
    let tag = raw.tag();
    let mut batch = NormalizedBatch {
        tag: Some(tag),
        ..Default::default()
    };

    let candidates: Vec<Option<VehicleRecord>> = match raw {
        RawBatch::Position(positions) => positions
            .iter()
            .map(|p| normalize_position(p, fleet, seen_at))
            .collect(),
        RawBatch::Snapshot(vehicles) => vehicles
            .iter()
            .map(|v| normalize_snapshot(v, fleet, seen_at))
            .collect(),
        RawBatch::PerRoute(per_route) => per_route
            .vehicles
            .iter()
            .map(|v| {
                let (record, alias) = normalize_route_vehicle(v, seen_at);
                batch.aliases.extend(alias);
                record
            })
            .collect(),
    };

    // A feed occasionally repeats a vehicle; the last occurrence wins
    let mut index: HashMap<String, usize> = HashMap::new();
    for candidate in candidates {
        let Some(record) = candidate else {
            batch.dropped += 1;
            continue;
        };
        match index.get(&record.id) {
            Some(&i) => batch.records[i] = record,
            None => {
                index.insert(record.id.clone(), batch.records.len());
                batch.records.push(record);
            }
        }
    }

    batch
}

fn normalize_position(raw: &RawPosition, fleet: &FleetMap, seen_at: DateTime<Utc>) -> Option<VehicleRecord> {
    let id = first_non_empty([
        raw.vehicle_id.as_deref(),
        raw.vehicle_label.as_deref(),
        Some(raw.entity_id.as_str()),
    ])?;
    let (lat, lon) = canonical_fix(
        raw.latitude.map_or(f64::NAN, f64::from),
        raw.longitude.map_or(f64::NAN, f64::from),
    );

    Some(VehicleRecord {
        id: fleet.resolve(&id).to_string(),
        route_id: sanitize(raw.route_id.as_deref().unwrap_or_default()),
        lat,
        lon,
        occupancy_or_status: raw
            .occupancy
            .map(occupancy_label)
            .unwrap_or(UNKNOWN_STATUS)
            .to_string(),
        trip_id: sanitize(raw.trip_id.as_deref().unwrap_or_default()),
        source_tag: SourceTag::Position,
        last_seen_at: seen_at,
    })
}

fn normalize_snapshot(
    raw: &RawSnapshotVehicle,
    fleet: &FleetMap,
    seen_at: DateTime<Utc>,
) -> Option<VehicleRecord> {
    let bus = coerce_string(raw.bus.as_ref());
    let id = if bus.is_empty() { sanitize(&raw.key) } else { bus };
    if id.is_empty() {
        return None;
    }
    let (lat, lon) = canonical_fix(
        coerce_f64(raw.latitude.as_ref()),
        coerce_f64(raw.longitude.as_ref()),
    );
    let model = coerce_string(raw.model.as_ref());

    Some(VehicleRecord {
        id: fleet.resolve(&id).to_string(),
        route_id: coerce_string(raw.route.as_ref()),
        lat,
        lon,
        occupancy_or_status: if model.is_empty() {
            UNKNOWN_STATUS.to_string()
        } else {
            model
        },
        trip_id: coerce_string(raw.trip.as_ref()),
        source_tag: SourceTag::Snapshot,
        last_seen_at: seen_at,
    })
}

fn normalize_route_vehicle(
    raw: &RawRouteVehicle,
    seen_at: DateTime<Utc>,
) -> (Option<VehicleRecord>, Option<FleetNumberEntry>) {
    let fleet_number = coerce_string(raw.fleet_number.as_ref());
    let internal_id = coerce_string(raw.vehicle_id.as_ref());
    let mut route_id = coerce_string(raw.route.as_ref());
    if route_id.is_empty() {
        route_id = sanitize(&raw.queried_route);
    }

    let alias = (!fleet_number.is_empty() && !internal_id.is_empty() && fleet_number != internal_id)
        .then(|| FleetNumberEntry {
            internal_id: internal_id.clone(),
            public_fleet_number: fleet_number.clone(),
            route_id: route_id.clone(),
        });

    let id = if fleet_number.is_empty() { internal_id } else { fleet_number };
    if id.is_empty() {
        return (None, alias);
    }

    let record = VehicleRecord {
        id,
        route_id,
        lat: 0.0,
        lon: 0.0,
        occupancy_or_status: UNKNOWN_STATUS.to_string(),
        trip_id: String::new(),
        source_tag: SourceTag::PerRoute,
        last_seen_at: seen_at,
    };
    (Some(record), alias)
}

// ============================================================================
// Field Coercion
// ============================================================================

/// Trim and strip embedded quote characters.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !QUOTE_CHARS.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Loose JSON → display string. Integers print without a fraction.
pub fn coerce_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => sanitize(s),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(u)) => u.to_string(),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Loose JSON → float. Anything unreadable becomes NaN rather than an error.
pub fn coerce_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => sanitize(s).parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Invalid fixes are stored as (0, 0), the feeds' own "no fix" marker.
fn canonical_fix(lat: f64, lon: f64) -> (f64, f64) {
    let fix = crate::models::Fix::new(lat, lon);
    if fix.is_valid() { (lat, lon) } else { (0.0, 0.0) }
}

fn first_non_empty<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(sanitize)
        .find(|s| !s.is_empty())
}

/// GTFS-RT `OccupancyStatus` names, as the map popup shows them.
pub fn occupancy_label(status: i32) -> &'static str {
    match status {
        0 => "EMPTY",
        1 => "MANY_SEATS_AVAILABLE",
        2 => "FEW_SEATS_AVAILABLE",
        3 => "STANDING_ROOM_ONLY",
        4 => "CRUSHED_STANDING_ROOM_ONLY",
        5 => "FULL",
        6 => "NOT_ACCEPTING_PASSENGERS",
        7 => "NO_DATA_AVAILABLE",
        8 => "NOT_BOARDABLE",
        _ => UNKNOWN_STATUS,
    }
}

// ============================================================================
// Fleet Numbers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct FleetAlias {
    fleet_number: String,
    route_id: String,
}

/// Feed-internal vehicle id → public fleet number.
#[derive(Debug, Clone, Default)]
pub struct FleetMap {
    aliases: HashMap<String, FleetAlias>,
}

impl FleetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the mapping is new or changed.
    pub fn register(&mut self, entry: &FleetNumberEntry) -> bool {
        let alias = FleetAlias {
            fleet_number: entry.public_fleet_number.clone(),
            route_id: entry.route_id.clone(),
        };
        self.aliases.insert(entry.internal_id.clone(), alias.clone()) != Some(alias)
    }

    /// Public fleet number for a known internal id, else the id unchanged.
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases
            .get(id)
            .map_or(id, |alias| alias.fleet_number.as_str())
    }

    pub fn entries(&self) -> Vec<FleetNumberEntry> {
        let mut entries: Vec<FleetNumberEntry> = self
            .aliases
            .iter()
            .map(|(internal_id, alias)| FleetNumberEntry {
                internal_id: internal_id.clone(),
                public_fleet_number: alias.fleet_number.clone(),
                route_id: alias.route_id.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.internal_id.cmp(&b.internal_id));
        entries
    }
}
