// Canonical vehicle model shared by every stage of the live-data pipeline.
//
// Upstream feeds (all MiWay, Mississauga):
// - GTFS-RT Vehicle Positions: https://www.miapp.ca/GTFS_RT/Vehicle/VehiclePositions.pb
// - Snapshot JSON: https://transit55.ca/mississauga/map/data.json
// - Per-route JSON: https://www.transsee.ca/routeveh?a=miway&r={route}
// - Trip shapes: https://transit55.ca/json/mississauga/map/trip_shape?id={id}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Sources
// ============================================================================

/// Which upstream feed last supplied a record's field-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceTag {
    Position,
    Snapshot,
    PerRoute,
}

impl SourceTag {
    pub const ALL: [SourceTag; 3] = [SourceTag::Position, SourceTag::Snapshot, SourceTag::PerRoute];

    /// Fields this source is authoritative for during a merge.
    pub fn coverage(self) -> FieldCoverage {
        match self {
            SourceTag::Position | SourceTag::Snapshot => FieldCoverage {
                route: true,
                position: true,
                status: true,
                trip: true,
            },
            // The per-route feed only knows which route a vehicle is on
            SourceTag::PerRoute => FieldCoverage {
                route: true,
                position: false,
                status: false,
                trip: false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Position => "position",
            SourceTag::Snapshot => "snapshot",
            SourceTag::PerRoute => "per-route",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "position" | "gtfs-rt" => Ok(SourceTag::Position),
            "snapshot" => Ok(SourceTag::Snapshot),
            "per-route" | "perroute" | "per_route" => Ok(SourceTag::PerRoute),
            other => Err(format!("unknown source '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldCoverage {
    pub route: bool,
    pub position: bool,
    pub status: bool,
    pub trip: bool,
}

// ============================================================================
// Vehicle Records
// ============================================================================

pub const UNKNOWN_STATUS: &str = "Unknown";

/// A single (lat, lon) observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub lat: f64,
    pub lon: f64,
}

impl Fix {
    pub fn new(lat: f64, lon: f64) -> Self {
        Fix { lat, lon }
    }

    /// (0, 0) is what the feeds send when the vehicle has no GPS lock.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && !(self.lat == 0.0 && self.lon == 0.0)
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn as_pair(&self) -> [f64; 2] {
        [self.lat, self.lon]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub id: String,
    pub route_id: String,
    pub lat: f64,
    pub lon: f64,
    pub occupancy_or_status: String,
    pub trip_id: String,
    pub source_tag: SourceTag,
    pub last_seen_at: DateTime<Utc>,
}

impl VehicleRecord {
    pub fn fix(&self) -> Fix {
        Fix::new(self.lat, self.lon)
    }

    pub fn has_fix(&self) -> bool {
        self.fix().is_valid()
    }

    /// True when anything a marker displays differs. Ignores bookkeeping fields.
    pub fn display_differs(&self, other: &VehicleRecord) -> bool {
        self.route_id != other.route_id
            || self.lat != other.lat
            || self.lon != other.lon
            || self.occupancy_or_status != other.occupancy_or_status
            || self.trip_id != other.trip_id
    }
}

/// Ids whose visibility or content changed in one store mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn absorb(&mut self, other: ChangeSummary) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

// ============================================================================
// Route Shapes
// ============================================================================

/// Ordered polyline for one trip or route id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteShape {
    pub id: String,
    pub points: Vec<[f64; 2]>,
}

// ============================================================================
// Fleet Numbers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetNumberEntry {
    pub internal_id: String,
    pub public_fleet_number: String,
    pub route_id: String,
}
