//! Upstream feed clients.
//!
//! Each client owns one endpoint, its request shape and its parse step, and
//! yields a [`RawBatch`]: the feed's records still in their own vocabulary.
//! Turning those into canonical records is the normalizer's job.
//!
//! ```text
//! PositionFeedClient  ── GTFS-RT protobuf ──┐
//! SnapshotFeedClient  ── keyed JSON object ─┼──> RawBatch ──> normalizer
//! PerRouteFeedClient  ── N JSON requests ───┘
//! ```

pub mod per_route;
pub mod position;
pub mod shape;
pub mod snapshot;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FetchError, Result};
use crate::models::SourceTag;

pub use per_route::PerRouteFeedClient;
pub use position::PositionFeedClient;
pub use shape::{HttpShapeClient, ShapeClient};
pub use snapshot::SnapshotFeedClient;

/// One poll against one upstream feed.
pub trait SourceClient: Send + Sync {
    fn tag(&self) -> SourceTag;

    fn fetch(&self) -> impl Future<Output = Result<RawBatch>> + Send;
}

// ============================================================================
// Raw Payloads
// ============================================================================

/// Records exactly as a feed described them, tagged by origin.
#[derive(Debug, Clone, PartialEq)]
pub enum RawBatch {
    Position(Vec<RawPosition>),
    Snapshot(Vec<RawSnapshotVehicle>),
    PerRoute(PerRouteBatch),
}

impl RawBatch {
    pub fn tag(&self) -> SourceTag {
        match self {
            RawBatch::Position(_) => SourceTag::Position,
            RawBatch::Snapshot(_) => SourceTag::Snapshot,
            RawBatch::PerRoute(_) => SourceTag::PerRoute,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawBatch::Position(v) => v.len(),
            RawBatch::Snapshot(v) => v.len(),
            RawBatch::PerRoute(b) => b.vehicles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set when some per-route requests failed but the batch is still usable.
    pub fn partial_failure(&self) -> Option<FetchError> {
        match self {
            RawBatch::PerRoute(b) if !b.failed.is_empty() => Some(FetchError::PartialSourceFailure {
                failed: b.failed.len(),
                total: b.requested,
            }),
            _ => None,
        }
    }
}

/// One `VehiclePosition` entity from the GTFS-RT feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPosition {
    pub entity_id: String,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub occupancy: Option<i32>,
}

/// One value of the snapshot feed's top-level object.
///
/// Every field is kept as loose JSON: the feed sends numbers as strings and
/// strings as numbers depending on the vehicle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawSnapshotVehicle {
    /// Key of the entry in the top-level object.
    #[serde(skip)]
    pub key: String,
    #[serde(alias = "Bus", alias = "bus_number", alias = "fleet_number")]
    pub bus: Option<Value>,
    #[serde(alias = "Route", alias = "route_id")]
    pub route: Option<Value>,
    #[serde(alias = "Model", alias = "vehicle_model")]
    pub model: Option<Value>,
    #[serde(alias = "Lat", alias = "lat", alias = "Latitude")]
    pub latitude: Option<Value>,
    #[serde(alias = "Lon", alias = "lon", alias = "Lng", alias = "lng", alias = "Longitude")]
    pub longitude: Option<Value>,
    #[serde(alias = "Trip", alias = "trip_id", alias = "tripId")]
    pub trip: Option<Value>,
}

/// One vehicle element returned for a per-route query.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRouteVehicle {
    /// Route the request was made for.
    #[serde(skip)]
    pub queried_route: String,
    #[serde(alias = "id", alias = "vehicle_id", alias = "vehicleId")]
    pub vehicle_id: Option<Value>,
    #[serde(alias = "vehicle", alias = "fleet", alias = "veh", alias = "name")]
    pub fleet_number: Option<Value>,
    #[serde(alias = "route_id", alias = "r")]
    pub route: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerRouteBatch {
    pub vehicles: Vec<RawRouteVehicle>,
    pub requested: usize,
    /// Routes whose request failed, with the reason.
    pub failed: Vec<(String, FetchError)>,
}

// ============================================================================
// HTTP
// ============================================================================

pub fn create_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FetchError::NetworkError(format!("Failed to create HTTP client: {}", e)))
}

/// GET a URL and return the body, treating non-2xx as a transport failure.
pub(crate) async fn get_bytes(client: &reqwest::Client, url: &str) -> Result<Bytes> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::NetworkError(format!("Failed to fetch {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(FetchError::NetworkError(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    response
        .bytes()
        .await
        .map_err(|e| FetchError::NetworkError(format!("Failed to read response from {}: {}", url, e)))
}

/// Parse a JSON body, reporting anything undecodable as a malformed payload.
pub(crate) fn parse_json(body: &[u8], what: &str) -> Result<Value> {
    serde_json::from_slice(body)
        .map_err(|e| FetchError::MalformedPayload(format!("Invalid JSON in {}: {}", what, e)))
}
