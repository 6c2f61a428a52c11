// GTFS-RT vehicle positions (binary protobuf).

use gtfs_rt::FeedMessage;
use prost::Message;

use super::{RawBatch, RawPosition, SourceClient, get_bytes};
use crate::error::{FetchError, Result};
use crate::models::SourceTag;

pub struct PositionFeedClient {
    http: reqwest::Client,
    url: String,
}

impl PositionFeedClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

impl SourceClient for PositionFeedClient {
    fn tag(&self) -> SourceTag {
        SourceTag::Position
    }

    async fn fetch(&self) -> Result<RawBatch> {
        let body = get_bytes(&self.http, &self.url).await?;
        let batch = parse_position_feed(&body)?;

        tracing::debug!(
            source = %SourceTag::Position,
            bytes = body.len(),
            vehicles = batch.len(),
            "Vehicle positions decoded"
        );
        Ok(batch)
    }
}

/// Decode a `FeedMessage` and keep the entities that carry a vehicle position.
pub fn parse_position_feed(body: &[u8]) -> Result<RawBatch> {
    let feed = FeedMessage::decode(body)
        .map_err(|e| FetchError::MalformedPayload(format!("Failed to decode vehicles feed: {}", e)))?;

    let positions = feed
        .entity
        .into_iter()
        .filter_map(|entity| {
            entity.vehicle.map(|vehicle| {
                let descriptor = vehicle.vehicle.as_ref();
                let trip = vehicle.trip.as_ref();

                RawPosition {
                    entity_id: entity.id,
                    vehicle_id: descriptor.and_then(|v| v.id.clone()),
                    vehicle_label: descriptor.and_then(|v| v.label.clone()),
                    route_id: trip.and_then(|t| t.route_id.clone()),
                    trip_id: trip.and_then(|t| t.trip_id.clone()),
                    latitude: vehicle.position.as_ref().map(|p| p.latitude),
                    longitude: vehicle.position.as_ref().map(|p| p.longitude),
                    occupancy: vehicle.occupancy_status,
                }
            })
        })
        .collect();

    Ok(RawBatch::Position(positions))
}
