// Snapshot feed: one JSON object keyed by an arbitrary string, one value per bus.

use serde_json::Value;

use super::{RawBatch, RawSnapshotVehicle, SourceClient, get_bytes, parse_json};
use crate::error::{FetchError, Result};
use crate::models::SourceTag;

pub struct SnapshotFeedClient {
    http: reqwest::Client,
    url: String,
}

impl SnapshotFeedClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

impl SourceClient for SnapshotFeedClient {
    fn tag(&self) -> SourceTag {
        SourceTag::Snapshot
    }

    async fn fetch(&self) -> Result<RawBatch> {
        let body = get_bytes(&self.http, &self.url).await?;
        let batch = parse_snapshot(&body)?;

        tracing::debug!(
            source = %SourceTag::Snapshot,
            vehicles = batch.len(),
            "Snapshot parsed"
        );
        Ok(batch)
    }
}

pub fn parse_snapshot(body: &[u8]) -> Result<RawBatch> {
    let json = parse_json(body, "snapshot feed")?;

    let Value::Object(entries) = json else {
        return Err(FetchError::MalformedPayload(format!(
            "Snapshot feed is not an object (got {})",
            json_kind(&json)
        )));
    };

    let vehicles = entries
        .into_iter()
        .filter_map(|(key, value)| {
            if !value.is_object() {
                tracing::trace!(key = %key, "Skipping non-object snapshot entry");
                return None;
            }
            match serde_json::from_value::<RawSnapshotVehicle>(value) {
                Ok(mut vehicle) => {
                    vehicle.key = key;
                    Some(vehicle)
                }
                Err(e) => {
                    tracing::trace!(key = %key, error = %e, "Skipping unreadable snapshot entry");
                    None
                }
            }
        })
        .collect();

    Ok(RawBatch::Snapshot(vehicles))
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_keyed_object() {
        let body = json!({
            "a1": {"Bus": "1804", "Route": "7", "Model": "\"New Flyer XD40\"", "Lat": "43.59", "Lon": -79.64, "Trip": "t-1"},
            "a2": {"Bus": 1805, "Route": 1, "Lat": 43.6, "Lon": -79.6}
        })
        .to_string();

        let RawBatch::Snapshot(vehicles) = parse_snapshot(body.as_bytes()).unwrap() else {
            panic!("expected a snapshot batch");
        };
        assert_eq!(vehicles.len(), 2);

        let first = vehicles.iter().find(|v| v.key == "a1").unwrap();
        assert_eq!(first.bus, Some(json!("1804")));
        assert_eq!(first.model, Some(json!("\"New Flyer XD40\"")));
        assert_eq!(first.trip, Some(json!("t-1")));

        let second = vehicles.iter().find(|v| v.key == "a2").unwrap();
        assert_eq!(second.bus, Some(json!(1805)));
        assert_eq!(second.trip, None);
    }

    #[test]
    fn non_object_entries_are_noise() {
        let body = json!({"a1": "garbage", "a2": {"Bus": "1805"}}).to_string();
        assert_eq!(parse_snapshot(body.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn array_payload_is_malformed() {
        let result = parse_snapshot(b"[1, 2, 3]");
        assert_eq!(
            result,
            Err(FetchError::MalformedPayload(
                "Snapshot feed is not an object (got array)".to_string()
            ))
        );
    }

    #[test]
    fn html_error_page_is_malformed() {
        let result = parse_snapshot(b"<html>503 Service Unavailable</html>");
        assert!(matches!(result, Err(FetchError::MalformedPayload(_))));
    }
}
