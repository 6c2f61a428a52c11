// Trip/route shape feed: `{"data": [{"lat": .., "lon": ..}, ..]}`.

use std::future::Future;

use serde_json::Value;

use super::snapshot::json_kind;
use super::{get_bytes, parse_json};
use crate::error::{FetchError, Result};
use crate::models::{Fix, RouteShape};
use crate::normalizer::coerce_f64;

/// Fetches one polyline by trip or route id.
pub trait ShapeClient: Send + Sync {
    fn fetch_shape(&self, id: &str) -> impl Future<Output = Result<RouteShape>> + Send;
}

pub struct HttpShapeClient {
    http: reqwest::Client,
    /// URL with an `{id}` placeholder.
    url_template: String,
}

impl HttpShapeClient {
    pub fn new(http: reqwest::Client, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
        }
    }
}

impl ShapeClient for HttpShapeClient {
    async fn fetch_shape(&self, id: &str) -> Result<RouteShape> {
        let url = self.url_template.replace("{id}", id);
        let body = get_bytes(&self.http, &url).await?;
        let shape = parse_shape(id, &body)?;

        tracing::debug!(shape_id = %id, points = shape.points.len(), "Shape fetched");
        Ok(shape)
    }
}

pub fn parse_shape(id: &str, body: &[u8]) -> Result<RouteShape> {
    let json = parse_json(body, "shape feed")?;

    let points = match json.get("data") {
        Some(Value::Array(points)) => points,
        Some(other) => {
            return Err(FetchError::MalformedPayload(format!(
                "Shape {} has a non-array data field (got {})",
                id,
                json_kind(other)
            )));
        }
        None => {
            return Err(FetchError::MalformedPayload(format!(
                "Shape {} response has no data field",
                id
            )));
        }
    };

    let points = points
        .iter()
        .filter_map(|point| {
            let fix = Fix::new(coerce_f64(point.get("lat")), coerce_f64(point.get("lon")));
            fix.is_valid().then(|| fix.as_pair())
        })
        .collect();

    Ok(RouteShape {
        id: id.to_string(),
        points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_and_numeric_points() {
        let body = json!({"data": [
            {"lat": "43.5890", "lon": "-79.6441"},
            {"lat": 43.59, "lon": -79.65},
            {"lat": "n/a", "lon": "-79.66"}
        ]})
        .to_string();

        let shape = parse_shape("t-1", body.as_bytes()).unwrap();
        assert_eq!(shape.id, "t-1");
        assert_eq!(shape.points, vec![[43.589, -79.6441], [43.59, -79.65]]);
    }

    #[test]
    fn missing_data_is_malformed() {
        let result = parse_shape("t-1", br#"{"error": "not found"}"#);
        assert!(matches!(result, Err(FetchError::MalformedPayload(_))));
    }
}
