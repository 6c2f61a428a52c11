// Per-route feed: one JSON request per tracked route, fanned out concurrently.

use std::future::Future;

use futures::future::join_all;
use serde_json::Value;

use super::snapshot::json_kind;
use super::{PerRouteBatch, RawBatch, RawRouteVehicle, SourceClient, get_bytes, parse_json};
use crate::error::{FetchError, Result};
use crate::models::SourceTag;

pub struct PerRouteFeedClient {
    http: reqwest::Client,
    /// URL with a `{route}` placeholder.
    url_template: String,
    routes: Vec<String>,
}

impl PerRouteFeedClient {
    pub fn new(http: reqwest::Client, url_template: impl Into<String>, routes: Vec<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
            routes,
        }
    }

    fn url_for(&self, route: &str) -> String {
        self.url_template.replace("{route}", route)
    }

    async fn fetch_route(&self, route: &str) -> Result<Vec<RawRouteVehicle>> {
        let url = self.url_for(route);
        let body = get_bytes(&self.http, &url).await?;
        parse_route_response(route, &body)
    }
}

impl SourceClient for PerRouteFeedClient {
    fn tag(&self) -> SourceTag {
        SourceTag::PerRoute
    }

    async fn fetch(&self) -> Result<RawBatch> {
        fetch_all_routes(&self.routes, |route| self.fetch_route(route)).await
    }
}

/// Run one request per route and keep whatever succeeded.
///
/// A failing route never aborts the others. The batch is an error only when
/// every request failed.
pub async fn fetch_all_routes<'a, F, Fut>(routes: &'a [String], fetch_one: F) -> Result<RawBatch>
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<Vec<RawRouteVehicle>>>,
{
    let results = join_all(routes.iter().map(|route| {
        let request = fetch_one(route.as_str());
        async move { (route, request.await) }
    }))
    .await;

    let mut batch = PerRouteBatch {
        requested: routes.len(),
        ..Default::default()
    };

    for (route, result) in results {
        match result {
            Ok(vehicles) => batch.vehicles.extend(vehicles),
            Err(e) => {
                tracing::debug!(source = %SourceTag::PerRoute, route = %route, error = %e, "Route request failed");
                batch.failed.push((route.clone(), e));
            }
        }
    }

    if batch.requested > 0 && batch.failed.len() == batch.requested {
        tracing::debug!(source = %SourceTag::PerRoute, total = batch.requested, "All route requests failed");
        return Err(FetchError::PartialSourceFailure {
            failed: batch.failed.len(),
            total: batch.requested,
        });
    }

    Ok(RawBatch::PerRoute(batch))
}

/// Accepts an array of vehicles, or a single vehicle object.
pub fn parse_route_response(route: &str, body: &[u8]) -> Result<Vec<RawRouteVehicle>> {
    let json = parse_json(body, "per-route feed")?;

    let elements = match json {
        Value::Array(items) => items,
        Value::Object(_) => vec![json],
        other => {
            return Err(FetchError::MalformedPayload(format!(
                "Route {} response is not an array or object (got {})",
                route,
                json_kind(&other)
            )));
        }
    };

    let vehicles = elements
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|element| serde_json::from_value::<RawRouteVehicle>(element).ok())
        .map(|mut vehicle| {
            vehicle.queried_route = route.to_string();
            vehicle
        })
        .collect();

    Ok(vehicles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vehicle(route: &str, fleet: &str) -> RawRouteVehicle {
        RawRouteVehicle {
            queried_route: route.to_string(),
            vehicle_id: Some(json!(format!("int-{}", fleet))),
            fleet_number: Some(json!(fleet)),
            route: None,
        }
    }

    #[tokio::test]
    async fn partial_failure_keeps_successful_routes() {
        let routes: Vec<String> = ["1", "2", "3", "4", "5"].iter().map(|r| r.to_string()).collect();

        let result = fetch_all_routes(&routes, |route| async move {
            match route {
                "2" => Err(FetchError::NetworkError("timeout".to_string())),
                "4" => Err(FetchError::MalformedPayload("not json".to_string())),
                r => Ok(vec![vehicle(r, &format!("{}00", r))]),
            }
        })
        .await
        .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(
            result.partial_failure(),
            Some(FetchError::PartialSourceFailure { failed: 2, total: 5 })
        );
        let RawBatch::PerRoute(batch) = result else {
            panic!("expected a per-route batch");
        };
        let failed_routes: Vec<&str> = batch.failed.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(failed_routes, vec!["2", "4"]);
    }

    #[tokio::test]
    async fn all_routes_failing_reports_the_failed_count() {
        let routes = vec!["1".to_string(), "2".to_string()];
        let result = fetch_all_routes(&routes, |_| async {
            Err(FetchError::NetworkError("connection refused".to_string()))
        })
        .await;

        assert_eq!(
            result,
            Err(FetchError::PartialSourceFailure { failed: 2, total: 2 })
        );
    }

    #[tokio::test]
    async fn no_routes_is_an_empty_batch() {
        let result = fetch_all_routes(&[], |_| async { Ok(Vec::new()) }).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.partial_failure(), None);
    }

    #[test]
    fn single_object_is_normalised_to_one_element() {
        let body = json!({"id": "9001", "vehicle": "1804"}).to_string();
        let vehicles = parse_route_response("7", body.as_bytes()).unwrap();

        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].queried_route, "7");
        assert_eq!(vehicles[0].vehicle_id, Some(json!("9001")));
        assert_eq!(vehicles[0].fleet_number, Some(json!("1804")));
    }

    #[test]
    fn array_response_skips_non_objects() {
        let body = json!([{"id": "9001", "vehicle": "1804"}, 42, {"id": "9002"}]).to_string();
        assert_eq!(parse_route_response("7", body.as_bytes()).unwrap().len(), 2);
    }

    #[test]
    fn string_response_is_malformed() {
        let result = parse_route_response("7", b"\"no such route\"");
        assert!(matches!(result, Err(FetchError::MalformedPayload(_))));
    }
}
