use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::config::Config;
use crate::domain::Coordinates;

#[derive(Debug, Error)]
pub enum GeocodingError {
    #[error("Geocoding service returned HTTP {0}")]
    Status(u16),

    #[error("No results for address: {0}")]
    NoResults(String),

    #[error("Timeout geocoding address: {0}")]
    Timeout(String),

    #[error("HTTP error geocoding address: {0}")]
    Transport(String),

    #[error("Invalid response from geocoding service: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(
        &self,
        address: &str,
        city: &str,
        country: &str,
    ) -> Result<Coordinates, GeocodingError>;
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    lat: String,
    lon: String,
}

/// Nominatim-compatible search client. Never retries; callers decide what a
/// failure means for them.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    search_url: Url,
    user_agent: String,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl NominatimGeocoder {
    pub fn new(
        base_url: &str,
        user_agent: impl Into<String>,
        min_interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let search_url = Url::parse(&format!("{}/search", base_url.trim_end_matches('/')))
            .with_context(|| format!("Invalid geocoding base URL: {base_url}"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build geocoding HTTP client")?;

        Ok(Self {
            client,
            search_url,
            user_agent: user_agent.into(),
            min_interval,
            last_request: Mutex::new(None),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            &config.geocoding_base_url,
            config.geocoding_user_agent.clone(),
            config.geocoding_min_interval(),
            config.geocoding_timeout(),
        )
    }

    /// Waits out the remainder of the minimum interval since the previous call.
    async fn throttle(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!("Throttling geocoding request for {:?}", wait);
                time::sleep(wait).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}

pub fn build_query(address: &str, city: &str, country: &str) -> String {
    [address, city, country]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(
        &self,
        address: &str,
        city: &str,
        country: &str,
    ) -> Result<Coordinates, GeocodingError> {
        let query = build_query(address, city, country);

        self.throttle().await;

        let response = self
            .client
            .get(self.search_url.clone())
            .query(&[("q", query.as_str()), ("format", "json"), ("limit", "1")])
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| classify(e, &query))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodingError::Status(status.as_u16()));
        }

        let results: Vec<SearchResult> = response.json().await.map_err(|e| {
            if e.is_timeout() {
                GeocodingError::Timeout(query.clone())
            } else {
                GeocodingError::InvalidResponse(e.to_string())
            }
        })?;

        let first = results
            .into_iter()
            .next()
            .ok_or_else(|| GeocodingError::NoResults(query.clone()))?;

        let coordinates = parse_coordinates(&first.lat, &first.lon)?;
        info!(
            "Geocoded '{}' to ({}, {})",
            query,
            coordinates.latitude(),
            coordinates.longitude()
        );
        Ok(coordinates)
    }
}

fn classify(error: reqwest::Error, query: &str) -> GeocodingError {
    if error.is_timeout() {
        GeocodingError::Timeout(query.to_string())
    } else {
        GeocodingError::Transport(error.to_string())
    }
}

fn parse_coordinates(lat: &str, lon: &str) -> Result<Coordinates, GeocodingError> {
    let latitude: f64 = lat
        .trim()
        .parse()
        .map_err(|_| GeocodingError::InvalidResponse(format!("latitude '{lat}'")))?;
    let longitude: f64 = lon
        .trim()
        .parse()
        .map_err(|_| GeocodingError::InvalidResponse(format!("longitude '{lon}'")))?;

    Coordinates::new(latitude, longitude).map_err(|e| GeocodingError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USER_AGENT: &str = "delivery-service-test/1.0";

    fn geocoder(server: &MockServer, min_interval: Duration) -> NominatimGeocoder {
        NominatimGeocoder::new(&server.uri(), USER_AGENT, min_interval, Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn query_skips_blank_parts() {
        assert_eq!(build_query("Calle 1", "Bogota", "Colombia"), "Calle 1, Bogota, Colombia");
        assert_eq!(build_query("", "Bogota", "Colombia"), "Bogota, Colombia");
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(NominatimGeocoder::new("not a url", USER_AGENT, Duration::ZERO, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn parses_first_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "Calle 100, Bogota, Colombia"))
            .and(query_param("format", "json"))
            .and(query_param("limit", "1"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "lat": "4.6097100", "lon": "-74.0817500", "display_name": "Bogota" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let coordinates = geocoder(&server, Duration::ZERO)
            .geocode("Calle 100", "Bogota", "Colombia")
            .await
            .unwrap();

        assert_eq!(coordinates, Coordinates::new(4.60971, -74.08175).unwrap());
    }

    #[tokio::test]
    async fn empty_result_is_no_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let result = geocoder(&server, Duration::ZERO).geocode("Nowhere", "Atlantis", "Sea").await;

        assert!(matches!(result, Err(GeocodingError::NoResults(_))));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = geocoder(&server, Duration::ZERO).geocode("Calle 1", "Bogota", "Colombia").await;

        assert!(matches!(result, Err(GeocodingError::Status(503))));
    }

    #[tokio::test]
    async fn unparsable_coordinates_are_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "lat": "north", "lon": "-74.0" }])))
            .mount(&server)
            .await;

        let result = geocoder(&server, Duration::ZERO).geocode("Calle 1", "Bogota", "Colombia").await;

        assert!(matches!(result, Err(GeocodingError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
            .mount(&server)
            .await;

        let result = geocoder(&server, Duration::ZERO).geocode("Calle 1", "Bogota", "Colombia").await;

        assert!(matches!(result, Err(GeocodingError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "lat": "4.6", "lon": "-74.0" }]))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let result = geocoder(&server, Duration::ZERO).geocode("Calle 1", "Bogota", "Colombia").await;

        assert!(matches!(result, Err(GeocodingError::Timeout(_))));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let geocoder = NominatimGeocoder::new(
            "http://127.0.0.1:1",
            USER_AGENT,
            Duration::ZERO,
            Duration::from_millis(500),
        )
        .unwrap();

        let result = geocoder.geocode("Calle 1", "Bogota", "Colombia").await;

        assert!(matches!(
            result,
            Err(GeocodingError::Transport(_)) | Err(GeocodingError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn consecutive_calls_respect_min_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "lat": "4.6", "lon": "-74.0" }])))
            .expect(2)
            .mount(&server)
            .await;

        let interval = Duration::from_millis(300);
        let geocoder = geocoder(&server, interval);

        let started = std::time::Instant::now();
        geocoder.geocode("Calle 1", "Bogota", "Colombia").await.unwrap();
        geocoder.geocode("Calle 2", "Bogota", "Colombia").await.unwrap();

        assert!(started.elapsed() >= interval);
    }
}
