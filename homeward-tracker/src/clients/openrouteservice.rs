//! OpenRouteService directions client
//!
//! `GET {base}/v2/directions/{profile}?api_key=&start=lng,lat&end=lng,lat`
//! returns a GeoJSON feature collection; the first feature carries the path
//! and its segment totals.

use async_trait::async_trait;
use homeward_common::model::{GeoPoint, Position, ReferenceLocation, RouteSolution};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{RateLimiter, USER_AGENT};
use crate::error::RouteError;
use crate::sources::RouteProvider;

/// Free plan allows 40 directions requests per minute
const RATE_LIMIT_MS: u64 = 1_500;

/// ORS error codes meaning "no route between these points"
const NO_ROUTE_CODES: [u32; 3] = [2009, 2010, 2099];

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
    #[serde(default)]
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    coordinates: Vec<Vec<f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    #[serde(default)]
    segments: Vec<Totals>,
    summary: Option<Totals>,
}

#[derive(Debug, Default, Deserialize)]
struct Totals {
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed { code: u32, message: Option<String> },
    Plain(String),
}

/// OpenRouteService route provider
pub struct OpenRouteServiceClient {
    http_client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    base_url: String,
    api_key: String,
    profile: String,
}

impl OpenRouteServiceClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        profile: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RouteError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| RouteError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            rate_limiter: Arc::new(RateLimiter::new(RATE_LIMIT_MS)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            profile: profile.into(),
        })
    }
}

#[async_trait]
impl RouteProvider for OpenRouteServiceClient {
    async fn compute_route(
        &self,
        from: &Position,
        to: &ReferenceLocation,
    ) -> Result<RouteSolution, RouteError> {
        self.rate_limiter.wait().await;

        let url = format!("{}/v2/directions/{}", self.base_url, self.profile);
        let start = format!("{},{}", from.longitude, from.latitude);
        let end = format!("{},{}", to.longitude, to.latitude);

        debug!(profile = %self.profile, start = %start, end = %end, "Requesting directions");

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RouteError::NetworkError(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RouteError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &body));
        }

        let solution = parse_directions(&body)?;
        info!(
            distance_meters = solution.distance_meters,
            duration_seconds = solution.duration_seconds,
            points = solution.path.len(),
            "Directions received"
        );
        Ok(solution)
    }
}

/// Parse a successful directions body
pub fn parse_directions(body: &str) -> Result<RouteSolution, RouteError> {
    let response: DirectionsResponse = serde_json::from_str(body)
        .map_err(|e| RouteError::NetworkError(format!("unreadable directions response: {}", e)))?;

    let Some(feature) = response.features.into_iter().next() else {
        return Err(RouteError::NoRouteFound(
            "directions response has no routes".to_string(),
        ));
    };

    let path = feature
        .geometry
        .coordinates
        .iter()
        .filter_map(|pair| match pair.as_slice() {
            [lng, lat, ..] => Some(GeoPoint::new(*lat, *lng)),
            _ => None,
        })
        .collect::<Vec<_>>();

    let properties = feature.properties;
    let totals = properties
        .segments
        .into_iter()
        .next()
        .or(properties.summary)
        .unwrap_or_default();

    Ok(RouteSolution {
        path,
        distance_meters: totals.distance,
        duration_seconds: totals.duration,
    })
}

/// Map a non-success directions response onto the route failure taxonomy
pub fn classify_error(status: u16, body: &str) -> RouteError {
    if status == 429 {
        return RouteError::RateLimited;
    }

    let (code, message) = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            error: ErrorBody::Detailed { code, message },
        }) => (Some(code), message.unwrap_or_default()),
        Ok(ErrorResponse {
            error: ErrorBody::Plain(message),
        }) => (None, message),
        Err(_) => (None, body.trim().to_string()),
    };

    if code.is_some_and(|code| NO_ROUTE_CODES.contains(&code)) || status == 404 {
        return RouteError::NoRouteFound(message);
    }

    RouteError::NetworkError(format!("HTTP {}: {}", status, message))
}
