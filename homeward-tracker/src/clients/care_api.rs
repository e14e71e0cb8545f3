//! Care API client
//!
//! Reads the patient's live location and configured home from the caregiver
//! backend:
//! - `GET {base}/get-patient-location?patientId=` returns
//!   `{ success, location: { coordinates: [lng, lat] }, updatedAt }`
//! - `GET {base}/get-patient-home?patientId=` returns
//!   `{ success, homeLocation: { coordinates: [lng, lat] }, homeAddress, updatedAt }`
//!
//! Coordinates are GeoJSON order (longitude first).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homeward_common::model::{PositionFix, ReferenceFix, SubjectId};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::USER_AGENT;
use crate::error::FetchError;
use crate::sources::{PositionSource, ReferenceSource};

/// Label used when the backend has coordinates but no address
pub const DEFAULT_HOME_LABEL: &str = "Home";

const LOCATION_ENDPOINT: &str = "get-patient-location";
const HOME_ENDPOINT: &str = "get-patient-home";

#[derive(Debug, Deserialize)]
struct GeoJsonPoint {
    #[serde(default)]
    coordinates: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationResponse {
    #[serde(default)]
    success: bool,
    location: Option<GeoJsonPoint>,
    updated_at: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HomeResponse {
    #[serde(default)]
    success: bool,
    home_location: Option<GeoJsonPoint>,
    home_address: Option<String>,
    updated_at: Option<String>,
}

/// Care API client (position and reference source)
pub struct CareApiClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl CareApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(
        &self,
        endpoint: &str,
        subject: &SubjectId,
    ) -> Result<(reqwest::StatusCode, String), FetchError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(endpoint, patient_id = %subject, "Querying care API");

        let response = self
            .http_client
            .get(&url)
            .query(&[("patientId", subject.as_str())])
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl PositionSource for CareApiClient {
    async fn fetch_position(&self, subject: &SubjectId) -> Result<PositionFix, FetchError> {
        let (status, body) = self.get(LOCATION_ENDPOINT, subject).await?;
        if !status.is_success() {
            return Err(FetchError::Api(status.as_u16(), body));
        }
        parse_location(&body)
    }
}

#[async_trait]
impl ReferenceSource for CareApiClient {
    async fn fetch_reference(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<ReferenceFix>, FetchError> {
        let (status, body) = self.get(HOME_ENDPOINT, subject).await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            // The backend answers 404 for a patient with no home saved
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Api(status.as_u16(), body));
        }
        parse_home(&body)
    }
}

/// Parse a `get-patient-location` body
pub fn parse_location(body: &str) -> Result<PositionFix, FetchError> {
    let response: LocationResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    if !response.success {
        let message = response
            .message
            .unwrap_or_else(|| "location request was not successful".to_string());
        return Err(FetchError::Api(200, message));
    }

    let coordinates = response
        .location
        .and_then(|point| point.coordinates)
        .ok_or_else(|| FetchError::Parse("response has no location coordinates".to_string()))?;
    let (latitude, longitude) = lat_lng(&coordinates)?;

    Ok(PositionFix {
        latitude,
        longitude,
        reported_at: response.updated_at.as_deref().and_then(parse_timestamp),
    })
}

/// Parse a `get-patient-home` body; `Ok(None)` when no home is configured
pub fn parse_home(body: &str) -> Result<Option<ReferenceFix>, FetchError> {
    let response: HomeResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    let coordinates = match response.home_location.and_then(|point| point.coordinates) {
        Some(coordinates) if response.success => coordinates,
        _ => return Ok(None),
    };
    let (latitude, longitude) = lat_lng(&coordinates)?;

    let label = response
        .home_address
        .filter(|address| !address.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOME_LABEL.to_string());

    Ok(Some(ReferenceFix {
        latitude,
        longitude,
        label,
        updated_at: response.updated_at.as_deref().and_then(parse_timestamp),
    }))
}

/// Validate a GeoJSON `[lng, lat]` pair and return `(lat, lng)`
fn lat_lng(coordinates: &[f64]) -> Result<(f64, f64), FetchError> {
    let [longitude, latitude, ..] = coordinates else {
        return Err(FetchError::Parse(format!(
            "expected [lng, lat], got {} values",
            coordinates.len()
        )));
    };

    let valid = latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(latitude)
        && (-180.0..=180.0).contains(longitude);
    if !valid {
        return Err(FetchError::Parse(format!(
            "coordinates out of range: [{}, {}]",
            longitude, latitude
        )));
    }

    Ok((*latitude, *longitude))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            debug!(raw, "Ignoring unparseable updatedAt: {}", e);
            None
        }
    }
}
