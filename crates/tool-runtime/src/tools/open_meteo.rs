//! Thin client for the Open-Meteo geocoding and forecast APIs, shared by
//! the weather and local-time tools.

use dchat_core::config::ToolsConfig;
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::tool::ToolError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Place {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CurrentConditions {
    pub temperature_2m: f64,
    pub wind_speed_10m: f64,
    pub weather_code: u16,
}

#[derive(Debug, Deserialize)]
pub struct Forecast {
    pub timezone: String,
    pub utc_offset_seconds: i32,
    #[serde(default)]
    pub current: Option<CurrentConditions>,
}

#[derive(Clone)]
pub struct OpenMeteoClient {
    http: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
}

impl OpenMeteoClient {
    pub fn new(
        geocoding_url: impl Into<String>,
        forecast_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self {
            http,
            geocoding_url: geocoding_url.into(),
            forecast_url: forecast_url.into(),
        }
    }

    pub fn from_config(config: &ToolsConfig) -> Self {
        Self::new(
            config.geocoding_url.clone(),
            config.forecast_url.clone(),
            config.http_timeout(),
        )
    }

    /// Resolve a place name to its best match.
    pub async fn geocode(&self, name: &str) -> Result<Place, ToolError> {
        let response: GeocodingResponse = self
            .get_json(
                &self.geocoding_url,
                &[
                    ("name", name.to_string()),
                    ("count", "1".to_string()),
                    ("language", "en".to_string()),
                    ("format", "json".to_string()),
                ],
            )
            .await?;
        response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::ExecutionFailed(format!("Location not found: {name}")))
    }

    /// Forecast for `place` in its own timezone. With `current` set, the
    /// response also carries the current conditions.
    pub async fn forecast(&self, place: &Place, current: bool) -> Result<Forecast, ToolError> {
        let mut query = vec![
            ("latitude", place.latitude.to_string()),
            ("longitude", place.longitude.to_string()),
            ("timezone", "auto".to_string()),
            ("forecast_days", "1".to_string()),
        ];
        if current {
            query.push((
                "current",
                "temperature_2m,wind_speed_10m,weather_code".to_string(),
            ));
        }
        self.get_json(&self.forecast_url, &query).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ToolError> {
        debug!(url, "open-meteo request");
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Weather service unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "Weather service returned {status}"
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Invalid weather service response: {e}")))
    }
}

/// Human-readable text for a WMO weather interpretation code.
pub fn describe_weather_code(code: u16) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 | 48 => "Fog",
        51 | 53 | 55 => "Drizzle",
        56 | 57 => "Freezing drizzle",
        61 | 63 | 65 => "Rain",
        66 | 67 => "Freezing rain",
        71 | 73 | 75 => "Snow",
        77 => "Snow grains",
        80..=82 => "Rain showers",
        85 | 86 => "Snow showers",
        95 => "Thunderstorm",
        96 | 99 => "Thunderstorm with hail",
        _ => "Unknown",
    }
}
