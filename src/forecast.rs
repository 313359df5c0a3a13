//! Forecast data collaborators.
//!
//! `ForecastProvider` wraps the Open-Meteo hourly forecast; `MeteogramSource`
//! wraps the Meteoblue thermal meteogram image. Both are pure reads, so the
//! HTTP layer retries them with backoff; everything downstream treats a
//! failure here as an `Upstream` error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Hourly variables requested from Open-Meteo.
const HOURLY_VARS: &str = "temperature_2m,precipitation,cloud_cover,wind_speed_10m,\
wind_gusts_10m,cape,wind_speed_850hPa,wind_direction_850hPa";

/// Flyable hours considered for the summary (local pilots' daylight window).
const FLYABLE_HOUR_START: u32 = 9;
const FLYABLE_HOUR_END: u32 = 18;

/// Retry policy for idempotent forecast reads.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(200);

/// Representative forecast values for one location, plus a preformatted
/// hourly summary block for the interpretation prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastSample {
    pub lat: f64,
    pub lon: f64,
    pub wind_speed_kmh: f64,
    pub wind_direction_deg: f64,
    pub cloud_cover_pct: f64,
    pub cape: f64,
    pub temperature_c: f64,
    pub hourly_summary: String,
}

impl ForecastSample {
    /// One-line summary used for route prompts.
    pub fn route_line(&self, point_index: usize) -> String {
        format!(
            "Point {} ({:.2},{:.2}): Wind {:.1}km/h from {:.0} deg, Clouds {:.0}%, Thermals(CAPE) {:.0}, Temp {:.1}C",
            point_index + 1,
            self.lat,
            self.lon,
            self.wind_speed_kmh,
            self.wind_direction_deg,
            self.cloud_cover_pct,
            self.cape,
            self.temperature_c
        )
    }
}

/// Fetches forecast data for a location.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn fetch(&self, lat: f64, lon: f64) -> Result<ForecastSample>;
}

/// Fetches the thermal meteogram image for a location.
#[async_trait]
pub trait MeteogramSource: Send + Sync {
    async fn fetch_png(&self, lat: f64, lon: f64, asl: f64) -> Result<Vec<u8>>;
}

// ============================================================================
// Open-Meteo
// ============================================================================

/// Open-Meteo hourly forecast client.
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    /// Unix timestamps (timeformat=unixtime)
    time: Vec<i64>,
    temperature_2m: Vec<Option<f64>>,
    precipitation: Vec<Option<f64>>,
    cloud_cover: Vec<Option<f64>>,
    wind_speed_10m: Vec<Option<f64>>,
    wind_gusts_10m: Vec<Option<f64>>,
    cape: Vec<Option<f64>>,
    #[serde(rename = "wind_speed_850hPa")]
    wind_speed_850hpa: Vec<Option<f64>>,
    #[serde(rename = "wind_direction_850hPa")]
    wind_direction_850hpa: Vec<Option<f64>>,
}

impl OpenMeteoClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: "https://api.open-meteo.com/v1/forecast".to_string(),
        })
    }

    /// Point the client at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_raw(&self, lat: f64, lon: f64) -> Result<OpenMeteoResponse> {
        let mut last_err = None;
        for attempt in 0..FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(FETCH_BACKOFF * 2u32.pow(attempt - 1)).await;
            }
            let result = self
                .client
                .get(&self.base_url)
                .query(&[
                    ("latitude", lat.to_string()),
                    ("longitude", lon.to_string()),
                    ("hourly", HOURLY_VARS.to_string()),
                    ("models", "best_match".to_string()),
                    ("timeformat", "unixtime".to_string()),
                    ("timezone", "UTC".to_string()),
                    ("forecast_days", "3".to_string()),
                ])
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(response) => {
                    metrics::record_upstream_call("open_meteo", "ok");
                    return Ok(response.json::<OpenMeteoResponse>().await?);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Forecast fetch attempt failed");
                    metrics::record_upstream_call("open_meteo", "error");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(Error::Http).unwrap_or_else(|| {
            Error::Upstream("forecast unavailable".to_string())
        }))
    }
}

#[async_trait]
impl ForecastProvider for OpenMeteoClient {
    async fn fetch(&self, lat: f64, lon: f64) -> Result<ForecastSample> {
        let raw = self.fetch_raw(lat, lon).await?;
        sample_from_hourly(lat, lon, &raw.hourly, Utc::now())
            .ok_or_else(|| Error::Upstream("forecast unavailable".to_string()))
    }
}

/// Extract the representative sample and summary block from raw hourly data.
///
/// The representative values come from the first future hour; the summary
/// covers the flyable hours (09:00-18:00 UTC) of the remaining forecast
/// window, one block per day.
fn sample_from_hourly(
    lat: f64,
    lon: f64,
    hourly: &OpenMeteoHourly,
    now: DateTime<Utc>,
) -> Option<ForecastSample> {
    let first_future = hourly.time.iter().position(|t| *t >= now.timestamp())?;

    let val = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten().unwrap_or(0.0);

    let mut summary_lines = vec![
        "--- Hourly Forecast Summary ---".to_string(),
        format!("Report generated at: {}", now.format("%Y-%m-%d %H:%M UTC")),
        "Treat the first date below as 'Day 1'.".to_string(),
        String::new(),
    ];

    let mut current_day = String::new();
    let mut flyable_hours = 0usize;
    for i in first_future..hourly.time.len() {
        let ts = DateTime::<Utc>::from_timestamp(hourly.time[i], 0)?;
        let hour = ts.hour();
        if !(FLYABLE_HOUR_START..=FLYABLE_HOUR_END).contains(&hour) {
            continue;
        }
        flyable_hours += 1;

        let day = ts.format("%Y-%m-%d").to_string();
        if day != current_day {
            summary_lines.push(format!("=== FORECAST FOR DATE: {} ===", day));
            current_day = day;
        }
        summary_lines.push(format!(
            "{}: wind {:.1} km/h (gusts {:.1}), 850hPa {:.1} km/h from {:.0} deg, \
clouds {:.0}%, rain {:.1} mm, temp {:.1} C, CAPE {:.0}",
            ts.format("%H:00"),
            val(&hourly.wind_speed_10m, i),
            val(&hourly.wind_gusts_10m, i),
            val(&hourly.wind_speed_850hpa, i),
            val(&hourly.wind_direction_850hpa, i),
            val(&hourly.cloud_cover, i),
            val(&hourly.precipitation, i),
            val(&hourly.temperature_2m, i),
            val(&hourly.cape, i),
        ));
    }

    if flyable_hours == 0 {
        summary_lines.push("No flyable hours (09:00-18:00) left in the forecast window.".to_string());
    }

    debug!(lat, lon, flyable_hours, "Built forecast sample");

    Some(ForecastSample {
        lat,
        lon,
        wind_speed_kmh: val(&hourly.wind_speed_10m, first_future),
        wind_direction_deg: val(&hourly.wind_direction_850hpa, first_future),
        cloud_cover_pct: val(&hourly.cloud_cover, first_future),
        cape: val(&hourly.cape, first_future),
        temperature_c: val(&hourly.temperature_2m, first_future),
        hourly_summary: summary_lines.join("\n"),
    })
}

// ============================================================================
// Meteoblue meteogram
// ============================================================================

/// Meteoblue thermal meteogram image client.
pub struct MeteoblueClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl MeteoblueClient {
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_key: api_key.to_string(),
            base_url: "https://my.meteoblue.com/images/meteogram_thermal".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl MeteogramSource for MeteoblueClient {
    async fn fetch_png(&self, lat: f64, lon: f64, asl: f64) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("asl", asl.to_string()),
                ("apikey", self.api_key.clone()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match response {
            Ok(r) => {
                metrics::record_upstream_call("meteoblue", "ok");
                Ok(r.bytes().await?.to_vec())
            }
            Err(e) => {
                metrics::record_upstream_call("meteoblue", "error");
                Err(Error::Http(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hourly_fixture(start: i64, hours: usize) -> OpenMeteoHourly {
        let some = |v: f64| (0..hours).map(|_| Some(v)).collect::<Vec<_>>();
        OpenMeteoHourly {
            time: (0..hours).map(|i| start + i as i64 * 3600).collect(),
            temperature_2m: some(21.5),
            precipitation: some(0.0),
            cloud_cover: some(40.0),
            wind_speed_10m: some(14.0),
            wind_gusts_10m: some(22.0),
            cape: some(850.0),
            wind_speed_850hpa: some(18.0),
            wind_direction_850hpa: some(270.0),
        }
    }

    #[test]
    fn test_sample_uses_first_future_hour() {
        // Start two days of hourly data at midnight UTC
        let now = DateTime::parse_from_rfc3339("2024-06-01T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .timestamp();

        let hourly = hourly_fixture(start, 48);
        let sample = sample_from_hourly(46.5, 8.1, &hourly, now).unwrap();

        assert_eq!(sample.wind_speed_kmh, 14.0);
        assert_eq!(sample.cape, 850.0);
        assert!(sample.hourly_summary.contains("2024-06-01"));
        assert!(sample.hourly_summary.contains("2024-06-02"));
        // Past hours are excluded; day 1 starts at 11:00
        assert!(!sample.hourly_summary.contains("09:00\n"));
    }

    #[test]
    fn test_sample_none_when_forecast_entirely_past() {
        let now = DateTime::parse_from_rfc3339("2024-06-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .timestamp();

        let hourly = hourly_fixture(start, 24);
        assert!(sample_from_hourly(46.5, 8.1, &hourly, now).is_none());
    }

    #[test]
    fn test_route_line_format() {
        let sample = ForecastSample {
            lat: 46.5,
            lon: 8.1,
            wind_speed_kmh: 14.0,
            wind_direction_deg: 270.0,
            cloud_cover_pct: 40.0,
            cape: 850.0,
            temperature_c: 21.5,
            hourly_summary: String::new(),
        };
        let line = sample.route_line(0);
        assert!(line.starts_with("Point 1 (46.50,8.10)"));
        assert!(line.contains("14.0km/h"));
        assert!(line.contains("CAPE) 850"));
    }
}
