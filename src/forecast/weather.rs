//! Weather forecast integration with a seasonal fail-safe
//!
//! Production and thermal planning both depend on forecast air temperature
//! and wind. When the forecast API is unreachable the controller keeps
//! running on seasonal averages; estimates derived from them are tagged
//! degraded so the status surface can show it.

use async_trait::async_trait;
use chrono::{Datelike, Duration, TimeZone, Timelike};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::warn;

use crate::domain::{DeviceError, DeviceResult, LocalTime};

/// One hourly forecast point
#[derive(Debug, Clone, Serialize)]
pub struct WeatherPoint {
    pub timestamp: LocalTime,
    pub temperature_c: f64,
    pub wind_speed_ms: f64,
    pub cloud_cover_percent: f64,
}

/// Forecast for the current day
#[derive(Debug, Clone, Serialize)]
pub struct DayForecast {
    pub points: Vec<WeatherPoint>,
    /// True when the points come from seasonal averages, not a live fetch
    pub degraded: bool,
    pub fetched_at: LocalTime,
}

impl DayForecast {
    /// Air temperature and wind at an instant, linearly interpolated between
    /// the surrounding hourly points, clamped to the forecast range
    pub fn conditions_at(&self, t: LocalTime) -> (f64, f64) {
        match self.points.as_slice() {
            [] => (15.0, 2.0),
            [only] => (only.temperature_c, only.wind_speed_ms),
            points => {
                if t <= points[0].timestamp {
                    return (points[0].temperature_c, points[0].wind_speed_ms);
                }
                if let Some(last) = points.last() {
                    if t >= last.timestamp {
                        return (last.temperature_c, last.wind_speed_ms);
                    }
                }
                for pair in points.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    if t >= a.timestamp && t <= b.timestamp {
                        let span = (b.timestamp - a.timestamp).num_seconds() as f64;
                        let frac = (t - a.timestamp).num_seconds() as f64 / span.max(1.0);
                        return (
                            a.temperature_c + (b.temperature_c - a.temperature_c) * frac,
                            a.wind_speed_ms + (b.wind_speed_ms - a.wind_speed_ms) * frac,
                        );
                    }
                }
                (points[0].temperature_c, points[0].wind_speed_ms)
            }
        }
    }

    /// Outdoor temperature at an instant, in fahrenheit
    pub fn temperature_f_at(&self, t: LocalTime) -> f64 {
        let (c, _) = self.conditions_at(t);
        c * 9.0 / 5.0 + 32.0
    }

    /// Coldest forecast temperature over the remaining points, celsius
    pub fn min_temperature_c(&self) -> Option<f64> {
        self.points
            .iter()
            .map(|p| p.temperature_c)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Largest forecast temperature delta against another forecast; drives
    /// memo invalidation in the PV predictor
    pub fn max_delta_c(&self, other: &DayForecast) -> f64 {
        self.points
            .iter()
            .zip(other.points.iter())
            .map(|(a, b)| (a.temperature_c - b.temperature_c).abs())
            .fold(0.0, f64::max)
    }
}

/// Typed source of weather forecasts
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Hourly forecast covering today in the given zone
    async fn today(&self, now: LocalTime) -> DeviceResult<DayForecast>;
}

/// Open-Meteo forecast client
pub struct OpenMeteoClient {
    client: Client,
    base_url: String,
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    temperature_2m: Vec<f64>,
    windspeed_10m: Vec<f64>,
    cloudcover: Vec<f64>,
}

impl OpenMeteoClient {
    pub fn new(
        base_url: String,
        latitude: f64,
        longitude: f64,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url,
            latitude,
            longitude,
        }
    }

    async fn fetch(&self, now: LocalTime) -> DeviceResult<DayForecast> {
        let tz = now.timezone();
        let url = format!(
            "{}/forecast?latitude={:.4}&longitude={:.4}&hourly=temperature_2m,windspeed_10m,cloudcover&forecast_days=2&timezone={}",
            self.base_url,
            self.latitude,
            self.longitude,
            tz.name().replace('/', "%2F"),
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| DeviceError::Transport(e.to_string()))?;

        let body: OpenMeteoResponse = response
            .json()
            .await
            .map_err(|e| DeviceError::Protocol(e.to_string()))?;

        let n = body.hourly.time.len();
        if body.hourly.temperature_2m.len() != n || body.hourly.windspeed_10m.len() != n {
            return Err(DeviceError::Protocol("hourly series length mismatch".into()));
        }

        let mut points = Vec::with_capacity(n);
        for (i, raw) in body.hourly.time.iter().enumerate() {
            let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
                .map_err(|e| DeviceError::Protocol(format!("bad timestamp {raw:?}: {e}")))?;
            let timestamp = tz
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| DeviceError::Protocol(format!("unmappable timestamp {raw:?}")))?;
            points.push(WeatherPoint {
                timestamp,
                temperature_c: body.hourly.temperature_2m[i],
                wind_speed_ms: body.hourly.windspeed_10m[i],
                cloud_cover_percent: body.hourly.cloudcover.get(i).copied().unwrap_or(0.0),
            });
        }

        Ok(DayForecast {
            points,
            degraded: false,
            fetched_at: now,
        })
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    async fn today(&self, now: LocalTime) -> DeviceResult<DayForecast> {
        match self.fetch(now).await {
            Ok(forecast) => Ok(forecast),
            Err(e) => {
                warn!(error = %e, "weather fetch failed, using seasonal averages");
                Ok(seasonal_forecast(now, self.latitude))
            }
        }
    }
}

/// Seasonal-average forecast used when the live source is down: a yearly
/// sinusoid for temperature with a small diurnal swing, and calm wind
pub fn seasonal_forecast(now: LocalTime, latitude: f64) -> DayForecast {
    let day_of_year = now.ordinal() as f64;
    // Annual mean and swing; southern hemisphere is phase-shifted half a year
    let phase = if latitude >= 0.0 { 172.0 } else { 355.0 };
    let annual = 13.0 + 10.0 * ((day_of_year - phase) * 2.0 * PI / 365.0).cos();

    let start = now
        .timezone()
        .from_local_datetime(&now.date_naive().and_hms_opt(0, 0, 0).expect("midnight"))
        .earliest()
        .unwrap_or(now);

    let points = (0..48)
        .map(|h| {
            let timestamp = start + Duration::hours(h);
            let hour = timestamp.hour() as f64;
            let diurnal = 5.0 * ((hour - 15.0) * 2.0 * PI / 24.0).cos();
            WeatherPoint {
                timestamp,
                temperature_c: annual + diurnal,
                wind_speed_ms: 2.0,
                cloud_cover_percent: 30.0,
            }
        })
        .collect();

    DayForecast {
        points,
        degraded: true,
        fetched_at: now,
    }
}

/// Fixed forecast for tests
pub struct StaticWeather {
    pub forecast: DayForecast,
}

#[async_trait]
impl WeatherProvider for StaticWeather {
    async fn today(&self, _now: LocalTime) -> DeviceResult<DayForecast> {
        Ok(self.forecast.clone())
    }
}
