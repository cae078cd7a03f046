use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

use crate::domain::Priority;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    /// IANA timezone the scheduler reasons in (solar time is local time)
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    pub controller: ControllerConfig,

    #[validate(nested)]
    pub pv: PvConfig,

    #[validate(nested)]
    pub weather: WeatherConfig,

    #[validate(nested)]
    pub store: StoreConfig,

    /// Per-channel noise floor in kW; readings below it are clipped to zero
    #[serde(default)]
    pub ignore_power_threshold: BTreeMap<String, f64>,

    #[validate(nested)]
    pub task: TaskConfigs,
}

/// HTTP control-surface configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ControllerConfig {
    /// Tick period in seconds
    #[validate(range(min = 1, max = 3600))]
    pub tick_seconds: u64,

    /// Sliding-window length in per-minute records
    #[validate(range(min = 1, max = 1440))]
    pub window_size: usize,

    /// Bound on every call into a task or device adapter
    #[serde(default = "default_adapter_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub adapter_timeout_secs: u64,

    /// External per-process liveness bound, exposed for the supervisor
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,

    /// Consecutive stale observations before a task is dropped
    #[serde(default = "default_stale_grace_ticks")]
    #[validate(range(min = 1, max = 60))]
    pub stale_grace_ticks: u32,
}

/// PV array geometry and rating
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PvConfig {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    /// Panel tilt from horizontal, degrees
    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt_deg: f64,

    /// Panel azimuth, degrees from north (180 = due south)
    #[validate(range(min = 0.0, max = 360.0))]
    pub azimuth_deg: f64,

    /// Number of installed modules
    #[validate(range(min = 1, max = 500))]
    pub modules: u32,

    /// Nameplate power per module in watts
    #[serde(default = "default_module_peak_w")]
    #[validate(range(min = 50.0, max = 1000.0))]
    pub module_peak_w: f64,

    /// Inverter and wiring losses
    #[serde(default = "default_system_efficiency")]
    #[validate(range(min = 0.5, max = 1.0))]
    pub system_efficiency: f64,
}

impl PvConfig {
    /// Installed DC capacity in kW
    pub fn capacity_kw(&self) -> f64 {
        self.modules as f64 * self.module_peak_w / 1000.0
    }
}

/// Weather provider configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WeatherConfig {
    #[serde(default = "default_weather_base_url")]
    #[validate(length(min = 1))]
    pub base_url: String,

    #[serde(default = "default_weather_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub http_timeout_secs: u64,

    /// Forecast-temperature change that invalidates the PV day memo, celsius
    #[serde(default = "default_forecast_epsilon_c")]
    pub forecast_epsilon_c: f64,
}

/// Key/value store configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Per-task sections
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TaskConfigs {
    #[validate(nested)]
    pub charger: ChargerTaskConfig,

    #[validate(nested)]
    pub water_heater: WaterHeaterTaskConfig,

    #[validate(nested)]
    pub hvac: HvacTaskConfig,

    #[validate(nested)]
    pub pool_pump: PoolPumpTaskConfig,
}

/// One rung of a priority ladder: the priority that applies below a level
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriorityStep {
    pub below: f64,
    pub priority: Priority,
}

/// EV charger task
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChargerTaskConfig {
    /// State-of-charge ladder, most urgent rung first
    pub priority_table: Vec<PriorityStep>,

    #[validate(range(min = 1.0, max = 80.0))]
    pub min_current_a: f64,

    #[validate(range(min = 1.0, max = 80.0))]
    pub max_current_a: f64,

    #[serde(default = "default_voltage_v")]
    pub voltage_v: f64,

    #[serde(default = "default_min_run_time_minutes")]
    pub min_run_time_minutes: i64,

    /// Coverage ratio required to start or keep charging
    #[serde(default = "default_start_ratio")]
    pub start_ratio: f64,

    #[serde(default = "default_stop_ratio")]
    pub stop_ratio: f64,
}

impl ChargerTaskConfig {
    /// Smallest useful draw: the minimum charger current at nominal voltage
    pub fn nominal_power_kw(&self) -> f64 {
        self.min_current_a * self.voltage_v / 1000.0
    }
}

/// Water heater task
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WaterHeaterTaskConfig {
    #[validate(range(min = 0.1, max = 20.0))]
    pub nominal_power_kw: f64,

    /// Latest acceptable completion, local time "HH:MM"
    pub goal_time: String,

    /// Tank temperature the goal requires, fahrenheit
    #[validate(range(min = 80.0, max = 160.0))]
    pub goal_value: f64,

    #[serde(default = "default_min_run_time_minutes")]
    pub min_run_time_minutes: i64,

    /// Zero-consumption observation delay before the tank counts as full
    #[serde(default = "default_no_power_delay_minutes")]
    pub no_power_delay_minutes: i64,

    /// Margin before target_time inside which the deadline override applies
    #[serde(default = "default_deadline_margin_minutes")]
    pub deadline_margin_minutes: i64,

    #[serde(default = "default_start_ratio")]
    pub start_ratio: f64,

    #[serde(default = "default_stop_ratio")]
    pub stop_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacSeason {
    Cool,
    Heat,
}

/// HVAC task
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HvacTaskConfig {
    /// Operating season: cooling drives the home down, heating up
    #[serde(default = "default_hvac_mode")]
    pub mode: HvacSeason,

    /// Comfort deadline, local time "HH:MM"
    pub goal_time: String,

    /// Indoor temperature the goal requires, fahrenheit
    #[validate(range(min = 50.0, max = 95.0))]
    pub goal_value: f64,

    /// Curve-crossing deadband, fahrenheit
    #[serde(default = "default_deadband_f")]
    pub deadband_f: f64,

    #[serde(default = "default_min_run_time_minutes")]
    pub min_run_time_minutes: i64,

    #[serde(default = "default_start_ratio")]
    pub start_ratio: f64,

    #[serde(default = "default_stop_ratio")]
    pub stop_ratio: f64,

    /// Fitted HVAC model; None falls back to the built-in table
    #[serde(default)]
    pub model_path: Option<PathBuf>,

    /// Fitted home drift model; None falls back to the built-in table
    #[serde(default)]
    pub home_model_path: Option<PathBuf>,
}

/// One rung of the pool run-time table
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunTimeStep {
    /// Applies when water temperature is at or above this, celsius
    pub above_c: f64,
    pub hours: f64,
}

/// Pool pump task
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PoolPumpTaskConfig {
    #[validate(range(min = 0.1, max = 10.0))]
    pub nominal_power_kw: f64,

    /// Required daily run time per water temperature, warmest rung first
    pub run_time_table: Vec<RunTimeStep>,

    #[serde(default = "default_min_run_time_minutes")]
    pub min_run_time_minutes: i64,

    #[serde(default = "default_start_ratio")]
    pub start_ratio: f64,

    #[serde(default = "default_stop_ratio")]
    pub stop_ratio: f64,
}

// Default value functions
fn default_timezone() -> String { "America/Los_Angeles".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_adapter_timeout_secs() -> u64 { 3 }
fn default_watchdog_timeout_secs() -> u64 { 180 }
fn default_stale_grace_ticks() -> u32 { 3 }
fn default_module_peak_w() -> f64 { 400.0 }
fn default_system_efficiency() -> f64 { 0.85 }
fn default_weather_base_url() -> String { "https://api.open-meteo.com/v1".to_string() }
fn default_weather_timeout_secs() -> u64 { 30 }
fn default_forecast_epsilon_c() -> f64 { 1.0 }
fn default_store_path() -> PathBuf { PathBuf::from("data/store.json") }
fn default_voltage_v() -> f64 { 240.0 }
fn default_min_run_time_minutes() -> i64 { 10 }
fn default_no_power_delay_minutes() -> i64 { 15 }
fn default_deadline_margin_minutes() -> i64 { 30 }
fn default_start_ratio() -> f64 { 0.8 }
fn default_stop_ratio() -> f64 { 0.5 }
fn default_deadband_f() -> f64 { 0.2 }
fn default_hvac_mode() -> HvacSeason { HvacSeason::Cool }

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Later sources override earlier ones:
    /// 1. config/default.toml
    /// 2. config/local.toml (optional site overrides)
    /// 3. Environment variables with PVTC__ prefix (PVTC__SERVER__PORT -> server.port)
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Toml::file("config/local.toml"))
            .merge(Env::prefixed("PVTC__").split("__"));

        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;
        config.cross_validate()?;

        Ok(config)
    }

    /// Checks the validator derive cannot express
    pub fn cross_validate(&self) -> Result<()> {
        self.tz()?;
        self.task.water_heater.goal_naive_time()?;
        self.task.hvac.goal_naive_time()?;

        if self.task.charger.min_current_a >= self.task.charger.max_current_a {
            anyhow::bail!(
                "charger min_current_a ({}) must be below max_current_a ({})",
                self.task.charger.min_current_a,
                self.task.charger.max_current_a
            );
        }
        if self.task.charger.priority_table.is_empty() {
            anyhow::bail!("charger priority_table must not be empty");
        }
        if self.task.pool_pump.run_time_table.is_empty() {
            anyhow::bail!("pool_pump run_time_table must not be empty");
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid timezone {:?}: {e}", self.timezone))
    }
}

fn parse_goal_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .with_context(|| format!("invalid goal_time {s:?}, expected HH:MM"))
}

impl WaterHeaterTaskConfig {
    pub fn goal_naive_time(&self) -> Result<NaiveTime> {
        parse_goal_time(&self.goal_time)
    }
}

impl HvacTaskConfig {
    pub fn goal_naive_time(&self) -> Result<NaiveTime> {
        parse_goal_time(&self.goal_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charger_config() -> ChargerTaskConfig {
        ChargerTaskConfig {
            priority_table: vec![
                PriorityStep { below: 20.0, priority: Priority::Urgent },
                PriorityStep { below: 60.0, priority: Priority::Medium },
                PriorityStep { below: 100.0, priority: Priority::Low },
            ],
            min_current_a: 6.0,
            max_current_a: 32.0,
            voltage_v: 240.0,
            min_run_time_minutes: 5,
            start_ratio: 0.8,
            stop_ratio: 0.5,
        }
    }

    #[test]
    fn charger_nominal_power_follows_min_current() {
        let cfg = charger_config();
        assert!((cfg.nominal_power_kw() - 1.44).abs() < 1e-9);
    }

    #[test]
    fn goal_time_parses_short_form() {
        assert_eq!(
            parse_goal_time("22:00").unwrap(),
            NaiveTime::from_hms_opt(22, 0, 0).unwrap()
        );
        assert!(parse_goal_time("10 pm").is_err());
    }

    #[test]
    fn pv_capacity_is_modules_times_rating() {
        let pv = PvConfig {
            latitude: 37.3,
            longitude: -121.9,
            tilt_deg: 20.0,
            azimuth_deg: 180.0,
            modules: 16,
            module_peak_w: 375.0,
            system_efficiency: 0.85,
        };
        assert!((pv.capacity_kw() - 6.0).abs() < 1e-9);
        assert!(pv.validate().is_ok());
    }

    #[test]
    fn server_config_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        };
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn hvac_season_deserializes_lowercase() {
        let season: HvacSeason = serde_json::from_str("\"cool\"").unwrap();
        assert_eq!(season, HvacSeason::Cool);
        let season: HvacSeason = serde_json::from_str("\"heat\"").unwrap();
        assert_eq!(season, HvacSeason::Heat);
    }
}
