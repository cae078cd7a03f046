use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use thiserror::Error;

/// Instant with its explicit local zone; all scheduling reasons in solar time
pub type LocalTime = DateTime<Tz>;

/// Channel key of a circuit or sub-meter in a power record
pub type ChannelKey = String;

/// Key every record must carry for array output
pub const PRODUCTION: &str = "production";
/// Key every record must carry for whole-home draw
pub const CONSUMPTION: &str = "consumption";

/// Scheduling priority, totally ordered; Urgent is highest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Background,
    Low,
    Medium,
    High,
    Urgent,
}

/// Sampling scale for sensor reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReadingScale {
    Second,
    Minute,
    Hour,
    Day,
}

impl Default for ReadingScale {
    fn default() -> Self {
        ReadingScale::Minute
    }
}

/// Device adapter errors, one variant per failure class the scheduler handles
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device call timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Immutable per-minute power snapshot: timestamp plus channel readings in kW
#[derive(Debug, Clone, Serialize)]
pub struct PowerRecord {
    pub timestamp: LocalTime,
    channels: BTreeMap<ChannelKey, f64>,
}

impl PowerRecord {
    /// Build a record, clipping negative readings and anything below the
    /// per-channel noise floor to zero
    pub fn new(
        timestamp: LocalTime,
        channels: BTreeMap<ChannelKey, f64>,
        thresholds: &BTreeMap<ChannelKey, f64>,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|(key, kw)| {
                let floor = thresholds.get(&key).copied().unwrap_or(0.0);
                let kw = if kw < floor { 0.0 } else { kw.max(0.0) };
                (key, kw)
            })
            .collect();
        Self { timestamp, channels }
    }

    /// Raw record without threshold clipping, for already-clean sources
    pub fn from_readings(timestamp: LocalTime, channels: BTreeMap<ChannelKey, f64>) -> Self {
        Self::new(timestamp, channels, &BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> f64 {
        self.channels.get(key).copied().unwrap_or(0.0)
    }

    pub fn production(&self) -> f64 {
        self.get(PRODUCTION)
    }

    pub fn consumption(&self) -> f64 {
        self.get(CONSUMPTION)
    }

    /// Sum of the given channel keys
    pub fn sum_of(&self, keys: &[ChannelKey]) -> f64 {
        keys.iter().map(|k| self.get(k)).sum()
    }

    /// Sum over every channel, production included
    pub fn total(&self) -> f64 {
        self.channels.values().sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChannelKey> {
        self.channels.keys()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.channels.contains_key(key)
    }

    /// Replace one channel's reading, used when production is substituted
    /// from the simulator during sensor degradation
    pub fn with_channel(mut self, key: &str, kw: f64) -> Self {
        self.channels.insert(key.to_string(), kw.max(0.0));
        self
    }
}
