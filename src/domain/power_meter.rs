use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::clock::Clock;
use super::types::{ChannelKey, DeviceError, DeviceResult, LocalTime, PowerRecord, ReadingScale};

/// Whole-home power clamp with per-circuit sub-meters
///
/// Implementations read a physical meter (eGauge, Shelly EM, ...) or replay a
/// log; the scheduler only sees records.
#[async_trait]
pub trait PowerSensor: Send + Sync {
    /// Latest reading at the given sampling scale (default Minute)
    async fn read(&self, scale: ReadingScale) -> DeviceResult<PowerRecord>;

    /// Historical reading; sensors without history return Unavailable
    async fn at(&self, _instant: LocalTime) -> DeviceResult<PowerRecord> {
        Err(DeviceError::Unavailable("no historical data".into()))
    }

    /// SI unit per channel, disclosed for dashboards
    fn units(&self) -> BTreeMap<ChannelKey, String>;
}

/// In-memory meter for tests and the no-hardware mode; tests drive it by
/// setting channel readings
pub struct SimulatedPowerMeter {
    clock: Arc<dyn Clock>,
    channels: RwLock<BTreeMap<ChannelKey, f64>>,
    thresholds: BTreeMap<ChannelKey, f64>,
}

impl SimulatedPowerMeter {
    pub fn new(clock: Arc<dyn Clock>, thresholds: BTreeMap<ChannelKey, f64>) -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(super::types::PRODUCTION.to_string(), 0.0);
        channels.insert(super::types::CONSUMPTION.to_string(), 0.0);
        Self {
            clock,
            channels: RwLock::new(channels),
            thresholds,
        }
    }

    pub fn set_channel(&self, key: &str, kw: f64) {
        self.channels.write().insert(key.to_string(), kw);
    }

    /// Convenience for tests: set production and consumption in one call
    pub fn set_balance(&self, production_kw: f64, consumption_kw: f64) {
        let mut channels = self.channels.write();
        channels.insert(super::types::PRODUCTION.to_string(), production_kw);
        channels.insert(super::types::CONSUMPTION.to_string(), consumption_kw);
    }
}

#[async_trait]
impl PowerSensor for SimulatedPowerMeter {
    async fn read(&self, _scale: ReadingScale) -> DeviceResult<PowerRecord> {
        let channels = self.channels.read().clone();
        Ok(PowerRecord::new(
            self.clock.now(),
            channels,
            &self.thresholds,
        ))
    }

    fn units(&self) -> BTreeMap<ChannelKey, String> {
        self.channels
            .read()
            .keys()
            .map(|k| (k.clone(), "kW".to_string()))
            .collect()
    }
}
