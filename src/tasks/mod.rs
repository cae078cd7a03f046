//! Uniform task contract the scheduler drives
//!
//! Tasks wrap one appliance each and own their policy: priority ladder,
//! deadline plan, minimum-run-time lockout, and what coverage ratio is good
//! enough. The scheduler never owns a task, it borrows them through this
//! trait, and every async call is bounded by the adapter timeout.

pub mod car_charger;
pub mod hvac;
pub mod pool_pump;
pub mod water_heater;

pub use car_charger::CarChargerTask;
pub use hvac::HvacTask;
pub use pool_pump::PoolPumpTask;
pub use water_heater::WaterHeaterTask;

use async_trait::async_trait;
use std::cmp::Ordering;

use crate::domain::{ChannelKey, DeviceResult, LocalTime, PowerRecord, Priority};
use crate::forecast::DayForecast;
use crate::pv::PvPredictor;
use crate::window::TaskProfile;

/// Shared read-only context a task may consult while refreshing
pub struct TickContext<'a> {
    pub now: LocalTime,
    pub pv: &'a PvPredictor,
    pub forecast: &'a DayForecast,
    pub latest: Option<&'a PowerRecord>,
    pub tick: chrono::Duration,
}

#[async_trait]
pub trait Task: Send + Sync {
    /// Stable registration identity
    fn id(&self) -> &str;

    /// Current priority, as of the last refresh
    fn priority(&self) -> Priority;

    /// Smallest power needed to start or keep running, kW
    fn nominal_power_kw(&self) -> f64;

    /// Channel keys this task is responsible for
    fn keys(&self) -> Vec<ChannelKey>;

    /// Whether the task voluntarily scales up to absorb surplus
    fn auto_adjust(&self) -> bool;

    /// Recompute priority and plan from device state and forecasts; called
    /// once per tick before any decision
    async fn refresh(&self, ctx: &TickContext<'_>) -> DeviceResult<()>;

    /// Could a start() now actually cause device consumption?
    async fn is_runnable(&self) -> DeviceResult<bool>;

    /// Actual device state, not cached intent
    async fn is_running(&self) -> DeviceResult<bool>;

    /// False while a minimum-run-time or safety lockout holds
    fn is_stoppable(&self) -> bool;

    /// Task-local policy: is this coverage ratio acceptable for starting or
    /// continuing at the given power?
    fn meet_running_criteria(&self, ratio: f64, power_kw: f64) -> bool;

    /// Idempotent; device effect may be asynchronous
    async fn start(&self) -> DeviceResult<()>;

    /// Idempotent; device effect may be asynchronous
    async fn stop(&self) -> DeviceResult<()>;

    /// Re-aim the set-point at the given total available power, kW; no-op
    /// for tasks without auto_adjust
    async fn adjust(&self, _available_kw: f64) -> DeviceResult<()> {
        Ok(())
    }

    /// Draw attributed to this task in a record, kW
    fn usage(&self, record: &PowerRecord) -> f64 {
        record.sum_of(&self.keys())
    }

    /// One-line status for dashboards
    fn desc(&self) -> String;

    fn profile(&self) -> TaskProfile {
        TaskProfile {
            id: self.id().to_string(),
            keys: self.keys(),
            nominal_power_kw: self.nominal_power_kw(),
        }
    }
}

/// Total order for election: priority first, then non-adjustable before
/// adjustable at equal priority (absorbers take leftovers), then identity.
/// `Ordering::Less` means "more important".
pub fn by_importance(
    a: (Priority, bool, &str),
    b: (Priority, bool, &str),
) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| a.1.cmp(&b.1))
        .then_with(|| a.2.cmp(b.2))
}
