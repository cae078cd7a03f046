//! Pool pump task
//!
//! Warm water needs more filtration; the daily quota comes from a lookup
//! table keyed by pool temperature, falling back to the coldest forecast
//! outdoor temperature when the thermometer is missing. Cumulative on-time
//! is tracked against the power log and persisted, so a controller restart
//! mid-afternoon does not forget the morning's run. Priority rises as the
//! remaining quota closes in on the remaining daytime.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{Task, TickContext};
use crate::config::PoolPumpTaskConfig;
use crate::domain::{ChannelKey, Clock, DeviceResult, LocalTime, PoolPump, Priority};
use crate::store::Store;

struct State {
    priority: Priority,
    water_temp_c: Option<f64>,
    running: bool,
    started_at: Option<LocalTime>,
    required_minutes: f64,
    done_minutes: f64,
}

pub struct PoolPumpTask {
    id: String,
    cfg: PoolPumpTaskConfig,
    /// Quota rungs sorted warmest first
    table: Vec<crate::config::RunTimeStep>,
    keys: Vec<ChannelKey>,
    device: Arc<dyn PoolPump>,
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    state: Mutex<State>,
}

impl PoolPumpTask {
    pub fn new(
        id: impl Into<String>,
        keys: Vec<ChannelKey>,
        cfg: PoolPumpTaskConfig,
        device: Arc<dyn PoolPump>,
        clock: Arc<dyn Clock>,
        store: Arc<Store>,
    ) -> Self {
        let mut table = cfg.run_time_table.clone();
        table.sort_by(|a, b| b.above_c.total_cmp(&a.above_c));
        Self {
            id: id.into(),
            cfg,
            table,
            keys,
            device,
            clock,
            store,
            state: Mutex::new(State {
                priority: Priority::Background,
                water_temp_c: None,
                running: false,
                started_at: None,
                required_minutes: 0.0,
                done_minutes: 0.0,
            }),
        }
    }

    fn required_minutes_for(&self, temp_c: f64) -> f64 {
        self.table
            .iter()
            .find(|step| temp_c >= step.above_c)
            .map(|step| step.hours * 60.0)
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl Task for PoolPumpTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    fn nominal_power_kw(&self) -> f64 {
        self.cfg.nominal_power_kw
    }

    fn keys(&self) -> Vec<ChannelKey> {
        self.keys.clone()
    }

    fn auto_adjust(&self) -> bool {
        false
    }

    async fn refresh(&self, ctx: &TickContext<'_>) -> DeviceResult<()> {
        let device_state = self.device.read_state().await?;
        let date = ctx.now.date_naive();

        // Count this tick against the quota when the power log shows the
        // pump circuit live; fall back to the relay state without a record
        let drew_power = match ctx.latest {
            Some(record) if record.has_key(&self.keys[0]) => self.usage(record) > 0.0,
            _ => device_state.running,
        };
        if drew_power {
            self.store
                .add_runtime_minutes(&self.id, date, ctx.tick.num_minutes() as f64);
        }
        let done_minutes = self.store.runtime_minutes(&self.id, date);

        let temp_c = device_state
            .water_temp_c
            .or_else(|| ctx.forecast.min_temperature_c());
        let required_minutes = temp_c
            .map(|t| self.required_minutes_for(t))
            .unwrap_or(0.0);
        let remaining_required = (required_minutes - done_minutes).max(0.0);

        let (_, dusk) = ctx.pv.daytime(ctx.now);
        let remaining_daytime = (dusk - ctx.now).num_minutes().max(0) as f64;

        let priority = if remaining_required <= 0.0 {
            Priority::Background
        } else {
            let slack = remaining_daytime - remaining_required;
            if slack <= 0.0 {
                Priority::High
            } else if slack <= 60.0 {
                Priority::Medium
            } else {
                Priority::Low
            }
        };

        let mut state = self.state.lock();
        state.water_temp_c = temp_c;
        state.running = device_state.running;
        state.required_minutes = required_minutes;
        state.done_minutes = done_minutes;
        state.priority = priority;
        Ok(())
    }

    async fn is_runnable(&self) -> DeviceResult<bool> {
        // Quota met means nothing left to do today
        let state = self.state.lock();
        Ok(state.required_minutes > state.done_minutes)
    }

    async fn is_running(&self) -> DeviceResult<bool> {
        Ok(self.device.read_state().await?.running)
    }

    fn is_stoppable(&self) -> bool {
        let state = self.state.lock();
        match state.started_at {
            Some(started) => {
                self.clock.now() - started >= Duration::minutes(self.cfg.min_run_time_minutes)
            }
            None => true,
        }
    }

    fn meet_running_criteria(&self, ratio: f64, _power_kw: f64) -> bool {
        let state = self.state.lock();
        // Quota pressure beats coverage: the water turns green either way
        if state.priority >= Priority::High {
            return true;
        }
        let threshold = if state.running {
            self.cfg.stop_ratio
        } else {
            self.cfg.start_ratio
        };
        ratio >= threshold
    }

    async fn start(&self) -> DeviceResult<()> {
        self.device.turn_on().await?;
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(self.clock.now());
        }
        Ok(())
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.device.turn_off().await?;
        self.state.lock().started_at = None;
        Ok(())
    }

    fn desc(&self) -> String {
        let state = self.state.lock();
        let temp = state
            .water_temp_c
            .map(|t| format!("{t:.1}C"))
            .unwrap_or_else(|| "?".to_string());
        format!(
            "{}: water {} run {:.0}/{:.0}min priority {} {}",
            self.id,
            temp,
            state.done_minutes,
            state.required_minutes,
            state.priority,
            if state.running { "on" } else { "off" },
        )
    }
}
