//! EV charger task
//!
//! Priority climbs the configured ladder as the car's state of charge
//! falls. The task auto-adjusts: while charging it re-aims the current
//! set-point every tick so the car absorbs whatever surplus the array
//! offers, clamped to the charger's range.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{Task, TickContext};
use crate::config::{ChargerTaskConfig, PriorityStep};
use crate::domain::{ChannelKey, Clock, DeviceResult, EvCharger, LocalTime, Priority};
use crate::store::Store;

struct State {
    priority: Priority,
    soc: Option<f64>,
    connected: bool,
    charging: bool,
    started_at: Option<LocalTime>,
}

pub struct CarChargerTask {
    id: String,
    cfg: ChargerTaskConfig,
    /// Ladder sorted by threshold, most urgent rung first
    ladder: Vec<PriorityStep>,
    keys: Vec<ChannelKey>,
    device: Arc<dyn EvCharger>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl CarChargerTask {
    pub fn new(
        id: impl Into<String>,
        keys: Vec<ChannelKey>,
        cfg: ChargerTaskConfig,
        device: Arc<dyn EvCharger>,
        clock: Arc<dyn Clock>,
        store: &Store,
    ) -> Self {
        let id = id.into();
        let mut ladder = cfg.priority_table.clone();
        ladder.sort_by(|a, b| a.below.total_cmp(&b.below));
        let warm_priority = store.last_priority(&id).unwrap_or(Priority::Background);
        Self {
            id,
            cfg,
            ladder,
            keys,
            device,
            clock,
            state: Mutex::new(State {
                priority: warm_priority,
                soc: None,
                connected: false,
                charging: false,
                started_at: None,
            }),
        }
    }

    fn priority_for_soc(&self, soc: f64) -> Priority {
        self.ladder
            .iter()
            .find(|step| soc < step.below)
            .map(|step| step.priority)
            .unwrap_or(Priority::Background)
    }
}

#[async_trait]
impl Task for CarChargerTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    fn nominal_power_kw(&self) -> f64 {
        self.cfg.nominal_power_kw()
    }

    fn keys(&self) -> Vec<ChannelKey> {
        self.keys.clone()
    }

    fn auto_adjust(&self) -> bool {
        true
    }

    async fn refresh(&self, _ctx: &TickContext<'_>) -> DeviceResult<()> {
        let device_state = self.device.read_state().await?;
        let mut state = self.state.lock();
        state.connected = device_state.connected;
        state.charging = device_state.charging;
        state.soc = device_state.vehicle_soc_percent;
        state.priority = match (device_state.connected, device_state.vehicle_soc_percent) {
            (false, _) => Priority::Background,
            (true, Some(soc)) => self.priority_for_soc(soc),
            // Connected but no SoC report: charge opportunistically
            (true, None) => Priority::Low,
        };
        Ok(())
    }

    async fn is_runnable(&self) -> DeviceResult<bool> {
        let device_state = self.device.read_state().await?;
        let full = device_state
            .vehicle_soc_percent
            .map(|soc| soc >= 100.0)
            .unwrap_or(false);
        Ok(device_state.connected && !full)
    }

    async fn is_running(&self) -> DeviceResult<bool> {
        Ok(self.device.read_state().await?.charging)
    }

    fn is_stoppable(&self) -> bool {
        let state = self.state.lock();
        match state.started_at {
            Some(started) => {
                self.clock.now() - started >= chrono::Duration::minutes(self.cfg.min_run_time_minutes)
            }
            None => true,
        }
    }

    fn meet_running_criteria(&self, ratio: f64, _power_kw: f64) -> bool {
        let state = self.state.lock();
        // A critically low battery charges no matter where the power comes from
        if state.priority == Priority::Urgent {
            return true;
        }
        let threshold = if state.charging {
            self.cfg.stop_ratio
        } else {
            self.cfg.start_ratio
        };
        ratio >= threshold
    }

    async fn start(&self) -> DeviceResult<()> {
        self.device.set_current(self.cfg.min_current_a).await?;
        self.device.start_charging().await?;
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(self.clock.now());
        }
        Ok(())
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.device.stop_charging().await?;
        self.state.lock().started_at = None;
        Ok(())
    }

    async fn adjust(&self, available_kw: f64) -> DeviceResult<()> {
        let caps = self.device.capabilities();
        let amps = caps
            .amps_for_power_kw(available_kw.max(0.0))
            .clamp(self.cfg.min_current_a, self.cfg.max_current_a);
        self.device.set_current(amps).await
    }

    fn desc(&self) -> String {
        let state = self.state.lock();
        let soc = state
            .soc
            .map(|s| format!("{s:.0}%"))
            .unwrap_or_else(|| "?".to_string());
        format!(
            "{}: soc {} priority {} {}",
            self.id,
            soc,
            state.priority,
            if state.charging { "charging" } else { "idle" },
        )
    }
}
