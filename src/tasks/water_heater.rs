//! Water heater task
//!
//! Deadline-bound: hot water must be ready by the daily goal time. Priority
//! is derived from tank level and temperature, escalating as the last PV
//! window able to cover the element approaches. Inside the deadline margin
//! an Urgent heater runs regardless of coverage, drawing grid power; that is
//! reported, never suppressed. Full-tank detection is heuristic: a heating
//! element that draws nothing after the minimum run time is taken as
//! satisfied and the task cools down before retrying.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{Task, TickContext};
use crate::config::WaterHeaterTaskConfig;
use crate::domain::{ChannelKey, Clock, DeviceResult, LocalTime, Priority, WaterHeater};
use crate::planner::{plan_window_only, today_at, Direction, TargetPlan};

struct State {
    priority: Priority,
    plan: Option<TargetPlan>,
    tank_temp_f: f64,
    tank_level: f64,
    heating: bool,
    started_at: Option<LocalTime>,
    cooldown_until: Option<LocalTime>,
}

pub struct WaterHeaterTask {
    id: String,
    cfg: WaterHeaterTaskConfig,
    keys: Vec<ChannelKey>,
    device: Arc<dyn WaterHeater>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl WaterHeaterTask {
    pub fn new(
        id: impl Into<String>,
        keys: Vec<ChannelKey>,
        cfg: WaterHeaterTaskConfig,
        device: Arc<dyn WaterHeater>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: id.into(),
            cfg,
            keys,
            device,
            clock,
            state: Mutex::new(State {
                priority: Priority::Low,
                plan: None,
                tank_temp_f: 0.0,
                tank_level: 0.0,
                heating: false,
                started_at: None,
                cooldown_until: None,
            }),
        }
    }

    fn margin(&self) -> Duration {
        Duration::minutes(self.cfg.deadline_margin_minutes)
    }

    fn at_goal(state: &State, goal_value: f64) -> bool {
        state.tank_level >= 0.95 && state.tank_temp_f >= goal_value
    }

    fn deadline_override(&self, state: &State, now: LocalTime) -> bool {
        state.priority == Priority::Urgent
            && state
                .plan
                .as_ref()
                .map(|p| p.within_margin(now, self.margin()))
                .unwrap_or(false)
    }
}

#[async_trait]
impl Task for WaterHeaterTask {
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
        let goal_time = today_at(
            ctx.now,
            self.cfg
                .goal_naive_time()
                .map_err(|e| crate::domain::DeviceError::Protocol(e.to_string()))?,
        );
        let plan = plan_window_only(
            ctx.now,
            device_state.tank_temp_f,
            goal_time,
            self.cfg.goal_value,
            self.cfg.nominal_power_kw,
            Direction::Raising,
            ctx.pv,
        );

        let mut state = self.state.lock();
        state.tank_temp_f = device_state.tank_temp_f;
        state.tank_level = device_state.tank_level;
        state.heating = device_state.heating;

        // Full-tank heuristic: heating with zero draw after the minimum run
        // time means the element dropped out at temperature
        if let Some(started) = state.started_at {
            let ran_long_enough =
                ctx.now - started >= Duration::minutes(self.cfg.min_run_time_minutes);
            if ran_long_enough && device_state.heating && device_state.power_kw == 0.0 {
                state.cooldown_until =
                    Some(ctx.now + Duration::minutes(4 * self.cfg.no_power_delay_minutes));
            }
        }
        if let Some(until) = state.cooldown_until {
            if ctx.now >= until {
                state.cooldown_until = None;
            }
        }

        // Tank-driven base priority, escalated by deadline proximity
        let base = if Self::at_goal(&state, self.cfg.goal_value) {
            Priority::Background
        } else if state.tank_level < 0.25 {
            Priority::High
        } else if state.tank_level < 0.5 {
            Priority::Medium
        } else {
            Priority::Low
        };
        let deadline = if plan.within_margin(ctx.now, self.margin()) || plan.overdue(ctx.now) {
            Priority::Urgent
        } else if plan.within_margin(ctx.now, Duration::hours(2)) {
            Priority::High
        } else {
            Priority::Background
        };
        state.priority = if base == Priority::Background {
            // A satisfied tank has no deadline to chase
            Priority::Background
        } else {
            base.max(deadline)
        };
        state.plan = Some(plan);
        Ok(())
    }

    async fn is_runnable(&self) -> DeviceResult<bool> {
        let device_state = self.device.read_state().await?;
        let state = self.state.lock();
        let now = self.clock.now();

        if state.cooldown_until.map(|t| now < t).unwrap_or(false) {
            return Ok(false);
        }
        if device_state.tank_level >= 0.95 && device_state.tank_temp_f >= self.cfg.goal_value {
            return Ok(false);
        }
        // No PV window today parks the task, unless the deadline override is
        // already in force
        match state.plan.as_ref() {
            Some(plan) if !plan.has_window => Ok(self.deadline_override(&state, now)),
            _ => Ok(true),
        }
    }

    async fn is_running(&self) -> DeviceResult<bool> {
        let device_state = self.device.read_state().await?;
        Ok(device_state.heating && device_state.power_kw > 0.0)
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
        if self.deadline_override(&state, self.clock.now()) {
            return true;
        }
        let threshold = if state.heating {
            self.cfg.stop_ratio
        } else {
            self.cfg.start_ratio
        };
        ratio >= threshold
    }

    async fn start(&self) -> DeviceResult<()> {
        self.device.start_heating().await?;
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(self.clock.now());
        }
        Ok(())
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.device.stop_heating().await?;
        self.state.lock().started_at = None;
        Ok(())
    }

    fn desc(&self) -> String {
        let state = self.state.lock();
        let deadline = state
            .plan
            .as_ref()
            .map(|p| p.target_time.format("%H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{}: tank {:.0}F {:.0}% priority {} target {}{}",
            self.id,
            state.tank_temp_f,
            state.tank_level * 100.0,
            state.priority,
            deadline,
            if self.deadline_override(&state, self.clock.now()) {
                " [deadline override, grid power]"
            } else {
                ""
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PvConfig;
    use crate::domain::{ManualClock, SimulatedWaterHeater};
    use crate::forecast::seasonal_forecast;
    use crate::pv::PvPredictor;
    use chrono::TimeZone;

    fn cfg() -> WaterHeaterTaskConfig {
        WaterHeaterTaskConfig {
            nominal_power_kw: 4.5,
            goal_time: "21:00".to_string(),
            goal_value: 120.0,
            min_run_time_minutes: 10,
            no_power_delay_minutes: 15,
            deadline_margin_minutes: 30,
            start_ratio: 0.8,
            stop_ratio: 0.5,
        }
    }

    fn pv() -> PvPredictor {
        let pv_cfg = PvConfig {
            latitude: 37.33,
            longitude: -121.89,
            tilt_deg: 20.0,
            azimuth_deg: 180.0,
            modules: 24,
            module_peak_w: 375.0,
            system_efficiency: 0.85,
        };
        PvPredictor::new(&pv_cfg, 1.0)
    }

    fn at(h: u32, m: u32) -> LocalTime {
        chrono_tz::America::Los_Angeles
            .with_ymd_and_hms(2024, 6, 21, h, m, 0)
            .unwrap()
    }

    fn setup(start: LocalTime) -> (WaterHeaterTask, Arc<SimulatedWaterHeater>, Arc<ManualClock>) {
        let clock = ManualClock::new(start);
        let device = Arc::new(SimulatedWaterHeater::new(4.5, 95.0, 0.4));
        let task = WaterHeaterTask::new(
            "water_heater",
            vec!["water_heater".to_string()],
            cfg(),
            device.clone(),
            clock.clone(),
        );
        (task, device, clock)
    }

    async fn refresh_at(task: &WaterHeaterTask, pv: &PvPredictor, now: LocalTime) {
        let forecast = seasonal_forecast(now, 37.33);
        let ctx = TickContext {
            now,
            pv,
            forecast: &forecast,
            latest: None,
            tick: Duration::minutes(1),
        };
        task.refresh(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn half_empty_tank_is_medium_at_midday() {
        let (task, _device, _clock) = setup(at(11, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;
        assert_eq!(task.priority(), Priority::Medium);
        assert!(task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn deadline_override_ignores_ratio() {
        let (task, _device, clock) = setup(at(11, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;
        assert!(!task.meet_running_criteria(0.2, 4.5));

        // Evening, past every PV window: the deadline collapses to the goal
        // time and the margin before it forces the override
        clock.set(at(20, 45));
        refresh_at(&task, &pv, at(20, 45)).await;
        assert_eq!(task.priority(), Priority::Urgent);
        assert!(task.meet_running_criteria(0.2, 4.5));
        assert!(task.meet_running_criteria(0.0, 4.5));
    }

    #[tokio::test]
    async fn satisfied_tank_goes_background() {
        let (task, device, _clock) = setup(at(11, 0));
        device.set_tank(125.0, 1.0).await;
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;
        assert_eq!(task.priority(), Priority::Background);
        assert!(!task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn zero_draw_after_min_run_triggers_cooldown() {
        let (task, device, clock) = setup(at(11, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;

        task.start().await.unwrap();
        clock.set(at(11, 20));
        device.set_satisfied().await;
        refresh_at(&task, &pv, at(11, 20)).await;

        // Cooldown: 4 x no_power_delay = 60 minutes
        assert!(!task.is_runnable().await.unwrap());

        // After the cooldown, a tank drawn down by usage may retry
        clock.set(at(12, 25));
        device.set_tank(98.0, 0.6).await;
        device.stop_heating().await.unwrap();
        refresh_at(&task, &pv, at(12, 25)).await;
        assert!(task.is_runnable().await.unwrap());

        // A tank at temperature is parked outright
        device.set_tank(125.0, 1.0).await;
        refresh_at(&task, &pv, at(12, 26)).await;
        assert!(!task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn min_run_time_blocks_early_stop() {
        let (task, _device, clock) = setup(at(11, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;
        task.start().await.unwrap();
        assert!(!task.is_stoppable());
        clock.set(at(11, 15));
        assert!(task.is_stoppable());
    }
}
