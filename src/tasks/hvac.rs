//! HVAC task
//!
//! The most model-driven task: each tick it asks the PV predictor for the
//! last window able to carry the compressor at today's outdoor temperature,
//! integrates home drift backward from the comfort goal to get the pre-cool
//! target, and compares the thermostat against the resulting curve. Priority
//! escalates as the remaining window shrinks against the runtime the
//! remaining temperature movement needs.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{Task, TickContext};
use crate::config::{HvacSeason, HvacTaskConfig};
use crate::domain::{
    ChannelKey, Clock, DeviceError, DeviceResult, HvacMode, HvacUnit, LocalTime, Priority,
};
use crate::models::{HomeModel, HvacModel};
use crate::planner::{plan_thermal, today_at, Direction, TargetPlan};

struct State {
    priority: Priority,
    plan: Option<TargetPlan>,
    indoor_f: f64,
    outdoor_f: f64,
    nominal_kw: f64,
    running: bool,
    started_at: Option<LocalTime>,
}

pub struct HvacTask {
    id: String,
    cfg: HvacTaskConfig,
    keys: Vec<ChannelKey>,
    device: Arc<dyn HvacUnit>,
    model: Arc<HvacModel>,
    home: Arc<HomeModel>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl HvacTask {
    pub fn new(
        id: impl Into<String>,
        keys: Vec<ChannelKey>,
        cfg: HvacTaskConfig,
        device: Arc<dyn HvacUnit>,
        model: Arc<HvacModel>,
        home: Arc<HomeModel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let nominal_kw = model.power_kw(85.0);
        Self {
            id: id.into(),
            cfg,
            keys,
            device,
            model,
            home,
            clock,
            state: Mutex::new(State {
                priority: Priority::Low,
                plan: None,
                indoor_f: 0.0,
                outdoor_f: 85.0,
                nominal_kw,
                running: false,
                started_at: None,
            }),
        }
    }

    fn direction(&self) -> Direction {
        match self.cfg.mode {
            HvacSeason::Cool => Direction::Lowering,
            HvacSeason::Heat => Direction::Raising,
        }
    }

    /// Temperature still to move, in the direction the device works; zero or
    /// negative means the target is met
    fn deficit(plan: &TargetPlan, indoor_f: f64) -> f64 {
        match plan.direction {
            Direction::Lowering => indoor_f - plan.target_value,
            Direction::Raising => plan.target_value - indoor_f,
        }
    }
}

#[async_trait]
impl Task for HvacTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    fn nominal_power_kw(&self) -> f64 {
        self.state.lock().nominal_kw
    }

    fn keys(&self) -> Vec<ChannelKey> {
        self.keys.clone()
    }

    fn auto_adjust(&self) -> bool {
        false
    }

    async fn refresh(&self, ctx: &TickContext<'_>) -> DeviceResult<()> {
        let device_state = self.device.read_state().await?;
        if !device_state.indoor_temp_f.is_finite() || !device_state.outdoor_temp_f.is_finite() {
            return Err(DeviceError::Protocol("non-finite thermostat reading".into()));
        }

        let nominal_kw = self.model.power_kw(device_state.outdoor_temp_f);
        let goal_time = today_at(
            ctx.now,
            self.cfg
                .goal_naive_time()
                .map_err(|e| DeviceError::Protocol(e.to_string()))?,
        );
        let plan = plan_thermal(
            ctx.now,
            device_state.indoor_temp_f,
            goal_time,
            self.cfg.goal_value,
            nominal_kw,
            self.direction(),
            ctx.pv,
            ctx.forecast,
            &self.home,
        );

        let deficit = Self::deficit(&plan, device_state.indoor_temp_f);
        let required_minutes =
            deficit.max(0.0) * self.model.minutes_per_degree(device_state.outdoor_temp_f);
        let remaining_minutes = (plan.target_time - ctx.now).num_minutes() as f64;

        let priority = if deficit <= self.cfg.deadband_f {
            Priority::Background
        } else if !plan.has_window {
            // Parked for the day; sanitisation aside, keep the ladder low
            Priority::Low
        } else if plan.overdue(ctx.now) || remaining_minutes < required_minutes {
            Priority::Urgent
        } else if remaining_minutes < required_minutes * 1.5 {
            Priority::High
        } else if plan.curve.is_behind(
            ctx.now,
            device_state.indoor_temp_f,
            self.cfg.deadband_f,
            plan.direction,
        ) {
            Priority::Medium
        } else {
            Priority::Low
        };

        let mut state = self.state.lock();
        state.indoor_f = device_state.indoor_temp_f;
        state.outdoor_f = device_state.outdoor_temp_f;
        state.nominal_kw = nominal_kw;
        state.running = device_state.running;
        state.priority = priority;
        state.plan = Some(plan);
        Ok(())
    }

    async fn is_runnable(&self) -> DeviceResult<bool> {
        let device_state = self.device.read_state().await?;
        let state = self.state.lock();
        let Some(plan) = state.plan.as_ref() else {
            return Ok(false);
        };
        if !plan.has_window && !plan.overdue(self.clock.now()) {
            return Ok(false);
        }
        Ok(Self::deficit(plan, device_state.indoor_temp_f) > self.cfg.deadband_f)
    }

    async fn is_running(&self) -> DeviceResult<bool> {
        Ok(self.device.read_state().await?.running)
    }

    fn is_stoppable(&self) -> bool {
        let state = self.state.lock();
        match state.started_at {
            // Compressor protection: hold the minimum run time
            Some(started) => {
                self.clock.now() - started >= Duration::minutes(self.cfg.min_run_time_minutes)
            }
            None => true,
        }
    }

    fn meet_running_criteria(&self, ratio: f64, _power_kw: f64) -> bool {
        let state = self.state.lock();
        if state.priority == Priority::Urgent {
            return true;
        }
        if state.running {
            let behind = state
                .plan
                .as_ref()
                .map(|p| {
                    p.curve
                        .is_behind(self.clock.now(), state.indoor_f, self.cfg.deadband_f, p.direction)
                })
                .unwrap_or(false);
            ratio >= self.cfg.stop_ratio || behind
        } else {
            ratio >= self.cfg.start_ratio
        }
    }

    async fn start(&self) -> DeviceResult<()> {
        let (mode, hold) = {
            let state = self.state.lock();
            match state.plan.as_ref() {
                Some(plan) => match plan.direction {
                    Direction::Lowering => (HvacMode::Cool, plan.target_value),
                    Direction::Raising => (HvacMode::Heat, plan.target_value),
                },
                None => (HvacMode::Cool, self.cfg.goal_value),
            }
        };
        self.device.set_hold(mode, hold).await?;
        let mut state = self.state.lock();
        if state.started_at.is_none() {
            state.started_at = Some(self.clock.now());
        }
        Ok(())
    }

    async fn stop(&self) -> DeviceResult<()> {
        self.device.release_hold().await?;
        self.state.lock().started_at = None;
        Ok(())
    }

    fn desc(&self) -> String {
        let state = self.state.lock();
        let target = state
            .plan
            .as_ref()
            .map(|p| {
                format!(
                    "{:.1}F by {}",
                    p.target_value,
                    p.target_time.format("%H:%M")
                )
            })
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{}: indoor {:.1}F outdoor {:.1}F priority {} target {}",
            self.id, state.indoor_f, state.outdoor_f, state.priority, target,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PvConfig;
    use crate::domain::{ManualClock, SimulatedHvac};
    use crate::forecast::{DayForecast, WeatherPoint};
    use crate::pv::PvPredictor;
    use chrono::TimeZone;

    fn cfg() -> HvacTaskConfig {
        HvacTaskConfig {
            mode: HvacSeason::Cool,
            goal_time: "22:00".to_string(),
            goal_value: 73.0,
            deadband_f: 0.2,
            min_run_time_minutes: 10,
            start_ratio: 0.8,
            stop_ratio: 0.5,
            model_path: None,
            home_model_path: None,
        }
    }

    fn at(h: u32, m: u32) -> LocalTime {
        chrono_tz::America::Los_Angeles
            .with_ymd_and_hms(2024, 6, 21, h, m, 0)
            .unwrap()
    }

    fn forecast() -> DayForecast {
        let points = (0..24)
            .map(|h| WeatherPoint {
                timestamp: at(0, 0) + Duration::hours(h),
                temperature_c: 32.0,
                wind_speed_ms: 1.0,
                cloud_cover_percent: 0.0,
            })
            .collect();
        DayForecast {
            points,
            degraded: false,
            fetched_at: at(0, 0),
        }
    }

    fn setup(indoor_f: f64, start: LocalTime) -> (HvacTask, Arc<SimulatedHvac>, Arc<ManualClock>) {
        let clock = ManualClock::new(start);
        let device = Arc::new(SimulatedHvac::new(3.0, indoor_f, 90.0));
        let task = HvacTask::new(
            "a_c",
            vec!["a_c".to_string()],
            cfg(),
            device.clone(),
            Arc::new(HvacModel::default_cooling()),
            Arc::new(HomeModel::default_home()),
            clock.clone(),
        );
        (task, device, clock)
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

    async fn refresh_at(task: &HvacTask, pv: &PvPredictor, now: LocalTime) {
        let fc = forecast();
        let ctx = TickContext {
            now,
            pv,
            forecast: &fc,
            latest: None,
            tick: Duration::minutes(1),
        };
        task.refresh(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn cool_home_parks_in_background() {
        // Already below any pre-cool target the hot day can demand
        let (task, _device, _clock) = setup(66.0, at(12, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(12, 0)).await;
        assert_eq!(task.priority(), Priority::Background);
        assert!(!task.is_runnable().await.unwrap());
    }

    #[tokio::test]
    async fn warm_home_with_time_left_waits_for_ratio() {
        let (task, _device, _clock) = setup(78.0, at(11, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;

        assert!(task.is_runnable().await.unwrap());
        assert!(task.priority() < Priority::Urgent);
        assert!(!task.meet_running_criteria(0.5, 3.0));
        assert!(task.meet_running_criteria(0.9, 3.0));
    }

    #[tokio::test]
    async fn shrinking_window_escalates_to_urgent() {
        // Very warm home in mid-afternoon: the remaining window cannot cover
        // the compressor minutes the pull-down still needs
        let (task, _device, _clock) = setup(88.0, at(15, 30));
        let pv = pv();
        refresh_at(&task, &pv, at(15, 30)).await;
        assert_eq!(task.priority(), Priority::Urgent);
        assert!(task.meet_running_criteria(0.0, 3.0));
    }

    #[tokio::test]
    async fn nominal_power_tracks_outdoor_temperature() {
        let (task, device, _clock) = setup(78.0, at(11, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;
        let at_90 = task.nominal_power_kw();

        device.set_temps(78.0, 65.0).await;
        refresh_at(&task, &pv, at(11, 1)).await;
        let at_65 = task.nominal_power_kw();
        assert!(at_90 > at_65);
    }

    #[tokio::test]
    async fn start_places_a_cooling_hold_at_target() {
        let (task, device, _clock) = setup(78.0, at(11, 0));
        let pv = pv();
        refresh_at(&task, &pv, at(11, 0)).await;
        task.start().await.unwrap();

        let st = device.read_state().await.unwrap();
        let hold = st.hold_temp_f.expect("hold placed");
        assert!(hold < 78.0);
        assert!(st.running);
    }
}
