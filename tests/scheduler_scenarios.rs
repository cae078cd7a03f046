//! End-to-end scheduling scenarios against simulated devices
//!
//! Each test drives the scheduler tick by tick with a manual clock and a
//! scripted power meter, the way a day at the house would unfold.

use async_trait::async_trait;
use chrono::{Duration, TimeZone};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pv_task_controller::config::{
    ChargerTaskConfig, ControllerConfig, HvacSeason, HvacTaskConfig, PoolPumpTaskConfig,
    PriorityStep, PvConfig, RunTimeStep, WaterHeaterTaskConfig,
};
use pv_task_controller::domain::{
    ChargerCapabilities, ChargerState, DeviceError, DeviceResult, EvCharger, HvacUnit, LocalTime,
    ManualClock, PoolPump, Priority, SimulatedEvCharger, SimulatedHvac, SimulatedPoolPump,
    SimulatedPowerMeter, SimulatedWaterHeater, WaterHeater,
};
use pv_task_controller::forecast::{seasonal_forecast, StaticWeather};
use pv_task_controller::models::{HomeModel, HvacModel};
use pv_task_controller::pv::PvPredictor;
use pv_task_controller::scheduler::Scheduler;
use pv_task_controller::store::Store;
use pv_task_controller::tasks::{
    CarChargerTask, HvacTask, PoolPumpTask, Task, WaterHeaterTask,
};

fn at(h: u32, m: u32) -> LocalTime {
    chrono_tz::America::Los_Angeles
        .with_ymd_and_hms(2024, 6, 21, h, m, 0)
        .unwrap()
}

fn pv_config() -> PvConfig {
    PvConfig {
        latitude: 37.33,
        longitude: -121.89,
        tilt_deg: 20.0,
        azimuth_deg: 180.0,
        modules: 24,
        module_peak_w: 375.0,
        system_efficiency: 0.85,
    }
}

fn controller_config() -> ControllerConfig {
    ControllerConfig {
        tick_seconds: 60,
        window_size: 60,
        adapter_timeout_secs: 3,
        watchdog_timeout_secs: 180,
        stale_grace_ticks: 3,
    }
}

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

fn water_heater_config() -> WaterHeaterTaskConfig {
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

fn hvac_config() -> HvacTaskConfig {
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

fn pool_config() -> PoolPumpTaskConfig {
    PoolPumpTaskConfig {
        nominal_power_kw: 1.1,
        run_time_table: vec![
            RunTimeStep { above_c: 28.0, hours: 6.0 },
            RunTimeStep { above_c: 20.0, hours: 4.0 },
            RunTimeStep { above_c: 10.0, hours: 2.0 },
        ],
        min_run_time_minutes: 5,
        start_ratio: 0.8,
        stop_ratio: 0.5,
    }
}

struct Harness {
    scheduler: Arc<Scheduler>,
    meter: Arc<SimulatedPowerMeter>,
    clock: Arc<ManualClock>,
    pv: Arc<PvPredictor>,
    store: Arc<Store>,
}

fn harness(start: LocalTime) -> Harness {
    harness_with_forecast(start, seasonal_forecast(start, 37.33))
}

fn harness_with_forecast(
    start: LocalTime,
    forecast: pv_task_controller::forecast::DayForecast,
) -> Harness {
    let clock = ManualClock::new(start);
    let meter = Arc::new(SimulatedPowerMeter::new(clock.clone(), BTreeMap::new()));
    let pv = Arc::new(PvPredictor::new(&pv_config(), 1.0));
    let weather = Arc::new(StaticWeather { forecast });
    let store = Store::ephemeral();
    let scheduler = Arc::new(Scheduler::new(
        controller_config(),
        clock.clone(),
        meter.clone(),
        weather,
        pv.clone(),
        store.clone(),
    ));
    Harness {
        scheduler,
        meter,
        clock,
        pv,
        store,
    }
}

impl Harness {
    async fn step(&self) {
        self.clock.advance(Duration::minutes(1));
        self.scheduler.tick().await;
    }
}

/// Charger adapter that can go silent, for the stall scenario
struct FlakyCharger {
    inner: SimulatedEvCharger,
    stalled: AtomicBool,
}

impl FlakyCharger {
    fn new(caps: ChargerCapabilities) -> Arc<Self> {
        Arc::new(Self {
            inner: SimulatedEvCharger::new(caps),
            stalled: AtomicBool::new(false),
        })
    }

    fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> DeviceResult<()> {
        if self.stalled.load(Ordering::SeqCst) {
            Err(DeviceError::Transport("no response".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EvCharger for FlakyCharger {
    async fn read_state(&self) -> DeviceResult<ChargerState> {
        self.check()?;
        self.inner.read_state().await
    }
    async fn set_current(&self, amps: f64) -> DeviceResult<()> {
        self.check()?;
        self.inner.set_current(amps).await
    }
    async fn start_charging(&self) -> DeviceResult<()> {
        self.check()?;
        self.inner.start_charging().await
    }
    async fn stop_charging(&self) -> DeviceResult<()> {
        self.check()?;
        self.inner.stop_charging().await
    }
    fn capabilities(&self) -> ChargerCapabilities {
        self.inner.capabilities()
    }
}

fn charger_caps() -> ChargerCapabilities {
    ChargerCapabilities {
        min_current_a: 6.0,
        max_current_a: 32.0,
        voltage_v: 240.0,
        phases: 1,
    }
}

// Scenario: sunny afternoon, EV only. 6 kW production against 0.6 kW house
// load; the charger starts and its set-point absorbs the surplus.
#[tokio::test]
async fn sunny_afternoon_ev_absorbs_surplus() {
    let h = harness(at(13, 0));
    let charger = Arc::new(SimulatedEvCharger::new(charger_caps()));
    charger.connect_vehicle(50.0).await;
    h.scheduler
        .register(Arc::new(CarChargerTask::new(
            "ev",
            vec!["ev".to_string()],
            charger_config(),
            charger.clone(),
            h.clock.clone(),
            &h.store,
        )))
        .unwrap();

    h.meter.set_balance(6.0, 0.6);
    h.step().await;

    let state = charger.read_state().await.unwrap();
    assert!(state.charging);
    // 5.4 kW surplus at 240 V single phase -> 22.5 A
    assert!(
        (state.current_amps - 22.5).abs() < 0.1,
        "amps {}",
        state.current_amps
    );

    // Steady state: the meter now shows the charger's own draw; the
    // set-point holds rather than ratcheting down
    h.meter.set_balance(6.0, 0.6 + state.power_kw);
    h.meter.set_channel("ev", state.power_kw);
    h.step().await;
    let state = charger.read_state().await.unwrap();
    assert!(state.charging);
    assert!(
        (state.current_amps - 22.5).abs() < 0.5,
        "steady amps {}",
        state.current_amps
    );
}

// Scenario: morning HVAC deadline. Weak production holds the unit off; when
// measured production clears the threshold in the afternoon it starts with a
// pre-cool target below the goal.
#[tokio::test]
async fn hvac_waits_for_coverage_then_precools() {
    // A hot day end to end: warm evenings drift the home back up after the
    // PV window closes, so the planner pre-cools below the goal
    let hot_day = pv_task_controller::forecast::DayForecast {
        points: (0..24)
            .map(|hour| pv_task_controller::forecast::WeatherPoint {
                timestamp: at(0, 0) + Duration::hours(hour),
                temperature_c: 33.0,
                wind_speed_ms: 1.0,
                cloud_cover_percent: 0.0,
            })
            .collect(),
        degraded: false,
        fetched_at: at(0, 0),
    };
    let h = harness_with_forecast(at(12, 59), hot_day);
    let unit = Arc::new(SimulatedHvac::new(3.0, 78.0, 90.0));
    let task = Arc::new(HvacTask::new(
        "a_c",
        vec!["a_c".to_string()],
        hvac_config(),
        unit.clone(),
        Arc::new(HvacModel::default_cooling()),
        Arc::new(HomeModel::default_home()),
        h.clock.clone(),
    ));
    h.scheduler.register(task.clone()).unwrap();

    // 13:00, production covers only half the compressor draw
    h.meter.set_balance(1.5, 0.0);
    h.step().await;
    assert!(!unit.read_state().await.unwrap().running, "held off at ratio 0.5");
    assert!(task.priority() < Priority::Urgent);

    // Early afternoon, production rises past the start threshold
    h.clock.set(at(14, 14));
    h.meter.set_balance(4.0, 0.0);
    h.step().await;

    let state = unit.read_state().await.unwrap();
    assert!(state.running, "started once covered");
    let hold = state.hold_temp_f.expect("hold placed");
    assert!(hold < 73.0, "pre-cool target {hold} under the goal");
}

// Scenario: priority preemption. A medium water heater holds its 4.5 kW
// under 3 kW production, until an urgent EV claims the power; when surplus
// returns the heater restarts.
#[tokio::test]
async fn urgent_ev_preempts_water_heater() {
    let h = harness(at(11, 0));

    let heater_dev = Arc::new(SimulatedWaterHeater::new(4.5, 95.0, 0.4));
    let heater = Arc::new(WaterHeaterTask::new(
        "water_heater",
        vec!["water_heater".to_string()],
        water_heater_config(),
        heater_dev.clone(),
        h.clock.clone(),
    ));
    let charger = Arc::new(SimulatedEvCharger::new(charger_caps()));
    let ev = Arc::new(CarChargerTask::new(
        "ev",
        vec!["ev".to_string()],
        charger_config(),
        charger.clone(),
        h.clock.clone(),
        &h.store,
    ));
    h.scheduler.register(heater.clone()).unwrap();
    h.scheduler.register(ev).unwrap();

    // Heater has been running past its minimum run time
    heater.start().await.unwrap();
    h.clock.advance(Duration::minutes(15));
    h.meter.set_balance(3.0, 4.5);
    h.meter.set_channel("water_heater", 4.5);
    h.step().await;
    assert!(heater_dev.read_state().await.unwrap().heating, "heater holds at 0.67 coverage");

    // EV arrives nearly empty: urgent
    charger.connect_vehicle(10.0).await;
    h.step().await;

    assert!(!heater_dev.read_state().await.unwrap().heating, "heater preempted");
    assert!(charger.read_state().await.unwrap().charging, "urgent ev started");

    // Surplus reappears; the heater restarts next tick
    h.meter.set_balance(9.0, 5.6);
    h.meter.set_channel("ev", 5.0);
    h.meter.set_channel("water_heater", 0.0);
    h.step().await;
    assert!(heater_dev.read_state().await.unwrap().heating, "heater restarted on surplus");
}

// Scenario: deadline override. Near the end of the last PV window able to
// carry the element, the heater goes urgent and runs even at ratio 0.2.
#[tokio::test]
async fn water_heater_deadline_override_runs_on_grid() {
    let h = harness(at(9, 0));
    let heater_dev = Arc::new(SimulatedWaterHeater::new(4.5, 95.0, 0.4));
    let heater = Arc::new(WaterHeaterTask::new(
        "water_heater",
        vec!["water_heater".to_string()],
        water_heater_config(),
        heater_dev.clone(),
        h.clock.clone(),
    ));
    h.scheduler.register(heater.clone()).unwrap();

    // Find the end of today's window for 4.5 kW and move just inside the
    // deadline margin
    let (_, window_end) = h.pv.next_power_window(at(9, 0), 4.5);
    assert!(window_end > at(9, 0), "clear-sky day must offer a window");
    h.clock.set(window_end - Duration::minutes(10));

    // Overcast in reality: production far below nominal
    h.meter.set_balance(0.9, 0.0);
    h.step().await;

    assert_eq!(heater.priority(), Priority::Urgent);
    assert!(
        heater_dev.read_state().await.unwrap().heating,
        "override runs the heater at ratio 0.2"
    );
    assert!(heater.desc().contains("override"), "status reports the override");
}

// Scenario: adapter stall. A charger that stops responding is sanitised
// after the grace period and the rest of the schedule is unaffected.
#[tokio::test]
async fn stalled_charger_is_removed_others_unaffected() {
    let h = harness(at(12, 0));
    let flaky = FlakyCharger::new(charger_caps());
    let ev = Arc::new(CarChargerTask::new(
        "ev",
        vec!["ev".to_string()],
        charger_config(),
        flaky.clone(),
        h.clock.clone(),
        &h.store,
    ));
    let pool_dev = Arc::new(SimulatedPoolPump::new(1.1, Some(25.0)));
    let pool = Arc::new(PoolPumpTask::new(
        "pool",
        vec!["pool".to_string()],
        pool_config(),
        pool_dev.clone(),
        h.clock.clone(),
        h.store.clone(),
    ));
    h.scheduler.register(ev).unwrap();
    h.scheduler.register(pool).unwrap();

    h.meter.set_balance(5.0, 0.2);
    h.step().await;
    assert_eq!(h.scheduler.descriptions().len(), 2);
    assert!(pool_dev.read_state().await.unwrap().running, "pool started on surplus");

    // The meter now sees the pump circuit
    h.meter.set_balance(5.0, 1.3);
    h.meter.set_channel("pool", 1.1);

    flaky.stall();
    for _ in 0..4 {
        h.step().await;
    }

    let descriptions = h.scheduler.descriptions();
    assert_eq!(descriptions.len(), 1, "ev sanitised: {descriptions:?}");
    assert!(descriptions[0].starts_with("pool"));
    assert!(pool_dev.read_state().await.unwrap().running, "pool unaffected");
}

// Scenario: pool quota. Warm water demands six hours; with the quota
// unfinished and daylight running out, the pump displaces a lower-priority
// task.
#[tokio::test]
async fn pool_quota_displaces_lower_priority() {
    let h = harness(at(17, 0));

    let heater_dev = Arc::new(SimulatedWaterHeater::new(4.5, 118.0, 0.8));
    let heater = Arc::new(WaterHeaterTask::new(
        "water_heater",
        vec!["water_heater".to_string()],
        water_heater_config(),
        heater_dev.clone(),
        h.clock.clone(),
    ));
    let pool_dev = Arc::new(SimulatedPoolPump::new(1.1, Some(30.0)));
    let pool = Arc::new(PoolPumpTask::new(
        "pool",
        vec!["pool".to_string()],
        pool_config(),
        pool_dev.clone(),
        h.clock.clone(),
        h.store.clone(),
    ));
    h.scheduler.register(heater.clone()).unwrap();
    h.scheduler.register(pool.clone()).unwrap();

    // Two of six hours already done today; four remain against roughly
    // three hours of daylight
    h.store
        .add_runtime_minutes("pool", at(17, 0).date_naive(), 120.0);

    // Heater runs covered; pool quota pressure builds
    heater.start().await.unwrap();
    h.clock.advance(Duration::minutes(15));
    h.meter.set_balance(4.2, 4.5);
    h.meter.set_channel("water_heater", 4.5);
    h.step().await;

    assert!(pool.priority() >= Priority::High, "pool priority {}", pool.priority());
    assert!(pool_dev.read_state().await.unwrap().running, "pool started");
    assert!(
        !heater_dev.read_state().await.unwrap().heating,
        "lower-priority heater displaced"
    );
}

// Control surface: pause gates elections without stopping running tasks;
// stop-all shuts everything down regardless of lockouts.
#[tokio::test]
async fn pause_and_stop_all() {
    let h = harness(at(12, 0));
    let charger = Arc::new(SimulatedEvCharger::new(charger_caps()));
    charger.connect_vehicle(50.0).await;
    let ev = Arc::new(CarChargerTask::new(
        "ev",
        vec!["ev".to_string()],
        charger_config(),
        charger.clone(),
        h.clock.clone(),
        &h.store,
    ));
    h.scheduler.register(ev).unwrap();

    h.scheduler.pause();
    h.meter.set_balance(6.0, 0.5);
    h.step().await;
    assert!(!charger.read_state().await.unwrap().charging, "paused: no starts");

    h.scheduler.resume();
    h.step().await;
    assert!(charger.read_state().await.unwrap().charging, "resumed: starts again");

    // Fresh start means the minimum run time lockout is active, stop_all
    // must override it
    h.scheduler.stop_all().await;
    assert!(!charger.read_state().await.unwrap().charging);
}
