use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pv_task_controller::api::{self, ApiState};
use pv_task_controller::config::AppConfig;
use pv_task_controller::domain::{
    Clock, SimulatedEvCharger, SimulatedHvac, SimulatedPoolPump, SimulatedPowerMeter,
    SimulatedWaterHeater, SystemClock,
};
use pv_task_controller::domain::ChargerCapabilities;
use pv_task_controller::forecast::OpenMeteoClient;
use pv_task_controller::models::{HomeModel, HvacModel};
use pv_task_controller::pv::PvPredictor;
use pv_task_controller::scheduler::Scheduler;
use pv_task_controller::store::Store;
use pv_task_controller::tasks::{CarChargerTask, HvacTask, PoolPumpTask, WaterHeaterTask};
use pv_task_controller::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = AppConfig::load()?;
    telemetry::init_tracing(&cfg.telemetry);

    let tz = cfg.tz()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(tz));
    let store = Store::open(cfg.store.path.clone()).await?;
    store.set("pv.parameters", &cfg.pv);

    let pv = Arc::new(PvPredictor::new(&cfg.pv, cfg.weather.forecast_epsilon_c));
    let weather = Arc::new(OpenMeteoClient::new(
        cfg.weather.base_url.clone(),
        cfg.pv.latitude,
        cfg.pv.longitude,
        std::time::Duration::from_secs(cfg.weather.http_timeout_secs),
    ));

    // Simulated device set; real drivers plug in behind the same traits
    let meter = Arc::new(SimulatedPowerMeter::new(
        clock.clone(),
        cfg.ignore_power_threshold.clone(),
    ));
    let charger = Arc::new(SimulatedEvCharger::new(ChargerCapabilities {
        min_current_a: cfg.task.charger.min_current_a,
        max_current_a: cfg.task.charger.max_current_a,
        voltage_v: cfg.task.charger.voltage_v,
        phases: 1,
    }));
    let water_heater = Arc::new(SimulatedWaterHeater::new(
        cfg.task.water_heater.nominal_power_kw,
        110.0,
        0.8,
    ));
    let hvac_unit = Arc::new(SimulatedHvac::new(3.0, 75.0, 85.0));
    let pool_pump = Arc::new(SimulatedPoolPump::new(
        cfg.task.pool_pump.nominal_power_kw,
        Some(26.0),
    ));

    let hvac_model = Arc::new(match &cfg.task.hvac.model_path {
        Some(path) => HvacModel::load(path).context("loading HVAC model")?,
        None => HvacModel::default_cooling(),
    });
    let home_model = Arc::new(match &cfg.task.hvac.home_model_path {
        Some(path) => HomeModel::load(path).context("loading home model")?,
        None => HomeModel::default_home(),
    });

    let scheduler = Arc::new(Scheduler::new(
        cfg.controller.clone(),
        clock.clone(),
        meter,
        weather,
        pv,
        store.clone(),
    ));

    scheduler.register(Arc::new(CarChargerTask::new(
        "ev",
        vec!["ev".to_string()],
        cfg.task.charger.clone(),
        charger,
        clock.clone(),
        &store,
    )))?;
    scheduler.register(Arc::new(WaterHeaterTask::new(
        "water_heater",
        vec!["water_heater".to_string()],
        cfg.task.water_heater.clone(),
        water_heater,
        clock.clone(),
    )))?;
    scheduler.register(Arc::new(HvacTask::new(
        "a_c",
        vec!["a_c".to_string()],
        cfg.task.hvac.clone(),
        hvac_unit,
        hvac_model,
        home_model,
        clock.clone(),
    )))?;
    scheduler.register(Arc::new(PoolPumpTask::new(
        "pool",
        vec!["pool".to_string()],
        cfg.task.pool_pump.clone(),
        pool_pump,
        clock.clone(),
        store.clone(),
    )))?;

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(scheduler.clone().run(cancel.clone()));

    let app = api::router(ApiState {
        scheduler: scheduler.clone(),
        clock,
    });
    let addr = cfg.server.socket_addr()?;
    info!(%addr, tick_seconds = cfg.controller.tick_seconds, "starting PV task controller");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding control surface")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await
        .context("serving control surface")?;

    // Shutdown path: cancel the loop, which stops every task
    cancel.cancel();
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "scheduler loop join failed");
    }

    warn!("shutdown complete");
    Ok(())
}
