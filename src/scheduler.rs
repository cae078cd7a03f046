//! Priority-based task scheduler
//!
//! One tick per minute: ingest a power record, let every task re-evaluate
//! itself, then elect which appliances run. Stop decisions walk the running
//! set from least to most important; start decisions walk the idle set the
//! other way and may preempt strictly lower-priority tasks when their draw
//! is needed. Every call into a task or device adapter is bounded by the
//! configured timeout; an adapter that stays silent for the grace period is
//! dropped from the registry and the tick carries on without it.

use chrono::Duration;
use futures::future::join_all;
use itertools::Itertools;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::domain::{
    Clock, DeviceError, DeviceResult, LocalTime, PowerRecord, PowerSensor, Priority, ReadingScale,
    PRODUCTION,
};
use crate::forecast::{DayForecast, WeatherProvider};
use crate::pv::PvPredictor;
use crate::store::Store;
use crate::tasks::{by_importance, Task, TickContext};
use crate::window::{SlidingWindow, TaskProfile};

/// Per-task line of a tick report
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub priority: Priority,
    pub running: bool,
    pub runnable: bool,
    pub desc: String,
}

/// Published to observers after every tick; lossy, no back-pressure
#[derive(Debug, Clone, Serialize)]
pub struct TickStatus {
    pub at: LocalTime,
    pub paused: bool,
    pub degraded: bool,
    pub tasks: Vec<TaskStatus>,
}

struct RegistryEntry {
    task: Arc<dyn Task>,
    stale_count: u32,
}

/// Working view of one task during a tick
struct Snapshot {
    task: Arc<dyn Task>,
    profile: TaskProfile,
    priority: Priority,
    auto_adjust: bool,
    running: bool,
    runnable: bool,
    stoppable: bool,
}

impl Snapshot {
    fn importance_key(&self) -> (Priority, bool, &str) {
        (self.priority, self.auto_adjust, self.profile.id.as_str())
    }
}

pub struct Scheduler {
    cfg: ControllerConfig,
    clock: Arc<dyn Clock>,
    sensor: Arc<dyn PowerSensor>,
    weather: Arc<dyn WeatherProvider>,
    pv: Arc<PvPredictor>,
    store: Arc<Store>,
    registry: RwLock<BTreeMap<String, RegistryEntry>>,
    window: RwLock<SlidingWindow>,
    forecast: RwLock<Option<DayForecast>>,
    paused: AtomicBool,
    degraded: AtomicBool,
    sensor_failures: RwLock<u32>,
    status_tx: broadcast::Sender<TickStatus>,
}

impl Scheduler {
    pub fn new(
        cfg: ControllerConfig,
        clock: Arc<dyn Clock>,
        sensor: Arc<dyn PowerSensor>,
        weather: Arc<dyn WeatherProvider>,
        pv: Arc<PvPredictor>,
        store: Arc<Store>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(16);
        let window_size = cfg.window_size;
        Self {
            cfg,
            clock,
            sensor,
            weather,
            pv,
            store,
            registry: RwLock::new(BTreeMap::new()),
            window: RwLock::new(SlidingWindow::new(window_size)),
            forecast: RwLock::new(None),
            paused: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            sensor_failures: RwLock::new(0),
            status_tx,
        }
    }

    /// Register a task under its stable identity. Duplicate ids and channel
    /// keys already claimed by another task are rejected.
    pub fn register(&self, task: Arc<dyn Task>) -> anyhow::Result<()> {
        let id = task.id().to_string();
        let keys = task.keys();
        let mut registry = self.registry.write();

        if registry.contains_key(&id) {
            anyhow::bail!("task {id:?} is already registered");
        }
        for entry in registry.values() {
            for key in &keys {
                if entry.task.keys().contains(key) {
                    anyhow::bail!(
                        "channel key {key:?} already claimed by task {:?}",
                        entry.task.id()
                    );
                }
            }
        }

        info!(task = %id, "task registered");
        registry.insert(
            id,
            RegistryEntry {
                task,
                stale_count: 0,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.registry.write().remove(id).is_some();
        if removed {
            info!(task = %id, "task unregistered");
        }
        removed
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("scheduler paused; running tasks keep running");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TickStatus> {
        self.status_tx.subscribe()
    }

    /// One-line status per registered task, for dashboards
    pub fn descriptions(&self) -> Vec<String> {
        self.registry
            .read()
            .values()
            .map(|entry| entry.task.desc())
            .collect()
    }

    /// Read-only copy of the window for observers
    pub fn window_snapshot(&self) -> Vec<PowerRecord> {
        self.window.read().snapshot()
    }

    /// Stop every task, ignoring minimum-run-time lockouts; shutdown path
    pub async fn stop_all(&self) {
        let tasks: Vec<Arc<dyn Task>> = self
            .registry
            .read()
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        let results = join_all(tasks.iter().map(|task| self.bounded(task.stop()))).await;
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok(()) => info!(task = %task.id(), "stopped on shutdown"),
                Err(e) => warn!(task = %task.id(), error = %e, "stop failed on shutdown"),
            }
        }
    }

    /// Periodic loop; cancellation triggers stop-all before returning
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.cfg.tick_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = cancel.cancelled() => {
                    info!("scheduler loop cancelled, stopping all tasks");
                    self.stop_all().await;
                    if let Err(e) = self.store.flush().await {
                        warn!(error = %e, "final store flush failed");
                    }
                    return;
                }
            }
        }
    }

    /// One full scheduling pass; public so tests and replays can drive it
    pub async fn tick(&self) {
        let now = self.clock.now();

        let forecast = self.refresh_forecast(now).await;
        self.ingest(now).await;
        let mut snapshots = self.refresh_and_partition(now, &forecast).await;

        let paused = self.is_paused();
        if !paused {
            self.stop_decisions(&mut snapshots).await;
            self.start_decisions(&mut snapshots).await;
            self.adjust_auto_tasks(&snapshots).await;
        }

        for snapshot in &snapshots {
            self.store
                .set_last_priority(&snapshot.profile.id, snapshot.priority);
        }
        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "store flush failed");
        }

        let status = TickStatus {
            at: now,
            paused,
            degraded: self.is_degraded(),
            tasks: snapshots
                .iter()
                .map(|s| TaskStatus {
                    id: s.profile.id.clone(),
                    priority: s.priority,
                    running: s.running,
                    runnable: s.runnable,
                    desc: s.task.desc(),
                })
                .collect(),
        };
        // Lossy by design; nobody listening is fine
        let _ = self.status_tx.send(status);
    }

    async fn refresh_forecast(&self, now: LocalTime) -> DayForecast {
        let cached = self.forecast.read().clone();
        let fresh_enough = cached
            .as_ref()
            .map(|f| now - f.fetched_at < Duration::minutes(30) && !f.degraded)
            .unwrap_or(false);
        if let (true, Some(forecast)) = (fresh_enough, cached) {
            return forecast;
        }

        let forecast = match self.weather.today(now).await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "weather provider failed outright, synthesizing seasonal forecast");
                crate::forecast::seasonal_forecast(now, 0.0)
            }
        };
        self.pv.refresh_forecast(now, forecast.clone());
        *self.forecast.write() = Some(forecast.clone());
        forecast
    }

    async fn ingest(&self, now: LocalTime) {
        match self.bounded(self.sensor.read(ReadingScale::Minute)).await {
            Ok(record) => {
                *self.sensor_failures.write() = 0;
                self.degraded
                    .store(self.pv.is_degraded(now), Ordering::SeqCst);
                self.window.write().push(record);
            }
            Err(e) => {
                let failures = {
                    let mut failures = self.sensor_failures.write();
                    *failures += 1;
                    *failures
                };
                warn!(error = %e, failures, "power sensor read failed");
                self.degraded.store(true, Ordering::SeqCst);

                // Stale beyond the grace period: substitute the PV simulator
                // for production so coverage estimates keep moving
                if failures >= self.cfg.stale_grace_ticks {
                    let synthetic = {
                        let window = self.window.read();
                        window.latest().map(|last| {
                            last.clone()
                                .with_channel(PRODUCTION, self.pv.power_at(now, None, None))
                        })
                    };
                    if let Some(mut record) = synthetic {
                        record.timestamp = now;
                        debug!("pushing synthetic record from PV estimate");
                        self.window.write().push(record);
                    }
                }
            }
        }
    }

    /// Steps 1 and 3-4: sanitise the registry, refresh every surviving
    /// task, and classify them
    async fn refresh_and_partition(
        &self,
        now: LocalTime,
        forecast: &DayForecast,
    ) -> Vec<Snapshot> {
        // Sanitise tasks that exhausted their grace before this tick
        let doomed: Vec<String> = self
            .registry
            .read()
            .iter()
            .filter(|(_, entry)| entry.stale_count >= self.cfg.stale_grace_ticks)
            .map(|(id, _)| id.clone())
            .collect();
        if !doomed.is_empty() {
            warn!(tasks = %doomed.iter().join(", "), "sanitising unreachable tasks");
            let mut registry = self.registry.write();
            for id in &doomed {
                registry.remove(id);
            }
        }

        let tasks: Vec<Arc<dyn Task>> = self
            .registry
            .read()
            .values()
            .map(|entry| entry.task.clone())
            .collect();

        let latest = self.window.read().latest().cloned();
        let mut snapshots = Vec::with_capacity(tasks.len());

        for task in tasks {
            let ctx = TickContext {
                now,
                pv: &self.pv,
                forecast,
                latest: latest.as_ref(),
                tick: Duration::seconds(self.cfg.tick_seconds as i64),
            };

            let refreshed = self.bounded(task.refresh(&ctx)).await;
            let running = match &refreshed {
                Ok(()) => self.bounded(task.is_running()).await,
                Err(_) => Err(DeviceError::Unavailable("refresh failed".into())),
            };
            let runnable = match &running {
                Ok(_) => self.bounded(task.is_runnable()).await,
                Err(_) => Err(DeviceError::Unavailable("state read failed".into())),
            };

            match (refreshed, running, runnable) {
                (Ok(()), Ok(running), Ok(runnable)) => {
                    self.mark_reachable(task.id());
                    snapshots.push(Snapshot {
                        profile: task.profile(),
                        priority: task.priority(),
                        auto_adjust: task.auto_adjust(),
                        running,
                        runnable,
                        stoppable: task.is_stoppable(),
                        task,
                    });
                }
                (r, _, _) => {
                    let error = r.err().unwrap_or(DeviceError::Timeout);
                    self.mark_stale(task.id(), &error);
                }
            }
        }

        snapshots
    }

    /// Step 5: ascending importance, stop running tasks whose coverage no
    /// longer satisfies their own criteria
    async fn stop_decisions(&self, snapshots: &mut [Snapshot]) {
        let mut order: Vec<usize> = (0..snapshots.len())
            .filter(|&i| snapshots[i].running)
            .collect();
        order.sort_by(|&a, &b| {
            by_importance(snapshots[a].importance_key(), snapshots[b].importance_key()).reverse()
        });

        for i in order {
            if !snapshots[i].stoppable {
                continue;
            }
            let (ratio, usage) = {
                let window = self.window.read();
                let minimize = Self::auto_adjust_profiles(snapshots, Some(i));
                (
                    window.covered_by_production(&snapshots[i].profile, &minimize, &[]),
                    window.power_used_by(&snapshots[i].profile),
                )
            };
            if snapshots[i].task.meet_running_criteria(ratio, usage) {
                continue;
            }
            info!(
                task = %snapshots[i].profile.id,
                ratio = format!("{ratio:.2}"),
                usage_kw = format!("{usage:.2}"),
                "stopping task, coverage below criteria"
            );
            match self.bounded(snapshots[i].task.stop()).await {
                Ok(()) => snapshots[i].running = false,
                Err(e) => {
                    warn!(task = %snapshots[i].profile.id, error = %e, "stop failed");
                    self.mark_stale(&snapshots[i].profile.id, &e);
                }
            }
        }
    }

    /// Step 6: descending importance, start idle runnable tasks, preempting
    /// strictly lower-priority running tasks when their draw is needed
    async fn start_decisions(&self, snapshots: &mut [Snapshot]) {
        let mut order: Vec<usize> = (0..snapshots.len())
            .filter(|&i| !snapshots[i].running && snapshots[i].runnable)
            .collect();
        order.sort_by(|&a, &b| {
            by_importance(snapshots[a].importance_key(), snapshots[b].importance_key())
        });

        // The window will not show draw from starts issued this tick until
        // the next record arrives, so account for them here
        let mut committed_kw = 0.0;

        for i in order {
            let minimum = Self::auto_adjust_profiles(snapshots, Some(i));
            let nominal = snapshots[i].profile.nominal_power_kw;

            // Preemption candidates: running, stoppable, strictly lower
            // priority; least important peeled first
            let mut candidates: Vec<usize> = (0..snapshots.len())
                .filter(|&j| {
                    j != i
                        && snapshots[j].running
                        && snapshots[j].stoppable
                        && snapshots[j].priority < snapshots[i].priority
                })
                .collect();
            candidates.sort_by(|&a, &b| {
                by_importance(snapshots[a].importance_key(), snapshots[b].importance_key())
                    .reverse()
            });

            let ratio_with = |preempt: &[usize], committed_kw: f64| -> f64 {
                let window = self.window.read();
                let ignore: Vec<TaskProfile> = preempt
                    .iter()
                    .map(|&k| snapshots[k].profile.clone())
                    .collect();
                let available_kw =
                    window.available_for(&snapshots[i].profile, &minimum, &ignore) * nominal
                        - committed_kw;
                (available_kw / nominal).max(0.0)
            };

            let mut preempt: Vec<usize> = Vec::new();
            let mut ratio = ratio_with(&preempt, committed_kw);
            for &j in &candidates {
                let criteria_met = snapshots[i].task.meet_running_criteria(ratio, nominal);
                if criteria_met && ratio >= 1.0 {
                    break;
                }
                preempt.push(j);
                ratio = ratio_with(&preempt, committed_kw);
            }

            if !snapshots[i].task.meet_running_criteria(ratio, nominal) {
                debug!(
                    task = %snapshots[i].profile.id,
                    ratio = format!("{ratio:.2}"),
                    "holding off, coverage below criteria"
                );
                continue;
            }

            for j in preempt {
                info!(
                    task = %snapshots[j].profile.id,
                    for_task = %snapshots[i].profile.id,
                    "preempting lower-priority task"
                );
                match self.bounded(snapshots[j].task.stop()).await {
                    Ok(()) => snapshots[j].running = false,
                    Err(e) => {
                        warn!(task = %snapshots[j].profile.id, error = %e, "preemption stop failed");
                        self.mark_stale(&snapshots[j].profile.id, &e);
                    }
                }
            }

            info!(
                task = %snapshots[i].profile.id,
                priority = %snapshots[i].priority,
                ratio = format!("{ratio:.2}"),
                "starting task"
            );
            match self.bounded(snapshots[i].task.start()).await {
                Ok(()) => {
                    snapshots[i].running = true;
                    committed_kw += nominal;
                }
                Err(e) => {
                    warn!(task = %snapshots[i].profile.id, error = %e, "start failed");
                    self.mark_stale(&snapshots[i].profile.id, &e);
                }
            }
        }
    }

    /// Step 7: re-aim every running auto-adjust task at the surplus it can
    /// absorb on top of its present draw
    async fn adjust_auto_tasks(&self, snapshots: &[Snapshot]) {
        for (i, snapshot) in snapshots.iter().enumerate() {
            if !snapshot.running || !snapshot.auto_adjust {
                continue;
            }
            let target_kw = {
                let window = self.window.read();
                let minimum = Self::auto_adjust_profiles(snapshots, Some(i));
                let available =
                    window.available_for(&snapshot.profile, &minimum, &[]) * snapshot.profile.nominal_power_kw;
                available + window.power_used_by(&snapshot.profile)
            };
            debug!(
                task = %snapshot.profile.id,
                target_kw = format!("{target_kw:.2}"),
                "adjusting set-point"
            );
            if let Err(e) = self.bounded(snapshot.task.adjust(target_kw)).await {
                warn!(task = %snapshot.profile.id, error = %e, "adjust failed");
                self.mark_stale(&snapshot.profile.id, &e);
            }
        }
    }

    /// Profiles of running auto-adjust tasks, excluding `except`
    fn auto_adjust_profiles(snapshots: &[Snapshot], except: Option<usize>) -> Vec<TaskProfile> {
        snapshots
            .iter()
            .enumerate()
            .filter(|(j, s)| Some(*j) != except && s.running && s.auto_adjust)
            .map(|(_, s)| s.profile.clone())
            .collect()
    }

    fn mark_stale(&self, id: &str, error: &DeviceError) {
        let mut registry = self.registry.write();
        if let Some(entry) = registry.get_mut(id) {
            entry.stale_count += 1;
            warn!(
                task = %id,
                error = %error,
                stale_count = entry.stale_count,
                grace = self.cfg.stale_grace_ticks,
                "adapter unreachable this tick"
            );
        }
    }

    fn mark_reachable(&self, id: &str) {
        let mut registry = self.registry.write();
        if let Some(entry) = registry.get_mut(id) {
            entry.stale_count = 0;
        }
    }

    /// Bound an adapter call by the configured timeout
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = DeviceResult<T>>,
    ) -> DeviceResult<T> {
        match tokio::time::timeout(
            std::time::Duration::from_secs(self.cfg.adapter_timeout_secs),
            fut,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout),
        }
    }
}
