//! Deadline planner shared by the deadline-bound tasks
//!
//! Answers one question: by when must the device have done its work so the
//! user goal still holds after passive drift, and what trajectory gets the
//! home from here to there. `target_time` is the end of the last PV window
//! able to power the task today; `target_value` is the set-point the home
//! must reach by then; the passive curve is the reference trajectory the
//! task compares its sensor against.

use chrono::{Duration, NaiveTime, TimeZone};
use serde::Serialize;

use crate::domain::LocalTime;
use crate::forecast::DayForecast;
use crate::models::HomeModel;
use crate::pv::PvPredictor;

/// Project a daily wall-clock goal onto the current date in the same zone
pub fn today_at(now: LocalTime, time: NaiveTime) -> LocalTime {
    now.timezone()
        .from_local_datetime(&now.date_naive().and_time(time))
        .earliest()
        .unwrap_or(now)
}

/// Which way the device moves the value, relative to passive drift
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Device lowers the value, drift raises it (summer HVAC)
    Lowering,
    /// Device raises the value, drift lowers it (heating, hot water)
    Raising,
}

/// Reference trajectory from now-state to target-state, minute-sampled
#[derive(Debug, Clone, Serialize)]
pub struct PassiveCurve {
    samples: Vec<(LocalTime, f64)>,
}

impl PassiveCurve {
    fn new(samples: Vec<(LocalTime, f64)>) -> Self {
        debug_assert!(!samples.is_empty(), "curve needs at least one sample");
        Self { samples }
    }

    pub fn value_at(&self, t: LocalTime) -> f64 {
        match self.samples.as_slice() {
            [] => 0.0,
            [only] => only.1,
            samples => {
                if t <= samples[0].0 {
                    return samples[0].1;
                }
                if let Some(last) = samples.last() {
                    if t >= last.0 {
                        return last.1;
                    }
                }
                for pair in samples.windows(2) {
                    let (a, b) = (pair[0], pair[1]);
                    if t >= a.0 && t <= b.0 {
                        let span = (b.0 - a.0).num_seconds() as f64;
                        let frac = (t - a.0).num_seconds() as f64 / span.max(1.0);
                        return a.1 + (b.1 - a.1) * frac;
                    }
                }
                samples[0].1
            }
        }
    }

    /// True when the measured value has fallen behind the curve by more than
    /// the deadband, in the direction the device works against
    pub fn is_behind(&self, t: LocalTime, measured: f64, deadband: f64, direction: Direction) -> bool {
        let reference = self.value_at(t);
        match direction {
            Direction::Lowering => measured > reference + deadband,
            Direction::Raising => measured < reference - deadband,
        }
    }

    /// True when the measured value is comfortably ahead of the curve
    pub fn is_ahead(&self, t: LocalTime, measured: f64, deadband: f64, direction: Direction) -> bool {
        let reference = self.value_at(t);
        match direction {
            Direction::Lowering => measured < reference - deadband,
            Direction::Raising => measured > reference + deadband,
        }
    }
}

/// Output of a planning pass; owned by the task and rebuilt every tick
#[derive(Debug, Clone, Serialize)]
pub struct TargetPlan {
    pub target_time: LocalTime,
    pub target_value: f64,
    pub direction: Direction,
    pub curve: PassiveCurve,
    /// False when no PV window today can power the task
    pub has_window: bool,
}

impl TargetPlan {
    pub fn overdue(&self, now: LocalTime) -> bool {
        now > self.target_time
    }

    pub fn within_margin(&self, now: LocalTime, margin: Duration) -> bool {
        now >= self.target_time - margin
    }
}

/// Plan for a temperature-driven task (HVAC): backward drift integration
/// from the goal fixes `target_value`, and the curve blends the straight
/// path with the drift boundary as `target_time` approaches.
///
/// `direction` is the device's working direction (cooling = Lowering), not
/// derived from the momentary state: a home already below a cooling goal has
/// nothing to do, it is not a heating problem.
pub fn plan_thermal(
    now: LocalTime,
    current_value: f64,
    goal_time: LocalTime,
    goal_value: f64,
    nominal_power_kw: f64,
    direction: Direction,
    pv: &PvPredictor,
    forecast: &DayForecast,
    home: &HomeModel,
) -> TargetPlan {
    let (window_start, window_end) = pv.next_power_window(now, nominal_power_kw);
    let has_window = window_end > window_start;
    let target_time = if has_window {
        window_end.min(goal_time)
    } else {
        // No usable PV today; the deadline collapses to the goal itself
        goal_time
    };

    // Walk passive drift backward from the goal to the target instant: the
    // value the home must hold at target_time so drift alone lands on the
    // goal. Continued further back it bounds the whole trajectory.
    let boundary_minutes = (goal_time - now).num_minutes().max(0);
    let mut boundary = Vec::with_capacity(boundary_minutes as usize + 1);
    let mut value = goal_value;
    boundary.push((goal_time, value));
    for m in 1..=boundary_minutes {
        let t = goal_time - Duration::minutes(m);
        let outdoor_f = forecast.temperature_f_at(t);
        value -= home.degree_per_minute(value, outdoor_f);
        boundary.push((t, value));
    }
    boundary.reverse();

    let boundary_at = |t: LocalTime| -> f64 {
        boundary
            .iter()
            .find(|(bt, _)| *bt >= t)
            .or(boundary.last())
            .map(|(_, v)| *v)
            .unwrap_or(goal_value)
    };
    let target_value = boundary_at(target_time);

    // Reference trajectory: convex combination of the straight path from the
    // current state with the drift boundary, weighted toward the boundary as
    // the target nears.
    let span_minutes = (target_time - now).num_minutes();
    let curve = if span_minutes <= 0 {
        PassiveCurve::new(vec![(target_time, target_value)])
    } else {
        let samples = (0..=span_minutes)
            .map(|m| {
                let t = now + Duration::minutes(m);
                let tau = m as f64 / span_minutes as f64;
                let linear = current_value + (target_value - current_value) * tau;
                let blended = (1.0 - tau) * linear + tau * boundary_at(t);
                (t, blended)
            })
            .collect();
        PassiveCurve::new(samples)
    };

    TargetPlan {
        target_time,
        target_value,
        direction,
        curve,
        has_window,
    }
}

/// Plan for tasks without a drift model (water heater, pool pump): the
/// target value is the goal itself and the curve runs straight to it.
pub fn plan_window_only(
    now: LocalTime,
    current_value: f64,
    goal_time: LocalTime,
    goal_value: f64,
    nominal_power_kw: f64,
    direction: Direction,
    pv: &PvPredictor,
) -> TargetPlan {
    let (window_start, window_end) = pv.next_power_window(now, nominal_power_kw);
    let has_window = window_end > window_start;
    let target_time = if has_window {
        window_end.min(goal_time)
    } else {
        goal_time
    };

    let span_minutes = (target_time - now).num_minutes();
    let curve = if span_minutes <= 0 {
        PassiveCurve::new(vec![(target_time, goal_value)])
    } else {
        let samples = (0..=span_minutes)
            .map(|m| {
                let t = now + Duration::minutes(m);
                let tau = m as f64 / span_minutes as f64;
                (t, current_value + (goal_value - current_value) * tau)
            })
            .collect();
        PassiveCurve::new(samples)
    };

    TargetPlan {
        target_time,
        target_value: goal_value,
        direction,
        curve,
        has_window,
    }
}
