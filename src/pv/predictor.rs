//! Forward production queries over the clear-sky model
//!
//! The predictor samples expected production at one-minute resolution over
//! the current calendar day and memoises the curve. The memo is flushed when
//! the day rolls over or when a refreshed weather forecast differs by more
//! than the configured epsilon.

use chrono::{Duration, NaiveDate, TimeZone};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;

use super::clearsky::ClearSkyModel;
use crate::config::PvConfig;
use crate::domain::LocalTime;
use crate::forecast::{seasonal_forecast, DayForecast};

const MINUTES_PER_DAY: usize = 24 * 60;

struct DayMemo {
    date: Option<NaiveDate>,
    day_start: Option<LocalTime>,
    /// Expected production per minute of the day, kW
    curve: Vec<f64>,
    forecast: Option<DayForecast>,
    degraded: bool,
}

/// Stateless service from the caller's point of view: queries are pure
/// functions of (time, forecast), with the per-day memo as a cache only
pub struct PvPredictor {
    model: ClearSkyModel,
    capacity_kw: f64,
    system_efficiency: f64,
    epsilon_c: f64,
    memo: RwLock<DayMemo>,
}

impl PvPredictor {
    pub fn new(cfg: &PvConfig, epsilon_c: f64) -> Self {
        Self {
            model: ClearSkyModel::new(cfg.latitude, cfg.longitude, cfg.tilt_deg, cfg.azimuth_deg),
            capacity_kw: cfg.capacity_kw(),
            system_efficiency: cfg.system_efficiency,
            epsilon_c,
            memo: RwLock::new(DayMemo {
                date: None,
                day_start: None,
                curve: Vec::new(),
                forecast: None,
                degraded: true,
            }),
        }
    }

    /// Install a fresh weather forecast; rebuilds the day curve only when
    /// the forecast moved materially or the day changed
    pub fn refresh_forecast(&self, now: LocalTime, forecast: DayForecast) {
        let mut memo = self.memo.write();
        let material = match &memo.forecast {
            Some(previous) => {
                previous.max_delta_c(&forecast) > self.epsilon_c
                    || previous.degraded != forecast.degraded
            }
            None => true,
        };
        let new_day = memo.date != Some(now.date_naive());
        memo.forecast = Some(forecast);
        if material || new_day {
            Self::rebuild(
                &mut memo,
                &self.model,
                self.capacity_kw,
                self.system_efficiency,
                now,
            );
        }
    }

    /// Expected production at `t`; explicit weather overrides skip the memo
    pub fn power_at(&self, t: LocalTime, temp_air_c: Option<f64>, wind_speed_ms: Option<f64>) -> f64 {
        if let (Some(temp), Some(wind)) = (temp_air_c, wind_speed_ms) {
            return self
                .model
                .power_kw(t, self.capacity_kw, self.system_efficiency, temp, wind);
        }
        self.with_curve(t, |memo| {
            let Some(day_start) = memo.day_start else { return 0.0 };
            let minute = (t - day_start).num_minutes();
            if minute < 0 || minute as usize >= memo.curve.len() {
                return 0.0;
            }
            // Linear interpolation between minute samples
            let i = minute as usize;
            let a = memo.curve[i];
            let b = memo.curve.get(i + 1).copied().unwrap_or(a);
            let frac = ((t - day_start).num_seconds() as f64 / 60.0) - minute as f64;
            a + (b - a) * frac
        })
    }

    /// Maximum expected production from `now` to dusk
    pub fn max_available_power(&self, now: LocalTime) -> f64 {
        self.with_curve(now, |memo| {
            let Some(day_start) = memo.day_start else { return 0.0 };
            let from = ((now - day_start).num_minutes().max(0) as usize).min(MINUTES_PER_DAY);
            memo.curve[from..].iter().copied().fold(0.0, f64::max)
        })
    }

    /// Smallest-start, latest-end interval today with production ≥ `p`.
    /// `start == now` when the current instant already qualifies; a
    /// zero-length window at `now` means "no window today".
    pub fn next_power_window(&self, now: LocalTime, p: f64) -> (LocalTime, LocalTime) {
        self.with_curve(now, |memo| {
            let Some(day_start) = memo.day_start else { return (now, now) };
            let from = ((now - day_start).num_minutes().max(0) as usize).min(MINUTES_PER_DAY);

            let start = memo.curve[from..]
                .iter()
                .position(|&kw| kw >= p)
                .map(|offset| from + offset);
            let end = memo.curve[from..]
                .iter()
                .rposition(|&kw| kw >= p)
                .map(|offset| from + offset);

            match (start, end) {
                (Some(s), Some(e)) => {
                    let start_at = if s == from {
                        now
                    } else {
                        day_start + Duration::minutes(s as i64)
                    };
                    (start_at, day_start + Duration::minutes(e as i64))
                }
                _ => (now, now),
            }
        })
    }

    /// Instant of peak expected production today
    pub fn optimal_time(&self, now: LocalTime) -> LocalTime {
        self.with_curve(now, |memo| {
            let Some(day_start) = memo.day_start else { return now };
            memo.curve
                .iter()
                .enumerate()
                .max_by_key(|(_, &kw)| OrderedFloat(kw))
                .map(|(i, _)| day_start + Duration::minutes(i as i64))
                .unwrap_or(now)
        })
    }

    /// First and last instants today with any expected production
    pub fn daytime(&self, now: LocalTime) -> (LocalTime, LocalTime) {
        self.with_curve(now, |memo| {
            let Some(day_start) = memo.day_start else { return (now, now) };
            let dawn = memo.curve.iter().position(|&kw| kw > 0.0);
            let dusk = memo.curve.iter().rposition(|&kw| kw > 0.0);
            match (dawn, dusk) {
                (Some(a), Some(b)) => (
                    day_start + Duration::minutes(a as i64),
                    day_start + Duration::minutes(b as i64),
                ),
                _ => (now, now),
            }
        })
    }

    /// True while estimates rest on seasonal averages instead of a live
    /// forecast
    pub fn is_degraded(&self, now: LocalTime) -> bool {
        self.with_curve(now, |memo| memo.degraded)
    }

    fn with_curve<R>(&self, now: LocalTime, f: impl FnOnce(&DayMemo) -> R) -> R {
        {
            let memo = self.memo.read();
            if memo.date == Some(now.date_naive()) {
                return f(&memo);
            }
        }
        let mut memo = self.memo.write();
        if memo.date != Some(now.date_naive()) {
            Self::rebuild(
                &mut memo,
                &self.model,
                self.capacity_kw,
                self.system_efficiency,
                now,
            );
        }
        f(&memo)
    }

    fn rebuild(
        memo: &mut DayMemo,
        model: &ClearSkyModel,
        capacity_kw: f64,
        system_efficiency: f64,
        now: LocalTime,
    ) {
        let tz = now.timezone();
        let date = now.date_naive();
        let day_start = tz
            .from_local_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight"))
            .earliest()
            .unwrap_or(now);

        // Seasonal averages stand in until a live forecast arrives
        let (forecast, degraded) = match &memo.forecast {
            Some(f) if !f.points.is_empty() => (f.clone(), f.degraded),
            _ => (seasonal_forecast(now, model.latitude_deg), true),
        };

        let curve = (0..MINUTES_PER_DAY)
            .map(|minute| {
                let t = day_start + Duration::minutes(minute as i64);
                let (temp_c, wind_ms) = forecast.conditions_at(t);
                model.power_kw(t, capacity_kw, system_efficiency, temp_c, wind_ms)
            })
            .collect();

        memo.date = Some(date);
        memo.day_start = Some(day_start);
        memo.curve = curve;
        memo.degraded = degraded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Los_Angeles;

    fn predictor() -> PvPredictor {
        let cfg = PvConfig {
            latitude: 37.33,
            longitude: -121.89,
            tilt_deg: 20.0,
            azimuth_deg: 180.0,
            modules: 16,
            module_peak_w: 375.0,
            system_efficiency: 0.85,
        };
        PvPredictor::new(&cfg, 1.0)
    }

    fn at(h: u32, m: u32) -> LocalTime {
        Los_Angeles.with_ymd_and_hms(2024, 6, 21, h, m, 0).unwrap()
    }

    #[test]
    fn night_produces_nothing() {
        assert_eq!(predictor().power_at(at(2, 0), None, None), 0.0);
    }

    #[test]
    fn summer_noon_produces() {
        let p = predictor().power_at(at(13, 0), None, None);
        assert!(p > 2.0, "noon production {p}");
    }

    #[test]
    fn max_available_shrinks_towards_dusk() {
        let pv = predictor();
        let morning_max = pv.max_available_power(at(9, 0));
        let evening_max = pv.max_available_power(at(19, 0));
        assert!(morning_max > evening_max);
    }

    #[test]
    fn window_for_modest_load_spans_midday() {
        let pv = predictor();
        let (start, end) = pv.next_power_window(at(6, 0), 1.5);
        assert!(start < end);
        assert!(start > at(6, 0));
        assert!(end > at(14, 0), "window should reach afternoon, got {end}");
    }

    #[test]
    fn window_is_zero_length_when_unreachable() {
        let pv = predictor();
        let now = at(10, 0);
        let (start, end) = pv.next_power_window(now, 1e6);
        assert_eq!(start, now);
        assert_eq!(end, now);
    }

    #[test]
    fn window_starts_now_when_already_inside() {
        let pv = predictor();
        let now = at(13, 0);
        let (start, _end) = pv.next_power_window(now, 0.5);
        assert_eq!(start, now);
    }

    #[test]
    fn optimal_time_is_around_solar_noon() {
        let best = predictor().optimal_time(at(8, 0));
        let hour = chrono::Timelike::hour(&best);
        assert!((11..=15).contains(&hour), "peak at {best}");
    }

    #[test]
    fn daytime_brackets_production() {
        let pv = predictor();
        let (dawn, dusk) = pv.daytime(at(8, 0));
        assert!(dawn < dusk);
        assert_eq!(pv.power_at(dawn - Duration::minutes(2), None, None), 0.0);
        assert!(pv.power_at(dawn + Duration::minutes(30), None, None) > 0.0);
    }

    #[test]
    fn degraded_until_forecast_arrives() {
        let pv = predictor();
        assert!(pv.is_degraded(at(9, 0)));
        pv.refresh_forecast(at(9, 0), crate::forecast::seasonal_forecast(at(9, 0), 37.33));
        // A seasonal forecast is still degraded
        assert!(pv.is_degraded(at(9, 0)));
        let mut live = crate::forecast::seasonal_forecast(at(9, 0), 37.33);
        live.degraded = false;
        pv.refresh_forecast(at(9, 0), live);
        assert!(!pv.is_degraded(at(9, 0)));
    }

    #[test]
    fn small_forecast_shift_keeps_memo() {
        let pv = predictor();
        let mut live = crate::forecast::seasonal_forecast(at(9, 0), 37.33);
        live.degraded = false;
        pv.refresh_forecast(at(9, 0), live.clone());
        let before = pv.power_at(at(13, 0), None, None);

        // Below-epsilon change: curve must not move
        for p in live.points.iter_mut() {
            p.temperature_c += 0.2;
        }
        pv.refresh_forecast(at(9, 5), live);
        let after = pv.power_at(at(13, 0), None, None);
        assert_eq!(before, after);
    }
}
