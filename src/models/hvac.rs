//! Fitted HVAC performance model
//!
//! A coefficient table fitted offline from observed (outdoor temperature,
//! power, efficiency) points, smoothed with a monotone piecewise-cubic
//! interpolant. The model is plain data so it can be rebuilt offline and
//! hot-swapped without interrupting queries.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One fitted knot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvacPoint {
    pub outdoor_f: f64,
    pub power_kw: f64,
    /// Compressor minutes to move the home one degree fahrenheit
    pub minutes_per_degree: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvacModel {
    points: Vec<HvacPoint>,
}

impl HvacModel {
    pub fn new(mut points: Vec<HvacPoint>) -> Result<Self> {
        ensure!(points.len() >= 2, "HVAC model needs at least two knots");
        points.sort_by(|a, b| a.outdoor_f.total_cmp(&b.outdoor_f));
        ensure!(
            points.windows(2).all(|w| w[1].outdoor_f > w[0].outdoor_f),
            "HVAC model knots must have distinct outdoor temperatures"
        );
        Ok(Self { points })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading HVAC model {}", path.display()))?;
        let points: Vec<HvacPoint> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing HVAC model {}", path.display()))?;
        Self::new(points)
    }

    /// Generic single-stage cooling fit used until a site-specific model is
    /// supplied
    pub fn default_cooling() -> Self {
        Self::new(vec![
            HvacPoint { outdoor_f: 60.0, power_kw: 2.4, minutes_per_degree: 8.0 },
            HvacPoint { outdoor_f: 75.0, power_kw: 2.8, minutes_per_degree: 10.0 },
            HvacPoint { outdoor_f: 90.0, power_kw: 3.3, minutes_per_degree: 14.0 },
            HvacPoint { outdoor_f: 105.0, power_kw: 3.8, minutes_per_degree: 20.0 },
        ])
        .expect("built-in table is valid")
    }

    /// Compressor draw at the given outdoor temperature, kW
    pub fn power_kw(&self, outdoor_f: f64) -> f64 {
        self.eval(outdoor_f, |p| p.power_kw)
    }

    /// Minutes of runtime per degree moved at the given outdoor temperature
    pub fn minutes_per_degree(&self, outdoor_f: f64) -> f64 {
        self.eval(outdoor_f, |p| p.minutes_per_degree)
    }

    /// Monotone cubic (Fritsch-Carlson) evaluation over one field, with
    /// clamped extrapolation past the fitted range
    fn eval(&self, x: f64, field: impl Fn(&HvacPoint) -> f64) -> f64 {
        let xs: Vec<f64> = self.points.iter().map(|p| p.outdoor_f).collect();
        let ys: Vec<f64> = self.points.iter().map(&field).collect();
        let n = xs.len();

        if x <= xs[0] {
            return ys[0];
        }
        if x >= xs[n - 1] {
            return ys[n - 1];
        }

        // Secant slopes
        let deltas: Vec<f64> = (0..n - 1)
            .map(|i| (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i]))
            .collect();

        // Endpoint and interior tangents, flattened where the data changes
        // direction so the interpolant stays monotone between knots
        let mut tangents = vec![0.0; n];
        tangents[0] = deltas[0];
        tangents[n - 1] = deltas[n - 2];
        for i in 1..n - 1 {
            if deltas[i - 1] * deltas[i] <= 0.0 {
                tangents[i] = 0.0;
            } else {
                tangents[i] = (deltas[i - 1] + deltas[i]) / 2.0;
            }
        }
        for i in 0..n - 1 {
            if deltas[i] == 0.0 {
                tangents[i] = 0.0;
                tangents[i + 1] = 0.0;
                continue;
            }
            let a = tangents[i] / deltas[i];
            let b = tangents[i + 1] / deltas[i];
            let s = (a * a + b * b).sqrt();
            if s > 3.0 {
                tangents[i] = 3.0 * deltas[i] * a / s;
                tangents[i + 1] = 3.0 * deltas[i] * b / s;
            }
        }

        let i = xs.partition_point(|&k| k <= x).saturating_sub(1).min(n - 2);
        let h = xs[i + 1] - xs[i];
        let t = (x - xs[i]) / h;
        let (t2, t3) = (t * t, t * t * t);

        // Cubic Hermite basis
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;

        h00 * ys[i] + h10 * h * tangents[i] + h01 * ys[i + 1] + h11 * h * tangents[i + 1]
    }
}
