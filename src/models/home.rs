//! Fitted home thermal-drift model
//!
//! Passive indoor temperature drift as a function of indoor and outdoor
//! temperature, smoothed over a 2-D grid. Positive values mean the home is
//! warming. Like the HVAC model this is plain data.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeModel {
    /// Grid axis of indoor temperatures, fahrenheit, ascending
    indoor_axis_f: Vec<f64>,
    /// Grid axis of outdoor temperatures, fahrenheit, ascending
    outdoor_axis_f: Vec<f64>,
    /// drift[i][j] = °F per minute at indoor_axis[i], outdoor_axis[j]
    drift_f_per_minute: Vec<Vec<f64>>,
}

impl HomeModel {
    pub fn new(
        indoor_axis_f: Vec<f64>,
        outdoor_axis_f: Vec<f64>,
        drift_f_per_minute: Vec<Vec<f64>>,
    ) -> Result<Self> {
        ensure!(
            indoor_axis_f.len() >= 2 && outdoor_axis_f.len() >= 2,
            "home model needs at least a 2x2 grid"
        );
        ensure!(
            drift_f_per_minute.len() == indoor_axis_f.len()
                && drift_f_per_minute
                    .iter()
                    .all(|row| row.len() == outdoor_axis_f.len()),
            "home model grid shape mismatch"
        );
        ensure!(
            indoor_axis_f.windows(2).all(|w| w[1] > w[0])
                && outdoor_axis_f.windows(2).all(|w| w[1] > w[0]),
            "home model axes must be strictly ascending"
        );
        Ok(Self {
            indoor_axis_f,
            outdoor_axis_f,
            drift_f_per_minute,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading home model {}", path.display()))?;
        let model: HomeModel = serde_json::from_str(&raw)
            .with_context(|| format!("parsing home model {}", path.display()))?;
        Self::new(
            model.indoor_axis_f,
            model.outdoor_axis_f,
            model.drift_f_per_minute,
        )
    }

    /// Generic leaky-envelope fit used until a site-specific model is
    /// supplied: drift proportional to the indoor/outdoor delta
    pub fn default_home() -> Self {
        let indoor: Vec<f64> = (0..=8).map(|i| 55.0 + i as f64 * 5.0).collect();
        let outdoor: Vec<f64> = (0..=12).map(|j| 30.0 + j as f64 * 7.5).collect();
        // Roughly a 20-hour envelope time constant
        let k_per_minute = 0.0008;
        let grid = indoor
            .iter()
            .map(|&t_in| {
                outdoor
                    .iter()
                    .map(|&t_out| (t_out - t_in) * k_per_minute)
                    .collect()
            })
            .collect();
        Self::new(indoor, outdoor, grid).expect("built-in grid is valid")
    }

    /// Passive drift rate at the given state, °F per minute; clamped
    /// bilinear interpolation over the grid
    pub fn degree_per_minute(&self, indoor_f: f64, outdoor_f: f64) -> f64 {
        let (i, ti) = Self::locate(&self.indoor_axis_f, indoor_f);
        let (j, tj) = Self::locate(&self.outdoor_axis_f, outdoor_f);

        let d00 = self.drift_f_per_minute[i][j];
        let d01 = self.drift_f_per_minute[i][j + 1];
        let d10 = self.drift_f_per_minute[i + 1][j];
        let d11 = self.drift_f_per_minute[i + 1][j + 1];

        let low = d00 + (d01 - d00) * tj;
        let high = d10 + (d11 - d10) * tj;
        low + (high - low) * ti
    }

    /// Cell index and interpolation fraction for a value on an axis,
    /// clamped to the grid
    fn locate(axis: &[f64], value: f64) -> (usize, f64) {
        let n = axis.len();
        if value <= axis[0] {
            return (0, 0.0);
        }
        if value >= axis[n - 1] {
            return (n - 2, 1.0);
        }
        let i = axis.partition_point(|&k| k <= value).saturating_sub(1).min(n - 2);
        let t = (value - axis[i]) / (axis[i + 1] - axis[i]);
        (i, t)
    }
}
