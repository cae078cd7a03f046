//! Clear-sky production model
//!
//! Solar position and atmospheric attenuation give horizontal irradiance;
//! projection onto the panel plane and a wind-cooled cell-temperature
//! derating turn that into array output.

use chrono::{Datelike, Offset, Timelike};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::domain::LocalTime;

/// Solar constant at the top of the atmosphere, W/m²
const SOLAR_CONSTANT: f64 = 1367.0;
/// Module power temperature coefficient, per °C above 25
const GAMMA_PER_C: f64 = -0.004;
/// Sandia cell-temperature model coefficients for glass/cell/polymer racks
const SANDIA_A: f64 = -3.47;
const SANDIA_B: f64 = -0.0594;

/// Array geometry and the irradiance model built on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearSkyModel {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub tilt_deg: f64,
    pub azimuth_deg: f64,
}

impl ClearSkyModel {
    pub fn new(latitude_deg: f64, longitude_deg: f64, tilt_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
            tilt_deg,
            azimuth_deg,
        }
    }

    /// Solar elevation and azimuth in degrees at the given local time
    ///
    /// Elevation: 0 at the horizon, 90 overhead. Azimuth: degrees from
    /// north, 180 = due south.
    pub fn solar_position(&self, time: LocalTime) -> (f64, f64) {
        let day_of_year = time.ordinal() as f64;
        let hour = time.hour() as f64 + time.minute() as f64 / 60.0;
        let utc_offset_hours = time.offset().fix().local_minus_utc() as f64 / 3600.0;

        // Declination swings ±23.45° over the year
        let declination_deg = 23.45 * (360.0 / 365.0 * (day_of_year + 284.0) * PI / 180.0).sin();
        let declination_rad = declination_deg * PI / 180.0;
        let latitude_rad = self.latitude_deg * PI / 180.0;

        // Hour angle relative to solar noon
        let solar_time = hour + self.longitude_deg / 15.0 - utc_offset_hours;
        let hour_angle_deg = 15.0 * (solar_time - 12.0);
        let hour_angle_rad = hour_angle_deg * PI / 180.0;

        let elevation_sin = latitude_rad.sin() * declination_rad.sin()
            + latitude_rad.cos() * declination_rad.cos() * hour_angle_rad.cos();
        let elevation_rad = elevation_sin.asin();
        let elevation_deg = elevation_rad * 180.0 / PI;

        let azimuth_cos = (declination_rad.sin() - latitude_rad.sin() * elevation_rad.sin())
            / (latitude_rad.cos() * elevation_rad.cos()).max(1e-9);
        let mut azimuth_deg = azimuth_cos.clamp(-1.0, 1.0).acos() * 180.0 / PI;
        if hour_angle_deg > 0.0 {
            azimuth_deg = 360.0 - azimuth_deg;
        }

        (elevation_deg, azimuth_deg)
    }

    /// Clear-sky global horizontal irradiance in W/m²
    pub fn horizontal_irradiance(&self, time: LocalTime) -> f64 {
        let (elevation_deg, _) = self.solar_position(time);
        if elevation_deg <= 0.0 {
            return 0.0;
        }
        let elevation_rad = elevation_deg * PI / 180.0;

        // Relative air mass; linear approximation near the horizon avoids
        // the 1/sin singularity
        let air_mass = if elevation_deg > 5.0 {
            1.0 / elevation_rad.sin()
        } else {
            12.0 - elevation_deg / 5.0
        };

        // Kasten-Young clear-sky transmittance
        let transmittance = 0.7_f64.powf(air_mass.powf(0.678));

        SOLAR_CONSTANT * transmittance * elevation_rad.sin()
    }

    /// Clear-sky irradiance in the plane of the array, W/m²
    pub fn panel_irradiance(&self, time: LocalTime) -> f64 {
        let (elevation_deg, sun_azimuth_deg) = self.solar_position(time);
        if elevation_deg <= 0.0 {
            return 0.0;
        }
        let ghi = self.horizontal_irradiance(time);

        let elevation_rad = elevation_deg * PI / 180.0;
        let tilt_rad = self.tilt_deg * PI / 180.0;
        let azimuth_delta_rad = (sun_azimuth_deg - self.azimuth_deg) * PI / 180.0;

        // Angle of incidence on the tilted plane
        let cos_aoi = elevation_rad.sin() * tilt_rad.cos()
            + elevation_rad.cos() * tilt_rad.sin() * azimuth_delta_rad.cos();
        if cos_aoi <= 0.0 {
            // Sun behind the array: diffuse sky only
            return ghi * 0.1;
        }

        // Re-project the horizontal beam onto the panel plane, with the
        // denominator floored so glancing sun does not blow up the ratio
        let projection = cos_aoi / elevation_rad.sin().max(0.087);
        (ghi * projection).min(ghi * 1.5)
    }

    /// Cell temperature from plane-of-array irradiance, air temperature and
    /// wind speed (Sandia module temperature model)
    pub fn cell_temperature_c(&self, poa_wm2: f64, air_temp_c: f64, wind_speed_ms: f64) -> f64 {
        poa_wm2 * (SANDIA_A + SANDIA_B * wind_speed_ms).exp() + air_temp_c
    }

    /// Expected array output in kW under clear sky
    pub fn power_kw(
        &self,
        time: LocalTime,
        capacity_kw: f64,
        system_efficiency: f64,
        air_temp_c: f64,
        wind_speed_ms: f64,
    ) -> f64 {
        let poa = self.panel_irradiance(time);
        if poa <= 0.0 {
            return 0.0;
        }
        let cell_temp = self.cell_temperature_c(poa, air_temp_c, wind_speed_ms);
        let derate = 1.0 + GAMMA_PER_C * (cell_temp - 25.0);
        (capacity_kw * (poa / 1000.0) * derate.clamp(0.5, 1.1) * system_efficiency).max(0.0)
    }
}
