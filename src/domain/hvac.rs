use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::RwLock;

use super::types::DeviceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HvacMode {
    Cool,
    Heat,
    Off,
}

/// Thermostat-fronted HVAC unit; running it means placing a hold at a
/// set-point aggressive enough to keep the compressor on
#[async_trait]
pub trait HvacUnit: Send + Sync {
    async fn read_state(&self) -> DeviceResult<HvacState>;
    /// Place a hold; idempotent, replaces any previous hold
    async fn set_hold(&self, mode: HvacMode, temp_f: f64) -> DeviceResult<()>;
    /// Release the hold and return control to the thermostat program
    async fn release_hold(&self) -> DeviceResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvacState {
    pub running: bool,
    pub mode: HvacMode,
    pub indoor_temp_f: f64,
    pub outdoor_temp_f: f64,
    pub power_kw: f64,
    pub hold_temp_f: Option<f64>,
}

/// Simulated unit for development and testing
pub struct SimulatedHvac {
    state: RwLock<HvacState>,
    nominal_power_kw: f64,
}

impl SimulatedHvac {
    pub fn new(nominal_power_kw: f64, indoor_temp_f: f64, outdoor_temp_f: f64) -> Self {
        Self {
            state: RwLock::new(HvacState {
                running: false,
                mode: HvacMode::Off,
                indoor_temp_f,
                outdoor_temp_f,
                power_kw: 0.0,
                hold_temp_f: None,
            }),
            nominal_power_kw,
        }
    }

    pub async fn set_temps(&self, indoor_f: f64, outdoor_f: f64) {
        let mut st = self.state.write().await;
        st.indoor_temp_f = indoor_f;
        st.outdoor_temp_f = outdoor_f;
    }
}

#[async_trait]
impl HvacUnit for SimulatedHvac {
    async fn read_state(&self) -> DeviceResult<HvacState> {
        Ok(self.state.read().await.clone())
    }

    async fn set_hold(&self, mode: HvacMode, temp_f: f64) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        st.mode = mode;
        st.hold_temp_f = Some(temp_f);
        // Compressor engages when the hold demands movement
        st.running = match mode {
            HvacMode::Cool => st.indoor_temp_f > temp_f,
            HvacMode::Heat => st.indoor_temp_f < temp_f,
            HvacMode::Off => false,
        };
        st.power_kw = if st.running { self.nominal_power_kw } else { 0.0 };
        Ok(())
    }

    async fn release_hold(&self) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        st.hold_temp_f = None;
        st.running = false;
        st.power_kw = 0.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cool_hold_engages_when_above_setpoint() {
        let hvac = SimulatedHvac::new(3.0, 78.0, 95.0);
        hvac.set_hold(HvacMode::Cool, 72.0).await.unwrap();
        let st = hvac.read_state().await.unwrap();
        assert!(st.running);
        assert_eq!(st.power_kw, 3.0);

        hvac.release_hold().await.unwrap();
        assert!(!hvac.read_state().await.unwrap().running);
    }

    #[tokio::test]
    async fn cool_hold_idles_when_already_below() {
        let hvac = SimulatedHvac::new(3.0, 70.0, 95.0);
        hvac.set_hold(HvacMode::Cool, 72.0).await.unwrap();
        assert!(!hvac.read_state().await.unwrap().running);
    }
}
