use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::types::DeviceResult;

/// Heat-pump or resistive water heater with an away/boost control surface
#[async_trait]
pub trait WaterHeater: Send + Sync {
    async fn read_state(&self) -> DeviceResult<WaterHeaterState>;
    /// Force heating now (boost); idempotent
    async fn start_heating(&self) -> DeviceResult<()>;
    /// Return to away/idle; idempotent
    async fn stop_heating(&self) -> DeviceResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterHeaterState {
    pub heating: bool,
    pub tank_temp_f: f64,
    /// Available hot-water fraction, 0 empty to 1 full
    pub tank_level: f64,
    pub power_kw: f64,
}

/// Simulated tank for development and testing
pub struct SimulatedWaterHeater {
    state: RwLock<WaterHeaterState>,
    nominal_power_kw: f64,
}

impl SimulatedWaterHeater {
    pub fn new(nominal_power_kw: f64, tank_temp_f: f64, tank_level: f64) -> Self {
        Self {
            state: RwLock::new(WaterHeaterState {
                heating: false,
                tank_temp_f,
                tank_level,
                power_kw: 0.0,
            }),
            nominal_power_kw,
        }
    }

    pub async fn set_tank(&self, temp_f: f64, level: f64) {
        let mut st = self.state.write().await;
        st.tank_temp_f = temp_f;
        st.tank_level = level.clamp(0.0, 1.0);
    }

    /// Simulate the element dropping out at temperature (full tank): the
    /// device stays "heating" but draws nothing
    pub async fn set_satisfied(&self) {
        let mut st = self.state.write().await;
        st.tank_level = 1.0;
        st.power_kw = 0.0;
    }
}

#[async_trait]
impl WaterHeater for SimulatedWaterHeater {
    async fn read_state(&self) -> DeviceResult<WaterHeaterState> {
        Ok(self.state.read().await.clone())
    }

    async fn start_heating(&self) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        st.heating = true;
        if st.tank_level < 1.0 {
            st.power_kw = self.nominal_power_kw;
        }
        Ok(())
    }

    async fn stop_heating(&self) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        st.heating = false;
        st.power_kw = 0.0;
        Ok(())
    }
}
