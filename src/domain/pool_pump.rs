use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::types::DeviceResult;

/// Single-speed pool pump behind a smart relay, plus the pool thermometer
#[async_trait]
pub trait PoolPump: Send + Sync {
    async fn read_state(&self) -> DeviceResult<PoolPumpState>;
    async fn turn_on(&self) -> DeviceResult<()>;
    async fn turn_off(&self) -> DeviceResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolPumpState {
    pub running: bool,
    pub water_temp_c: Option<f64>,
    pub power_kw: f64,
}

/// Simulated pump for development and testing
pub struct SimulatedPoolPump {
    state: RwLock<PoolPumpState>,
    nominal_power_kw: f64,
}

impl SimulatedPoolPump {
    pub fn new(nominal_power_kw: f64, water_temp_c: Option<f64>) -> Self {
        Self {
            state: RwLock::new(PoolPumpState {
                running: false,
                water_temp_c,
                power_kw: 0.0,
            }),
            nominal_power_kw,
        }
    }

    pub async fn set_water_temp(&self, temp_c: Option<f64>) {
        self.state.write().await.water_temp_c = temp_c;
    }
}

#[async_trait]
impl PoolPump for SimulatedPoolPump {
    async fn read_state(&self) -> DeviceResult<PoolPumpState> {
        Ok(self.state.read().await.clone())
    }

    async fn turn_on(&self) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        st.running = true;
        st.power_kw = self.nominal_power_kw;
        Ok(())
    }

    async fn turn_off(&self) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        st.running = false;
        st.power_kw = 0.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn on_off_round_trip() {
        let pump = SimulatedPoolPump::new(1.1, Some(28.0));
        pump.turn_on().await.unwrap();
        assert!(pump.read_state().await.unwrap().running);
        pump.turn_off().await.unwrap();
        let st = pump.read_state().await.unwrap();
        assert!(!st.running);
        assert_eq!(st.power_kw, 0.0);
    }
}
