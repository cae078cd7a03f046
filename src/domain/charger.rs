use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::types::{DeviceError, DeviceResult};

/// EV charger abstraction; the car's state of charge arrives through the
/// charger state (OBD link or charger telemetry, the scheduler does not care)
#[async_trait]
pub trait EvCharger: Send + Sync {
    async fn read_state(&self) -> DeviceResult<ChargerState>;
    /// Set the charging current set-point; idempotent
    async fn set_current(&self, amps: f64) -> DeviceResult<()>;
    /// Begin a charging session; idempotent, no-op while charging
    async fn start_charging(&self) -> DeviceResult<()>;
    /// End the session; idempotent, no-op while stopped
    async fn stop_charging(&self) -> DeviceResult<()>;
    fn capabilities(&self) -> ChargerCapabilities;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerState {
    pub connected: bool,
    pub charging: bool,
    pub current_amps: f64,
    pub power_kw: f64,
    pub vehicle_soc_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerCapabilities {
    pub min_current_a: f64,
    pub max_current_a: f64,
    pub voltage_v: f64,
    pub phases: u8,
}

impl ChargerCapabilities {
    pub fn power_at_amps_kw(&self, amps: f64) -> f64 {
        amps * self.voltage_v * self.phases as f64 / 1000.0
    }

    pub fn amps_for_power_kw(&self, kw: f64) -> f64 {
        kw * 1000.0 / (self.voltage_v * self.phases as f64)
    }
}

/// Simulated charger for development and testing
pub struct SimulatedEvCharger {
    state: RwLock<ChargerState>,
    caps: ChargerCapabilities,
}

impl SimulatedEvCharger {
    pub fn new(caps: ChargerCapabilities) -> Self {
        Self {
            state: RwLock::new(ChargerState {
                connected: false,
                charging: false,
                current_amps: 0.0,
                power_kw: 0.0,
                vehicle_soc_percent: None,
            }),
            caps,
        }
    }

    /// Simulate a vehicle plugging in at the given state of charge
    pub async fn connect_vehicle(&self, soc_percent: f64) {
        let mut st = self.state.write().await;
        st.connected = true;
        st.vehicle_soc_percent = Some(soc_percent);
    }

    pub async fn disconnect_vehicle(&self) {
        let mut st = self.state.write().await;
        st.connected = false;
        st.charging = false;
        st.current_amps = 0.0;
        st.power_kw = 0.0;
        st.vehicle_soc_percent = None;
    }

    pub async fn set_soc(&self, soc_percent: f64) {
        self.state.write().await.vehicle_soc_percent = Some(soc_percent);
    }
}

#[async_trait]
impl EvCharger for SimulatedEvCharger {
    async fn read_state(&self) -> DeviceResult<ChargerState> {
        Ok(self.state.read().await.clone())
    }

    async fn set_current(&self, amps: f64) -> DeviceResult<()> {
        if !amps.is_finite() || amps < 0.0 {
            return Err(DeviceError::Protocol(format!("bad current {amps}")));
        }
        let amps = amps.clamp(self.caps.min_current_a, self.caps.max_current_a);
        let mut st = self.state.write().await;
        st.current_amps = amps;
        if st.charging {
            st.power_kw = self.caps.power_at_amps_kw(amps);
        }
        Ok(())
    }

    async fn start_charging(&self) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        if !st.connected {
            return Err(DeviceError::Unavailable("vehicle not connected".into()));
        }
        st.charging = true;
        if st.current_amps == 0.0 {
            st.current_amps = self.caps.min_current_a;
        }
        st.power_kw = self.caps.power_at_amps_kw(st.current_amps);
        Ok(())
    }

    async fn stop_charging(&self) -> DeviceResult<()> {
        let mut st = self.state.write().await;
        st.charging = false;
        st.power_kw = 0.0;
        Ok(())
    }

    fn capabilities(&self) -> ChargerCapabilities {
        self.caps.clone()
    }
}
