pub mod charger;
pub mod clock;
pub mod hvac;
pub mod pool_pump;
pub mod power_meter;
pub mod types;
pub mod water_heater;

pub use charger::*;
pub use clock::*;
pub use hvac::*;
pub use pool_pump::*;
pub use power_meter::*;
pub use types::*;
pub use water_heater::*;
