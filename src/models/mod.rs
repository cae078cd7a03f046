pub mod home;
pub mod hvac;

pub use home::HomeModel;
pub use hvac::{HvacModel, HvacPoint};
