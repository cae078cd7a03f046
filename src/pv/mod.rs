pub mod clearsky;
pub mod predictor;

pub use clearsky::ClearSkyModel;
pub use predictor::PvPredictor;
