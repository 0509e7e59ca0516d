//! Botfleet Core: research job model, time source, configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod model;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DataPaths, FleetConfig, OrchestratorConfig};
pub use error::{Error, Result};
pub use model::*;
