//! Repository implementations for database operations

pub mod config;
pub mod evolution_log;
pub mod model_versions;

pub use config::*;
pub use evolution_log::*;
pub use model_versions::*;
