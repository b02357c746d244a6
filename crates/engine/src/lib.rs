//! Trading organism engine: backtesting, scoring, evolution and promotion
//!
//! Provides:
//! - Indicator preprocessing and the confidence-weighted signal rule
//! - A single-position bar-by-bar execution simulator
//! - Risk-adjusted metrics over equity traces
//! - A seeded evolutionary parameter search
//! - The promotion orchestrator and its worker loop, with SQLite, HTTP and
//!   in-memory collaborators

pub mod api;
pub mod config;
pub mod engine;
pub mod evolution;
pub mod fees;
pub mod indicators;
pub mod metrics;
pub mod promotion;
pub mod store;
pub mod strategy;
pub mod synthetic;
pub mod types;

// Re-exports for convenience
pub use api::{
    HttpReloadSignal, LogOnlyReload, Notifier, ReloadError, ReloadSignal, WebhookNotifier,
};
pub use config::{ConfigError, WorkerConfig};
pub use engine::{BacktestEngine, SimulationConfig, SimulationResult};
pub use evolution::{
    evolve_generation, CandidateResult, EvolutionError, EvolutionSettings, GenerationResult,
    ParamSet,
};
pub use fees::ExecutionCosts;
pub use indicators::{IndicatedSeries, IndicatorError};
pub use metrics::compute_metrics;
pub use promotion::{
    decide, run_worker, BackoffPolicy, Collaborators, CycleError, CycleReport,
    OrchestratorSettings, PromotionDecision, PromotionOrchestrator, PromotionPolicy, WorkerState,
};
pub use store::{
    ConfigStore, EvolutionJournal, InMemoryStores, ModelStore, SqliteStores, StoreError,
};
pub use strategy::{evaluate_signal, SignalConfig, SignalFault, SignalOutcome};
pub use synthetic::{BarSource, RandomWalkSource, StaticSource};
pub use types::*;
