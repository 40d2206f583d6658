//! Compute engine seam.
//!
//! A worker owns at most one engine, created by `prepare`. The engine is
//! shared between the dispatch loop and the run thread, so every method
//! takes `&self` and pause/stop must be observable from a running `run`.
//!
//! - `native`: built-in real-valued GA used when no external engine is wired in

pub mod native;
#[cfg(test)]
pub(crate) mod stub;

use anyhow::Result;
use gaia_ga_protocol::{BestResult, GenerationStats};
use serde_json::Value;
use std::sync::Arc;

use crate::device::DeviceContext;

/// Called by the engine once per finished generation.
pub type GenerationCallback = Arc<dyn Fn(u64, GenerationStats) + Send + Sync>;

pub trait Engine: Send + Sync {
    /// One-time setup after construction (initial population, kernels, ...).
    fn prepare(&self) -> Result<()>;

    /// Clear a pending pause/stop. Called synchronously before each `run` is
    /// handed to its thread, so a pause/stop issued right after it is kept.
    fn resume(&self);

    /// Blocks until the run completes or observes a pause/stop request.
    /// Never clears a pause/stop itself.
    fn run(&self, mutation_rate: f64, crossover_rate: f64) -> Result<()>;

    fn pause(&self);

    fn stop(&self);

    fn restore(&self, state: &[u8]) -> Result<()>;

    fn save(&self, destination: &str) -> Result<()>;

    fn best(&self) -> Result<BestResult>;

    fn statistics(&self) -> Result<Value>;
}

pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        options: Value,
        context: DeviceContext,
        on_generation: GenerationCallback,
    ) -> Result<Arc<dyn Engine>>;
}
