//! Deterministic engine for exercising the worker without a real GA.

use anyhow::Result;
use gaia_ga_protocol::{BestResult, GenerationStats};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Engine, EngineFactory, GenerationCallback};
use crate::device::DeviceContext;

/// Everything the worker asked of the engines built by one factory.
#[derive(Default)]
pub struct StubLog {
    pub created: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
}

impl StubLog {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[derive(Clone, Default)]
pub struct StubFactory {
    pub log: Arc<StubLog>,
    /// Generations emitted per `run`.
    pub generations: u64,
    /// Pause between generations, to keep a run observable.
    pub step_delay: Duration,
}

impl StubFactory {
    pub fn new(generations: u64) -> Self {
        Self { generations, ..Default::default() }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl EngineFactory for StubFactory {
    fn create(
        &self,
        options: Value,
        _context: DeviceContext,
        on_generation: GenerationCallback,
    ) -> Result<Arc<dyn Engine>> {
        if options.get("fail_prepare").and_then(Value::as_bool).unwrap_or(false) {
            anyhow::bail!("stub engine refused options");
        }
        self.log.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubEngine {
            log: self.log.clone(),
            generations: self.generations,
            step_delay: self.step_delay,
            on_generation,
            halted: AtomicBool::new(false),
        }))
    }
}

pub struct StubEngine {
    log: Arc<StubLog>,
    generations: u64,
    step_delay: Duration,
    on_generation: GenerationCallback,
    halted: AtomicBool,
}

impl Engine for StubEngine {
    fn prepare(&self) -> Result<()> {
        self.log.record("prepare");
        Ok(())
    }

    fn run(&self, mutation_rate: f64, crossover_rate: f64) -> Result<()> {
        self.log.record(format!("run {mutation_rate} {crossover_rate}"));
        for index in 1..=self.generations {
            if self.halted.load(Ordering::SeqCst) {
                break;
            }
            let best = index as f64;
            (self.on_generation)(index, GenerationStats { best, avg: best / 2.0, worst: 0.0 });
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
        }
        Ok(())
    }

    fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.log.record("pause");
        self.halted.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.log.record("stop");
        self.halted.store(true, Ordering::SeqCst);
    }

    fn restore(&self, state: &[u8]) -> Result<()> {
        self.log.record(format!("restore {}", state.len()));
        Ok(())
    }

    fn save(&self, destination: &str) -> Result<()> {
        self.log.record(format!("save {destination}"));
        Ok(())
    }

    fn best(&self) -> Result<BestResult> {
        self.log.record("best");
        Ok(BestResult { chromosome: json!([1, 2, 3]), fitness: self.generations as f64 })
    }

    fn statistics(&self) -> Result<Value> {
        self.log.record("statistics");
        Ok(json!({ "generations": self.generations }))
    }
}
