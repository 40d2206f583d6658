//! Native real-valued GA, the engine a worker runs when no external one is plugged in.
//!
//! - Tournament selection, uniform crossover, per-gene Gaussian mutation, elitism
//! - Fitness evaluated in parallel across the population (rayon)
//! - Pause/stop are observed between generations; pause keeps progress

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gaia_ga_protocol::{BestResult, GenerationStats};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::{Engine, EngineFactory, GenerationCallback};
use crate::device::DeviceContext;

const RUNNING: u8 = 0;
const PAUSED: u8 = 1;
const STOPPED: u8 = 2;

/// Generations kept for `statistics` and in saved state.
const HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Sphere,
    Rastrigin,
    Rosenbrock,
}

impl Objective {
    /// Negated benchmark value, so higher is better.
    pub fn fitness(&self, x: &[f64]) -> f64 {
        let value: f64 = match self {
            Objective::Sphere => x.iter().map(|v| v * v).sum(),
            Objective::Rastrigin => {
                10.0 * x.len() as f64
                    + x.iter()
                        .map(|v| v * v - 10.0 * (2.0 * std::f64::consts::PI * v).cos())
                        .sum::<f64>()
            }
            Objective::Rosenbrock => x
                .windows(2)
                .map(|w| 100.0 * (w[1] - w[0] * w[0]).powi(2) + (1.0 - w[0]).powi(2))
                .sum(),
        };
        -value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeGaOptions {
    pub population: usize,
    pub dimensions: usize,
    /// Generation count at which a run completes.
    pub generations: u64,
    pub objective: Objective,
    pub lower: f64,
    pub upper: f64,
    pub tournament: usize,
    pub elitism: usize,
    /// Mutation step as a fraction of the search range.
    pub mutation_scale: f64,
    pub seed: Option<u64>,
}

impl Default for NativeGaOptions {
    fn default() -> Self {
        Self {
            population: 64,
            dimensions: 16,
            generations: 100,
            objective: Objective::Sphere,
            lower: -5.12,
            upper: 5.12,
            tournament: 3,
            elitism: 1,
            mutation_scale: 0.1,
            seed: None,
        }
    }
}

impl NativeGaOptions {
    fn validate(&self) -> Result<()> {
        if self.population < 2 {
            anyhow::bail!("population must be at least 2, got {}", self.population);
        }
        if self.dimensions == 0 {
            anyhow::bail!("dimensions must be positive");
        }
        if !(self.lower < self.upper) {
            anyhow::bail!("lower bound {} must be below upper bound {}", self.lower, self.upper);
        }
        if self.tournament == 0 {
            anyhow::bail!("tournament size must be positive");
        }
        if self.elitism >= self.population {
            anyhow::bail!("elitism {} must be below population {}", self.elitism, self.population);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Elite {
    chromosome: Vec<f64>,
    fitness: f64,
}

/// Everything `save` persists and `restore` reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Population {
    generation: u64,
    evaluations: u64,
    individuals: Vec<Vec<f64>>,
    fitness: Vec<f64>,
    best: Option<Elite>,
    /// Most recent generations only, at most `HISTORY_LIMIT`.
    history: VecDeque<GenerationStats>,
}

impl Population {
    fn record(&mut self) -> GenerationStats {
        let stats = summarize(&self.fitness);
        let leader = self
            .fitness
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, f)| (i, *f));
        if let Some((idx, fitness)) = leader {
            if self.best.as_ref().map_or(true, |b| fitness > b.fitness) {
                self.best = Some(Elite { chromosome: self.individuals[idx].clone(), fitness });
            }
        }
        while self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(stats);
        stats
    }
}

fn summarize(fitness: &[f64]) -> GenerationStats {
    let best = fitness.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let worst = fitness.iter().cloned().fold(f64::INFINITY, f64::min);
    let avg = fitness.iter().sum::<f64>() / fitness.len().max(1) as f64;
    GenerationStats { best, avg, worst }
}

fn evaluate(objective: Objective, individuals: &[Vec<f64>]) -> Vec<f64> {
    individuals
        .par_iter()
        .map(|c| {
            let f = objective.fitness(c);
            if f.is_finite() { f } else { -1e300 }
        })
        .collect()
}

/// Gaussian sample via Box-Muller.
fn randn(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-10);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn tournament<'a>(pop: &'a Population, size: usize, rng: &mut impl Rng) -> &'a [f64] {
    let n = pop.individuals.len();
    let mut winner = rng.gen_range(0..n);
    for _ in 1..size {
        let challenger = rng.gen_range(0..n);
        if pop.fitness[challenger] > pop.fitness[winner] {
            winner = challenger;
        }
    }
    &pop.individuals[winner]
}

fn breed(
    opts: &NativeGaOptions,
    pop: &Population,
    rng: &mut impl Rng,
    mutation_rate: f64,
    crossover_rate: f64,
) -> Vec<Vec<f64>> {
    let mut order: Vec<usize> = (0..pop.individuals.len()).collect();
    order.sort_by(|a, b| pop.fitness[*b].total_cmp(&pop.fitness[*a]));

    let mut next: Vec<Vec<f64>> = order
        .iter()
        .take(opts.elitism)
        .map(|&i| pop.individuals[i].clone())
        .collect();

    let step = opts.mutation_scale * (opts.upper - opts.lower);
    while next.len() < opts.population {
        let mother = tournament(pop, opts.tournament, rng);
        let mut child: Vec<f64> = if rng.gen_bool(crossover_rate.clamp(0.0, 1.0)) {
            let father = tournament(pop, opts.tournament, rng);
            mother
                .iter()
                .zip(father)
                .map(|(m, f)| if rng.gen_bool(0.5) { *m } else { *f })
                .collect()
        } else {
            mother.to_vec()
        };
        for gene in child.iter_mut() {
            if rng.gen_bool(mutation_rate.clamp(0.0, 1.0)) {
                *gene = (*gene + randn(rng) * step).clamp(opts.lower, opts.upper);
            }
        }
        next.push(child);
    }
    next
}

pub struct NativeGa {
    options: NativeGaOptions,
    device: String,
    state: Mutex<Option<Population>>,
    rng: Mutex<StdRng>,
    control: AtomicU8,
    started_at: DateTime<Utc>,
    on_generation: GenerationCallback,
}

impl NativeGa {
    pub fn new(
        options: NativeGaOptions,
        device: String,
        on_generation: GenerationCallback,
    ) -> Result<Self> {
        options.validate()?;
        let seed = options.seed.unwrap_or_else(rand::random);
        Ok(Self {
            options,
            device,
            state: Mutex::new(None),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            control: AtomicU8::new(RUNNING),
            started_at: Utc::now(),
            on_generation,
        })
    }

    fn step(&self, mutation_rate: f64, crossover_rate: f64) -> Result<(u64, GenerationStats)> {
        let mut guard = self.state.lock();
        let pop = guard.as_mut().context("engine is not prepared")?;
        let next = breed(&self.options, pop, &mut *self.rng.lock(), mutation_rate, crossover_rate);
        pop.fitness = evaluate(self.options.objective, &next);
        pop.individuals = next;
        pop.generation += 1;
        pop.evaluations += pop.individuals.len() as u64;
        let stats = pop.record();
        Ok((pop.generation, stats))
    }

    fn generation(&self) -> u64 {
        self.state.lock().as_ref().map_or(0, |p| p.generation)
    }
}

impl Engine for NativeGa {
    fn prepare(&self) -> Result<()> {
        let opts = &self.options;
        let individuals: Vec<Vec<f64>> = {
            let mut rng = self.rng.lock();
            (0..opts.population)
                .map(|_| {
                    (0..opts.dimensions)
                        .map(|_| rng.gen_range(opts.lower..opts.upper))
                        .collect()
                })
                .collect()
        };
        let mut pop = Population {
            generation: 0,
            evaluations: individuals.len() as u64,
            fitness: evaluate(opts.objective, &individuals),
            individuals,
            best: None,
            history: VecDeque::new(),
        };
        pop.record();
        *self.state.lock() = Some(pop);
        tracing::info!(
            device = %self.device,
            population = opts.population,
            dimensions = opts.dimensions,
            objective = ?opts.objective,
            "Native GA prepared"
        );
        Ok(())
    }

    fn resume(&self) {
        self.control.store(RUNNING, Ordering::SeqCst);
    }

    fn run(&self, mutation_rate: f64, crossover_rate: f64) -> Result<()> {
        while self.generation() < self.options.generations {
            match self.control.load(Ordering::SeqCst) {
                PAUSED => {
                    tracing::info!(generation = self.generation(), "Native GA paused");
                    break;
                }
                STOPPED => {
                    tracing::info!(generation = self.generation(), "Native GA stopped");
                    break;
                }
                _ => {}
            }
            let (index, stats) = self.step(mutation_rate, crossover_rate)?;
            (self.on_generation)(index, stats);
        }
        Ok(())
    }

    fn pause(&self) {
        self.control.store(PAUSED, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.control.store(STOPPED, Ordering::SeqCst);
    }

    fn restore(&self, state: &[u8]) -> Result<()> {
        let pop: Population = serde_json::from_slice(state).context("Malformed GA state")?;
        if pop.individuals.is_empty() || pop.individuals.len() != pop.fitness.len() {
            anyhow::bail!(
                "GA state has {} individuals but {} fitness values",
                pop.individuals.len(),
                pop.fitness.len()
            );
        }
        if let Some(bad) = pop.individuals.iter().find(|c| c.len() != self.options.dimensions) {
            anyhow::bail!(
                "GA state has chromosomes of length {}, expected {}",
                bad.len(),
                self.options.dimensions
            );
        }
        tracing::info!(generation = pop.generation, "Native GA state restored");
        *self.state.lock() = Some(pop);
        Ok(())
    }

    fn save(&self, destination: &str) -> Result<()> {
        let bytes = {
            let guard = self.state.lock();
            let pop = guard.as_ref().context("engine is not prepared")?;
            serde_json::to_vec(pop)?
        };
        std::fs::write(destination, bytes)
            .with_context(|| format!("Failed to write GA state to {destination}"))?;
        Ok(())
    }

    fn best(&self) -> Result<BestResult> {
        let guard = self.state.lock();
        let best = guard
            .as_ref()
            .and_then(|p| p.best.as_ref())
            .context("no chromosome evaluated yet")?;
        Ok(BestResult {
            chromosome: json!(best.chromosome),
            fitness: best.fitness,
        })
    }

    fn statistics(&self) -> Result<Value> {
        let guard = self.state.lock();
        let pop = guard.as_ref().context("engine is not prepared")?;
        Ok(json!({
            "device": self.device,
            "generation": pop.generation,
            "evaluations": pop.evaluations,
            "best_fitness": pop.best.as_ref().map(|b| b.fitness),
            "started_at": self.started_at.to_rfc3339(),
            "history": pop.history,
        }))
    }
}

pub struct NativeGaFactory;

impl EngineFactory for NativeGaFactory {
    fn create(
        &self,
        options: Value,
        context: DeviceContext,
        on_generation: GenerationCallback,
    ) -> Result<Arc<dyn Engine>> {
        let options: NativeGaOptions =
            serde_json::from_value(options).context("Invalid native GA options")?;
        let engine = NativeGa::new(options, context.device.name.clone(), on_generation)?;
        Ok(Arc::new(engine))
    }
}
