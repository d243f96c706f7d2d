//! # Flex-Search
//!
//! Continuous evolutionary search over electrode positions and the current
//! split. Individuals are `[e1, e2, e3, e4, ratio]` gene vectors (see
//! [`SearchSpace`]), repaired to four distinct electrodes before every
//! evaluation.
//!
//! ## Optimizers
//!
//! | Optimizer | Operators |
//! |-----------|-----------|
//! | Differential evolution | rand/1/bin or best/1/bin, dithered F, greedy replacement |
//! | Genetic algorithm | tournament selection, slot crossover, random reset, elitism |
//!
//! With [`OptimizerChoice::Auto`] DE is probed first and the GA takes over
//! when DE cannot run. Several independent starts may run in parallel; the
//! best is chosen once all have finished.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tiopt_core::{
    derive_seed, CancellationToken, Candidate, ElectrodeCatalog, EvaluationCache, FailurePolicy,
    FailureTally, GenerationRecord, Goal, Leadfield, Milliamps, Montage, Result, RunStatus,
    SearchSpace, TargetRegion, TiError, ELECTRODES_PER_MONTAGE,
};
use tiopt_field::{score, Metrics, ScalarObjective, Scored};
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Which optimizer each start uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerChoice {
    /// DE, falling back to the GA when DE is unavailable
    #[default]
    Auto,
    DifferentialEvolution,
    Genetic,
}

/// DE mutation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeStrategy {
    #[default]
    Rand1Bin,
    Best1Bin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeSettings {
    pub strategy: DeStrategy,
    /// Differential weight range, re-drawn each generation
    pub mutation: (f64, f64),
    pub crossover_rate: f64,
}

impl Default for DeSettings {
    fn default() -> Self {
        Self {
            strategy: DeStrategy::Rand1Bin,
            mutation: (0.5, 1.0),
            crossover_rate: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaSettings {
    pub tournament_size: usize,
    pub crossover_rate: f64,
    /// Per-gene reset probability
    pub mutation_rate: f64,
}

impl Default for GaSettings {
    fn default() -> Self {
        Self {
            tournament_size: 3,
            crossover_rate: 0.9,
            mutation_rate: 0.2,
        }
    }
}

/// Stop when the best cost improves by less than `epsilon` for `patience`
/// consecutive generations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Convergence {
    pub epsilon: f64,
    pub patience: usize,
}

impl Default for Convergence {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            patience: 15,
        }
    }
}

/// Flex-search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlexConfig {
    pub population_size: usize,
    pub max_generations: usize,
    pub num_starts: usize,
    pub seed: u64,
    pub optimizer: OptimizerChoice,
    pub de: DeSettings,
    pub ga: GaSettings,
    pub convergence: Convergence,
    pub failure: FailurePolicy,
}

impl Default for FlexConfig {
    fn default() -> Self {
        Self {
            population_size: 32,
            max_generations: 200,
            num_starts: 1,
            seed: 42,
            optimizer: OptimizerChoice::Auto,
            de: DeSettings::default(),
            ga: GaSettings::default(),
            convergence: Convergence::default(),
            failure: FailurePolicy::default(),
        }
    }
}

impl FlexConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_population(mut self, population_size: usize) -> Self {
        self.population_size = population_size;
        self
    }

    pub fn with_generations(mut self, max_generations: usize) -> Self {
        self.max_generations = max_generations;
        self
    }

    pub fn with_starts(mut self, num_starts: usize) -> Self {
        self.num_starts = num_starts;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerChoice) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_starts == 0 {
            return Err(TiError::InvalidConfig("num_starts must be at least 1".into()));
        }
        if self.max_generations == 0 {
            return Err(TiError::InvalidConfig("max_generations must be at least 1".into()));
        }
        if self.population_size == 0 {
            return Err(TiError::InvalidConfig("population_size must be at least 1".into()));
        }
        let (lo, hi) = self.de.mutation;
        if !(lo > 0.0 && lo <= hi && hi <= 2.0) {
            return Err(TiError::InvalidConfig(format!(
                "DE mutation range must satisfy 0 < lo <= hi <= 2, got ({}, {})",
                lo, hi
            )));
        }
        for (name, p) in [
            ("DE crossover rate", self.de.crossover_rate),
            ("GA crossover rate", self.ga.crossover_rate),
            ("GA mutation rate", self.ga.mutation_rate),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(TiError::InvalidConfig(format!("{} must lie in [0, 1], got {}", name, p)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// PROBLEM
// ============================================================================

/// Evaluation outcome cached per candidate; errors carry their message
pub type Evaluation = std::result::Result<Scored, String>;

fn cost_of(evaluation: &Evaluation) -> f64 {
    evaluation.as_ref().map_or(f64::INFINITY, |s| s.cost)
}

/// Everything an optimizer needs to score gene vectors
pub struct FlexProblem<'a> {
    pub leadfield: &'a Leadfield,
    pub region: &'a TargetRegion,
    pub objective: ScalarObjective,
    pub space: SearchSpace,
    pub failure: FailurePolicy,
}

/// Per-start bookkeeping: cache, failure tally, history
#[derive(Default)]
struct Trace {
    cache: EvaluationCache<Evaluation>,
    tally: FailureTally,
    history: Vec<GenerationRecord>,
}

struct BatchCosts {
    costs: Vec<f64>,
    evaluations: usize,
    failures: usize,
    /// Set once the failure budget is exceeded
    aborted: Option<String>,
}

impl Trace {
    fn record(&mut self, generation: usize, population_costs: &[f64], batch: &BatchCosts) {
        let finite: Vec<f64> = population_costs.iter().copied().filter(|c| c.is_finite()).collect();
        let best_cost = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let mean_cost = if finite.is_empty() {
            f64::INFINITY
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };
        debug!(generation, best_cost, mean_cost, failures = batch.failures, "Generation complete");
        self.history.push(GenerationRecord {
            generation,
            best_cost,
            mean_cost,
            evaluations: batch.evaluations,
            failures: batch.failures,
        });
    }
}

impl<'a> FlexProblem<'a> {
    /// Costs in input order; only fresh evaluations count against the
    /// failure budget
    fn evaluate(&self, trace: &mut Trace, genes: &[Vec<f64>]) -> BatchCosts {
        let candidates: Vec<Candidate> = genes.iter().map(|g| self.space.decode(g)).collect();
        let (evals, fresh) = trace.cache.evaluate_batch_counted(
            &candidates,
            |m| score(m, self.leadfield, self.region, &self.objective).map_err(|e| e.to_string()),
            |e: &Evaluation| e.is_err(),
        );
        trace.tally.record(fresh.evaluated, fresh.failed);
        let aborted = if trace.tally.exceeds(&self.failure) {
            Some(trace.tally.to_error().to_string())
        } else {
            None
        };
        BatchCosts {
            costs: evals.iter().map(cost_of).collect(),
            evaluations: fresh.evaluated,
            failures: fresh.failed,
            aborted,
        }
    }
}

fn argmin(costs: &[f64]) -> usize {
    costs
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Convergence bookkeeping shared by both optimizers
struct Stagnation {
    best: f64,
    stale: usize,
}

impl Stagnation {
    fn new(best: f64) -> Self {
        Self { best, stale: 0 }
    }

    /// Returns true once the run has converged
    fn update(&mut self, best: f64, convergence: &Convergence) -> bool {
        if self.best - best > convergence.epsilon {
            self.stale = 0;
        } else {
            self.stale += 1;
        }
        self.best = self.best.min(best);
        convergence.patience > 0 && self.stale >= convergence.patience
    }
}

/// Raw result of one optimizer run
pub struct StartOutcome {
    pub best_genes: Vec<f64>,
    pub initial_best: f64,
    pub generations: usize,
    pub cancelled: bool,
    /// Failure budget exceeded; the run stopped early
    pub aborted: Option<String>,
    pub evaluations: usize,
    pub history: Vec<GenerationRecord>,
    best: Option<Evaluation>,
    candidate: Candidate,
}

impl StartOutcome {
    fn finish(
        problem: &FlexProblem<'_>,
        trace: Trace,
        best_genes: Vec<f64>,
        initial_best: f64,
        generations: usize,
        cancelled: bool,
        aborted: Option<String>,
    ) -> Self {
        let candidate = problem.space.decode(&best_genes);
        Self {
            best: trace.cache.get(&candidate.key).cloned(),
            evaluations: trace.cache.misses(),
            history: trace.history,
            candidate,
            best_genes,
            initial_best,
            generations,
            cancelled,
            aborted,
        }
    }
}

// ============================================================================
// OPTIMIZERS
// ============================================================================

/// Strategy seam for continuous optimizers
pub trait ContinuousOptimizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Can this optimizer run on `problem` with its settings?
    fn probe(&self, problem: &FlexProblem<'_>) -> Result<()>;

    fn optimize(&self, problem: &FlexProblem<'_>, seed: u64, cancel: &CancellationToken) -> Result<StartOutcome>;
}

/// Differential evolution with deferred, generation-wide evaluation
pub struct DifferentialEvolution {
    pub population_size: usize,
    pub max_generations: usize,
    pub settings: DeSettings,
    pub convergence: Convergence,
}

impl DifferentialEvolution {
    pub fn from_config(config: &FlexConfig) -> Self {
        Self {
            population_size: config.population_size,
            max_generations: config.max_generations,
            settings: config.de.clone(),
            convergence: config.convergence,
        }
    }
}

fn distinct_indices<R: Rng>(rng: &mut R, n: usize, exclude: usize, k: usize) -> Vec<usize> {
    let mut picked = Vec::with_capacity(k);
    while picked.len() < k {
        let r = rng.gen_range(0..n);
        if r != exclude && !picked.contains(&r) {
            picked.push(r);
        }
    }
    picked
}

fn binomial_crossover<R: Rng>(target: &[f64], mutant: &[f64], cr: f64, rng: &mut R) -> Vec<f64> {
    let jrand = rng.gen_range(0..target.len());
    target
        .iter()
        .zip(mutant)
        .enumerate()
        .map(|(j, (&t, &m))| if j == jrand || rng.gen::<f64>() < cr { m } else { t })
        .collect()
}

impl ContinuousOptimizer for DifferentialEvolution {
    fn name(&self) -> &'static str {
        "differential-evolution"
    }

    fn probe(&self, _problem: &FlexProblem<'_>) -> Result<()> {
        if self.population_size < 4 {
            return Err(TiError::InvalidConfig(format!(
                "differential evolution needs a population of at least 4, got {}",
                self.population_size
            )));
        }
        Ok(())
    }

    fn optimize(&self, problem: &FlexProblem<'_>, seed: u64, cancel: &CancellationToken) -> Result<StartOutcome> {
        self.probe(problem)?;
        let space = &problem.space;
        let n = self.population_size;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut trace = Trace::default();

        let mut population: Vec<Vec<f64>> = (0..n).map(|_| space.random_genes(&mut rng)).collect();
        let initial = problem.evaluate(&mut trace, &population);
        let mut energies = initial.costs.clone();
        if initial.aborted.is_none() && energies.iter().all(|e| !e.is_finite()) {
            return Err(TiError::InvalidConfig(
                "no finite energy in the initial DE population".into(),
            ));
        }
        trace.record(0, &energies, &initial);
        let mut aborted = initial.aborted;

        let mut best = argmin(&energies);
        let initial_best = energies[best];
        let mut stagnation = Stagnation::new(initial_best);
        let mut generations = 0;
        let mut cancelled = false;
        let (f_lo, f_hi) = self.settings.mutation;

        for generation in 1..=self.max_generations {
            if aborted.is_some() {
                break;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let f = if f_hi > f_lo { rng.gen_range(f_lo..=f_hi) } else { f_lo };
            let trials: Vec<Vec<f64>> = (0..n)
                .map(|i| {
                    let mutant: Vec<f64> = match self.settings.strategy {
                        DeStrategy::Rand1Bin => {
                            let r = distinct_indices(&mut rng, n, i, 3);
                            (0..space.dimension())
                                .map(|j| {
                                    population[r[0]][j] + f * (population[r[1]][j] - population[r[2]][j])
                                })
                                .collect()
                        }
                        DeStrategy::Best1Bin => {
                            let r = distinct_indices(&mut rng, n, i, 2);
                            (0..space.dimension())
                                .map(|j| population[best][j] + f * (population[r[0]][j] - population[r[1]][j]))
                                .collect()
                        }
                    };
                    let mut trial = binomial_crossover(&population[i], &mutant, self.settings.crossover_rate, &mut rng);
                    space.repair(&mut trial);
                    trial
                })
                .collect();

            let batch = problem.evaluate(&mut trace, &trials);
            for (i, trial) in trials.into_iter().enumerate() {
                if batch.costs[i] < energies[i] {
                    population[i] = trial;
                    energies[i] = batch.costs[i];
                }
            }
            trace.record(generation, &energies, &batch);

            best = argmin(&energies);
            generations = generation;
            aborted = batch.aborted;
            if aborted.is_some() {
                break;
            }
            if stagnation.update(energies[best], &self.convergence) {
                debug!(generation, "DE converged");
                break;
            }
        }

        let best_genes = population[best].clone();
        Ok(StartOutcome::finish(
            problem,
            trace,
            best_genes,
            initial_best,
            generations,
            cancelled,
            aborted,
        ))
    }
}

/// Genetic algorithm fallback
pub struct GeneticAlgorithm {
    pub population_size: usize,
    pub max_generations: usize,
    pub settings: GaSettings,
    pub convergence: Convergence,
}

impl GeneticAlgorithm {
    pub fn from_config(config: &FlexConfig) -> Self {
        Self {
            population_size: config.population_size,
            max_generations: config.max_generations,
            settings: config.ga.clone(),
            convergence: config.convergence,
        }
    }
}

fn tournament<R: Rng>(costs: &[f64], size: usize, rng: &mut R) -> usize {
    (0..size)
        .map(|_| rng.gen_range(0..costs.len()))
        .min_by(|&a, &b| costs[a].partial_cmp(&costs[b]).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or(0)
}

/// Single cut at an electrode slot boundary
fn slot_crossover<R: Rng>(a: &[f64], b: &[f64], space: &SearchSpace, rng: &mut R) -> Vec<f64> {
    let cut = space.slot_genes(rng.gen_range(1..ELECTRODES_PER_MONTAGE)).start;
    a[..cut].iter().chain(&b[cut..]).copied().collect()
}

impl GeneticAlgorithm {
    fn mutate<R: Rng>(&self, genes: &mut [f64], space: &SearchSpace, rng: &mut R) {
        for slot in 0..ELECTRODES_PER_MONTAGE {
            if rng.gen::<f64>() < self.settings.mutation_rate {
                space.reset_slot(genes, slot, rng);
            }
        }
        let ratio = space.ratio_gene();
        if rng.gen::<f64>() < self.settings.mutation_rate {
            let (lo, hi) = space.bounds()[ratio];
            genes[ratio] = rng.gen_range(lo..=hi);
        }
    }
}

impl ContinuousOptimizer for GeneticAlgorithm {
    fn name(&self) -> &'static str {
        "genetic"
    }

    fn probe(&self, _problem: &FlexProblem<'_>) -> Result<()> {
        if self.population_size < 2 {
            return Err(TiError::InvalidConfig("genetic algorithm needs a population of at least 2".into()));
        }
        if self.settings.tournament_size == 0 {
            return Err(TiError::InvalidConfig("tournament size must be at least 1".into()));
        }
        Ok(())
    }

    fn optimize(&self, problem: &FlexProblem<'_>, seed: u64, cancel: &CancellationToken) -> Result<StartOutcome> {
        self.probe(problem)?;
        let space = &problem.space;
        let n = self.population_size;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut trace = Trace::default();

        let mut population: Vec<Vec<f64>> = (0..n).map(|_| space.random_genes(&mut rng)).collect();
        let initial = problem.evaluate(&mut trace, &population);
        let mut costs = initial.costs.clone();
        trace.record(0, &costs, &initial);
        let mut aborted = initial.aborted;

        let initial_best = costs[argmin(&costs)];
        let mut stagnation = Stagnation::new(initial_best);
        let mut generations = 0;
        let mut cancelled = false;

        for generation in 1..=self.max_generations {
            if aborted.is_some() {
                break;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let elite = argmin(&costs);
            let mut next = Vec::with_capacity(n);
            next.push(population[elite].clone());
            while next.len() < n {
                let a = tournament(&costs, self.settings.tournament_size, &mut rng);
                let b = tournament(&costs, self.settings.tournament_size, &mut rng);
                let mut child = if rng.gen::<f64>() < self.settings.crossover_rate {
                    slot_crossover(&population[a], &population[b], space, &mut rng)
                } else {
                    population[a].clone()
                };
                self.mutate(&mut child, space, &mut rng);
                space.repair(&mut child);
                next.push(child);
            }

            let batch = problem.evaluate(&mut trace, &next);
            population = next;
            costs = batch.costs.clone();
            trace.record(generation, &costs, &batch);

            generations = generation;
            aborted = batch.aborted;
            if aborted.is_some() {
                break;
            }
            if stagnation.update(costs[argmin(&costs)], &self.convergence) {
                debug!(generation, "GA converged");
                break;
            }
        }

        let best_genes = population[argmin(&costs)].clone();
        Ok(StartOutcome::finish(
            problem,
            trace,
            best_genes,
            initial_best,
            generations,
            cancelled,
            aborted,
        ))
    }
}

// ============================================================================
// MULTI-START
// ============================================================================

/// Best montage of a start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlexSolution {
    pub montage: Montage,
    pub metrics: Metrics,
    pub cost: f64,
    pub genes: Vec<f64>,
}

/// Outcome of one independent start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReport {
    pub index: usize,
    pub seed: u64,
    pub optimizer: String,
    pub status: RunStatus,
    pub best: Option<FlexSolution>,
    pub initial_best_cost: f64,
    /// No improvement over the initial population
    pub low_confidence: bool,
    pub generations: usize,
    pub evaluations: usize,
    pub history: Vec<GenerationRecord>,
}

impl StartReport {
    fn failed(index: usize, seed: u64, optimizer: &str, reason: String) -> Self {
        Self {
            index,
            seed,
            optimizer: optimizer.to_string(),
            status: RunStatus::Failed { reason },
            best: None,
            initial_best_cost: f64::INFINITY,
            low_confidence: true,
            generations: 0,
            evaluations: 0,
            history: Vec::new(),
        }
    }

    pub fn cost(&self) -> f64 {
        self.best.as_ref().map_or(f64::INFINITY, |b| b.cost)
    }
}

/// A start that lost the best-of-N selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedStart {
    pub index: usize,
    pub cost: f64,
    /// Cost above the selected start
    pub margin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSelection {
    pub selected: usize,
    pub rejected: Vec<RejectedStart>,
}

/// Pick the lowest finite cost (earliest on ties); `None` if nothing is finite
pub fn select_best_of(costs: &[f64]) -> Option<StartSelection> {
    let selected = costs
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_finite())
        .fold(None::<(usize, f64)>, |best, (i, &c)| match best {
            Some((_, b)) if b <= c => best,
            _ => Some((i, c)),
        })?;

    let rejected = costs
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != selected.0)
        .map(|(index, &cost)| RejectedStart {
            index,
            cost,
            margin: if cost.is_finite() { cost - selected.1 } else { f64::INFINITY },
        })
        .collect();

    Some(StartSelection {
        selected: selected.0,
        rejected,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexReport {
    pub objective: String,
    pub best: Option<FlexSolution>,
    pub selection: Option<StartSelection>,
    pub starts: Vec<StartReport>,
    pub status: RunStatus,
}

/// Flex-search bound to one leadfield, region and search space
pub struct FlexSearch<'a> {
    problem: FlexProblem<'a>,
    config: FlexConfig,
}

impl<'a> FlexSearch<'a> {
    pub fn new(
        leadfield: &'a Leadfield,
        region: &'a TargetRegion,
        goal: &Goal,
        space: SearchSpace,
        config: FlexConfig,
    ) -> Result<Self> {
        config.validate()?;
        if region.voxel_count() != leadfield.voxel_count() {
            return Err(TiError::ShapeMismatch(format!(
                "region built for {} voxels, leadfield has {}",
                region.voxel_count(),
                leadfield.voxel_count()
            )));
        }
        let objective = ScalarObjective::from_goal(goal, region)?;
        let problem = FlexProblem {
            leadfield,
            region,
            objective,
            space,
            failure: config.failure,
        };
        match config.optimizer {
            OptimizerChoice::DifferentialEvolution => DifferentialEvolution::from_config(&config).probe(&problem)?,
            OptimizerChoice::Genetic => GeneticAlgorithm::from_config(&config).probe(&problem)?,
            OptimizerChoice::Auto => {}
        }
        Ok(Self { problem, config })
    }

    pub fn problem(&self) -> &FlexProblem<'a> {
        &self.problem
    }

    /// Run all starts in parallel and select the best once all are done
    pub fn run(&self, cancel: &CancellationToken) -> FlexReport {
        info!(
            starts = self.config.num_starts,
            population = self.config.population_size,
            generations = self.config.max_generations,
            optimizer = ?self.config.optimizer,
            objective = self.problem.objective.name(),
            "Starting flex-search"
        );

        let starts: Vec<StartReport> = (0..self.config.num_starts)
            .into_par_iter()
            .map(|i| self.run_start(i, derive_seed(self.config.seed, i as u64), cancel))
            .collect();

        let costs: Vec<f64> = starts.iter().map(StartReport::cost).collect();
        let selection = select_best_of(&costs);
        let best = selection.as_ref().and_then(|s| starts[s.selected].best.clone());

        let status = match &selection {
            None => starts
                .iter()
                .find(|s| s.status.is_failed())
                .map(|s| s.status.clone())
                .unwrap_or_else(|| RunStatus::Failed {
                    reason: "no start produced a valid montage".into(),
                }),
            Some(_) if starts.iter().any(|s| s.status == RunStatus::Cancelled) => RunStatus::Cancelled,
            Some(s) => starts[s.selected].status.clone(),
        };

        if let Some(s) = &selection {
            for r in &s.rejected {
                debug!(start = r.index, cost = r.cost, margin = r.margin, "Start rejected");
            }
        }
        match &best {
            Some(b) => info!(
                electrodes = ?b.montage.electrodes(),
                currents = ?b.montage.currents(),
                cost = b.cost,
                status = status.label(),
                "Flex-search finished"
            ),
            None => warn!(status = status.label(), "Flex-search found no valid montage"),
        }

        FlexReport {
            objective: self.problem.objective.name().to_string(),
            best,
            selection,
            starts,
            status,
        }
    }

    fn run_start(&self, index: usize, seed: u64, cancel: &CancellationToken) -> StartReport {
        let de = DifferentialEvolution::from_config(&self.config);
        let ga = GeneticAlgorithm::from_config(&self.config);

        let (name, outcome, degraded) = match self.config.optimizer {
            OptimizerChoice::DifferentialEvolution => (de.name(), de.optimize(&self.problem, seed, cancel), false),
            OptimizerChoice::Genetic => (ga.name(), ga.optimize(&self.problem, seed, cancel), false),
            OptimizerChoice::Auto => match de.optimize(&self.problem, seed, cancel) {
                Err(e) => {
                    warn!(start = index, error = %e, "Differential evolution unavailable, falling back to genetic algorithm");
                    (ga.name(), ga.optimize(&self.problem, seed, cancel), true)
                }
                other => (de.name(), other, false),
            },
        };

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                warn!(start = index, error = %e, "Start failed");
                return StartReport::failed(index, seed, name, e.to_string());
            }
        };

        let best = match &outcome.best {
            Some(Ok(scored)) => Some(FlexSolution {
                montage: outcome.candidate.montage,
                metrics: scored.metrics,
                cost: scored.cost,
                genes: outcome.best_genes.clone(),
            }),
            _ => None,
        };

        let status = match (&outcome.aborted, &best, outcome.cancelled, degraded) {
            (Some(reason), _, _, _) => {
                warn!(start = index, %reason, "Start aborted");
                RunStatus::Failed { reason: reason.clone() }
            }
            (None, None, _, _) => RunStatus::Failed {
                reason: "no finite evaluation".into(),
            },
            (None, Some(_), true, _) => RunStatus::Cancelled,
            (None, Some(_), false, true) => RunStatus::DegradedFallback,
            (None, Some(_), false, false) => RunStatus::Complete,
        };

        let low_confidence = best.as_ref().map_or(true, |b| !(b.cost < outcome.initial_best));
        if low_confidence {
            warn!(start = index, "No improvement over the initial population");
        }

        StartReport {
            index,
            seed,
            optimizer: name.to_string(),
            status,
            best,
            initial_best_cost: outcome.initial_best,
            low_confidence,
            generations: outcome.generations,
            evaluations: outcome.evaluations,
            history: outcome.history,
        }
    }
}

// ============================================================================
// NET MAPPING
// ============================================================================

/// One optimized electrode moved onto a physical net position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedElectrode {
    pub source: String,
    pub target: String,
    /// Euclidean distance between the two positions
    pub distance: f64,
}

/// Montage expressed in a target net's labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetMapping {
    /// `[e1+, e1-, e2+, e2-]`
    pub electrodes: Vec<MappedElectrode>,
    pub currents: (Milliamps, Milliamps),
}

impl NetMapping {
    pub fn max_distance(&self) -> f64 {
        self.electrodes.iter().map(|e| e.distance).fold(0.0, f64::max)
    }

    /// Montage indexed against `leadfield` (must carry the target labels)
    pub fn montage_on(&self, leadfield: &Leadfield) -> Result<Montage> {
        let mut idx = [0usize; ELECTRODES_PER_MONTAGE];
        for (slot, e) in self.electrodes.iter().enumerate().take(ELECTRODES_PER_MONTAGE) {
            idx[slot] = leadfield.electrode_index(&e.target)?;
        }
        Ok(Montage::new(idx, self.currents))
    }
}

/// Move each electrode to the nearest unused electrode of `target`
pub fn map_to_net(
    montage: &Montage,
    leadfield: &Leadfield,
    source: &ElectrodeCatalog,
    target: &ElectrodeCatalog,
) -> Result<NetMapping> {
    if target.len() < ELECTRODES_PER_MONTAGE {
        return Err(TiError::InvalidConfig(format!(
            "target net has {} electrodes, need {}",
            target.len(),
            ELECTRODES_PER_MONTAGE
        )));
    }

    let mut used = Vec::with_capacity(ELECTRODES_PER_MONTAGE);
    let mut electrodes = Vec::with_capacity(ELECTRODES_PER_MONTAGE);
    for e in montage.electrodes() {
        let label = leadfield.label(e).ok_or(TiError::IndexOutOfRange {
            what: "leadfield electrodes",
            index: e,
            len: leadfield.electrode_count(),
        })?;
        let position = source.position(label)?;
        let (k, distance) = target
            .nearest(&position, &used)
            .ok_or_else(|| TiError::EmptyElectrodePool("target net".into()))?;
        used.push(k);
        electrodes.push(MappedElectrode {
            source: label.to_string(),
            target: target.electrodes()[k].label.clone(),
            distance,
        });
    }

    let mapping = NetMapping {
        electrodes,
        currents: montage.currents(),
    };
    debug!(max_distance = mapping.max_distance(), "Mapped montage to net");
    Ok(mapping)
}

/// Re-evaluate a mapped montage on the net's own leadfield
pub fn validate_mapping(
    mapping: &NetMapping,
    net_leadfield: &Leadfield,
    region: &TargetRegion,
    objective: &ScalarObjective,
) -> Result<Scored> {
    let montage = mapping.montage_on(net_leadfield)?;
    score(&montage, net_leadfield, region, objective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;
    use ndarray::{Array3, Axis};
    use std::collections::HashSet;
    use tiopt_core::{CurrentConstraints, Electrode, NonRoi, Roi};

    fn toy() -> (Leadfield, TargetRegion) {
        let labels = (0..8).map(|i| format!("E{}", i)).collect();
        let field = Array3::from_shape_fn((8, 6, 3), |(e, v, c)| {
            ((e * 7 + v * 3 + c) as f64 * 0.37).sin() * (1.0 + e as f64 * 0.1)
        });
        let lf = Leadfield::new(labels, field).unwrap();
        let region = TargetRegion::new(&Roi::new(vec![0, 1]), &NonRoi::Complement, 6).unwrap();
        (lf, region)
    }

    fn search<'a>(lf: &'a Leadfield, region: &'a TargetRegion, config: FlexConfig) -> FlexSearch<'a> {
        let space = SearchSpace::all_electrodes(lf, CurrentConstraints::default()).unwrap();
        FlexSearch::new(lf, region, &Goal::Mean, space, config).unwrap()
    }

    fn small() -> FlexConfig {
        FlexConfig::default().with_population(12).with_generations(20)
    }

    #[test]
    fn test_select_best_of() {
        let selection = select_best_of(&[5.0, 2.0, 8.0]).unwrap();
        assert_eq!(selection.selected, 1);
        assert_eq!(selection.rejected.len(), 2);
        assert_eq!(selection.rejected[0].index, 0);
        assert!((selection.rejected[0].margin - 3.0).abs() < 1e-12);
        assert_eq!(selection.rejected[1].index, 2);
        assert!((selection.rejected[1].margin - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_select_best_of_skips_failed() {
        let selection = select_best_of(&[f64::INFINITY, 4.0, 4.0]).unwrap();
        assert_eq!(selection.selected, 1);
        assert!(selection.rejected[0].margin.is_infinite());
        assert!(select_best_of(&[f64::INFINITY]).is_none());
    }

    #[test]
    fn test_same_seed_same_result() {
        let (lf, region) = toy();
        let a = search(&lf, &region, small().with_seed(7)).run(&CancellationToken::new());
        let b = search(&lf, &region, small().with_seed(7)).run(&CancellationToken::new());
        let (a, b) = (a.best.unwrap(), b.best.unwrap());
        assert_eq!(a.montage, b.montage);
        assert_eq!(a.cost.to_bits(), b.cost.to_bits());
    }

    #[test]
    fn test_result_is_valid_montage() {
        let (lf, region) = toy();
        let report = search(&lf, &region, small().with_starts(3)).run(&CancellationToken::new());
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.starts.len(), 3);

        let best = report.best.unwrap();
        let distinct: HashSet<usize> = best.montage.electrodes().iter().copied().collect();
        assert_eq!(distinct.len(), 4);
        let (i1, i2) = best.montage.currents();
        assert!((i1 + i2 - 4.0).abs() < 1e-9);
        assert!(i1 <= 3.0 + 1e-9 && i2 <= 3.0 + 1e-9);

        let selected = report.selection.unwrap().selected;
        assert!(report.starts.iter().all(|s| s.cost() >= report.starts[selected].cost()));
        for start in &report.starts {
            assert!(start.cost() <= start.initial_best_cost);
            assert_eq!(start.history[0].generation, 0);
        }
    }

    #[test]
    fn test_falls_back_to_ga_with_tiny_population() {
        let (lf, region) = toy();
        let report = search(&lf, &region, small().with_population(3)).run(&CancellationToken::new());
        assert_eq!(report.status, RunStatus::DegradedFallback);
        assert_eq!(report.starts[0].optimizer, "genetic");
        assert!(report.best.is_some());
    }

    #[test]
    fn test_explicit_de_rejects_tiny_population() {
        let (lf, region) = toy();
        let space = SearchSpace::all_electrodes(&lf, CurrentConstraints::default()).unwrap();
        let config = small()
            .with_population(3)
            .with_optimizer(OptimizerChoice::DifferentialEvolution);
        assert!(matches!(
            FlexSearch::new(&lf, &region, &Goal::Mean, space, config),
            Err(TiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_genetic_and_best1bin() {
        let (lf, region) = toy();
        let ga = search(&lf, &region, small().with_optimizer(OptimizerChoice::Genetic)).run(&CancellationToken::new());
        assert_eq!(ga.status, RunStatus::Complete);

        let mut config = small().with_optimizer(OptimizerChoice::DifferentialEvolution);
        config.de.strategy = DeStrategy::Best1Bin;
        let de = search(&lf, &region, config).run(&CancellationToken::new());
        assert_eq!(de.starts[0].optimizer, "differential-evolution");
        assert!(de.best.is_some());
    }

    #[test]
    fn test_cancelled_before_first_generation() {
        let (lf, region) = toy();
        let token = CancellationToken::new();
        token.cancel();
        let report = search(&lf, &region, small()).run(&token);
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.best.is_some());
        assert!(report.starts[0].low_confidence);
        assert_eq!(report.starts[0].generations, 0);
    }

    #[test]
    fn test_abort_keeps_best_and_history() {
        let (lf, region) = toy();
        let mut field = lf.field().clone();
        field.index_axis_mut(Axis(0), 7).fill(f64::NAN);
        let lf = Leadfield::new(lf.labels().to_vec(), field).unwrap();

        for optimizer in [OptimizerChoice::DifferentialEvolution, OptimizerChoice::Genetic] {
            let mut config = small().with_optimizer(optimizer);
            config.failure = FailurePolicy {
                max_rate: 0.0,
                min_samples: 1,
            };
            let report = search(&lf, &region, config).run(&CancellationToken::new());

            match &report.status {
                RunStatus::Failed { reason } => assert!(reason.contains("aborted"), "{}", reason),
                other => panic!("unexpected status {:?}", other),
            }
            let start = &report.starts[0];
            assert!(start.status.is_failed());
            assert!(start.evaluations > 0);
            assert!(!start.history.is_empty());
            assert!(start.history.last().unwrap().failures > 0);
            assert!(start.generations < 20);

            let best = report.best.as_ref().unwrap();
            assert!(best.cost.is_finite());
            assert!(!best.montage.electrodes().contains(&7));
        }
    }

    #[test]
    fn test_multi_objective_rejected() {
        let (lf, region) = toy();
        let space = SearchSpace::all_electrodes(&lf, CurrentConstraints::default()).unwrap();
        assert!(matches!(
            FlexSearch::new(&lf, &region, &Goal::MultiObjective, space, FlexConfig::default()),
            Err(TiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config: FlexConfig = serde_json::from_str(r#"{"num_starts": 4, "optimizer": "genetic"}"#).unwrap();
        assert_eq!(config.num_starts, 4);
        assert_eq!(config.optimizer, OptimizerChoice::Genetic);
        assert_eq!(config.population_size, 32);
    }

    #[test]
    fn test_map_to_net() {
        let (lf, region) = toy();
        let source = ElectrodeCatalog::new(
            (0..8)
                .map(|i| {
                    let a = i as f64 * std::f64::consts::PI / 4.0;
                    Electrode::new(&format!("E{}", i), Point3::new(a.cos(), a.sin(), 0.0))
                })
                .collect(),
        )
        .unwrap();
        // Target net: same ring rotated slightly, different labels
        let target = ElectrodeCatalog::new(
            (0..8)
                .map(|i| {
                    let a = i as f64 * std::f64::consts::PI / 4.0 + 0.05;
                    Electrode::new(&format!("E{}", i), Point3::new(a.cos(), a.sin(), 0.0))
                })
                .collect(),
        )
        .unwrap();

        let montage = Montage::new([0, 2, 4, 6], (2.0, 2.0));
        let mapping = map_to_net(&montage, &lf, &source, &target).unwrap();
        let labels: Vec<&str> = mapping.electrodes.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(labels, vec!["E0", "E2", "E4", "E6"]);
        assert!(mapping.max_distance() < 0.1);

        let objective = ScalarObjective::from_goal(&Goal::Mean, &region).unwrap();
        let scored = validate_mapping(&mapping, &lf, &region, &objective).unwrap();
        let direct = score(&montage, &lf, &region, &objective).unwrap();
        assert_eq!(scored.cost.to_bits(), direct.cost.to_bits());
    }

    #[test]
    fn test_mapping_uses_distinct_targets() {
        let (lf, _) = toy();
        let at = |x: f64| Point3::new(x, 0.0, 0.0);
        let source = ElectrodeCatalog::new(
            (0..8).map(|i| Electrode::new(&format!("E{}", i), at(0.01 * i as f64))).collect(),
        )
        .unwrap();
        let target = ElectrodeCatalog::new(vec![
            Electrode::new("T0", at(0.0)),
            Electrode::new("T1", at(1.0)),
            Electrode::new("T2", at(2.0)),
            Electrode::new("T3", at(3.0)),
        ])
        .unwrap();
        let mapping = map_to_net(&Montage::new([0, 1, 2, 3], (2.0, 2.0)), &lf, &source, &target).unwrap();
        let targets: HashSet<&str> = mapping.electrodes.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets.len(), 4);
        assert_eq!(mapping.electrodes[0].target, "T0");
    }
}
