//! # MOVEA
//!
//! Multi-objective montage search with NSGA-II (Deb et al., 2002). Both
//! objectives are minimized:
//!
//! 1. `-mean(TI in ROI)` (intensity)
//! 2. mean TI over the non-ROI set, or the whole brain when the non-ROI set
//!    is the ROI complement (exposure)
//!
//! The result is the first non-dominated front of the final population. The
//! objectives are never aggregated; [`ParetoFront::knee`] is offered for
//! callers that need a single montage.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tiopt_core::{
    CancellationToken, Candidate, EvaluationCache, FailurePolicy, FailureTally, FreshCount, Leadfield, Montage,
    Result, RunStatus, SearchSpace, TargetRegion, TiError, ELECTRODES_PER_MONTAGE,
};
use tiopt_field::{evaluate, Metrics, ParetoObjective};
use tracing::{debug, info, warn};

/// Objective vector, both minimized
pub type Objectives = [f64; 2];

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveaConfig {
    pub population_size: usize,
    pub generations: usize,
    pub seed: u64,
    pub crossover_rate: f64,
    /// Per-electrode reset probability, also the ratio perturbation probability
    pub mutation_rate: f64,
    /// Ratio perturbation std. dev. as a fraction of the ratio range
    pub ratio_sigma: f64,
    pub failure: FailurePolicy,
}

impl Default for MoveaConfig {
    fn default() -> Self {
        Self {
            population_size: 40,
            generations: 50,
            seed: 42,
            crossover_rate: 0.9,
            mutation_rate: 0.2,
            ratio_sigma: 0.1,
            failure: FailurePolicy::default(),
        }
    }
}

impl MoveaConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_population(mut self, population_size: usize) -> Self {
        self.population_size = population_size;
        self
    }

    pub fn with_generations(mut self, generations: usize) -> Self {
        self.generations = generations;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.population_size < 2 {
            return Err(TiError::InvalidConfig("MOVEA needs a population of at least 2".into()));
        }
        for (name, p) in [
            ("crossover rate", self.crossover_rate),
            ("mutation rate", self.mutation_rate),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(TiError::InvalidConfig(format!("{} must lie in [0, 1], got {}", name, p)));
            }
        }
        if !(self.ratio_sigma > 0.0) || !self.ratio_sigma.is_finite() {
            return Err(TiError::InvalidConfig(format!(
                "ratio sigma must be positive, got {}",
                self.ratio_sigma
            )));
        }
        Ok(())
    }
}

// ============================================================================
// NSGA-II PRIMITIVES
// ============================================================================

/// `a` dominates `b`: no worse in every objective, better in at least one
pub fn dominates(a: &Objectives, b: &Objectives) -> bool {
    a.iter().zip(b).all(|(x, y)| x <= y) && a.iter().zip(b).any(|(x, y)| x < y)
}

/// Fronts of indices into `objectives`, best first
pub fn fast_non_dominated_sort(objectives: &[Objectives]) -> Vec<Vec<usize>> {
    let n = objectives.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    let mut fronts: Vec<Vec<usize>> = vec![Vec::new()];

    for p in 0..n {
        for q in 0..n {
            if p == q {
                continue;
            }
            if dominates(&objectives[p], &objectives[q]) {
                dominated_by[p].push(q);
            } else if dominates(&objectives[q], &objectives[p]) {
                domination_count[p] += 1;
            }
        }
        if domination_count[p] == 0 {
            fronts[0].push(p);
        }
    }

    let mut i = 0;
    while !fronts[i].is_empty() {
        let mut next = Vec::new();
        for &p in &fronts[i] {
            for &q in &dominated_by[p] {
                domination_count[q] -= 1;
                if domination_count[q] == 0 {
                    next.push(q);
                }
            }
        }
        next.sort_unstable();
        fronts.push(next);
        i += 1;
    }
    fronts.pop();
    fronts
}

/// Crowding distance of each member of `front` (same order). Boundary
/// members get infinity.
pub fn crowding_distance(objectives: &[Objectives], front: &[usize]) -> Vec<f64> {
    let len = front.len();
    let mut distance = vec![0.0; len];
    if len <= 2 {
        return vec![f64::INFINITY; len];
    }

    for m in 0..2 {
        let mut order: Vec<usize> = (0..len).collect();
        order.sort_by(|&a, &b| {
            objectives[front[a]][m]
                .partial_cmp(&objectives[front[b]][m])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let lo = objectives[front[order[0]]][m];
        let hi = objectives[front[order[len - 1]]][m];
        distance[order[0]] = f64::INFINITY;
        distance[order[len - 1]] = f64::INFINITY;

        let range = hi - lo;
        if !(range > 0.0) || !range.is_finite() {
            continue;
        }
        for k in 1..len - 1 {
            let gap = objectives[front[order[k + 1]]][m] - objectives[front[order[k - 1]]][m];
            if gap.is_finite() {
                distance[order[k]] += gap / range;
            }
        }
    }
    distance
}

/// Rank and crowding of every individual
fn rank_population(objectives: &[Objectives]) -> (Vec<Vec<usize>>, Vec<usize>, Vec<f64>) {
    let fronts = fast_non_dominated_sort(objectives);
    let mut rank = vec![0; objectives.len()];
    let mut crowding = vec![0.0; objectives.len()];
    for (r, front) in fronts.iter().enumerate() {
        for (&i, d) in front.iter().zip(crowding_distance(objectives, front)) {
            rank[i] = r;
            crowding[i] = d;
        }
    }
    (fronts, rank, crowding)
}

fn binary_tournament<R: Rng>(rank: &[usize], crowding: &[f64], rng: &mut R) -> usize {
    let a = rng.gen_range(0..rank.len());
    let b = rng.gen_range(0..rank.len());
    if rank[b] < rank[a] || (rank[b] == rank[a] && crowding[b] > crowding[a]) {
        b
    } else {
        a
    }
}

// ============================================================================
// PARETO FRONT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoMember {
    pub montage: Montage,
    pub objectives: Objectives,
    pub metrics: Metrics,
}

/// Mutually non-dominated montages, sorted by the first objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParetoFront {
    pub members: Vec<ParetoMember>,
}

impl ParetoFront {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member closest to the utopia point of the min-max normalized objectives
    pub fn knee(&self) -> Option<&ParetoMember> {
        let bounds: Vec<(f64, f64)> = (0..2)
            .map(|m| {
                self.members.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                    (lo.min(p.objectives[m]), hi.max(p.objectives[m]))
                })
            })
            .collect();
        let normalized = |v: f64, (lo, hi): (f64, f64)| if hi > lo { (v - lo) / (hi - lo) } else { 0.0 };

        self.members
            .iter()
            .map(|p| {
                let d: f64 = (0..2).map(|m| normalized(p.objectives[m], bounds[m]).powi(2)).sum();
                (p, d)
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(p, _)| p)
    }
}

// ============================================================================
// SEARCH
// ============================================================================

type Evaluation = std::result::Result<(Metrics, Objectives), String>;

const FAILED: Objectives = [f64::INFINITY, f64::INFINITY];

#[derive(Debug, Clone)]
struct Individual {
    genes: Vec<f64>,
    candidate: Candidate,
    objectives: Objectives,
    metrics: Option<Metrics>,
}

/// Per-generation front summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveaGeneration {
    pub generation: usize,
    pub front_size: usize,
    /// Highest ROI mean in the front
    pub best_intensity: f64,
    /// Lowest exposure in the front
    pub best_exposure: f64,
    pub evaluations: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveaReport {
    pub front: ParetoFront,
    pub history: Vec<MoveaGeneration>,
    pub evaluations: usize,
    pub status: RunStatus,
}

/// NSGA-II bound to one leadfield, region and search space
pub struct MoveaSearch<'a> {
    leadfield: &'a Leadfield,
    region: &'a TargetRegion,
    objective: ParetoObjective,
    space: SearchSpace,
    config: MoveaConfig,
    ratio_noise: Normal<f64>,
}

struct RunState {
    cache: EvaluationCache<Evaluation>,
    tally: FailureTally,
    history: Vec<MoveaGeneration>,
}

impl<'a> MoveaSearch<'a> {
    pub fn new(
        leadfield: &'a Leadfield,
        region: &'a TargetRegion,
        space: SearchSpace,
        config: MoveaConfig,
    ) -> Result<Self> {
        config.validate()?;
        if region.voxel_count() != leadfield.voxel_count() {
            return Err(TiError::ShapeMismatch(format!(
                "region built for {} voxels, leadfield has {}",
                region.voxel_count(),
                leadfield.voxel_count()
            )));
        }
        let (lo, hi) = space.bounds()[space.ratio_gene()];
        let sigma = (config.ratio_sigma * (hi - lo)).max(f64::MIN_POSITIVE);
        let ratio_noise =
            Normal::new(0.0, sigma).map_err(|e| TiError::InvalidConfig(format!("ratio noise: {}", e)))?;
        Ok(Self {
            leadfield,
            region,
            objective: ParetoObjective::new(region),
            space,
            config,
            ratio_noise,
        })
    }

    /// Individuals in input order, with the evaluations this batch ran
    fn evaluate(&self, state: &mut RunState, genes: Vec<Vec<f64>>) -> (Vec<Individual>, FreshCount) {
        let candidates: Vec<Candidate> = genes.iter().map(|g| self.space.decode(g)).collect();
        let (evals, fresh) = state.cache.evaluate_batch_counted(
            &candidates,
            |m| {
                evaluate(m, self.leadfield, self.region)
                    .map_err(|e| e.to_string())
                    .and_then(|field| {
                        let metrics = Metrics::from_field(&field);
                        let objectives = self.objective.objectives(&field);
                        if metrics.is_finite() && objectives.iter().all(|o| o.is_finite()) {
                            Ok((metrics, objectives))
                        } else {
                            Err(TiError::NonFiniteField(m.electrodes()).to_string())
                        }
                    })
            },
            |e: &Evaluation| e.is_err(),
        );
        state.tally.record(fresh.evaluated, fresh.failed);

        let individuals = genes
            .into_iter()
            .zip(candidates)
            .zip(evals)
            .map(|((genes, candidate), eval)| match eval {
                Ok((metrics, objectives)) => Individual {
                    genes,
                    candidate,
                    objectives,
                    metrics: Some(metrics),
                },
                Err(reason) => {
                    debug!(electrodes = ?candidate.montage.electrodes(), %reason, "Evaluation failed");
                    Individual {
                        genes,
                        candidate,
                        objectives: FAILED,
                        metrics: None,
                    }
                }
            })
            .collect();
        (individuals, fresh)
    }

    fn offspring<R: Rng>(&self, parents: &[Individual], rank: &[usize], crowding: &[f64], rng: &mut R) -> Vec<Vec<f64>> {
        let n = self.config.population_size;
        let ratio = self.space.ratio_gene();
        let (lo, hi) = self.space.bounds()[ratio];
        let mut children = Vec::with_capacity(n + 1);

        while children.len() < n {
            let a = &parents[binary_tournament(rank, crowding, rng)].genes;
            let b = &parents[binary_tournament(rank, crowding, rng)].genes;
            let (mut c1, mut c2) = (a.clone(), b.clone());

            if rng.gen::<f64>() < self.config.crossover_rate {
                for slot in 0..ELECTRODES_PER_MONTAGE {
                    if rng.gen::<bool>() {
                        for g in self.space.slot_genes(slot) {
                            std::mem::swap(&mut c1[g], &mut c2[g]);
                        }
                    }
                }
                let u: f64 = rng.gen();
                c1[ratio] = u * a[ratio] + (1.0 - u) * b[ratio];
                c2[ratio] = (1.0 - u) * a[ratio] + u * b[ratio];
            }

            for child in [&mut c1, &mut c2] {
                for slot in 0..ELECTRODES_PER_MONTAGE {
                    if rng.gen::<f64>() < self.config.mutation_rate {
                        self.space.reset_slot(child, slot, rng);
                    }
                }
                if rng.gen::<f64>() < self.config.mutation_rate {
                    child[ratio] = (child[ratio] + self.ratio_noise.sample(rng)).clamp(lo, hi);
                }
                self.space.repair(child);
            }
            children.push(c1);
            children.push(c2);
        }
        children.truncate(n);
        children
    }

    /// Elitist (μ+λ) truncation by rank, then crowding
    fn survivors(&self, combined: Vec<Individual>) -> Vec<Individual> {
        let objectives: Vec<Objectives> = combined.iter().map(|i| i.objectives).collect();
        let fronts = fast_non_dominated_sort(&objectives);
        let n = self.config.population_size;
        let mut keep: Vec<usize> = Vec::with_capacity(n);

        for front in &fronts {
            if keep.len() + front.len() <= n {
                keep.extend(front);
                continue;
            }
            let crowding = crowding_distance(&objectives, front);
            let mut order: Vec<usize> = (0..front.len()).collect();
            order.sort_by(|&a, &b| crowding[b].partial_cmp(&crowding[a]).unwrap_or(std::cmp::Ordering::Equal));
            keep.extend(order.into_iter().take(n - keep.len()).map(|k| front[k]));
            break;
        }

        let mut slots: Vec<Option<Individual>> = combined.into_iter().map(Some).collect();
        keep.into_iter().filter_map(|i| slots[i].take()).collect()
    }

    fn record(&self, state: &mut RunState, generation: usize, population: &[Individual], fresh: FreshCount) {
        let objectives: Vec<Objectives> = population.iter().map(|i| i.objectives).collect();
        let fronts = fast_non_dominated_sort(&objectives);
        let first: Vec<&Objectives> = fronts
            .first()
            .map(|f| f.iter().map(|&i| &objectives[i]).filter(|o| o[0].is_finite()).collect())
            .unwrap_or_default();
        let best_intensity = first.iter().map(|o| -o[0]).fold(f64::NEG_INFINITY, f64::max);
        let best_exposure = first.iter().map(|o| o[1]).fold(f64::INFINITY, f64::min);
        debug!(generation, front = first.len(), best_intensity, best_exposure, "Generation complete");
        state.history.push(MoveaGeneration {
            generation,
            front_size: first.len(),
            best_intensity,
            best_exposure,
            evaluations: fresh.evaluated,
            failures: fresh.failed,
        });
    }

    pub fn run(&self, cancel: &CancellationToken) -> MoveaReport {
        info!(
            population = self.config.population_size,
            generations = self.config.generations,
            seed = self.config.seed,
            "Starting MOVEA"
        );
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut state = RunState {
            cache: EvaluationCache::new(),
            tally: FailureTally::default(),
            history: Vec::new(),
        };

        let initial: Vec<Vec<f64>> = (0..self.config.population_size)
            .map(|_| self.space.random_genes(&mut rng))
            .collect();
        let (mut population, fresh) = self.evaluate(&mut state, initial);
        self.record(&mut state, 0, &population, fresh);

        let mut status = RunStatus::Complete;
        if state.tally.exceeds(&self.config.failure) {
            status = RunStatus::Failed {
                reason: state.tally.to_error().to_string(),
            };
        }

        let mut generation = 1;
        while status == RunStatus::Complete && generation <= self.config.generations {
            if cancel.is_cancelled() {
                warn!(generation, "MOVEA cancelled");
                status = RunStatus::Cancelled;
                break;
            }

            let objectives: Vec<Objectives> = population.iter().map(|i| i.objectives).collect();
            let (_, rank, crowding) = rank_population(&objectives);
            let children = self.offspring(&population, &rank, &crowding, &mut rng);
            let (children, fresh) = self.evaluate(&mut state, children);

            let mut combined = population;
            combined.extend(children);
            population = self.survivors(combined);
            self.record(&mut state, generation, &population, fresh);

            if state.tally.exceeds(&self.config.failure) {
                let err = state.tally.to_error();
                warn!(error = %err, "Aborting MOVEA");
                status = RunStatus::Failed {
                    reason: err.to_string(),
                };
            }
            generation += 1;
        }

        let front = final_front(&population);
        info!(front = front.len(), status = status.label(), "MOVEA finished");
        MoveaReport {
            front,
            history: state.history,
            evaluations: state.cache.misses(),
            status,
        }
    }
}

/// F0 of the population: finite, deduplicated by candidate, sorted by the
/// first objective
fn final_front(population: &[Individual]) -> ParetoFront {
    let objectives: Vec<Objectives> = population.iter().map(|i| i.objectives).collect();
    let fronts = fast_non_dominated_sort(&objectives);
    let mut seen = HashSet::new();
    let mut members: Vec<ParetoMember> = fronts
        .first()
        .into_iter()
        .flatten()
        .map(|&i| &population[i])
        .filter(|ind| seen.insert(ind.candidate.key))
        .filter_map(|ind| {
            ind.metrics.map(|metrics| ParetoMember {
                montage: ind.candidate.montage,
                objectives: ind.objectives,
                metrics,
            })
        })
        .collect();
    members.sort_by(|a, b| {
        a.objectives[0]
            .partial_cmp(&b.objectives[0])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.objectives[1].partial_cmp(&b.objectives[1]).unwrap_or(std::cmp::Ordering::Equal))
    });
    ParetoFront { members }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Axis};
    use proptest::prelude::*;
    use tiopt_core::{CurrentConstraints, NonRoi, Roi};

    fn toy() -> (Leadfield, TargetRegion) {
        let labels = (0..8).map(|i| format!("E{}", i)).collect();
        let field = Array3::from_shape_fn((8, 6, 3), |(e, v, c)| {
            ((e * 5 + v * 11 + c * 3) as f64 * 0.29).cos() * (1.0 + (e % 3) as f64 * 0.2)
        });
        let lf = Leadfield::new(labels, field).unwrap();
        let region = TargetRegion::new(&Roi::new(vec![0, 1]), &NonRoi::Complement, 6).unwrap();
        (lf, region)
    }

    fn search<'a>(lf: &'a Leadfield, region: &'a TargetRegion, config: MoveaConfig) -> MoveaSearch<'a> {
        let space = SearchSpace::all_electrodes(lf, CurrentConstraints::default()).unwrap();
        MoveaSearch::new(lf, region, space, config).unwrap()
    }

    fn assert_non_dominated(front: &ParetoFront) {
        for a in &front.members {
            for b in &front.members {
                assert!(!dominates(&a.objectives, &b.objectives));
            }
        }
    }

    #[test]
    fn test_dominates() {
        assert!(dominates(&[1.0, 1.0], &[1.0, 2.0]));
        assert!(!dominates(&[1.0, 2.0], &[1.0, 2.0]));
        assert!(!dominates(&[0.0, 3.0], &[1.0, 2.0]));
        assert!(dominates(&[5.0, 5.0], &FAILED));
        assert!(!dominates(&FAILED, &FAILED));
    }

    #[test]
    fn test_sort_hand_example() {
        let objectives = [[1.0, 5.0], [2.0, 3.0], [3.0, 1.0], [2.0, 4.0], [4.0, 4.0]];
        let fronts = fast_non_dominated_sort(&objectives);
        assert_eq!(fronts, vec![vec![0, 1, 2], vec![3], vec![4]]);

        let crowding = crowding_distance(&objectives, &fronts[0]);
        assert!(crowding[0].is_infinite());
        assert!(crowding[2].is_infinite());
        assert!((crowding[1] - 2.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_first_front_is_non_dominated(
            points in prop::collection::vec((0.0f64..10.0, 0.0f64..10.0), 1..40),
        ) {
            let objectives: Vec<Objectives> = points.iter().map(|&(a, b)| [a, b]).collect();
            let fronts = fast_non_dominated_sort(&objectives);
            prop_assert_eq!(fronts.iter().map(Vec::len).sum::<usize>(), objectives.len());
            for &p in &fronts[0] {
                for &q in &fronts[0] {
                    prop_assert!(!dominates(&objectives[p], &objectives[q]));
                }
            }
            for front in fronts.iter().skip(1) {
                for &q in front {
                    prop_assert!(fronts[0].iter().any(|&p| dominates(&objectives[p], &objectives[q])));
                }
            }
        }
    }

    #[test]
    fn test_run_produces_sorted_non_dominated_front() {
        let (lf, region) = toy();
        let report = search(&lf, &region, MoveaConfig::default().with_population(16).with_generations(10))
            .run(&CancellationToken::new());

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.history.len(), 11);
        assert!(!report.front.is_empty());
        assert_non_dominated(&report.front);

        let keys: HashSet<_> = report.front.members.iter().map(|m| Candidate::new(m.montage).key).collect();
        assert_eq!(keys.len(), report.front.len());
        for pair in report.front.members.windows(2) {
            assert!(pair[0].objectives[0] <= pair[1].objectives[0]);
        }
        for m in &report.front.members {
            assert!((m.objectives[0] + m.metrics.ti_mean_roi).abs() < 1e-12);
            assert!((m.objectives[1] - m.metrics.ti_mean_whole_brain).abs() < 1e-12);
        }
    }

    #[test]
    fn test_same_seed_same_front() {
        let (lf, region) = toy();
        let config = MoveaConfig::default().with_population(12).with_generations(6).with_seed(3);
        let a = search(&lf, &region, config.clone()).run(&CancellationToken::new());
        let b = search(&lf, &region, config).run(&CancellationToken::new());
        assert_eq!(a.front, b.front);
    }

    #[test]
    fn test_cancelled_returns_initial_front() {
        let (lf, region) = toy();
        let token = CancellationToken::new();
        token.cancel();
        let report = search(&lf, &region, MoveaConfig::default().with_population(10)).run(&token);
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.history.len(), 1);
        assert!(!report.front.is_empty());
        assert_non_dominated(&report.front);
    }

    #[test]
    fn test_history_counts_fresh_evaluations_only() {
        let (lf, region) = toy();
        let config = MoveaConfig::default().with_population(12).with_generations(8);
        let report = search(&lf, &region, config).run(&CancellationToken::new());
        let logged: usize = report.history.iter().map(|g| g.evaluations).sum();
        assert_eq!(logged, report.evaluations);
        assert!(report.history.iter().all(|g| g.evaluations <= 12));
    }

    #[test]
    fn test_abort_keeps_front_and_history() {
        let (lf, region) = toy();
        let mut field = lf.field().clone();
        field.index_axis_mut(Axis(0), 7).fill(f64::NAN);
        let lf = Leadfield::new(lf.labels().to_vec(), field).unwrap();
        let config = MoveaConfig {
            failure: FailurePolicy {
                max_rate: 0.0,
                min_samples: 1,
            },
            ..MoveaConfig::default().with_population(12).with_generations(20)
        };

        let report = search(&lf, &region, config).run(&CancellationToken::new());
        match &report.status {
            RunStatus::Failed { reason } => assert!(reason.contains("aborted"), "{}", reason),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(report.evaluations > 0);
        assert!(!report.history.is_empty() && report.history.len() < 21);
        assert!(report.history.last().unwrap().failures > 0);
        assert!(!report.front.is_empty());
        for member in &report.front.members {
            assert!(!member.montage.electrodes().contains(&7));
        }
        assert_non_dominated(&report.front);
    }

    #[test]
    fn test_knee() {
        let member = |a: f64, b: f64| ParetoMember {
            montage: Montage::new([0, 1, 2, 3], (2.0, 2.0)),
            objectives: [a, b],
            metrics: Metrics {
                ti_max_roi: -a,
                ti_mean_roi: -a,
                ti_mean_whole_brain: b,
                focality: 0.0,
            },
        };
        let front = ParetoFront {
            members: vec![member(-1.0, 1.0), member(-0.8, 0.2), member(0.0, 0.0)],
        };
        assert_eq!(front.knee().unwrap().objectives, [-0.8, 0.2]);
        assert!(ParetoFront::default().knee().is_none());
    }

    #[test]
    fn test_invalid_config() {
        let (lf, region) = toy();
        let space = SearchSpace::all_electrodes(&lf, CurrentConstraints::default()).unwrap();
        let config = MoveaConfig {
            population_size: 1,
            ..MoveaConfig::default()
        };
        assert!(matches!(
            MoveaSearch::new(&lf, &region, space, config),
            Err(TiError::InvalidConfig(_))
        ));
    }
}
