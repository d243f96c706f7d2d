//! # Exhaustive Montage Search
//!
//! Enumerates every electrode assignment drawn from four pools
//! (E1+, E1-, E2+, E2-) combined with every admissible current split, and
//! evaluates each one. Guarantees the global optimum over the discrete
//! space at combinatorial cost, so [`ExhaustiveSearch::plan`] reports the
//! size before anything runs.
//!
//! Rows are produced in enumeration order (assignment-major, then current
//! ratio) regardless of how batches are scheduled across threads.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tiopt_core::{
    CancellationToken, CurrentConstraints, FailurePolicy, FailureTally, Goal, Leadfield, Milliamps,
    Montage, Result, RunStatus, TargetRegion, TiError, ELECTRODES_PER_MONTAGE,
};
use tiopt_field::{score, Metrics, ScalarObjective};
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Candidate electrodes for each of the four montage positions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrodePools {
    pub e1_plus: Vec<usize>,
    pub e1_minus: Vec<usize>,
    pub e2_plus: Vec<usize>,
    pub e2_minus: Vec<usize>,
}

const POOL_NAMES: [&str; ELECTRODES_PER_MONTAGE] = ["E1+", "E1-", "E2+", "E2-"];

impl ElectrodePools {
    pub fn new(e1_plus: Vec<usize>, e1_minus: Vec<usize>, e2_plus: Vec<usize>, e2_minus: Vec<usize>) -> Self {
        Self {
            e1_plus,
            e1_minus,
            e2_plus,
            e2_minus,
        }
    }

    /// Resolve label pools against a leadfield
    pub fn from_labels<S: AsRef<str>>(leadfield: &Leadfield, pools: [&[S]; ELECTRODES_PER_MONTAGE]) -> Result<Self> {
        let resolve = |labels: &[S]| -> Result<Vec<usize>> {
            labels
                .iter()
                .map(|l| leadfield.electrode_index(l.as_ref()))
                .collect()
        };
        Ok(Self::new(
            resolve(pools[0])?,
            resolve(pools[1])?,
            resolve(pools[2])?,
            resolve(pools[3])?,
        ))
    }

    pub fn as_array(&self) -> [&[usize]; ELECTRODES_PER_MONTAGE] {
        [&self.e1_plus, &self.e1_minus, &self.e2_plus, &self.e2_minus]
    }

    /// Pools must be non-empty, in range and free of repeats, and admit
    /// at least one assignment with distinct electrodes per channel
    pub fn validate(&self, leadfield: &Leadfield) -> Result<()> {
        for (pool, name) in self.as_array().into_iter().zip(POOL_NAMES) {
            if pool.is_empty() {
                return Err(TiError::EmptyElectrodePool(name.to_string()));
            }
            let mut seen = HashSet::with_capacity(pool.len());
            for &e in pool {
                leadfield.check_electrode(e)?;
                if !seen.insert(e) {
                    return Err(TiError::InvalidConfig(format!(
                        "electrode {} appears twice in pool {}",
                        e, name
                    )));
                }
            }
        }
        if self.valid_assignments() == 0 {
            return Err(TiError::InvalidConfig(
                "no assignment uses two different electrodes on both channels".into(),
            ));
        }
        Ok(())
    }

    /// Assignments before the anode ≠ cathode filter
    pub fn raw_assignments(&self) -> u128 {
        self.as_array().iter().map(|p| p.len() as u128).product()
    }

    /// Assignments where each channel uses two different electrodes
    pub fn valid_assignments(&self) -> u128 {
        let pairs = |plus: &[usize], minus: &[usize]| {
            let shared = plus.iter().filter(|e| minus.contains(e)).count();
            (plus.len() * minus.len() - shared) as u128
        };
        pairs(&self.e1_plus, &self.e1_minus) * pairs(&self.e2_plus, &self.e2_minus)
    }

    /// Valid assignments in enumeration order
    pub fn assignments(&self) -> impl Iterator<Item = [usize; ELECTRODES_PER_MONTAGE]> + '_ {
        let pools = self.as_array();
        let radix = pools.map(|p| p.len());
        let total: usize = radix.iter().product();
        (0..total).filter_map(move |mut raw| {
            let mut digits = [0usize; ELECTRODES_PER_MONTAGE];
            for slot in (0..ELECTRODES_PER_MONTAGE).rev() {
                digits[slot] = raw % radix[slot];
                raw /= radix[slot];
            }
            let e = [
                pools[0][digits[0]],
                pools[1][digits[1]],
                pools[2][digits[2]],
                pools[3][digits[3]],
            ];
            (e[0] != e[1] && e[2] != e[3]).then_some(e)
        })
    }
}

/// Exhaustive run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExhaustiveConfig {
    pub pools: ElectrodePools,
    #[serde(default)]
    pub constraints: CurrentConstraints,
    /// Candidates evaluated per parallel batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub failure: FailurePolicy,
}

fn default_batch_size() -> usize {
    256
}

impl ExhaustiveConfig {
    pub fn new(pools: ElectrodePools) -> Self {
        Self {
            pools,
            constraints: CurrentConstraints::default(),
            batch_size: default_batch_size(),
            failure: FailurePolicy::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: CurrentConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Search size, known before running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPlan {
    /// `|E1+|·|E1-|·|E2+|·|E2-|·|ratios|`
    pub raw_combinations: u128,
    pub valid_assignments: u128,
    pub ratio_count: usize,
    /// Valid assignments × ratios
    pub total_evaluations: u128,
}

/// One evaluated (assignment, current split)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExhaustiveRow {
    /// `[e1+, e1-, e2+, e2-]` leadfield indices
    pub electrodes: [usize; ELECTRODES_PER_MONTAGE],
    pub currents: (Milliamps, Milliamps),
    pub metrics: Metrics,
    pub cost: f64,
}

impl ExhaustiveRow {
    pub fn montage(&self) -> Montage {
        Montage::new(self.electrodes, self.currents)
    }
}

/// Combination dropped because its evaluation failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCombination {
    pub electrodes: [usize; ELECTRODES_PER_MONTAGE],
    pub currents: (Milliamps, Milliamps),
    pub reason: String,
}

/// Progress after each batch
#[derive(Debug, Clone, Copy)]
pub struct ExhaustiveProgress {
    pub completed: u128,
    pub total: u128,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustiveReport {
    pub plan: SearchPlan,
    pub objective: String,
    pub rows: Vec<ExhaustiveRow>,
    pub skipped: Vec<SkippedCombination>,
    pub best: Option<ExhaustiveRow>,
    pub status: RunStatus,
}

impl ExhaustiveReport {
    /// Best `n` rows by cost; ties keep enumeration order
    pub fn top(&self, n: usize) -> Vec<&ExhaustiveRow> {
        let mut ranked: Vec<&ExhaustiveRow> = self.rows.iter().collect();
        ranked.sort_by(|a, b| a.cost.partial_cmp(&b.cost).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(n);
        ranked
    }
}

// ============================================================================
// SEARCH
// ============================================================================

/// Exhaustive optimizer bound to one leadfield and region
pub struct ExhaustiveSearch<'a> {
    leadfield: &'a Leadfield,
    region: &'a TargetRegion,
    objective: ScalarObjective,
    config: ExhaustiveConfig,
    ratios: Vec<(Milliamps, Milliamps)>,
}

impl<'a> ExhaustiveSearch<'a> {
    /// Validate everything up front; a multi-objective goal is rejected
    pub fn new(
        leadfield: &'a Leadfield,
        region: &'a TargetRegion,
        goal: &Goal,
        config: ExhaustiveConfig,
    ) -> Result<Self> {
        config.pools.validate(leadfield)?;
        if config.batch_size == 0 {
            return Err(TiError::InvalidConfig("batch size must be at least 1".into()));
        }
        if region.voxel_count() != leadfield.voxel_count() {
            return Err(TiError::ShapeMismatch(format!(
                "region built for {} voxels, leadfield has {}",
                region.voxel_count(),
                leadfield.voxel_count()
            )));
        }
        let objective = ScalarObjective::from_goal(goal, region)?;
        let ratios = config.constraints.current_ratios()?;
        Ok(Self {
            leadfield,
            region,
            objective,
            config,
            ratios,
        })
    }

    pub fn plan(&self) -> SearchPlan {
        let ratio_count = self.ratios.len();
        let valid_assignments = self.config.pools.valid_assignments();
        SearchPlan {
            raw_combinations: self.config.pools.raw_assignments() * ratio_count as u128,
            valid_assignments,
            ratio_count,
            total_evaluations: valid_assignments * ratio_count as u128,
        }
    }

    pub fn ratios(&self) -> &[(Milliamps, Milliamps)] {
        &self.ratios
    }

    /// Enumerate and evaluate everything, calling `on_progress` after each batch
    pub fn run<F>(&self, cancel: &CancellationToken, mut on_progress: Option<F>) -> ExhaustiveReport
    where
        F: FnMut(&ExhaustiveProgress),
    {
        let plan = self.plan();
        info!(
            raw = %plan.raw_combinations,
            valid = %plan.valid_assignments,
            ratios = plan.ratio_count,
            total = %plan.total_evaluations,
            objective = self.objective.name(),
            "Starting exhaustive search"
        );

        let start = Instant::now();
        let mut units = self
            .config
            .pools
            .assignments()
            .flat_map(|e| self.ratios.iter().map(move |&c| Montage::new(e, c)));

        let mut rows: Vec<ExhaustiveRow> = Vec::new();
        let mut skipped = Vec::new();
        let mut best: Option<usize> = None;
        let mut tally = FailureTally::default();
        let mut completed: u128 = 0;
        let mut status = RunStatus::Complete;
        let mut batch_index = 0usize;

        loop {
            if cancel.is_cancelled() {
                warn!(completed = %completed, "Exhaustive search cancelled");
                status = RunStatus::Cancelled;
                break;
            }

            let batch: Vec<Montage> = units.by_ref().take(self.config.batch_size).collect();
            if batch.is_empty() {
                break;
            }

            let results: Vec<_> = batch
                .par_iter()
                .map(|m| score(m, self.leadfield, self.region, &self.objective))
                .collect();

            let mut failed = 0;
            for (montage, result) in batch.iter().zip(results) {
                match result {
                    Ok(scored) => {
                        let row = ExhaustiveRow {
                            electrodes: montage.electrodes(),
                            currents: montage.currents(),
                            metrics: scored.metrics,
                            cost: scored.cost,
                        };
                        if best.map_or(true, |b| row.cost < rows[b].cost) {
                            best = Some(rows.len());
                        }
                        rows.push(row);
                    }
                    Err(e) => {
                        warn!(electrodes = ?montage.electrodes(), error = %e, "Skipping combination");
                        failed += 1;
                        skipped.push(SkippedCombination {
                            electrodes: montage.electrodes(),
                            currents: montage.currents(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            completed += batch.len() as u128;
            tally.record(batch.len(), failed);
            debug!(batch = batch_index, completed = %completed, failed, "Batch evaluated");
            batch_index += 1;

            if let Some(cb) = on_progress.as_mut() {
                let elapsed = start.elapsed();
                let eta = (completed > 0 && completed < plan.total_evaluations).then(|| {
                    let remaining = (plan.total_evaluations - completed) as f64;
                    elapsed.mul_f64(remaining / completed as f64)
                });
                cb(&ExhaustiveProgress {
                    completed,
                    total: plan.total_evaluations,
                    elapsed,
                    eta,
                });
            }

            if tally.exceeds(&self.config.failure) {
                let err = tally.to_error();
                warn!(error = %err, "Aborting exhaustive search");
                status = RunStatus::Failed {
                    reason: err.to_string(),
                };
                break;
            }
        }

        let best = best.map(|b| rows[b].clone());
        match &best {
            Some(b) => info!(
                electrodes = ?b.electrodes,
                currents = ?b.currents,
                cost = b.cost,
                evaluated = rows.len(),
                skipped = skipped.len(),
                status = status.label(),
                "Exhaustive search finished"
            ),
            None => warn!(status = status.label(), "Exhaustive search found no valid montage"),
        }

        ExhaustiveReport {
            plan,
            objective: self.objective.name().to_string(),
            rows,
            skipped,
            best,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tiopt_core::{FocalityGoal, NonRoi, Roi};

    /// Voxel 0 is the ROI; voxel 1 sees no field. Electrodes 0 and 2 push
    /// +x at voxel 0 with strengths 1 and 3, electrodes 1 and 3 are silent,
    /// electrode 4 (when present) is corrupt.
    fn analytic(with_corrupt: bool) -> (Leadfield, TargetRegion) {
        let n = if with_corrupt { 5 } else { 4 };
        let labels = (0..n).map(|i| format!("E{}", i)).collect();
        let field = Array3::from_shape_fn((n, 2, 3), |(e, v, c)| match (e, v, c) {
            (0, 0, 0) => 1.0,
            (2, 0, 0) => 3.0,
            (4, _, _) => f64::NAN,
            _ => 0.0,
        });
        let lf = Leadfield::new(labels, field).unwrap();
        let region = TargetRegion::new(&Roi::new(vec![0]), &NonRoi::Complement, 2).unwrap();
        (lf, region)
    }

    fn pools() -> ElectrodePools {
        ElectrodePools::new(vec![0, 2], vec![1], vec![0, 2], vec![3])
    }

    fn run(search: &ExhaustiveSearch) -> ExhaustiveReport {
        search.run(&CancellationToken::new(), None::<fn(&ExhaustiveProgress)>)
    }

    #[test]
    fn test_finds_analytic_optimum() {
        let (lf, region) = analytic(false);
        let search = ExhaustiveSearch::new(&lf, &region, &Goal::Mean, ExhaustiveConfig::new(pools())).unwrap();

        let plan = search.plan();
        assert_eq!(plan.ratio_count, 5);
        assert_eq!(plan.valid_assignments, 4);
        assert_eq!(plan.total_evaluations, 20);

        let report = run(&search);
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.rows.len(), 20);

        let best = report.best.unwrap();
        assert_eq!(best.electrodes, [2, 1, 2, 3]);
        assert_eq!(best.currents, (2.0, 2.0));
        assert!((best.cost + 12.0).abs() < 1e-9);
        assert!((best.metrics.ti_max_roi - 12.0).abs() < 1e-9);
        assert!((best.metrics.ti_mean_whole_brain - 6.0).abs() < 1e-9);
        assert!((best.metrics.focality - 2.0).abs() < 1e-9);

        // No row beats the reported best
        assert!(report.rows.iter().all(|r| r.cost >= best.cost));
    }

    #[test]
    fn test_enumeration_order_and_determinism() {
        let (lf, region) = analytic(false);
        let config = ExhaustiveConfig::new(pools()).with_batch_size(3);
        let search = ExhaustiveSearch::new(&lf, &region, &Goal::Max, config).unwrap();
        let a = run(&search);
        let b = run(&search);

        assert_eq!(a.rows.len(), b.rows.len());
        for (x, y) in a.rows.iter().zip(&b.rows) {
            assert_eq!(x.electrodes, y.electrodes);
            assert_eq!(x.currents, y.currents);
            assert_eq!(x.cost.to_bits(), y.cost.to_bits());
        }
        assert_eq!(a.rows[0].electrodes, [0, 1, 0, 3]);
        assert_eq!(a.rows[0].currents, (1.0, 3.0));
        assert_eq!(a.rows[5].electrodes, [0, 1, 2, 3]);
        assert_eq!(a.best, b.best);
    }

    #[test]
    fn test_same_electrode_pairs_are_skipped() {
        let p = ElectrodePools::new(vec![0, 1], vec![1], vec![2], vec![3]);
        assert_eq!(p.raw_assignments(), 2);
        assert_eq!(p.valid_assignments(), 1);
        assert_eq!(p.assignments().collect::<Vec<_>>(), vec![[0, 1, 2, 3]]);

        let shared = ElectrodePools::new(vec![0, 1], vec![1, 0], vec![2, 3], vec![3]);
        assert_eq!(shared.valid_assignments(), 2);
        assert_eq!(shared.assignments().count() as u128, shared.valid_assignments());
    }

    #[test]
    fn test_failed_combinations_are_recorded() {
        let (lf, region) = analytic(true);
        let p = ElectrodePools::new(vec![0, 2], vec![1], vec![0, 2, 4], vec![3]);
        let search = ExhaustiveSearch::new(&lf, &region, &Goal::Mean, ExhaustiveConfig::new(p)).unwrap();
        let report = run(&search);

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.skipped.len(), 10);
        assert_eq!(report.rows.len(), 20);
        assert!(report.skipped.iter().all(|s| s.electrodes[2] == 4));
        assert!(report.skipped[0].reason.starts_with("Non-finite field"));
        assert_eq!(report.best.unwrap().electrodes, [2, 1, 2, 3]);
    }

    #[test]
    fn test_abort_on_failure_rate() {
        let (lf, region) = analytic(true);
        let p = ElectrodePools::new(vec![4], vec![1], vec![0, 2], vec![3]);
        let config = ExhaustiveConfig::new(p)
            .with_batch_size(2)
            .with_failure_policy(FailurePolicy { max_rate: 0.1, min_samples: 2 });
        let search = ExhaustiveSearch::new(&lf, &region, &Goal::Mean, config).unwrap();
        let report = run(&search);

        assert!(report.status.is_failed());
        assert!(report.best.is_none());
        assert_eq!(report.skipped.len(), 2);
    }

    #[test]
    fn test_cancellation_keeps_partial_table() {
        let (lf, region) = analytic(false);
        let search = ExhaustiveSearch::new(
            &lf,
            &region,
            &Goal::Mean,
            ExhaustiveConfig::new(pools()).with_batch_size(5),
        )
        .unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut batches = 0;
        let report = search.run(
            &token,
            Some(|p: &ExhaustiveProgress| {
                batches += 1;
                if p.completed >= 10 {
                    trigger.cancel();
                }
            }),
        );
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.rows.len(), 10);
        assert_eq!(batches, 2);
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let (lf, region) = analytic(false);
        let empty = ElectrodePools::new(vec![], vec![1], vec![2], vec![3]);
        assert!(matches!(
            ExhaustiveSearch::new(&lf, &region, &Goal::Mean, ExhaustiveConfig::new(empty)),
            Err(TiError::EmptyElectrodePool(_))
        ));
        assert!(matches!(
            ExhaustiveSearch::new(&lf, &region, &Goal::MultiObjective, ExhaustiveConfig::new(pools())),
            Err(TiError::InvalidConfig(_))
        ));
        let colliding = ElectrodePools::new(vec![1], vec![1], vec![2], vec![3]);
        assert!(matches!(
            ExhaustiveSearch::new(&lf, &region, &Goal::Mean, ExhaustiveConfig::new(colliding)),
            Err(TiError::InvalidConfig(_))
        ));
        let repeated = ElectrodePools::new(vec![0, 0], vec![1], vec![2], vec![3, 1, 1]);
        assert!(matches!(repeated.validate(&lf), Err(TiError::InvalidConfig(_))));
        let infeasible = ExhaustiveConfig::new(pools()).with_constraints(CurrentConstraints::new(4.0, 1.5, 0.5));
        assert!(matches!(
            ExhaustiveSearch::new(&lf, &region, &Goal::Mean, infeasible),
            Err(TiError::InfeasibleBudget { .. })
        ));
    }

    #[test]
    fn test_top_rows() {
        let (lf, region) = analytic(false);
        let goal = Goal::Focality(FocalityGoal {
            threshold: Some(0.0),
            ..FocalityGoal::default()
        });
        let search = ExhaustiveSearch::new(&lf, &region, &goal, ExhaustiveConfig::new(pools())).unwrap();
        let report = run(&search);
        let top = report.top(3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].electrodes, [2, 1, 2, 3]);
        assert!(top[0].cost <= top[1].cost && top[1].cost <= top[2].cost);
    }
}
