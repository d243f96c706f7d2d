//! Problem files and run configuration.
//!
//! Run settings are layered: JSON file, then `TIOPT_*` environment
//! variables, then command-line flags.

use anyhow::{bail, Context};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tiopt_core::{
    CurrentConstraints, Electrode, ElectrodeCatalog, FailurePolicy, Goal, Leadfield, NonRoi, Roi, SearchSpace,
    TargetRegion,
};
use tiopt_exsearch::{ElectrodePools, ExhaustiveConfig};
use tiopt_flex::FlexConfig;
use tiopt_movea::MoveaConfig;

// ============================================================================
// PROBLEM
// ============================================================================

/// How the ROI is given in a problem file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoiSource {
    Indices(Roi),
    Sphere { center: [f64; 3], radius: f64 },
    Atlas { atlas: Vec<u32>, label: u32 },
}

/// In-memory arrays for one optimization problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemFile {
    pub labels: Vec<String>,
    /// `field[electrode][voxel] = [x, y, z]`
    pub field: Vec<Vec<[f64; 3]>>,
    #[serde(default)]
    pub voxel_positions: Option<Vec<[f64; 3]>>,
    pub roi: RoiSource,
    #[serde(default)]
    pub non_roi: NonRoi,
    #[serde(default)]
    pub catalog: Option<Vec<Electrode>>,
}

/// Validated problem
pub struct Problem {
    pub leadfield: Leadfield,
    pub region: TargetRegion,
    pub catalog: Option<ElectrodeCatalog>,
}

impl ProblemFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading problem {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing problem {}", path.display()))
    }

    pub fn into_problem(self) -> anyhow::Result<Problem> {
        let n_electrodes = self.field.len();
        let n_voxels = self.field.first().map_or(0, Vec::len);
        if let Some(bad) = self.field.iter().position(|row| row.len() != n_voxels) {
            bail!(
                "electrode {} has {} voxels, expected {}",
                bad,
                self.field[bad].len(),
                n_voxels
            );
        }
        let flat: Vec<f64> = self.field.iter().flatten().flatten().copied().collect();
        let field = Array3::from_shape_vec((n_electrodes, n_voxels, 3), flat).context("leadfield shape")?;
        let mut leadfield = Leadfield::new(self.labels, field)?;

        if let Some(positions) = &self.voxel_positions {
            let flat: Vec<f64> = positions.iter().flatten().copied().collect();
            let positions = Array2::from_shape_vec((positions.len(), 3), flat).context("voxel positions shape")?;
            leadfield = leadfield.with_voxel_positions(positions)?;
        }

        let roi = match self.roi {
            RoiSource::Indices(roi) => roi,
            RoiSource::Sphere { center, radius } => {
                let positions = leadfield
                    .voxel_positions()
                    .context("spherical ROI needs voxel_positions")?;
                Roi::sphere(center, radius, positions)?
            }
            RoiSource::Atlas { atlas, label } => {
                if atlas.len() != leadfield.voxel_count() {
                    bail!("atlas has {} entries for {} voxels", atlas.len(), leadfield.voxel_count());
                }
                Roi::from_atlas(&atlas, label)?
            }
        };
        let region = TargetRegion::new(&roi, &self.non_roi, leadfield.voxel_count())?;
        let catalog = self.catalog.map(ElectrodeCatalog::new).transpose()?;

        Ok(Problem {
            leadfield,
            region,
            catalog,
        })
    }
}

// ============================================================================
// RUN CONFIGURATION
// ============================================================================

/// Exhaustive pools by electrode label
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolLabels {
    pub e1_plus: Vec<String>,
    pub e1_minus: Vec<String>,
    pub e2_plus: Vec<String>,
    pub e2_minus: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustiveSettings {
    pub pools: PoolLabels,
    pub batch_size: usize,
    /// Ask before runs with more evaluations than this
    pub confirm_above: u64,
}

impl Default for ExhaustiveSettings {
    fn default() -> Self {
        Self {
            pools: PoolLabels::default(),
            batch_size: 256,
            confirm_above: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunConfig {
    pub goal: Goal,
    pub constraints: CurrentConstraints,
    pub failure: FailurePolicy,
    /// Worker threads (rayon default when unset)
    pub threads: Option<usize>,
    /// Candidate electrodes for flex/MOVEA by label (all when unset)
    pub candidates: Option<Vec<String>>,
    /// Encode electrodes as scalp coordinates (needs a catalog)
    pub scalp_layout: bool,
    pub exhaustive: ExhaustiveSettings,
    pub flex: FlexConfig,
    pub movea: MoveaConfig,
}

/// Command-line values that override the file and environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub seed: Option<u64>,
    pub threads: Option<usize>,
    pub starts: Option<usize>,
}

impl RunConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply `TIOPT_SEED`, `TIOPT_THREADS`, `TIOPT_STARTS` from `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TIOPT_SEED") {
            let seed = v.trim().parse().with_context(|| format!("TIOPT_SEED={}", v))?;
            self.set_seed(seed);
        }
        if let Some(v) = lookup("TIOPT_THREADS") {
            self.threads = Some(v.trim().parse().with_context(|| format!("TIOPT_THREADS={}", v))?);
        }
        if let Some(v) = lookup("TIOPT_STARTS") {
            self.flex.num_starts = v.trim().parse().with_context(|| format!("TIOPT_STARTS={}", v))?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(seed) = overrides.seed {
            self.set_seed(seed);
        }
        if let Some(threads) = overrides.threads {
            self.threads = Some(threads);
        }
        if let Some(starts) = overrides.starts {
            self.flex.num_starts = starts;
        }
    }

    fn set_seed(&mut self, seed: u64) {
        self.flex.seed = seed;
        self.movea.seed = seed;
    }

    /// File, then process environment, then flags
    pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_overrides(overrides);
        config.flex.failure = config.failure;
        config.movea.failure = config.failure;
        Ok(config)
    }

    pub fn exhaustive_config(&self, leadfield: &Leadfield) -> anyhow::Result<ExhaustiveConfig> {
        let p = &self.exhaustive.pools;
        let pools = ElectrodePools::from_labels(
            leadfield,
            [
                p.e1_plus.as_slice(),
                p.e1_minus.as_slice(),
                p.e2_plus.as_slice(),
                p.e2_minus.as_slice(),
            ],
        )?;
        Ok(ExhaustiveConfig::new(pools)
            .with_constraints(self.constraints)
            .with_batch_size(self.exhaustive.batch_size)
            .with_failure_policy(self.failure))
    }

    pub fn search_space(&self, problem: &Problem) -> anyhow::Result<SearchSpace> {
        let lf = &problem.leadfield;
        let candidates: Vec<usize> = match &self.candidates {
            Some(labels) => labels
                .iter()
                .map(|l| lf.electrode_index(l))
                .collect::<tiopt_core::Result<_>>()?,
            None => (0..lf.electrode_count()).collect(),
        };
        let space = SearchSpace::new(candidates.clone(), lf, self.constraints)?;
        if !self.scalp_layout {
            return Ok(space);
        }

        let catalog = problem
            .catalog
            .as_ref()
            .context("scalp layout needs an electrode catalog in the problem file")?;
        let positions = candidates
            .iter()
            .map(|&e| catalog.position(lf.labels()[e].as_str()))
            .collect::<tiopt_core::Result<Vec<_>>>()?;
        Ok(space.with_scalp_layout(&positions)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const PROBLEM: &str = r#"{
        "labels": ["A", "B", "C", "D"],
        "field": [
            [[1.0, 0.0, 0.0], [0.5, 0.0, 0.0], [0.0, 0.0, 0.0]],
            [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
            [[3.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]],
            [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]
        ],
        "voxel_positions": [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [9.0, 0.0, 0.0]],
        "roi": {"center": [0.0, 0.0, 0.0], "radius": 1.5},
        "catalog": [
            {"label": "A", "position": [1.0, 0.0, 0.0]},
            {"label": "B", "position": [0.0, 1.0, 0.0]},
            {"label": "C", "position": [-1.0, 0.0, 0.0]},
            {"label": "D", "position": [0.0, 0.0, 1.0]}
        ]
    }"#;

    #[test]
    fn test_problem_from_json() {
        let file: ProblemFile = serde_json::from_str(PROBLEM).unwrap();
        let problem = file.into_problem().unwrap();
        assert_eq!(problem.leadfield.electrode_count(), 4);
        assert_eq!(problem.leadfield.voxel_count(), 3);
        assert_eq!(problem.region.roi(), &[0, 1]);
        assert_eq!(problem.region.non_roi(), &[2]);
        assert_eq!(problem.catalog.unwrap().len(), 4);
    }

    #[test]
    fn test_ragged_field_rejected() {
        let file: ProblemFile = serde_json::from_str(
            r#"{"labels": ["A", "B"], "field": [[[1.0, 0.0, 0.0]], []], "roi": {"indices": [0]}}"#,
        )
        .unwrap();
        assert!(file.into_problem().is_err());
    }

    #[test]
    fn test_layering_precedence() {
        let mut config: RunConfig =
            serde_json::from_str(r#"{"flex": {"seed": 1, "num_starts": 2}, "threads": 2}"#).unwrap();
        assert_eq!(config.flex.population_size, 32);

        let env: HashMap<&str, &str> = [("TIOPT_SEED", "5"), ("TIOPT_STARTS", "3")].into_iter().collect();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.flex.seed, 5);
        assert_eq!(config.movea.seed, 5);
        assert_eq!(config.flex.num_starts, 3);
        assert_eq!(config.threads, Some(2));

        config.apply_overrides(&Overrides {
            seed: Some(9),
            threads: None,
            starts: None,
        });
        assert_eq!(config.flex.seed, 9);
        assert_eq!(config.flex.num_starts, 3);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = RunConfig::default();
        assert!(config
            .apply_env(|k| (k == "TIOPT_THREADS").then(|| "many".to_string()))
            .is_err());
    }

    #[test]
    fn test_search_space_with_scalp_layout() {
        let problem: ProblemFile = serde_json::from_str(PROBLEM).unwrap();
        let problem = problem.into_problem().unwrap();
        let config = RunConfig {
            scalp_layout: true,
            ..RunConfig::default()
        };
        let space = config.search_space(&problem).unwrap();
        assert_eq!(space.dimension(), 9);
    }

    #[test]
    fn test_exhaustive_pools_by_label() {
        let problem: ProblemFile = serde_json::from_str(PROBLEM).unwrap();
        let problem = problem.into_problem().unwrap();
        let mut config = RunConfig::default();
        config.exhaustive.pools = PoolLabels {
            e1_plus: vec!["A".into(), "C".into()],
            e1_minus: vec!["B".into()],
            e2_plus: vec!["A".into(), "C".into()],
            e2_minus: vec!["D".into()],
        };
        let exhaustive = config.exhaustive_config(&problem.leadfield).unwrap();
        assert_eq!(exhaustive.pools.e1_plus, vec![0, 2]);

        config.exhaustive.pools.e2_minus = vec!["Cz".into()];
        assert!(config.exhaustive_config(&problem.leadfield).is_err());
    }
}
