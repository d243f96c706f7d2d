//! # TIOpt Core
//!
//! Shared types and utilities for temporal-interference (TI) montage
//! optimization.
//!
//! ## Contents
//!
//! | Item | Role |
//! |------|------|
//! | [`Leadfield`] | electrode × voxel × 3 linear field model |
//! | [`Roi`], [`NonRoi`], [`TargetRegion`] | target and contrast voxel sets |
//! | [`Montage`] | two bipolar channels and their currents |
//! | [`CurrentConstraints`] | current budget and ratio enumeration |
//! | [`SearchSpace`] | gene encoding shared by the evolutionary optimizers |
//! | [`EvaluationCache`] | evaluate-once bookkeeping within a run |
//!
//! ## Design Philosophy
//!
//! 1. Leadfield and regions are immutable values handed to each run
//! 2. Configuration errors surface before any search begins
//! 3. Same inputs and seed reproduce the same trace

use nalgebra::Point3;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum TiError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("ROI is empty")]
    EmptyRoi,

    #[error("ROI and non-ROI overlap at {0} voxel(s)")]
    RoiOverlap(usize),

    #[error("Index {index} out of range for {what} (len {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Infeasible current budget: total {total_ma} mA, channel limit {channel_limit_ma} mA, step {step_ma} mA")]
    InfeasibleBudget {
        total_ma: f64,
        channel_limit_ma: f64,
        step_ma: f64,
    },

    #[error("Non-finite field for electrodes {0:?}")]
    NonFiniteField([usize; ELECTRODES_PER_MONTAGE]),

    #[error("Electrode pool {0} is empty")]
    EmptyElectrodePool(String),

    #[error("Unknown electrode: {0}")]
    UnknownElectrode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Search aborted: {failed} of {attempted} evaluations failed")]
    SearchAborted { failed: usize, attempted: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TiError>;

/// Current (mA)
pub type Milliamps = f64;

/// Electric field magnitude (V/m)
pub type FieldStrength = f64;

/// Electrodes making up one TI montage (two bipolar channels)
pub const ELECTRODES_PER_MONTAGE: usize = 4;

/// Absolute tolerance for current comparisons (mA)
pub const CURRENT_TOLERANCE: f64 = 1e-9;

// ============================================================================
// ELECTRODES
// ============================================================================

/// Scalp contact point of an EEG net
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Electrode {
    pub label: String,
    pub position: Point3<f64>,
}

impl Electrode {
    pub fn new(label: &str, position: Point3<f64>) -> Self {
        Self {
            label: label.to_string(),
            position,
        }
    }
}

/// Label ↔ position lookup for one EEG net
#[derive(Debug, Clone)]
pub struct ElectrodeCatalog {
    electrodes: Vec<Electrode>,
    by_label: HashMap<String, usize>,
}

impl ElectrodeCatalog {
    pub fn new(electrodes: Vec<Electrode>) -> Result<Self> {
        let mut by_label = HashMap::with_capacity(electrodes.len());
        for (i, e) in electrodes.iter().enumerate() {
            if by_label.insert(e.label.clone(), i).is_some() {
                return Err(TiError::InvalidConfig(format!(
                    "duplicate electrode label {} in catalog",
                    e.label
                )));
            }
        }
        Ok(Self {
            electrodes,
            by_label,
        })
    }

    pub fn len(&self) -> usize {
        self.electrodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.electrodes.is_empty()
    }

    pub fn electrodes(&self) -> &[Electrode] {
        &self.electrodes
    }

    pub fn get(&self, label: &str) -> Option<&Electrode> {
        self.by_label.get(label).map(|&i| &self.electrodes[i])
    }

    pub fn position(&self, label: &str) -> Result<Point3<f64>> {
        self.get(label)
            .map(|e| e.position)
            .ok_or_else(|| TiError::UnknownElectrode(label.to_string()))
    }

    /// Nearest electrode to `point`, skipping catalog indices in `exclude`.
    /// Returns (catalog index, distance).
    pub fn nearest(&self, point: &Point3<f64>, exclude: &[usize]) -> Option<(usize, f64)> {
        self.electrodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !exclude.contains(i))
            .map(|(i, e)| (i, nalgebra::distance(&e.position, point)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

// ============================================================================
// LEADFIELD
// ============================================================================

/// Precomputed linear map from per-electrode current to the field at each voxel.
///
/// `field[[e, v, c]]` is component `c` of the field (V/m per mA) at voxel `v`
/// when 1 mA is driven through electrode `e` against the reference.
#[derive(Debug, Clone)]
pub struct Leadfield {
    labels: Vec<String>,
    index: HashMap<String, usize>,
    field: Array3<f64>,
    voxel_positions: Option<Array2<f64>>,
}

impl Leadfield {
    pub fn new(labels: Vec<String>, field: Array3<f64>) -> Result<Self> {
        let (n_electrodes, n_voxels, n_components) = field.dim();
        if n_components != 3 {
            return Err(TiError::ShapeMismatch(format!(
                "leadfield must have 3 field components, got {}",
                n_components
            )));
        }
        if labels.len() != n_electrodes {
            return Err(TiError::ShapeMismatch(format!(
                "{} labels for {} leadfield electrodes",
                labels.len(),
                n_electrodes
            )));
        }
        if n_voxels == 0 {
            return Err(TiError::ShapeMismatch("leadfield has no voxels".into()));
        }

        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), i).is_some() {
                return Err(TiError::InvalidConfig(format!(
                    "duplicate electrode label {} in leadfield",
                    label
                )));
            }
        }

        Ok(Self {
            labels,
            index,
            field,
            voxel_positions: None,
        })
    }

    /// Attach voxel centers (n_voxels × 3), used by spherical ROIs
    pub fn with_voxel_positions(mut self, positions: Array2<f64>) -> Result<Self> {
        if positions.dim() != (self.voxel_count(), 3) {
            return Err(TiError::ShapeMismatch(format!(
                "voxel positions {:?} do not match {} voxels",
                positions.dim(),
                self.voxel_count()
            )));
        }
        self.voxel_positions = Some(positions);
        Ok(self)
    }

    pub fn electrode_count(&self) -> usize {
        self.field.len_of(Axis(0))
    }

    pub fn voxel_count(&self) -> usize {
        self.field.len_of(Axis(1))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, electrode: usize) -> Option<&str> {
        self.labels.get(electrode).map(String::as_str)
    }

    pub fn electrode_index(&self, label: &str) -> Result<usize> {
        self.index
            .get(label)
            .copied()
            .ok_or_else(|| TiError::UnknownElectrode(label.to_string()))
    }

    pub fn check_electrode(&self, electrode: usize) -> Result<()> {
        if electrode < self.electrode_count() {
            Ok(())
        } else {
            Err(TiError::IndexOutOfRange {
                what: "leadfield electrodes",
                index: electrode,
                len: self.electrode_count(),
            })
        }
    }

    /// Field of one electrode over all voxels (n_voxels × 3)
    pub fn electrode_field(&self, electrode: usize) -> ArrayView2<'_, f64> {
        self.field.index_axis(Axis(0), electrode)
    }

    pub fn field(&self) -> &Array3<f64> {
        &self.field
    }

    pub fn voxel_positions(&self) -> Option<&Array2<f64>> {
        self.voxel_positions.as_ref()
    }
}

// ============================================================================
// REGIONS
// ============================================================================

/// Target voxel set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub indices: Vec<usize>,
    /// Per-voxel weights for the ROI mean (e.g. element volumes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
}

impl Roi {
    pub fn new(indices: Vec<usize>) -> Self {
        Self {
            indices,
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Voxels whose centers lie within `radius` of `center`
    pub fn sphere(center: [f64; 3], radius: f64, voxel_positions: &Array2<f64>) -> Result<Self> {
        if !(radius > 0.0) {
            return Err(TiError::InvalidConfig(format!(
                "sphere radius must be positive, got {}",
                radius
            )));
        }
        if voxel_positions.ncols() != 3 {
            return Err(TiError::ShapeMismatch("voxel positions must be n × 3".into()));
        }
        let center = Point3::new(center[0], center[1], center[2]);
        let indices: Vec<usize> = voxel_positions
            .outer_iter()
            .enumerate()
            .filter(|(_, p)| nalgebra::distance(&Point3::new(p[0], p[1], p[2]), &center) <= radius)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return Err(TiError::EmptyRoi);
        }
        Ok(Self::new(indices))
    }

    /// Voxels carrying `wanted` in a per-voxel atlas labelling
    pub fn from_atlas(atlas: &[u32], wanted: u32) -> Result<Self> {
        let indices: Vec<usize> = atlas
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == wanted)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return Err(TiError::EmptyRoi);
        }
        Ok(Self::new(indices))
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Contrast region for focality objectives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "indices", rename_all = "snake_case")]
pub enum NonRoi {
    /// Every voxel outside the ROI
    #[default]
    Complement,
    Explicit(Vec<usize>),
}

/// Validated ROI and resolved non-ROI index set for one leadfield
#[derive(Debug, Clone)]
pub struct TargetRegion {
    roi: Vec<usize>,
    roi_weights: Option<Vec<f64>>,
    non_roi: Vec<usize>,
    complement: bool,
    voxel_count: usize,
}

impl TargetRegion {
    pub fn new(roi: &Roi, non_roi: &NonRoi, voxel_count: usize) -> Result<Self> {
        if roi.is_empty() {
            return Err(TiError::EmptyRoi);
        }

        let mut in_roi = vec![false; voxel_count];
        for &idx in &roi.indices {
            if idx >= voxel_count {
                return Err(TiError::IndexOutOfRange {
                    what: "ROI voxels",
                    index: idx,
                    len: voxel_count,
                });
            }
            if in_roi[idx] {
                return Err(TiError::InvalidConfig(format!("duplicate ROI voxel {}", idx)));
            }
            in_roi[idx] = true;
        }

        if let Some(weights) = &roi.weights {
            if weights.len() != roi.len() {
                return Err(TiError::ShapeMismatch(format!(
                    "{} ROI weights for {} ROI voxels",
                    weights.len(),
                    roi.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(TiError::InvalidConfig("ROI weights must be finite and non-negative".into()));
            }
            if weights.iter().sum::<f64>() <= 0.0 {
                return Err(TiError::InvalidConfig("ROI weights sum to zero".into()));
            }
        }

        let (non_roi, complement) = match non_roi {
            NonRoi::Complement => ((0..voxel_count).filter(|&i| !in_roi[i]).collect(), true),
            NonRoi::Explicit(indices) => {
                let mut seen = HashSet::with_capacity(indices.len());
                let mut overlap = 0;
                for &idx in indices {
                    if idx >= voxel_count {
                        return Err(TiError::IndexOutOfRange {
                            what: "non-ROI voxels",
                            index: idx,
                            len: voxel_count,
                        });
                    }
                    if !seen.insert(idx) {
                        return Err(TiError::InvalidConfig(format!("duplicate non-ROI voxel {}", idx)));
                    }
                    if in_roi[idx] {
                        overlap += 1;
                    }
                }
                if overlap > 0 {
                    return Err(TiError::RoiOverlap(overlap));
                }
                (indices.clone(), false)
            }
        };

        Ok(Self {
            roi: roi.indices.clone(),
            roi_weights: roi.weights.clone(),
            non_roi,
            complement,
            voxel_count,
        })
    }

    pub fn roi(&self) -> &[usize] {
        &self.roi
    }

    pub fn roi_weights(&self) -> Option<&[f64]> {
        self.roi_weights.as_deref()
    }

    pub fn non_roi(&self) -> &[usize] {
        &self.non_roi
    }

    /// True when the non-ROI set is "everything else"
    pub fn is_complement(&self) -> bool {
        self.complement
    }

    pub fn voxel_count(&self) -> usize {
        self.voxel_count
    }
}

// ============================================================================
// MONTAGES
// ============================================================================

/// One bipolar channel: current enters at the anode and leaves at the cathode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub anode: usize,
    pub cathode: usize,
    pub current_ma: Milliamps,
}

/// Two-channel TI montage (4 electrodes)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Montage {
    pub channels: [Channel; 2],
}

impl Montage {
    /// `electrodes` is `[e1+, e1-, e2+, e2-]`
    pub fn new(electrodes: [usize; ELECTRODES_PER_MONTAGE], currents: (Milliamps, Milliamps)) -> Self {
        Self {
            channels: [
                Channel {
                    anode: electrodes[0],
                    cathode: electrodes[1],
                    current_ma: currents.0,
                },
                Channel {
                    anode: electrodes[2],
                    cathode: electrodes[3],
                    current_ma: currents.1,
                },
            ],
        }
    }

    pub fn electrodes(&self) -> [usize; ELECTRODES_PER_MONTAGE] {
        [
            self.channels[0].anode,
            self.channels[0].cathode,
            self.channels[1].anode,
            self.channels[1].cathode,
        ]
    }

    pub fn currents(&self) -> (Milliamps, Milliamps) {
        (self.channels[0].current_ma, self.channels[1].current_ma)
    }

    pub fn total_current(&self) -> Milliamps {
        self.channels[0].current_ma + self.channels[1].current_ma
    }

    /// Check electrode indices against the leadfield and currents against the budget
    pub fn validate(&self, electrode_count: usize, constraints: &CurrentConstraints) -> Result<()> {
        for ch in &self.channels {
            for e in [ch.anode, ch.cathode] {
                if e >= electrode_count {
                    return Err(TiError::IndexOutOfRange {
                        what: "leadfield electrodes",
                        index: e,
                        len: electrode_count,
                    });
                }
            }
            if ch.anode == ch.cathode {
                return Err(TiError::InvalidConfig(format!(
                    "channel uses electrode {} as both anode and cathode",
                    ch.anode
                )));
            }
        }
        let (i1, i2) = self.currents();
        if !constraints.admits(i1, i2) {
            return Err(TiError::InvalidConfig(format!(
                "currents ({}, {}) mA violate the budget {:?}",
                i1, i2, constraints
            )));
        }
        Ok(())
    }

    /// Attach electrode labels for consumers outside the optimizer
    pub fn describe(&self, leadfield: &Leadfield) -> Result<LabeledMontage> {
        let label = |e: usize| -> Result<String> {
            leadfield.label(e).map(str::to_string).ok_or(TiError::IndexOutOfRange {
                what: "leadfield electrodes",
                index: e,
                len: leadfield.electrode_count(),
            })
        };
        let mut channels = Vec::with_capacity(2);
        for ch in &self.channels {
            channels.push(LabeledChannel {
                anode: label(ch.anode)?,
                cathode: label(ch.cathode)?,
                current_ma: ch.current_ma,
            });
        }
        Ok(LabeledMontage { channels })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledChannel {
    pub anode: String,
    pub cathode: String,
    pub current_ma: Milliamps,
}

/// Montage with electrode labels instead of leadfield indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledMontage {
    pub channels: Vec<LabeledChannel>,
}

// ============================================================================
// CURRENT BUDGET
// ============================================================================

/// Device current constraints
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentConstraints {
    /// Current shared by both channels (mA)
    pub total_ma: Milliamps,
    /// Per-channel maximum (mA)
    pub channel_limit_ma: Milliamps,
    /// Ratio enumeration granularity (mA)
    pub step_ma: Milliamps,
}

impl Default for CurrentConstraints {
    fn default() -> Self {
        Self {
            total_ma: 4.0,
            channel_limit_ma: 3.0,
            step_ma: 0.5,
        }
    }
}

impl CurrentConstraints {
    pub fn new(total_ma: Milliamps, channel_limit_ma: Milliamps, step_ma: Milliamps) -> Self {
        Self {
            total_ma,
            channel_limit_ma,
            step_ma,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("total current", self.total_ma),
            ("channel limit", self.channel_limit_ma),
            ("current step", self.step_ma),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(TiError::InvalidConfig(format!("{} must be positive, got {}", name, v)));
            }
        }
        Ok(())
    }

    fn infeasible(&self) -> TiError {
        TiError::InfeasibleBudget {
            total_ma: self.total_ma,
            channel_limit_ma: self.channel_limit_ma,
            step_ma: self.step_ma,
        }
    }

    /// Ordered `(I1, I2)` pairs with `I1 + I2 = total`, both in `(0, limit]`,
    /// `I1` ascending in multiples of the step.
    pub fn current_ratios(&self) -> Result<Vec<(Milliamps, Milliamps)>> {
        self.validate()?;

        // Integer stepping keeps the sequence free of accumulated drift
        let steps = (self.total_ma / self.step_ma + CURRENT_TOLERANCE).floor() as usize;
        let ratios: Vec<(f64, f64)> = (1..=steps)
            .map(|k| {
                let i1 = snap(k as f64 * self.step_ma);
                (i1, snap(self.total_ma - i1))
            })
            .filter(|&(i1, i2)| i2 > CURRENT_TOLERANCE && self.admits(i1, i2))
            .collect();

        if ratios.is_empty() {
            return Err(self.infeasible());
        }
        Ok(ratios)
    }

    /// Continuous interval for `I1 / total`, with both channels at least one step
    pub fn ratio_bounds(&self) -> Result<(f64, f64)> {
        self.validate()?;
        let low = self.step_ma.max(self.total_ma - self.channel_limit_ma) / self.total_ma;
        let high = (self.total_ma - self.step_ma).min(self.channel_limit_ma) / self.total_ma;
        if low > high + CURRENT_TOLERANCE {
            return Err(self.infeasible());
        }
        Ok((low, high.max(low)))
    }

    /// Split the total at `ratio` (channel 1 share)
    pub fn split(&self, ratio: f64) -> (Milliamps, Milliamps) {
        let i1 = ratio * self.total_ma;
        (i1, self.total_ma - i1)
    }

    pub fn admits(&self, i1: Milliamps, i2: Milliamps) -> bool {
        i1 > 0.0
            && i2 > 0.0
            && i1 <= self.channel_limit_ma + CURRENT_TOLERANCE
            && i2 <= self.channel_limit_ma + CURRENT_TOLERANCE
            && (i1 + i2 - self.total_ma).abs() <= CURRENT_TOLERANCE * self.total_ma.max(1.0)
    }
}

fn snap(x: f64) -> f64 {
    (x * 1e9).round() / 1e9
}

// ============================================================================
// GOALS
// ============================================================================

/// Optimization goal, resolved once per run into a cost function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Goal {
    /// Maximize the mean envelope over the ROI
    #[default]
    Mean,
    /// Maximize the peak envelope in the ROI
    Max,
    /// Maximize the ROI mean while limiting exposure elsewhere
    Focality(FocalityGoal),
    /// Pareto trade-off between ROI intensity and off-target exposure
    MultiObjective,
}

/// Focality settings. When `thresholds` is set it takes precedence over the
/// single-threshold penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocalityGoal {
    /// Non-ROI level above which exposure is penalized (V/m)
    pub threshold: Option<FieldStrength>,
    /// Weight of the non-ROI exceedance penalty
    pub penalty_weight: f64,
    /// Two-threshold form: `[non-ROI max, ROI min]` (V/m)
    pub thresholds: Option<[FieldStrength; 2]>,
}

impl Default for FocalityGoal {
    fn default() -> Self {
        Self {
            threshold: None,
            penalty_weight: 1.0,
            thresholds: None,
        }
    }
}

// ============================================================================
// SEARCH SPACE (evolutionary encoding)
// ============================================================================

/// How electrode genes map to candidate electrodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElectrodeLayout {
    /// One gene per electrode, rounded to a candidate slot
    Index,
    /// Two genes per electrode: azimuthal projection of the scalp position
    Scalp { coordinates: Vec<[f64; 2]> },
}

/// Identity of an evaluated (assignment, current split)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateKey {
    pub electrodes: [usize; ELECTRODES_PER_MONTAGE],
    current_bits: u64,
}

impl CandidateKey {
    pub fn of(montage: &Montage) -> Self {
        Self {
            electrodes: montage.electrodes(),
            current_bits: montage.channels[0].current_ma.to_bits(),
        }
    }
}

/// One point of the search space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub montage: Montage,
    pub key: CandidateKey,
}

impl Candidate {
    pub fn new(montage: Montage) -> Self {
        Self {
            key: CandidateKey::of(&montage),
            montage,
        }
    }
}

/// Individual encoding `[e1, e2, e3, e4, ratio]` over a candidate electrode set.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    candidates: Vec<usize>,
    layout: ElectrodeLayout,
    constraints: CurrentConstraints,
    ratio_bounds: (f64, f64),
}

impl SearchSpace {
    pub fn new(candidates: Vec<usize>, leadfield: &Leadfield, constraints: CurrentConstraints) -> Result<Self> {
        if candidates.is_empty() {
            return Err(TiError::EmptyElectrodePool("candidates".into()));
        }
        let mut seen = HashSet::with_capacity(candidates.len());
        for &e in &candidates {
            leadfield.check_electrode(e)?;
            if !seen.insert(e) {
                return Err(TiError::InvalidConfig(format!("duplicate candidate electrode {}", e)));
            }
        }
        if candidates.len() < ELECTRODES_PER_MONTAGE {
            return Err(TiError::InvalidConfig(format!(
                "need at least {} candidate electrodes, got {}",
                ELECTRODES_PER_MONTAGE,
                candidates.len()
            )));
        }
        let ratio_bounds = constraints.ratio_bounds()?;
        Ok(Self {
            candidates,
            layout: ElectrodeLayout::Index,
            constraints,
            ratio_bounds,
        })
    }

    /// Every leadfield electrode is a candidate
    pub fn all_electrodes(leadfield: &Leadfield, constraints: CurrentConstraints) -> Result<Self> {
        Self::new((0..leadfield.electrode_count()).collect(), leadfield, constraints)
    }

    /// Switch to continuous scalp coordinates. `positions[k]` is the 3D
    /// position of candidate `k`.
    pub fn with_scalp_layout(mut self, positions: &[Point3<f64>]) -> Result<Self> {
        if positions.len() != self.candidates.len() {
            return Err(TiError::ShapeMismatch(format!(
                "{} positions for {} candidates",
                positions.len(),
                self.candidates.len()
            )));
        }
        self.layout = ElectrodeLayout::Scalp {
            coordinates: project_to_plane(positions),
        };
        Ok(self)
    }

    pub fn candidates(&self) -> &[usize] {
        &self.candidates
    }

    pub fn layout(&self) -> &ElectrodeLayout {
        &self.layout
    }

    pub fn constraints(&self) -> &CurrentConstraints {
        &self.constraints
    }

    fn genes_per_electrode(&self) -> usize {
        match self.layout {
            ElectrodeLayout::Index => 1,
            ElectrodeLayout::Scalp { .. } => 2,
        }
    }

    pub fn dimension(&self) -> usize {
        ELECTRODES_PER_MONTAGE * self.genes_per_electrode() + 1
    }

    /// Position of the current-ratio gene
    pub fn ratio_gene(&self) -> usize {
        ELECTRODES_PER_MONTAGE * self.genes_per_electrode()
    }

    /// Genes encoding electrode `slot` (0..4)
    pub fn slot_genes(&self, slot: usize) -> Range<usize> {
        let g = self.genes_per_electrode();
        slot * g..(slot + 1) * g
    }

    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let mut bounds = Vec::with_capacity(self.dimension());
        match &self.layout {
            ElectrodeLayout::Index => {
                let upper = (self.candidates.len() - 1) as f64;
                bounds.extend(std::iter::repeat((0.0, upper)).take(ELECTRODES_PER_MONTAGE));
            }
            ElectrodeLayout::Scalp { coordinates } => {
                let axis = |a: usize| {
                    coordinates.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| {
                        (lo.min(c[a]), hi.max(c[a]))
                    })
                };
                let (x, y) = (axis(0), axis(1));
                for _ in 0..ELECTRODES_PER_MONTAGE {
                    bounds.push(x);
                    bounds.push(y);
                }
            }
        }
        bounds.push(self.ratio_bounds);
        bounds
    }

    /// Random individual with 4 distinct electrodes
    pub fn random_genes<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let mut genes = vec![0.0; self.dimension()];
        let picks = rand::seq::index::sample(rng, self.candidates.len(), ELECTRODES_PER_MONTAGE);
        for (slot, k) in picks.iter().enumerate() {
            self.write_slot(&mut genes, slot, k);
        }
        let (lo, hi) = self.ratio_bounds;
        genes[self.ratio_gene()] = rng.gen_range(lo..=hi);
        genes
    }

    /// Random-reset one electrode slot (may collide; call `repair` afterwards)
    pub fn reset_slot<R: Rng + ?Sized>(&self, genes: &mut [f64], slot: usize, rng: &mut R) {
        let k = rng.gen_range(0..self.candidates.len());
        self.write_slot(genes, slot, k);
    }

    fn write_slot(&self, genes: &mut [f64], slot: usize, k: usize) {
        let range = self.slot_genes(slot);
        match &self.layout {
            ElectrodeLayout::Index => genes[range.start] = k as f64,
            ElectrodeLayout::Scalp { coordinates } => {
                genes[range.start] = coordinates[k][0];
                genes[range.start + 1] = coordinates[k][1];
            }
        }
    }

    /// Clamp to bounds, resolve each slot to the nearest unused candidate and
    /// snap its genes onto that candidate. Returns candidate slots.
    pub fn repair(&self, genes: &mut [f64]) -> [usize; ELECTRODES_PER_MONTAGE] {
        for (g, (lo, hi)) in genes.iter_mut().zip(self.bounds()) {
            *g = if g.is_nan() { lo } else { g.clamp(lo, hi) };
        }

        let mut used: Vec<usize> = Vec::with_capacity(ELECTRODES_PER_MONTAGE);
        for slot in 0..ELECTRODES_PER_MONTAGE {
            let range = self.slot_genes(slot);
            let k = match &self.layout {
                ElectrodeLayout::Index => nearest_free_index(genes[range.start], self.candidates.len(), &used),
                ElectrodeLayout::Scalp { coordinates } => {
                    nearest_free_point(coordinates, [genes[range.start], genes[range.start + 1]], &used)
                }
            };
            used.push(k);
            self.write_slot(genes, slot, k);
        }
        [used[0], used[1], used[2], used[3]]
    }

    /// Decode genes into a montage (repairing a copy)
    pub fn decode(&self, genes: &[f64]) -> Candidate {
        let mut repaired = genes.to_vec();
        let slots = self.repair(&mut repaired);
        let electrodes = slots.map(|k| self.candidates[k]);
        let currents = self.constraints.split(repaired[self.ratio_gene()]);
        Candidate::new(Montage::new(electrodes, currents))
    }
}

fn nearest_free_index(gene: f64, n: usize, used: &[usize]) -> usize {
    let start = gene.round().clamp(0.0, (n - 1) as f64) as usize;
    for offset in 0..n {
        for k in [start.checked_add(offset), start.checked_sub(offset)].into_iter().flatten() {
            if k < n && !used.contains(&k) {
                return k;
            }
        }
    }
    start
}

fn nearest_free_point(coordinates: &[[f64; 2]], p: [f64; 2], used: &[usize]) -> usize {
    coordinates
        .iter()
        .enumerate()
        .filter(|(k, _)| !used.contains(k))
        .map(|(k, c)| (k, (c[0] - p[0]).powi(2) + (c[1] - p[1]).powi(2)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(k, _)| k)
        .unwrap_or(0)
}

/// Azimuthal equidistant projection around the vertex of the electrode cloud
fn project_to_plane(positions: &[Point3<f64>]) -> Vec<[f64; 2]> {
    let n = positions.len().max(1) as f64;
    let centroid = positions
        .iter()
        .fold(nalgebra::Vector3::zeros(), |acc, p| acc + p.coords)
        / n;

    positions
        .iter()
        .map(|p| {
            let v = p.coords - centroid;
            let r = v.norm();
            if r == 0.0 {
                return [0.0, 0.0];
            }
            let polar = (v.z / r).clamp(-1.0, 1.0).acos();
            let azimuth = v.y.atan2(v.x);
            [polar * azimuth.cos(), polar * azimuth.sin()]
        })
        .collect()
}

// ============================================================================
// EVALUATION CACHE
// ============================================================================

/// Evaluations actually run by one cached batch (hits excluded)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreshCount {
    pub evaluated: usize,
    pub failed: usize,
}

/// Memoizes per-candidate results so each unique candidate is evaluated
/// once per run. Misses in a batch are evaluated in parallel.
#[derive(Debug, Clone)]
pub struct EvaluationCache<V> {
    entries: HashMap<CandidateKey, V>,
    hits: usize,
    misses: usize,
}

impl<V> Default for EvaluationCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<V: Clone + Send> EvaluationCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn get(&self, key: &CandidateKey) -> Option<&V> {
        self.entries.get(key)
    }

    /// Results for `candidates`, in order
    pub fn evaluate_batch<F>(&mut self, candidates: &[Candidate], evaluate: F) -> Vec<V>
    where
        F: Fn(&Montage) -> V + Sync,
    {
        self.evaluate_batch_counted(candidates, evaluate, |_| false).0
    }

    /// Like [`evaluate_batch`](Self::evaluate_batch), also counting the
    /// evaluations this call ran and how many of those `failed`
    pub fn evaluate_batch_counted<F, P>(&mut self, candidates: &[Candidate], evaluate: F, failed: P) -> (Vec<V>, FreshCount)
    where
        F: Fn(&Montage) -> V + Sync,
        P: Fn(&V) -> bool,
    {
        let mut queued = HashSet::new();
        let pending: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| !self.entries.contains_key(&c.key) && queued.insert(c.key))
            .collect();

        self.misses += pending.len();
        self.hits += candidates.len() - pending.len();

        let fresh: Vec<(CandidateKey, V)> = pending
            .par_iter()
            .map(|c| (c.key, evaluate(&c.montage)))
            .collect();
        let count = FreshCount {
            evaluated: fresh.len(),
            failed: fresh.iter().filter(|(_, v)| failed(v)).count(),
        };
        self.entries.extend(fresh);

        let values = candidates.iter().map(|c| self.entries[&c.key].clone()).collect();
        (values, count)
    }
}

// ============================================================================
// RUN CONTROL
// ============================================================================

/// Cooperative cancellation, checked between batches/generations
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

/// Terminal state of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Cancelled,
    /// Finished, but on the fallback optimizer
    DegradedFallback,
    Failed { reason: String },
}

impl RunStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::DegradedFallback => "degraded-fallback",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Per-generation summary, appended in generation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: usize,
    pub best_cost: f64,
    pub mean_cost: f64,
    pub evaluations: usize,
    pub failures: usize,
}

/// Tolerated share of failed evaluations before a run is aborted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    pub max_rate: f64,
    /// Evaluations needed before the rate is judged
    pub min_samples: usize,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_rate: 0.5,
            min_samples: 20,
        }
    }
}

/// Running failure tally against a [`FailurePolicy`]
#[derive(Debug, Clone, Default)]
pub struct FailureTally {
    pub attempted: usize,
    pub failed: usize,
}

impl FailureTally {
    pub fn record(&mut self, attempted: usize, failed: usize) {
        self.attempted += attempted;
        self.failed += failed;
    }

    pub fn rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed as f64 / self.attempted as f64
        }
    }

    pub fn exceeds(&self, policy: &FailurePolicy) -> bool {
        self.attempted >= policy.min_samples && self.failed > 0 && self.rate() > policy.max_rate
    }

    pub fn to_error(&self) -> TiError {
        TiError::SearchAborted {
            failed: self.failed,
            attempted: self.attempted,
        }
    }
}

/// Independent seed for stream `stream` of a base seed (splitmix64)
pub fn derive_seed(base: u64, stream: u64) -> u64 {
    let mut z = base.wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
