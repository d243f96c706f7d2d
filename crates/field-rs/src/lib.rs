//! # TI Field Evaluation
//!
//! Superposes the two channel fields of a montage from a precomputed
//! leadfield and computes the temporal-interference envelope per voxel.
//!
//! ## Envelope
//!
//! The maximal amplitude modulation of two fields E1, E2 oscillating at
//! slightly different frequencies (Grossman et al., Cell 2017):
//!
//! ```text
//! |E1| >= |E2|, E1·E2 >= 0 (flip E2 otherwise)
//! TI = 2|E2|                       if |E2| <= |E1| cos(α)
//! TI = 2|E2 × (E1 - E2)| / |E1 - E2|  otherwise
//! ```
//!
//! Objectives turn an evaluated field into a scalar cost (lower is better)
//! or a two-objective vector for Pareto search.

use nalgebra::Vector3;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use tiopt_core::{
    Channel, FieldStrength, FocalityGoal, Goal, Leadfield, Montage, Result, TargetRegion, TiError,
};
use tracing::debug;

/// Penalty multiplier for the two-threshold focality form
pub const CONSTRAINT_PENALTY: f64 = 1e3;

const ZERO_FIELD: f64 = 1e-300;

// ============================================================================
// ENVELOPE
// ============================================================================

/// Maximum TI modulation amplitude for one voxel
pub fn ti_max(e1: Vector3<f64>, e2: Vector3<f64>) -> FieldStrength {
    let (a, mut b) = if e1.norm() >= e2.norm() { (e1, e2) } else { (e2, e1) };
    if a.dot(&b) < 0.0 {
        b = -b;
    }

    let na = a.norm();
    let nb = b.norm();
    if na <= ZERO_FIELD || nb <= ZERO_FIELD {
        return 0.0;
    }

    let cos_alpha = a.dot(&b) / (na * nb);
    if nb <= na * cos_alpha {
        return 2.0 * nb;
    }

    let diff = a - b;
    let nd = diff.norm();
    if nd <= ZERO_FIELD {
        2.0 * nb
    } else {
        2.0 * b.cross(&diff).norm() / nd
    }
}

/// Envelope amplitude along a unit direction `n`
pub fn ti_directional(e1: Vector3<f64>, e2: Vector3<f64>, n: Vector3<f64>) -> FieldStrength {
    ((e1 + e2).dot(&n).abs() - (e1 - e2).dot(&n).abs()).abs()
}

fn row(v: ndarray::ArrayView1<'_, f64>) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

/// Per-voxel envelope of two `n_voxels × 3` fields
pub fn ti_envelope(e1: ArrayView2<'_, f64>, e2: ArrayView2<'_, f64>) -> Array1<f64> {
    let mut out = Array1::zeros(e1.nrows());
    Zip::from(&mut out)
        .and(e1.rows())
        .and(e2.rows())
        .for_each(|t, a, b| *t = ti_max(row(a), row(b)));
    out
}

/// Per-voxel envelope projected on `direction` (normalized here)
pub fn ti_envelope_directional(
    e1: ArrayView2<'_, f64>,
    e2: ArrayView2<'_, f64>,
    direction: [f64; 3],
) -> Result<Array1<f64>> {
    let n = Vector3::from(direction);
    let norm = n.norm();
    if !(norm > 0.0) || !norm.is_finite() {
        return Err(TiError::InvalidConfig(format!(
            "envelope direction must be a non-zero vector, got {:?}",
            direction
        )));
    }
    let n = n / norm;
    let mut out = Array1::zeros(e1.nrows());
    Zip::from(&mut out)
        .and(e1.rows())
        .and(e2.rows())
        .for_each(|t, a, b| *t = ti_directional(row(a), row(b), n));
    Ok(out)
}

/// `I · (L[anode] − L[cathode])` over all voxels
pub fn channel_field(leadfield: &Leadfield, channel: &Channel) -> Result<Array2<f64>> {
    for e in [channel.anode, channel.cathode] {
        if e >= leadfield.electrode_count() {
            return Err(TiError::ShapeMismatch(format!(
                "electrode {} outside leadfield with {} electrodes",
                e,
                leadfield.electrode_count()
            )));
        }
    }
    if !channel.current_ma.is_finite() || channel.current_ma <= 0.0 {
        return Err(TiError::ShapeMismatch(format!(
            "channel current must be positive and finite, got {}",
            channel.current_ma
        )));
    }
    let anode = leadfield.electrode_field(channel.anode);
    let cathode = leadfield.electrode_field(channel.cathode);
    Ok((&anode - &cathode) * channel.current_ma)
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Envelope restricted to the ROI and non-ROI sets
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResult {
    pub roi: Array1<f64>,
    pub non_roi: Array1<f64>,
    /// ROI mean (weighted when the ROI carries weights)
    pub roi_mean: FieldStrength,
    pub whole_brain_mean: FieldStrength,
}

/// Evaluate a montage. Pure: repeated calls give bit-identical results.
pub fn evaluate(montage: &Montage, leadfield: &Leadfield, region: &TargetRegion) -> Result<FieldResult> {
    if region.voxel_count() != leadfield.voxel_count() {
        return Err(TiError::ShapeMismatch(format!(
            "region built for {} voxels, leadfield has {}",
            region.voxel_count(),
            leadfield.voxel_count()
        )));
    }
    if region.roi().is_empty() {
        return Err(TiError::EmptyRoi);
    }

    let e1 = channel_field(leadfield, &montage.channels[0])?;
    let e2 = channel_field(leadfield, &montage.channels[1])?;
    let ti = ti_envelope(e1.view(), e2.view());

    let roi = ti.select(Axis(0), region.roi());
    let non_roi = ti.select(Axis(0), region.non_roi());
    let roi_mean = weighted_mean(&roi, region.roi_weights());
    let whole_brain_mean = ti.mean().unwrap_or(0.0);

    Ok(FieldResult {
        roi,
        non_roi,
        roi_mean,
        whole_brain_mean,
    })
}

fn weighted_mean(values: &Array1<f64>, weights: Option<&[f64]>) -> f64 {
    match weights {
        Some(w) => {
            let total: f64 = w.iter().sum();
            values.iter().zip(w).map(|(v, w)| v * w).sum::<f64>() / total
        }
        None => values.mean().unwrap_or(0.0),
    }
}

fn max_of(values: &Array1<f64>) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn min_of(values: &Array1<f64>) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

/// Summary metrics reported per candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub ti_max_roi: FieldStrength,
    pub ti_mean_roi: FieldStrength,
    pub ti_mean_whole_brain: FieldStrength,
    /// ROI mean over whole-brain mean (0 when the brain is unstimulated)
    pub focality: f64,
}

impl Metrics {
    pub fn from_field(result: &FieldResult) -> Self {
        let focality = if result.whole_brain_mean > 0.0 {
            result.roi_mean / result.whole_brain_mean
        } else {
            0.0
        };
        Self {
            ti_max_roi: max_of(&result.roi),
            ti_mean_roi: result.roi_mean,
            ti_mean_whole_brain: result.whole_brain_mean,
            focality,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.ti_max_roi.is_finite()
            && self.ti_mean_roi.is_finite()
            && self.ti_mean_whole_brain.is_finite()
            && self.focality.is_finite()
    }
}

// ============================================================================
// OBJECTIVES
// ============================================================================

/// Resolved focality cost
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FocalityCost {
    /// `-mean(ROI) + w · mean(max(0, nonROI - t))`
    Penalized { threshold: f64, weight: f64 },
    /// `-mean(ROI) + K · (max(0, max(nonROI) - A) + max(0, B - min(ROI)))`
    Constrained { non_roi_max: f64, roi_min: f64 },
}

impl FocalityCost {
    fn resolve(goal: &FocalityGoal) -> Result<Self> {
        if let Some([non_roi_max, roi_min]) = goal.thresholds {
            if goal.threshold.is_some() {
                debug!("Both focality forms configured, using two-threshold form");
            }
            return Ok(Self::Constrained { non_roi_max, roi_min });
        }
        let threshold = goal.threshold.ok_or_else(|| {
            TiError::InvalidConfig("focality goal needs `threshold` or `thresholds`".into())
        })?;
        if !goal.penalty_weight.is_finite() || goal.penalty_weight < 0.0 {
            return Err(TiError::InvalidConfig(format!(
                "focality penalty weight must be finite and non-negative, got {}",
                goal.penalty_weight
            )));
        }
        Ok(Self::Penalized {
            threshold,
            weight: goal.penalty_weight,
        })
    }

    fn penalty(&self, result: &FieldResult) -> f64 {
        match *self {
            Self::Penalized { threshold, weight } => {
                let excess = result.non_roi.mapv(|v| (v - threshold).max(0.0));
                weight * excess.mean().unwrap_or(0.0)
            }
            Self::Constrained { non_roi_max, roi_min } => {
                let over = (max_of(&result.non_roi) - non_roi_max).max(0.0);
                let under = (roi_min - min_of(&result.roi)).max(0.0);
                CONSTRAINT_PENALTY * (over + under)
            }
        }
    }
}

/// Scalar cost over an evaluated field (lower is better)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarObjective {
    Mean,
    Max,
    Focality(FocalityCost),
}

impl ScalarObjective {
    pub fn from_goal(goal: &Goal, region: &TargetRegion) -> Result<Self> {
        match goal {
            Goal::Mean => Ok(Self::Mean),
            Goal::Max => Ok(Self::Max),
            Goal::Focality(focality) => {
                if region.non_roi().is_empty() {
                    return Err(TiError::InvalidConfig(
                        "focality goal requires a non-empty non-ROI set".into(),
                    ));
                }
                Ok(Self::Focality(FocalityCost::resolve(focality)?))
            }
            Goal::MultiObjective => Err(TiError::InvalidConfig(
                "multi-objective goal needs a Pareto optimizer".into(),
            )),
        }
    }

    pub fn cost(&self, result: &FieldResult) -> f64 {
        match self {
            Self::Mean => -result.roi_mean,
            Self::Max => -max_of(&result.roi),
            Self::Focality(f) => -result.roi_mean + f.penalty(result),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Max => "max",
            Self::Focality(FocalityCost::Penalized { .. }) => "focality",
            Self::Focality(FocalityCost::Constrained { .. }) => "focality-thresholds",
        }
    }
}

/// Two objectives, both minimized: `(-mean(ROI), off-target exposure)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParetoObjective {
    /// Exposure is the non-ROI mean for an explicit set, else the whole-brain mean
    explicit_non_roi: bool,
}

impl ParetoObjective {
    pub fn new(region: &TargetRegion) -> Self {
        Self {
            explicit_non_roi: !region.is_complement(),
        }
    }

    pub fn objectives(&self, result: &FieldResult) -> [f64; 2] {
        let exposure = if self.explicit_non_roi {
            result.non_roi.mean().unwrap_or(0.0)
        } else {
            result.whole_brain_mean
        };
        [-result.roi_mean, exposure]
    }
}

/// Metrics and cost of one evaluated montage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub metrics: Metrics,
    pub cost: f64,
}

/// Evaluate and score; non-finite results are reported as errors
pub fn score(
    montage: &Montage,
    leadfield: &Leadfield,
    region: &TargetRegion,
    objective: &ScalarObjective,
) -> Result<Scored> {
    let result = evaluate(montage, leadfield, region)?;
    let metrics = Metrics::from_field(&result);
    let cost = objective.cost(&result);
    if !metrics.is_finite() || !cost.is_finite() {
        return Err(TiError::NonFiniteField(montage.electrodes()));
    }
    Ok(Scored { metrics, cost })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use proptest::prelude::*;
    use tiopt_core::{NonRoi, Roi};

    fn v(x: f64, y: f64, z: f64) -> Vector3<f64> {
        Vector3::new(x, y, z)
    }

    /// 4 electrodes, 4 voxels, fields along x with per-voxel scaling
    fn toy() -> Leadfield {
        let labels = vec!["A".into(), "B".into(), "C".into(), "D".into()];
        let field = Array3::from_shape_fn((4, 4, 3), |(e, vx, c)| match (e, c) {
            (0, 0) => 1.0 + vx as f64,
            (2, 0) => 0.5 * (4 - vx) as f64,
            (2, 1) => 0.25,
            (1, 2) => 0.1,
            _ => 0.0,
        });
        Leadfield::new(labels, field).unwrap()
    }

    #[test]
    fn test_collinear_envelope() {
        assert!((ti_max(v(3.0, 0.0, 0.0), v(1.0, 0.0, 0.0)) - 2.0).abs() < 1e-12);
        assert!((ti_max(v(1.0, 0.0, 0.0), v(3.0, 0.0, 0.0)) - 2.0).abs() < 1e-12);
        assert!((ti_max(v(3.0, 0.0, 0.0), v(-1.0, 0.0, 0.0)) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_orthogonal_envelope() {
        let ti = ti_max(v(1.0, 0.0, 0.0), v(0.0, 1.0, 0.0));
        assert!((ti - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_zero_field() {
        assert_eq!(ti_max(Vector3::zeros(), v(1.0, 2.0, 3.0)), 0.0);
        assert_eq!(ti_max(Vector3::zeros(), Vector3::zeros()), 0.0);
    }

    #[test]
    fn test_directional() {
        let e = v(1.0, 0.0, 0.0);
        assert!((ti_directional(e, e, v(1.0, 0.0, 0.0)) - 2.0).abs() < 1e-12);
        assert_eq!(ti_directional(e, e, v(0.0, 1.0, 0.0)), 0.0);

        let lf = toy();
        let e1 = lf.electrode_field(0);
        assert!(ti_envelope_directional(e1, e1, [0.0, 0.0, 0.0]).is_err());
        let out = ti_envelope_directional(e1, e1, [2.0, 0.0, 0.0]).unwrap();
        assert!((out[0] - 2.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_envelope_bounded(
            a in prop::array::uniform3(-5.0f64..5.0),
            b in prop::array::uniform3(-5.0f64..5.0),
        ) {
            let (e1, e2) = (Vector3::from(a), Vector3::from(b));
            let ti = ti_max(e1, e2);
            prop_assert!(ti >= 0.0);
            prop_assert!(ti <= 2.0 * e1.norm().min(e2.norm()) + 1e-9);
            prop_assert!((ti - ti_max(e2, e1)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let lf = toy();
        let region = TargetRegion::new(&Roi::new(vec![0, 1]), &NonRoi::Complement, 4).unwrap();
        let montage = Montage::new([0, 1, 2, 3], (1.5, 2.5));
        let a = evaluate(&montage, &lf, &region).unwrap();
        let b = evaluate(&montage, &lf, &region).unwrap();
        assert_eq!(a.roi.len(), 2);
        assert_eq!(a.non_roi.len(), 2);
        for (x, y) in a.roi.iter().zip(b.roi.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
        assert_eq!(a.whole_brain_mean.to_bits(), b.whole_brain_mean.to_bits());
    }

    #[test]
    fn test_shape_mismatch() {
        let lf = toy();
        let region = TargetRegion::new(&Roi::new(vec![0]), &NonRoi::Complement, 9).unwrap();
        let montage = Montage::new([0, 1, 2, 3], (2.0, 2.0));
        assert!(matches!(evaluate(&montage, &lf, &region), Err(TiError::ShapeMismatch(_))));

        let region = TargetRegion::new(&Roi::new(vec![0]), &NonRoi::Complement, 4).unwrap();
        let bad = Montage::new([0, 1, 2, 7], (2.0, 2.0));
        assert!(matches!(evaluate(&bad, &lf, &region), Err(TiError::ShapeMismatch(_))));
    }

    #[test]
    fn test_weighted_roi_mean() {
        let lf = toy();
        let plain = TargetRegion::new(&Roi::new(vec![0, 1]), &NonRoi::Complement, 4).unwrap();
        let weighted = TargetRegion::new(
            &Roi::new(vec![0, 1]).with_weights(vec![1.0, 0.0]),
            &NonRoi::Complement,
            4,
        )
        .unwrap();
        let montage = Montage::new([0, 1, 2, 3], (2.0, 2.0));
        let a = evaluate(&montage, &lf, &plain).unwrap();
        let b = evaluate(&montage, &lf, &weighted).unwrap();
        assert!((b.roi_mean - a.roi[0]).abs() < 1e-12);
        assert!((a.roi_mean - (a.roi[0] + a.roi[1]) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_metrics_focality_zero_brain() {
        let result = FieldResult {
            roi: Array1::zeros(2),
            non_roi: Array1::zeros(3),
            roi_mean: 0.0,
            whole_brain_mean: 0.0,
        };
        let m = Metrics::from_field(&result);
        assert_eq!(m.focality, 0.0);
        assert!(m.is_finite());
    }

    #[test]
    fn test_focality_monotone_in_weight() {
        let lf = toy();
        let region = TargetRegion::new(&Roi::new(vec![0]), &NonRoi::Complement, 4).unwrap();
        let result = evaluate(&Montage::new([0, 1, 2, 3], (2.0, 2.0)), &lf, &region).unwrap();

        let cost_at = |w: f64| {
            let goal = Goal::Focality(FocalityGoal {
                threshold: Some(0.1),
                penalty_weight: w,
                thresholds: None,
            });
            ScalarObjective::from_goal(&goal, &region).unwrap().cost(&result)
        };
        let weights = [0.0, 0.5, 1.0, 4.0, 10.0];
        for pair in weights.windows(2) {
            assert!(cost_at(pair[0]) <= cost_at(pair[1]));
        }
    }

    #[test]
    fn test_two_threshold_form_takes_precedence() {
        let region = TargetRegion::new(&Roi::new(vec![0]), &NonRoi::Complement, 4).unwrap();
        let goal = Goal::Focality(FocalityGoal {
            threshold: Some(0.2),
            penalty_weight: 1.0,
            thresholds: Some([0.3, 0.5]),
        });
        let objective = ScalarObjective::from_goal(&goal, &region).unwrap();
        assert_eq!(
            objective,
            ScalarObjective::Focality(FocalityCost::Constrained {
                non_roi_max: 0.3,
                roi_min: 0.5
            })
        );

        let result = FieldResult {
            roi: Array1::from(vec![0.4]),
            non_roi: Array1::from(vec![0.1, 0.35, 0.0]),
            roi_mean: 0.4,
            whole_brain_mean: 0.2,
        };
        let expected = -0.4 + CONSTRAINT_PENALTY * (0.05 + 0.1);
        assert!((objective.cost(&result) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_goal_errors() {
        let region = TargetRegion::new(&Roi::new(vec![0, 1, 2, 3]), &NonRoi::Complement, 4).unwrap();
        let goal = Goal::Focality(FocalityGoal {
            threshold: Some(0.2),
            ..FocalityGoal::default()
        });
        assert!(matches!(
            ScalarObjective::from_goal(&goal, &region),
            Err(TiError::InvalidConfig(_))
        ));
        assert!(matches!(
            ScalarObjective::from_goal(&Goal::MultiObjective, &region),
            Err(TiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pareto_objectives() {
        let result = FieldResult {
            roi: Array1::from(vec![0.8, 0.6]),
            non_roi: Array1::from(vec![0.2, 0.4]),
            roi_mean: 0.7,
            whole_brain_mean: 0.5,
        };
        let complement = TargetRegion::new(&Roi::new(vec![0, 1]), &NonRoi::Complement, 4).unwrap();
        let explicit = TargetRegion::new(&Roi::new(vec![0, 1]), &NonRoi::Explicit(vec![2, 3]), 4).unwrap();

        let [a, b] = ParetoObjective::new(&complement).objectives(&result);
        assert!((a + 0.7).abs() < 1e-12 && (b - 0.5).abs() < 1e-12);
        let [a, b] = ParetoObjective::new(&explicit).objectives(&result);
        assert!((a + 0.7).abs() < 1e-12 && (b - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_score_mean_goal() {
        let lf = toy();
        let region = TargetRegion::new(&Roi::new(vec![3]), &NonRoi::Complement, 4).unwrap();
        let objective = ScalarObjective::from_goal(&Goal::Mean, &region).unwrap();
        let scored = score(&Montage::new([0, 1, 2, 3], (2.0, 2.0)), &lf, &region, &objective).unwrap();
        assert!((scored.cost + scored.metrics.ti_mean_roi).abs() < 1e-12);
        assert!(scored.metrics.ti_max_roi >= scored.metrics.ti_mean_roi);
    }

    #[test]
    fn test_score_reports_non_finite_field() {
        let labels = vec!["A".into(), "B".into(), "C".into(), "D".into()];
        let field = Array3::from_shape_fn((4, 4, 3), |(e, _, c)| match (e, c) {
            (3, _) => f64::NAN,
            (0, 0) | (2, 1) => 1.0,
            _ => 0.0,
        });
        let lf = Leadfield::new(labels, field).unwrap();
        let region = TargetRegion::new(&Roi::new(vec![0]), &NonRoi::Complement, 4).unwrap();
        let objective = ScalarObjective::from_goal(&Goal::Mean, &region).unwrap();

        let err = score(&Montage::new([0, 1, 2, 3], (2.0, 2.0)), &lf, &region, &objective).unwrap_err();
        assert!(matches!(err, TiError::NonFiniteField([0, 1, 2, 3])));
    }
}
