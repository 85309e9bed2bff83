//! Detector evaluation on a clean vs. anomalous split.
//!
//! Labels are `true` for anomalous samples; higher scores should mean
//! "more anomalous", so a perfect detector has AUROC 1.0.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::detectors::{AnomalyDetector, DetectorKind, LayerScores};
use crate::error::{Result, WardenError};
use crate::primitives::Matrix;

fn check_inputs(scores: &[f32], labels: &[bool]) -> Result<(usize, usize)> {
    if scores.len() != labels.len() {
        return Err(WardenError::dimension_mismatch("labels", scores.len(), labels.len()));
    }
    if let Some(&bad) = scores.iter().find(|s| !s.is_finite()) {
        return Err(WardenError::non_finite("evaluation score", f64::from(bad)));
    }
    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(WardenError::Config(format!(
            "ranking metrics need both classes, got {positives} anomalous and {negatives} clean"
        )));
    }
    Ok((positives, negatives))
}

/// Indices sorted by score, highest first.
fn descending(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

/// Area under the ROC curve.
///
/// Computed from the Mann-Whitney statistic; tied scores get their average
/// rank, so a constant scorer yields exactly 0.5.
///
/// # Errors
///
/// Returns an error if lengths differ, a score is not finite, or either
/// class is absent.
///
/// # Examples
///
/// ```
/// use warden::eval::auc_roc;
///
/// let scores = [0.1, 0.4, 0.35, 0.8];
/// let labels = [false, false, true, true];
/// assert!((auc_roc(&scores, &labels).expect("both classes") - 0.75).abs() < 1e-12);
/// ```
pub fn auc_roc(scores: &[f32], labels: &[bool]) -> Result<f64> {
    let (positives, negatives) = check_inputs(scores, labels)?;

    let mut order = descending(scores);
    order.reverse();
    let mut positive_rank_sum = 0.0_f64;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1..=end share their mean
        let rank = (start + end + 1) as f64 / 2.0;
        let tied_positives = order[start..end].iter().filter(|&&i| labels[i]).count();
        positive_rank_sum += rank * tied_positives as f64;
        start = end;
    }

    let p = positives as f64;
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

/// Average precision: the step-wise area under the precision-recall curve.
///
/// Tied scores form a single threshold.
///
/// # Errors
///
/// Returns an error if lengths differ, a score is not finite, or either
/// class is absent.
pub fn average_precision(scores: &[f32], labels: &[bool]) -> Result<f64> {
    let (positives, _) = check_inputs(scores, labels)?;

    let order = descending(scores);
    let mut ap = 0.0;
    let mut true_positives = 0_usize;
    let mut seen = 0_usize;
    let mut prev_recall = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        true_positives += order[start..end].iter().filter(|&&i| labels[i]).count();
        seen = end;
        let recall = true_positives as f64 / positives as f64;
        let precision = true_positives as f64 / seen as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
        start = end;
    }
    debug_assert_eq!(seen, order.len());
    Ok(ap)
}

/// AUROC and AP of one set of scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub auc_roc: f64,
    pub average_precision: f64,
}

impl Metrics {
    /// Computes both metrics.
    ///
    /// # Errors
    ///
    /// See [`auc_roc`].
    pub fn compute(scores: &[f32], labels: &[bool]) -> Result<Self> {
        Ok(Self {
            auc_roc: auc_roc(scores, labels)?,
            average_precision: average_precision(scores, labels)?,
        })
    }
}

/// Outcome of [`evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub detector: DetectorKind,
    pub n_clean: usize,
    pub n_anomalous: usize,
    /// Metrics of the aggregated scores.
    pub overall: Metrics,
    /// Per-layer metrics; empty for detectors without layerwise scores.
    pub layers: BTreeMap<String, Metrics>,
}

impl EvalReport {
    /// Writes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reads a report written by [`Self::save_json`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

struct Scored {
    scores: Vec<f32>,
    layers: Option<LayerScores>,
}

fn score_in_batches<D>(detector: &D, inputs: &Matrix<f32>, batch_size: usize) -> Result<Scored>
where
    D: AnomalyDetector + ?Sized,
{
    let mut scored = Scored {
        scores: Vec::with_capacity(inputs.n_rows()),
        layers: Some(LayerScores::new()),
    };
    for start in (0..inputs.n_rows()).step_by(batch_size) {
        let chunk = inputs.slice_rows(start, (start + batch_size).min(inputs.n_rows()));
        scored.scores.extend(detector.scores(&chunk)?);

        if let Some(layers) = scored.layers.as_mut() {
            match detector.layerwise_scores(&chunk) {
                Ok(chunk_layers) => {
                    for (name, s) in chunk_layers {
                        layers.entry(name).or_default().extend(s);
                    }
                }
                Err(WardenError::Unsupported(_)) => scored.layers = None,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(scored)
}

/// Scores `clean` and `anomalous` inputs and ranks them.
///
/// Inputs are scored `batch_size` rows at a time. Per-layer metrics are
/// included when the detector supports layerwise scores.
///
/// # Errors
///
/// - [`WardenError::InvalidHyperparameter`] if `batch_size` is zero.
/// - [`WardenError::EmptyInput`] if either split is empty.
/// - Any scoring error, including [`WardenError::NonFiniteScore`].
pub fn evaluate<D>(
    detector: &D,
    clean: &Matrix<f32>,
    anomalous: &Matrix<f32>,
    batch_size: usize,
) -> Result<EvalReport>
where
    D: AnomalyDetector + ?Sized,
{
    if batch_size == 0 {
        return Err(WardenError::InvalidHyperparameter {
            param: "batch_size".into(),
            value: "0".into(),
            constraint: "> 0".into(),
        });
    }
    if clean.n_rows() == 0 || anomalous.n_rows() == 0 {
        return Err(WardenError::EmptyInput(
            "evaluation needs clean and anomalous samples".into(),
        ));
    }

    let clean_scored = score_in_batches(detector, clean, batch_size)?;
    let anomalous_scored = score_in_batches(detector, anomalous, batch_size)?;

    let labels: Vec<bool> = std::iter::repeat(false)
        .take(clean.n_rows())
        .chain(std::iter::repeat(true).take(anomalous.n_rows()))
        .collect();
    let all_scores: Vec<f32> = clean_scored
        .scores
        .iter()
        .chain(&anomalous_scored.scores)
        .copied()
        .collect();
    let overall = Metrics::compute(&all_scores, &labels)?;

    let mut layers = BTreeMap::new();
    if let (Some(clean_layers), Some(anomalous_layers)) =
        (clean_scored.layers, anomalous_scored.layers)
    {
        for (name, mut scores) in clean_layers {
            let other = anomalous_layers
                .get(&name)
                .ok_or_else(|| WardenError::MissingKey(format!("layer scores for '{name}'")))?;
            scores.extend_from_slice(other);
            layers.insert(name, Metrics::compute(&scores, &labels)?);
        }
    }

    info!(
        "{} detector: AUROC {:.4}, AP {:.4} ({} clean, {} anomalous)",
        detector.kind(),
        overall.auc_roc,
        overall.average_precision,
        clean.n_rows(),
        anomalous.n_rows()
    );
    for (name, m) in &layers {
        info!("  {name}: AUROC {:.4}, AP {:.4}", m.auc_roc, m.average_precision);
    }

    Ok(EvalReport {
        detector: detector.kind(),
        n_clean: clean.n_rows(),
        n_anomalous: anomalous.n_rows(),
        overall,
        layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FinetuningTrainConfig, MahalanobisTrainConfig};
    use crate::data::Dataset;
    use crate::detectors::{FinetuningDetector, MahalanobisDetector};
    use crate::nn::{normal, Mlp};

    #[test]
    fn test_auc_perfect_and_inverted() {
        let labels = [false, false, true, true];
        assert_eq!(auc_roc(&[0.1, 0.2, 0.8, 0.9], &labels).expect("valid"), 1.0);
        assert_eq!(auc_roc(&[0.9, 0.8, 0.2, 0.1], &labels).expect("valid"), 0.0);
    }

    #[test]
    fn test_auc_ties_count_half() {
        let labels = [false, true, false, true];
        assert_eq!(auc_roc(&[1.0; 4], &labels).expect("valid"), 0.5);
        // One tie between a positive and a negative, everything else ordered
        assert_eq!(auc_roc(&[0.0, 0.5, 0.5, 1.0], &labels).expect("valid"), 0.875);
    }

    #[test]
    fn test_average_precision() {
        let labels = [true, false, true, false];
        // Ranking: 0.9 (pos), 0.8 (neg), 0.7 (pos), 0.1 (neg)
        let ap = average_precision(&[0.9, 0.8, 0.7, 0.1], &labels).expect("valid");
        assert!((ap - (0.5 * 1.0 + 0.5 * (2.0 / 3.0))).abs() < 1e-12);

        let perfect = average_precision(&[0.9, 0.1, 0.8, 0.2], &labels).expect("valid");
        assert_eq!(perfect, 1.0);

        // All tied: one threshold with precision = prevalence
        let tied = average_precision(&[0.3; 4], &labels).expect("valid");
        assert_eq!(tied, 0.5);
    }

    #[test]
    fn test_metric_errors() {
        assert!(matches!(
            auc_roc(&[0.1, 0.2], &[true]),
            Err(WardenError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            auc_roc(&[0.1, 0.2], &[true, true]),
            Err(WardenError::Config(_))
        ));
        assert!(matches!(
            average_precision(&[f32::NAN, 0.2], &[true, false]),
            Err(WardenError::NonFiniteScore { .. })
        ));
    }

    #[test]
    fn test_evaluate_mahalanobis_with_layers() {
        let model = Mlp::new(&[3, 6, 2], Some(1)).expect("valid sizes");
        let mut detector = MahalanobisDetector::new(
            model,
            vec!["layer0".into(), "logits".into()],
            MahalanobisTrainConfig::default(),
        )
        .expect("known layers");
        detector
            .train(Some(&Dataset::unlabeled(normal(300, 3, 0.0, 1.0, Some(2)))), None)
            .expect("train");

        let clean = normal(50, 3, 0.0, 1.0, Some(3));
        let anomalous = normal(20, 3, 6.0, 1.0, Some(4));
        let report = evaluate(&detector, &clean, &anomalous, 16).expect("evaluate");

        assert_eq!(report.detector, DetectorKind::Mahalanobis);
        assert_eq!((report.n_clean, report.n_anomalous), (50, 20));
        assert_eq!(report.layers.len(), 2);
        assert!(report.overall.auc_roc > 0.9, "AUROC {}", report.overall.auc_roc);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        report.save_json(&path).expect("save");
        assert_eq!(EvalReport::load_json(&path).expect("load"), report);
    }

    #[test]
    fn test_evaluate_finetuning_has_no_layers() {
        let model = Mlp::new(&[3, 4, 2], Some(1)).expect("valid sizes");
        let mut detector =
            FinetuningDetector::new(model, FinetuningTrainConfig::default()).expect("valid config");
        let clean = normal(5, 3, 0.0, 1.0, Some(3));
        let anomalous = normal(5, 3, 1.0, 1.0, Some(4));
        assert!(matches!(
            evaluate(&detector, &clean, &anomalous, 2),
            Err(WardenError::State(_))
        ));

        // Copy loaded with the model's own weights: every score is 0
        let snapshot = detector.to_file().expect("snapshot");
        detector.load_file(&snapshot).expect("same architecture");
        let report = evaluate(&detector, &clean, &anomalous, 2).expect("evaluate");
        assert!(report.layers.is_empty());
        assert_eq!(report.overall.auc_roc, 0.5);
    }

    #[test]
    fn test_evaluate_rejects_bad_arguments() {
        let model = Mlp::new(&[3, 2], Some(1)).expect("valid sizes");
        let detector =
            FinetuningDetector::new(model, FinetuningTrainConfig::default()).expect("valid config");
        let x = normal(4, 3, 0.0, 1.0, Some(0));
        assert!(evaluate(&detector, &x, &x, 0).is_err());
        assert!(matches!(
            evaluate(&detector, &Matrix::zeros(0, 3), &x, 2),
            Err(WardenError::EmptyInput(_))
        ));
    }
}
