//! Classification metrics over integer labels and per-class scores.
//!
//! Curve functions follow scikit-learn: thresholds are the distinct scores, a sample is
//! positive when `score >= threshold`, the PR curve ends at `(recall 0, precision 1)` and
//! the ROC curve starts at `(0, 0)` with an infinite threshold.

use serde::Serialize;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MetricsError {
    #[error("length mismatch: {left} labels vs {right} predictions/scores")]
    LengthMismatch { left: usize, right: usize },
    #[error("label {label} out of range for {classes} classes")]
    ClassOutOfRange { label: usize, classes: usize },
    #[error("x values are neither increasing nor decreasing")]
    NonMonotonic,
    #[error("at least two points are required")]
    TooFewPoints,
}

pub type MetricsResult<T> = Result<T, MetricsError>;

fn check_len(left: usize, right: usize) -> MetricsResult<()> {
    if left != right {
        return Err(MetricsError::LengthMismatch { left, right });
    }
    Ok(())
}

/// Row = true class, column = predicted class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    classes: usize,
    counts: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn get(&self, truth: usize, pred: usize) -> usize {
        self.counts[truth * self.classes + pred]
    }

    pub fn row(&self, truth: usize) -> &[usize] {
        &self.counts[truth * self.classes..(truth + 1) * self.classes]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn max_count(&self) -> usize {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    pub fn rows(&self) -> Vec<Vec<usize>> {
        (0..self.classes).map(|t| self.row(t).to_vec()).collect()
    }
}

pub fn confusion_matrix(
    y_true: &[usize],
    y_pred: &[usize],
    classes: usize,
) -> MetricsResult<ConfusionMatrix> {
    check_len(y_true.len(), y_pred.len())?;
    let mut counts = vec![0usize; classes * classes];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        for label in [t, p] {
            if label >= classes {
                return Err(MetricsError::ClassOutOfRange { label, classes });
            }
        }
        counts[t * classes + p] += 1;
    }
    Ok(ConfusionMatrix { classes, counts })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AverageMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AverageMetrics,
    pub weighted_avg: AverageMetrics,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Per-class precision/recall/F1 with zero for undefined ratios.
pub fn classification_report<S: AsRef<str>>(
    y_true: &[usize],
    y_pred: &[usize],
    class_names: &[S],
) -> MetricsResult<ClassificationReport> {
    let cm = confusion_matrix(y_true, y_pred, class_names.len())?;
    let n = cm.classes();
    let total = cm.total();

    let classes: Vec<ClassMetrics> = class_names
        .iter()
        .enumerate()
        .map(|(c, name)| {
            let tp = cm.get(c, c);
            let support: usize = cm.row(c).iter().sum();
            let predicted: usize = (0..n).map(|t| cm.get(t, c)).sum();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                name: name.as_ref().to_string(),
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect();

    let correct: usize = (0..n).map(|c| cm.get(c, c)).sum();
    let macro_avg = AverageMetrics {
        precision: mean(classes.iter().map(|c| c.precision), n),
        recall: mean(classes.iter().map(|c| c.recall), n),
        f1: mean(classes.iter().map(|c| c.f1), n),
        support: total,
    };
    let weighted = |f: fn(&ClassMetrics) -> f64| {
        if total == 0 {
            0.0
        } else {
            classes
                .iter()
                .map(|c| f(c) * c.support as f64)
                .sum::<f64>()
                / total as f64
        }
    };
    let weighted_avg = AverageMetrics {
        precision: weighted(|c| c.precision),
        recall: weighted(|c| c.recall),
        f1: weighted(|c| c.f1),
        support: total,
    };
    Ok(ClassificationReport {
        accuracy: ratio(correct, total),
        classes,
        macro_avg,
        weighted_avg,
    })
}

fn mean(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        values.sum::<f64>() / n as f64
    }
}

/// Cumulative true/false positive counts at each distinct score, highest score first.
fn binary_clf_curve(y_true: &[bool], scores: &[f32]) -> MetricsResult<(Vec<f64>, Vec<f64>, Vec<f32>)> {
    check_len(y_true.len(), scores.len())?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut tps = Vec::new();
    let mut fps = Vec::new();
    let mut thresholds = Vec::new();
    let (mut tp, mut fp) = (0.0f64, 0.0f64);
    for (k, &i) in order.iter().enumerate() {
        if y_true[i] {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        let last_of_group = order
            .get(k + 1)
            .map(|&next| scores[next] != scores[i])
            .unwrap_or(true);
        if last_of_group {
            tps.push(tp);
            fps.push(fp);
            thresholds.push(scores[i]);
        }
    }
    Ok((tps, fps, thresholds))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrCurve {
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    /// Increasing; one shorter than `precision`/`recall`.
    pub thresholds: Vec<f32>,
}

pub fn precision_recall_curve(y_true: &[bool], scores: &[f32]) -> MetricsResult<PrCurve> {
    let (tps, fps, thresholds) = binary_clf_curve(y_true, scores)?;
    if tps.is_empty() {
        return Err(MetricsError::TooFewPoints);
    }
    let total_pos = tps[tps.len() - 1];
    let mut precision: Vec<f64> = tps
        .iter()
        .zip(&fps)
        .map(|(tp, fp)| if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 })
        .rev()
        .collect();
    let mut recall: Vec<f64> = tps
        .iter()
        .map(|tp| if total_pos > 0.0 { tp / total_pos } else { 1.0 })
        .rev()
        .collect();
    precision.push(1.0);
    recall.push(0.0);
    Ok(PrCurve {
        precision,
        recall,
        thresholds: thresholds.into_iter().rev().collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Decreasing; the first entry is `+inf`.
    pub thresholds: Vec<f32>,
}

/// ROC curve with collinear intermediate points dropped. Rates are NaN when a class
/// has no positives (tpr) or no negatives (fpr).
pub fn roc_curve(y_true: &[bool], scores: &[f32]) -> MetricsResult<RocCurve> {
    let (tps, fps, thresholds) = binary_clf_curve(y_true, scores)?;
    if tps.is_empty() {
        return Err(MetricsError::TooFewPoints);
    }
    let keep: Vec<usize> = if tps.len() > 2 {
        (0..tps.len())
            .filter(|&i| {
                if i == 0 || i + 1 == tps.len() {
                    return true;
                }
                let second_diff = |v: &[f64]| v[i + 1] - 2.0 * v[i] + v[i - 1];
                second_diff(&fps) != 0.0 || second_diff(&tps) != 0.0
            })
            .collect()
    } else {
        (0..tps.len()).collect()
    };

    let total_pos = tps[tps.len() - 1];
    let total_neg = fps[fps.len() - 1];
    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut ths = vec![f32::INFINITY];
    for &i in &keep {
        fpr.push(fps[i] / total_neg);
        tpr.push(tps[i] / total_pos);
        ths.push(thresholds[i]);
    }
    if total_neg <= 0.0 {
        fpr.iter_mut().for_each(|v| *v = f64::NAN);
    }
    if total_pos <= 0.0 {
        tpr.iter_mut().for_each(|v| *v = f64::NAN);
    }
    Ok(RocCurve {
        fpr,
        tpr,
        thresholds: ths,
    })
}

/// Area under a curve by the trapezoidal rule; `x` must be monotonic.
pub fn auc(x: &[f64], y: &[f64]) -> MetricsResult<f64> {
    check_len(x.len(), y.len())?;
    if x.len() < 2 {
        return Err(MetricsError::TooFewPoints);
    }
    let diffs: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let direction = if diffs.iter().all(|d| *d >= 0.0) {
        1.0
    } else if diffs.iter().all(|d| *d <= 0.0) {
        -1.0
    } else {
        return Err(MetricsError::NonMonotonic);
    };
    let area: f64 = diffs
        .iter()
        .zip(y.windows(2))
        .map(|(dx, w)| dx * (w[0] + w[1]) / 2.0)
        .sum();
    Ok(direction * area)
}

/// One-vs-rest targets for class `class`.
pub fn one_vs_rest(y_true: &[usize], class: usize) -> Vec<bool> {
    y_true.iter().map(|&t| t == class).collect()
}

/// PR and ROC curves of one class against the rest.
#[derive(Debug, Clone, Serialize)]
pub struct ClassCurves {
    pub name: String,
    pub pr: PrCurve,
    pub roc: RocCurve,
    pub pr_auc: f64,
    pub roc_auc: f64,
}

/// `probs` is row-major `[n, class_names.len()]`.
pub fn per_class_curves<S: AsRef<str>>(
    y_true: &[usize],
    probs: &[f32],
    class_names: &[S],
) -> MetricsResult<Vec<ClassCurves>> {
    let k = class_names.len();
    check_len(y_true.len() * k, probs.len())?;
    class_names
        .iter()
        .enumerate()
        .map(|(c, name)| {
            let targets = one_vs_rest(y_true, c);
            let scores: Vec<f32> = probs.iter().skip(c).step_by(k).copied().collect();
            let pr = precision_recall_curve(&targets, &scores)?;
            let roc = roc_curve(&targets, &scores)?;
            let pr_auc = auc(&pr.recall, &pr.precision).unwrap_or(f64::NAN);
            let roc_auc = auc(&roc.fpr, &roc.tpr).unwrap_or(f64::NAN);
            Ok(ClassCurves {
                name: name.as_ref().to_string(),
                pr,
                roc,
                pr_auc,
                roc_auc,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confusion_matrix_counts_sum_to_n() {
        let y_true = [0, 1, 2, 3, 1, 0, 2];
        let y_pred = [0, 2, 2, 3, 1, 1, 0];
        let cm = confusion_matrix(&y_true, &y_pred, 4).unwrap();
        assert_eq!(cm.total(), y_true.len());
        assert_eq!(cm.get(1, 2), 1);
        assert_eq!(cm.row(0), &[1, 1, 0, 0]);
        assert_eq!(cm.max_count(), 1);
    }

    #[test]
    fn out_of_range_label_is_rejected() {
        let err = confusion_matrix(&[0, 4], &[0, 1], 4).unwrap_err();
        assert_eq!(err, MetricsError::ClassOutOfRange { label: 4, classes: 4 });
        assert!(matches!(
            confusion_matrix(&[0], &[0, 1], 4),
            Err(MetricsError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn report_matches_hand_computed_values() {
        let y_true = [0, 0, 1, 1, 1, 2];
        let y_pred = [0, 1, 1, 1, 0, 1];
        let report = classification_report(&y_true, &y_pred, &["a", "b", "c"]).unwrap();
        let a = &report.classes[0];
        assert!((a.precision - 0.5).abs() < 1e-12);
        assert!((a.recall - 0.5).abs() < 1e-12);
        let b = &report.classes[1];
        assert!((b.precision - 0.5).abs() < 1e-12);
        assert!((b.recall - 2.0 / 3.0).abs() < 1e-12);
        let c = &report.classes[2];
        assert_eq!((c.precision, c.recall, c.f1, c.support), (0.0, 0.0, 0.0, 1));
        assert!((report.accuracy - 0.5).abs() < 1e-12);
        assert_eq!(report.weighted_avg.support, 6);
        let expected_macro_recall = (0.5 + 2.0 / 3.0) / 3.0;
        assert!((report.macro_avg.recall - expected_macro_recall).abs() < 1e-12);
    }

    #[test]
    fn perfect_scores_give_unit_roc_auc() {
        let y = [true, false, true, false, false];
        let s = [0.9, 0.2, 0.8, 0.3, 0.1];
        let roc = roc_curve(&y, &s).unwrap();
        assert_eq!(roc.fpr.first(), Some(&0.0));
        assert_eq!(roc.tpr.last(), Some(&1.0));
        assert!(roc.thresholds[0].is_infinite());
        assert!((auc(&roc.fpr, &roc.tpr).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn reversed_scores_give_zero_roc_auc() {
        let y = [true, false, true, false];
        let s = [0.1, 0.9, 0.2, 0.8];
        let roc = roc_curve(&y, &s).unwrap();
        assert!(auc(&roc.fpr, &roc.tpr).unwrap().abs() < 1e-12);
    }

    #[test]
    fn pr_curve_has_descending_thresholds_and_closing_point() {
        // precision [0.5, 0.667, 0.5, 1, 1], recall [1, 1, 0.5, 0.5, 0],
        // thresholds [0.1, 0.35, 0.4, 0.8]
        let y = [false, false, true, true];
        let s = [0.1, 0.4, 0.35, 0.8];
        let pr = precision_recall_curve(&y, &s).unwrap();
        let expected_p = [0.5, 2.0 / 3.0, 0.5, 1.0, 1.0];
        let expected_r = [1.0, 1.0, 0.5, 0.5, 0.0];
        for (got, want) in pr.precision.iter().zip(expected_p) {
            assert!((got - want).abs() < 1e-9);
        }
        assert_eq!(pr.recall, expected_r.to_vec());
        assert_eq!(pr.thresholds, vec![0.1, 0.35, 0.4, 0.8]);
        let ap_area = auc(&pr.recall, &pr.precision).unwrap();
        assert!(ap_area > 0.0 && ap_area <= 1.0);
    }

    #[test]
    fn tied_scores_collapse_into_one_threshold() {
        let y = [true, false, true];
        let s = [0.5, 0.5, 0.5];
        let roc = roc_curve(&y, &s).unwrap();
        assert_eq!(roc.fpr, vec![0.0, 1.0]);
        assert_eq!(roc.tpr, vec![0.0, 1.0]);
    }

    #[test]
    fn per_class_curves_slice_probability_columns() {
        let y = [0, 1, 1, 0];
        let probs = [0.9, 0.1, 0.2, 0.8, 0.3, 0.7, 0.6, 0.4];
        let curves = per_class_curves(&y, &probs, &["a", "b"]).unwrap();
        assert_eq!(curves.len(), 2);
        for c in &curves {
            assert!((c.roc_auc - 1.0).abs() < 1e-12, "{}: {}", c.name, c.roc_auc);
        }
    }

    #[test]
    fn non_monotonic_x_is_rejected() {
        assert_eq!(
            auc(&[0.0, 1.0, 0.5], &[0.0, 1.0, 1.0]),
            Err(MetricsError::NonMonotonic)
        );
    }
}
