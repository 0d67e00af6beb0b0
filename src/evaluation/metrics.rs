//! Метрики бинарной классификации и точки кривых ROC / PR

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionMatrix {
    pub fn total(&self) -> usize {
        self.true_negative + self.false_positive + self.false_negative + self.true_positive
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// None, если в разметке только один класс
    pub roc_auc: Option<f64>,
    /// Average precision; None без положительных примеров
    pub pr_auc: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub false_positive_rate: f64,
    pub true_positive_rate: f64,
    /// None для начальной точки (0, 0)
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrPoint {
    pub recall: f64,
    pub precision: f64,
    pub threshold: f64,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn confusion_matrix(y_true: &[usize], y_pred: &[usize]) -> ConfusionMatrix {
    let mut cm = ConfusionMatrix::default();
    for (&truth, &pred) in y_true.iter().zip(y_pred.iter()) {
        match (truth == 1, pred == 1) {
            (false, false) => cm.true_negative += 1,
            (false, true) => cm.false_positive += 1,
            (true, false) => cm.false_negative += 1,
            (true, true) => cm.true_positive += 1,
        }
    }
    cm
}

pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> f64 {
    let cm = confusion_matrix(y_true, y_pred);
    ratio(cm.true_positive + cm.true_negative, cm.total())
}

/// Деление на ноль даёт 0
pub fn precision(y_true: &[usize], y_pred: &[usize]) -> f64 {
    let cm = confusion_matrix(y_true, y_pred);
    ratio(cm.true_positive, cm.true_positive + cm.false_positive)
}

pub fn recall(y_true: &[usize], y_pred: &[usize]) -> f64 {
    let cm = confusion_matrix(y_true, y_pred);
    ratio(cm.true_positive, cm.true_positive + cm.false_negative)
}

pub fn f1(y_true: &[usize], y_pred: &[usize]) -> f64 {
    let cm = confusion_matrix(y_true, y_pred);
    ratio(2 * cm.true_positive, 2 * cm.true_positive + cm.false_positive + cm.false_negative)
}

/// Накопленные (FP, TP) для каждого различного порога, пороги по убыванию
fn cumulative_counts(y_true: &[usize], scores: &[f64]) -> Vec<(usize, usize, f64)> {
    let mut order: Vec<usize> = (0..scores.len().min(y_true.len())).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut points = Vec::new();
    let (mut fp, mut tp) = (0usize, 0usize);
    for (i, &idx) in order.iter().enumerate() {
        if y_true[idx] == 1 {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_group = order.get(i + 1).map_or(true, |&next| scores[next] != scores[idx]);
        if last_of_group {
            points.push((fp, tp, scores[idx]));
        }
    }
    points
}

pub fn roc_curve(y_true: &[usize], scores: &[f64]) -> Vec<RocPoint> {
    let counts = cumulative_counts(y_true, scores);
    let (negatives, positives) = counts.last().map_or((0, 0), |&(fp, tp, _)| (fp, tp));

    let mut curve = vec![RocPoint {
        false_positive_rate: 0.0,
        true_positive_rate: 0.0,
        threshold: None,
    }];
    curve.extend(counts.into_iter().map(|(fp, tp, threshold)| RocPoint {
        false_positive_rate: ratio(fp, negatives),
        true_positive_rate: ratio(tp, positives),
        threshold: Some(threshold),
    }));
    curve
}

/// Площадь под ROC методом трапеций
pub fn roc_auc(y_true: &[usize], scores: &[f64]) -> Option<f64> {
    let positives = y_true.iter().filter(|&&y| y == 1).count();
    if positives == 0 || positives == y_true.len() {
        return None;
    }
    let curve = roc_curve(y_true, scores);
    Some(
        curve
            .windows(2)
            .map(|w| {
                (w[1].false_positive_rate - w[0].false_positive_rate)
                    * (w[1].true_positive_rate + w[0].true_positive_rate)
                    / 2.0
            })
            .sum(),
    )
}

/// Точки precision/recall от самого высокого порога к самому низкому
pub fn precision_recall_curve(y_true: &[usize], scores: &[f64]) -> Vec<PrPoint> {
    let counts = cumulative_counts(y_true, scores);
    let positives = counts.last().map_or(0, |&(_, tp, _)| tp);
    counts
        .into_iter()
        .map(|(fp, tp, threshold)| PrPoint {
            recall: ratio(tp, positives),
            precision: ratio(tp, tp + fp),
            threshold,
        })
        .collect()
}

/// Average precision: сумма (R_n - R_{n-1}) * P_n
pub fn average_precision(y_true: &[usize], scores: &[f64]) -> Option<f64> {
    if !y_true.iter().any(|&y| y == 1) {
        return None;
    }
    let mut previous_recall = 0.0;
    let mut total = 0.0;
    for point in precision_recall_curve(y_true, scores) {
        total += (point.recall - previous_recall) * point.precision;
        previous_recall = point.recall;
    }
    Some(total)
}

pub fn calculate_metrics(y_true: &[usize], y_pred: &[usize], scores: Option<&[f64]>) -> ClassificationMetrics {
    ClassificationMetrics {
        accuracy: accuracy(y_true, y_pred),
        precision: precision(y_true, y_pred),
        recall: recall(y_true, y_pred),
        f1: f1(y_true, y_pred),
        roc_auc: scores.and_then(|s| roc_auc(y_true, s)),
        pr_auc: scores.and_then(|s| average_precision(y_true, s)),
    }
}
