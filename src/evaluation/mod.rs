//! Оценка моделей и проверка утечек

pub mod leakage;
pub mod metrics;

pub use leakage::{LeakageCheck, LeakageReport, LeakageVerifier};
pub use metrics::{calculate_metrics, ClassificationMetrics, ConfusionMatrix, PrPoint, RocPoint};

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::models::Classifier;
use crate::preprocessing::TrainingSet;

/// Результат оценки одной модели на одном наборе данных
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model: String,
    pub dataset: String,
    pub rows: usize,
    pub positives: usize,
    pub threshold: f64,
    pub metrics: ClassificationMetrics,
    pub confusion_matrix: ConfusionMatrix,
    pub roc_curve: Vec<RocPoint>,
    pub pr_curve: Vec<PrPoint>,
}

impl EvaluationReport {
    pub fn log(&self) {
        let m = &self.metrics;
        tracing::info!(
            "{} on {} ({} rows, {} positive): accuracy {:.4}, precision {:.4}, recall {:.4}, f1 {:.4}, roc_auc {}, pr_auc {}",
            self.model,
            self.dataset,
            self.rows,
            self.positives,
            m.accuracy,
            m.precision,
            m.recall,
            m.f1,
            m.roc_auc.map_or("n/a".to_string(), |v| format!("{v:.4}")),
            m.pr_auc.map_or("n/a".to_string(), |v| format!("{v:.4}")),
        );
    }
}

pub struct ModelEvaluator {
    threshold: f64,
}

impl ModelEvaluator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Оценка по готовым вероятностям (подходит и для ансамблей)
    pub fn evaluate_scores(&self, model: &str, dataset: &str, labels: &Array1<usize>, scores: &Array1<f64>) -> EvaluationReport {
        let y_true = labels.to_vec();
        let scores = scores.to_vec();
        let y_pred: Vec<usize> = scores.iter().map(|&p| usize::from(p >= self.threshold)).collect();

        EvaluationReport {
            model: model.to_string(),
            dataset: dataset.to_string(),
            rows: y_true.len(),
            positives: y_true.iter().filter(|&&y| y == 1).count(),
            threshold: self.threshold,
            metrics: calculate_metrics(&y_true, &y_pred, Some(&scores)),
            confusion_matrix: metrics::confusion_matrix(&y_true, &y_pred),
            roc_curve: metrics::roc_curve(&y_true, &scores),
            pr_curve: metrics::precision_recall_curve(&y_true, &scores),
        }
    }

    pub fn evaluate(&self, model: &dyn Classifier, set: &TrainingSet, dataset: &str) -> Result<EvaluationReport, ModelError> {
        let scores = model.predict_proba(&set.features)?;
        Ok(self.evaluate_scores(model.name(), dataset, &set.labels, &scores))
    }

    /// Сравнение нескольких моделей на одном наборе
    pub fn compare(&self, models: &[&dyn Classifier], set: &TrainingSet, dataset: &str) -> Result<Vec<EvaluationReport>, ModelError> {
        models.iter().map(|m| self.evaluate(*m, set, dataset)).collect()
    }
}
