/// ML модели вероятности закрытия

pub mod adaboost;
pub mod ensemble;
pub mod gbdt_model;

pub use adaboost::AdaBoostClassifier;
pub use ensemble::{EnsembleMethod, ModelEnsemble};
pub use gbdt_model::GbdtClassifier;

use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::preprocessing::missing_values::median;
use crate::preprocessing::TrainingSet;

/// Бинарный классификатор: 1 = мерчант закроется в горизонте прогноза
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn train(&mut self, train: &TrainingSet, validation: Option<&TrainingSet>) -> Result<(), ModelError>;

    /// Вероятность положительного класса для каждой строки
    fn predict_proba(&self, features: &Array2<f64>) -> Result<Array1<f64>, ModelError>;

    fn predict(&self, features: &Array2<f64>, threshold: f64) -> Result<Array1<usize>, ModelError> {
        Ok(self
            .predict_proba(features)?
            .mapv(|p| usize::from(p >= threshold)))
    }

    /// Важность признаков, по убыванию
    fn feature_importance(&self) -> Result<Vec<FeatureImportance>, ModelError>;

    fn save(&self, path: &Path) -> Result<(), ModelError>;

    fn load(path: &Path) -> Result<Self, ModelError>
    where
        Self: Sized;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Пары (имя, важность), отсортированные по убыванию
pub(crate) fn ranked_importance(names: &[String], scores: &[f64]) -> Vec<FeatureImportance> {
    let mut ranked: Vec<FeatureImportance> = names
        .iter()
        .zip(scores.iter())
        .map(|(feature, &importance)| FeatureImportance {
            feature: feature.clone(),
            importance,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ranked
}

/// Заполнение пропусков (NaN) медианами признаков обучающей выборки
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedianImputer {
    medians: Vec<f64>,
}

impl MedianImputer {
    /// Признак без единого значения заполняется нулём
    pub fn fit(features: &Array2<f64>) -> Self {
        let medians = features
            .axis_iter(Axis(1))
            .map(|column| {
                let values: Vec<Option<f64>> = column.iter().map(|&v| (!v.is_nan()).then_some(v)).collect();
                median(&values).unwrap_or(0.0)
            })
            .collect();
        Self { medians }
    }

    pub fn width(&self) -> usize {
        self.medians.len()
    }

    pub fn transform(&self, features: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        if features.ncols() != self.medians.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.medians.len(),
                actual: features.ncols(),
            });
        }
        let mut filled = features.clone();
        for (mut column, &fill) in filled.axis_iter_mut(Axis(1)).zip(self.medians.iter()) {
            column.mapv_inplace(|v| if v.is_finite() { v } else { fill });
        }
        Ok(filled)
    }
}

/// Общие проверки обучающей выборки
pub(crate) fn check_training_set(train: &TrainingSet) -> Result<(), ModelError> {
    if train.is_empty() || train.features.ncols() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    let positives = train.positives();
    if positives == 0 {
        return Err(ModelError::SingleClass(0));
    }
    if positives == train.len() {
        return Err(ModelError::SingleClass(1));
    }
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ModelError> {
    let json = serde_json::to_string(value).map_err(|e| ModelError::Persistence(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| ModelError::Persistence(format!("{}: {}", path.display(), e)))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ModelError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ModelError::Persistence(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw).map_err(|e| ModelError::Persistence(e.to_string()))
}

/// Лог качества на валидации после обучения
pub(crate) fn log_validation(model: &dyn Classifier, validation: Option<&TrainingSet>) {
    let Some(validation) = validation else {
        return;
    };
    match model.predict_proba(&validation.features) {
        Ok(proba) => {
            let labels = validation.labels.to_vec();
            let auc = crate::evaluation::metrics::roc_auc(&labels, &proba.to_vec());
            match auc {
                Some(auc) => tracing::info!("{} validation ROC-AUC: {:.4}", model.name(), auc),
                None => tracing::info!("{} validation set has a single class", model.name()),
            }
        }
        Err(e) => tracing::warn!("{} validation failed: {}", model.name(), e),
    }
}
