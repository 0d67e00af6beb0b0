//! Градиентный бустинг деревьев (крейт `gbdt`, логистическая функция потерь)

use std::path::Path;

use gbdt::config::Config;
use gbdt::decision_tree::{Data, DataVec};
use gbdt::gradient_boost::GBDT;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::GbdtParams;
use crate::error::ModelError;
use crate::models::{
    check_training_set, log_validation, ranked_importance, read_json, write_json, Classifier,
    FeatureImportance, MedianImputer,
};
use crate::preprocessing::TrainingSet;

/// Строк для оценки важности перестановкой
const IMPORTANCE_SAMPLE: usize = 1000;

#[derive(Serialize, Deserialize)]
pub struct GbdtClassifier {
    params: GbdtParams,
    seed: u64,
    feature_names: Vec<String>,
    imputer: MedianImputer,
    importance: Vec<f64>,
    model: Option<GBDT>,
}

impl GbdtClassifier {
    pub fn new(params: GbdtParams, seed: u64) -> Self {
        Self {
            params,
            seed,
            feature_names: Vec::new(),
            imputer: MedianImputer::default(),
            importance: Vec::new(),
            model: None,
        }
    }

    fn config(&self, feature_size: usize) -> Config {
        let mut cfg = Config::new();
        cfg.set_feature_size(feature_size);
        cfg.set_max_depth(self.params.max_depth);
        cfg.set_iterations(self.params.iterations);
        cfg.set_shrinkage(self.params.shrinkage);
        cfg.set_loss("LogLikelyhood");
        cfg.set_debug(false);
        cfg.set_training_optimization_level(2);
        cfg
    }

    fn to_rows(features: &Array2<f64>) -> Vec<Vec<f32>> {
        features
            .outer_iter()
            .map(|row| row.iter().map(|&v| v as f32).collect())
            .collect()
    }

    /// Вероятности по уже заполненной матрице
    fn score(model: &GBDT, filled: &Array2<f64>) -> Array1<f64> {
        let data: DataVec = Self::to_rows(filled)
            .into_iter()
            .map(|row| Data::new_test_data(row, None))
            .collect();
        model
            .predict(&data)
            .into_iter()
            .map(|p| (p as f64).clamp(0.0, 1.0))
            .collect()
    }

    /// Средний сдвиг вероятности при перемешивании одного признака
    fn permutation_importance(&self, model: &GBDT, filled: &Array2<f64>) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let rows = filled.nrows().min(IMPORTANCE_SAMPLE);
        let mut sample_rows: Vec<usize> = (0..filled.nrows()).collect();
        sample_rows.shuffle(&mut rng);
        sample_rows.truncate(rows);
        let sample = filled.select(ndarray::Axis(0), &sample_rows);

        let baseline = Self::score(model, &sample);
        (0..sample.ncols())
            .map(|j| {
                let mut column: Vec<f64> = sample.column(j).to_vec();
                column.shuffle(&mut rng);
                let mut permuted = sample.clone();
                permuted.column_mut(j).assign(&Array1::from(column));
                let shifted = Self::score(model, &permuted);
                (&shifted - &baseline).mapv(f64::abs).mean().unwrap_or(0.0)
            })
            .collect()
    }
}

impl Classifier for GbdtClassifier {
    fn name(&self) -> &'static str {
        "gbdt"
    }

    fn train(&mut self, train: &TrainingSet, validation: Option<&TrainingSet>) -> Result<(), ModelError> {
        check_training_set(train)?;

        self.imputer = MedianImputer::fit(&train.features);
        let filled = self.imputer.transform(&train.features)?;

        let mut data: DataVec = Self::to_rows(&filled)
            .into_iter()
            .zip(train.labels.iter())
            .map(|(row, &label)| {
                let target = if label == 1 { 1.0 } else { -1.0 };
                Data::new_training_data(row, 1.0, target, None)
            })
            .collect();

        let mut model = GBDT::new(&self.config(filled.ncols()));
        model.fit(&mut data);

        self.importance = self.permutation_importance(&model, &filled);
        self.feature_names = train.feature_names.clone();
        self.model = Some(model);

        tracing::info!(
            "GBDT trained: {} rows, {} features, {} iterations",
            train.len(),
            filled.ncols(),
            self.params.iterations
        );
        log_validation(&*self, validation);
        Ok(())
    }

    fn predict_proba(&self, features: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let model = self.model.as_ref().ok_or(ModelError::NotTrained)?;
        let filled = self.imputer.transform(features)?;
        Ok(Self::score(model, &filled))
    }

    fn feature_importance(&self) -> Result<Vec<FeatureImportance>, ModelError> {
        if self.model.is_none() {
            return Err(ModelError::NotTrained);
        }
        Ok(ranked_importance(&self.feature_names, &self.importance))
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        if self.model.is_none() {
            return Err(ModelError::NotTrained);
        }
        write_json(path, self)
    }

    fn load(path: &Path) -> Result<Self, ModelError> {
        read_json(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::{separable_set, two_points};

    fn params() -> GbdtParams {
        GbdtParams {
            iterations: 30,
            max_depth: 3,
            shrinkage: 0.3,
        }
    }

    #[test]
    fn learns_separable_signal() {
        let mut model = GbdtClassifier::new(params(), 7);
        model.train(&separable_set(), None).unwrap();
        let proba = model.predict_proba(&two_points()).unwrap();
        assert!(proba[0] < 0.5 && proba[1] > 0.5, "{proba:?}");
        assert!(proba.iter().all(|p| (0.0..=1.0).contains(p)));

        let importance = model.feature_importance().unwrap();
        assert_eq!(importance[0].feature, "signal");
    }

    #[test]
    fn untrained_model_refuses_to_predict() {
        let model = GbdtClassifier::new(params(), 7);
        assert!(matches!(model.predict_proba(&two_points()), Err(ModelError::NotTrained)));
    }

    #[test]
    fn missing_values_are_imputed() {
        let mut set = separable_set();
        set.features[[3, 1]] = f64::NAN;
        let mut model = GbdtClassifier::new(params(), 7);
        model.train(&set, None).unwrap();
        let proba = model.predict_proba(&ndarray::array![[0.9, f64::NAN]]).unwrap();
        assert!(proba[0].is_finite());
    }

    #[test]
    fn save_and_load_keep_predictions() {
        let mut model = GbdtClassifier::new(params(), 7);
        model.train(&separable_set(), None).unwrap();
        let path = std::env::temp_dir().join(format!("closure_risk_gbdt_{}.json", std::process::id()));
        model.save(&path).unwrap();
        let restored = GbdtClassifier::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let before = model.predict_proba(&two_points()).unwrap();
        let after = restored.predict_proba(&two_points()).unwrap();
        assert!((&before - &after).iter().all(|d| d.abs() < 1e-6));
    }
}
