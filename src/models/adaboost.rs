//! AdaBoost (SAMME, два класса) над неглубокими деревьями `linfa-tree`

use std::path::Path;

use linfa::prelude::*;
use linfa::Dataset;
use linfa_tree::{DecisionTree, SplitQuality};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::AdaBoostParams;
use crate::error::ModelError;
use crate::models::{
    check_training_set, log_validation, ranked_importance, read_json, write_json, Classifier,
    FeatureImportance, MedianImputer,
};
use crate::preprocessing::TrainingSet;

#[derive(Serialize, Deserialize)]
struct WeakLearner {
    tree: DecisionTree<f64, usize>,
    alpha: f64,
}

#[derive(Serialize, Deserialize)]
pub struct AdaBoostClassifier {
    params: AdaBoostParams,
    feature_names: Vec<String>,
    imputer: MedianImputer,
    learners: Vec<WeakLearner>,
}

fn backend_error(message: impl ToString) -> ModelError {
    ModelError::Backend {
        backend: "adaboost",
        message: message.to_string(),
    }
}

impl AdaBoostClassifier {
    pub fn new(params: AdaBoostParams) -> Self {
        Self {
            params,
            feature_names: Vec::new(),
            imputer: MedianImputer::default(),
            learners: Vec::new(),
        }
    }

    pub fn rounds_used(&self) -> usize {
        self.learners.len()
    }

    fn fit_tree(&self, features: &Array2<f64>, labels: &Array1<usize>, weights: &[f64]) -> Result<DecisionTree<f64, usize>, ModelError> {
        let dataset = Dataset::new(features.clone(), labels.clone())
            .with_weights(weights.iter().map(|&w| w as f32).collect::<Array1<f32>>());
        DecisionTree::params()
            .split_quality(SplitQuality::Gini)
            .max_depth(Some(self.params.max_depth))
            .fit(&dataset)
            .map_err(backend_error)
    }
}

impl Classifier for AdaBoostClassifier {
    fn name(&self) -> &'static str {
        "adaboost"
    }

    fn train(&mut self, train: &TrainingSet, validation: Option<&TrainingSet>) -> Result<(), ModelError> {
        check_training_set(train)?;

        let imputer = MedianImputer::fit(&train.features);
        let filled = imputer.transform(&train.features)?;
        let n = train.len() as f64;
        // сумма весов держится равной n: деревьям нужен минимальный вес узла
        let mut weights = vec![1.0; train.len()];
        let mut learners = Vec::with_capacity(self.params.rounds);

        for round in 0..self.params.rounds {
            let tree = self.fit_tree(&filled, &train.labels, &weights)?;
            let predicted = tree.predict(&filled);
            let missed: Vec<bool> = predicted
                .iter()
                .zip(train.labels.iter())
                .map(|(p, y)| p != y)
                .collect();

            let total: f64 = weights.iter().sum();
            let error = weights
                .iter()
                .zip(missed.iter())
                .filter(|(_, miss)| **miss)
                .map(|(w, _)| w)
                .sum::<f64>()
                / total;

            if error <= f64::EPSILON {
                learners.push(WeakLearner { tree, alpha: 1.0 });
                tracing::debug!("adaboost round {}: perfect fit, stopping", round);
                break;
            }
            if error >= 0.5 {
                tracing::debug!("adaboost round {}: error {:.4} no better than chance, stopping", round, error);
                break;
            }

            let alpha = ((1.0 - error) / error).ln();
            for (w, &miss) in weights.iter_mut().zip(missed.iter()) {
                if miss {
                    *w *= alpha.exp();
                }
            }
            let total: f64 = weights.iter().sum();
            weights.iter_mut().for_each(|w| *w *= n / total);
            learners.push(WeakLearner { tree, alpha });
        }

        if learners.is_empty() {
            return Err(backend_error("first weak learner is no better than chance"));
        }

        tracing::info!(
            "AdaBoost trained: {} rows, {} features, {} rounds",
            train.len(),
            filled.ncols(),
            learners.len()
        );
        self.imputer = imputer;
        self.learners = learners;
        self.feature_names = train.feature_names.clone();
        log_validation(&*self, validation);
        Ok(())
    }

    /// Вероятность = sigmoid(взвешенный голос в [-1, 1])
    fn predict_proba(&self, features: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        if self.learners.is_empty() {
            return Err(ModelError::NotTrained);
        }
        let filled = self.imputer.transform(features)?;
        let alpha_total: f64 = self.learners.iter().map(|l| l.alpha).sum();

        let mut decision = Array1::<f64>::zeros(filled.nrows());
        for learner in &self.learners {
            let predicted = learner.tree.predict(&filled);
            for (d, &p) in decision.iter_mut().zip(predicted.iter()) {
                *d += if p == 1 { learner.alpha } else { -learner.alpha };
            }
        }
        Ok(decision.mapv(|d| 1.0 / (1.0 + (-d / alpha_total).exp())))
    }

    fn feature_importance(&self) -> Result<Vec<FeatureImportance>, ModelError> {
        if self.learners.is_empty() {
            return Err(ModelError::NotTrained);
        }
        let mut scores = vec![0.0; self.feature_names.len()];
        for learner in &self.learners {
            for (score, importance) in scores.iter_mut().zip(learner.tree.feature_importance()) {
                *score += learner.alpha * importance;
            }
        }
        let total: f64 = scores.iter().sum();
        if total > 0.0 {
            scores.iter_mut().for_each(|s| *s /= total);
        }
        Ok(ranked_importance(&self.feature_names, &scores))
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        if self.learners.is_empty() {
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

    fn params() -> AdaBoostParams {
        AdaBoostParams { rounds: 10, max_depth: 2 }
    }

    #[test]
    fn separable_data_stops_after_perfect_round() {
        let mut model = AdaBoostClassifier::new(params());
        model.train(&separable_set(), None).unwrap();
        assert_eq!(model.rounds_used(), 1);

        let proba = model.predict_proba(&two_points()).unwrap();
        assert!(proba[0] < 0.5 && proba[1] > 0.5, "{proba:?}");
        assert_eq!(Classifier::predict(&model, &two_points(), 0.5).unwrap().to_vec(), vec![0, 1]);
        assert_eq!(model.feature_importance().unwrap()[0].feature, "signal");
    }

    #[test]
    fn untrained_model_refuses_to_predict() {
        let model = AdaBoostClassifier::new(params());
        assert!(matches!(model.predict_proba(&two_points()), Err(ModelError::NotTrained)));
        assert!(matches!(model.feature_importance(), Err(ModelError::NotTrained)));
    }

    #[test]
    fn noisy_labels_use_several_rounds() {
        let mut set = separable_set();
        // пара перевёрнутых меток мешает одному дереву
        set.labels[5] = 1;
        set.labels[30] = 0;
        let mut model = AdaBoostClassifier::new(AdaBoostParams { rounds: 5, max_depth: 1 });
        model.train(&set, None).unwrap();
        assert!(model.rounds_used() > 1);
        let proba = model.predict_proba(&set.features).unwrap();
        assert!(proba.iter().all(|p| *p > 0.0 && *p < 1.0));
    }
}
