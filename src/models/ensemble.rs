//! Ансамбль моделей: взвешенное среднее вероятностей или голосование

use std::path::Path;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::models::{read_json, write_json, AdaBoostClassifier, Classifier, FeatureImportance, GbdtClassifier};
use crate::preprocessing::TrainingSet;

const WEIGHT_TOLERANCE: f64 = 1e-6;
const MANIFEST_FILE: &str = "ensemble.json";

/// Число весов должно совпадать с числом моделей, сумма равна 1
pub fn validate_weights(weights: &[f64], expected: usize) -> Result<(), ModelError> {
    if weights.len() != expected {
        return Err(ModelError::InvalidEnsemble(format!(
            "{} weights for {} models",
            weights.len(),
            expected
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ModelError::InvalidEnsemble("weights must be finite and non-negative".to_string()));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(ModelError::InvalidEnsemble(format!("weights sum to {sum}, expected 1.0")));
    }
    Ok(())
}

/// Способ объединения моделей
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleMethod {
    /// Взвешенное среднее вероятностей
    #[default]
    Weighted,
    /// Доля голосов «за»; решение по строгому большинству, ничья -> 0
    HardVoting,
    /// Среднее вероятностей с равными весами
    SoftVoting,
}

/// Состав сохранённого ансамбля
#[derive(Debug, Serialize, Deserialize)]
pub struct EnsembleManifest {
    pub members: Vec<String>,
    pub weights: Vec<f64>,
    #[serde(default)]
    pub method: EnsembleMethod,
    #[serde(default)]
    pub feature_names: Vec<String>,
}

impl EnsembleManifest {
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let manifest: Self = read_json(&dir.join(MANIFEST_FILE))?;
        validate_weights(&manifest.weights, manifest.members.len())?;
        Ok(manifest)
    }
}

/// Восстановление модели по имени из `<dir>/<name>.json`
fn load_member(dir: &Path, name: &str) -> Result<Box<dyn Classifier>, ModelError> {
    let path = dir.join(format!("{name}.json"));
    match name {
        "gbdt" => Ok(Box::new(GbdtClassifier::load(&path)?)),
        "adaboost" => Ok(Box::new(AdaBoostClassifier::load(&path)?)),
        other => Err(ModelError::InvalidEnsemble(format!("unknown ensemble member '{other}'"))),
    }
}

fn require_members(members: &[Box<dyn Classifier>]) -> Result<(), ModelError> {
    if members.is_empty() {
        Err(ModelError::InvalidEnsemble("ensemble needs at least one model".to_string()))
    } else {
        Ok(())
    }
}

fn member_probabilities(members: &[Box<dyn Classifier>], features: &Array2<f64>) -> Result<Vec<Array1<f64>>, ModelError> {
    members.iter().map(|m| m.predict_proba(features)).collect()
}

fn combine(probabilities: &[Array1<f64>], weights: &[f64], rows: usize) -> Array1<f64> {
    probabilities
        .iter()
        .zip(weights.iter())
        .fold(Array1::zeros(rows), |acc, (p, &w)| acc + p * w)
}

pub struct ModelEnsemble {
    members: Vec<Box<dyn Classifier>>,
    weights: Vec<f64>,
    method: EnsembleMethod,
    feature_names: Vec<String>,
}

impl ModelEnsemble {
    /// Без весов модели получают равные доли
    pub fn new(members: Vec<Box<dyn Classifier>>, weights: Option<Vec<f64>>) -> Result<Self, ModelError> {
        require_members(&members)?;
        let weights = weights.unwrap_or_else(|| vec![1.0 / members.len() as f64; members.len()]);
        validate_weights(&weights, members.len())?;
        Ok(Self {
            members,
            weights,
            method: EnsembleMethod::Weighted,
            feature_names: Vec::new(),
        })
    }

    pub fn with_method(mut self, method: EnsembleMethod) -> Self {
        self.method = method;
        self
    }

    pub fn method(&self) -> EnsembleMethod {
        self.method
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn members(&self) -> &[Box<dyn Classifier>] {
        &self.members
    }

    pub fn member_names(&self) -> Vec<&'static str> {
        self.members.iter().map(|m| m.name()).collect()
    }

    /// Признаки, на которых обучены модели
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// При голосовании веса не используются
    fn effective_weights(&self) -> Vec<f64> {
        match self.method {
            EnsembleMethod::Weighted => self.weights.clone(),
            EnsembleMethod::HardVoting | EnsembleMethod::SoftVoting => {
                vec![1.0 / self.members.len() as f64; self.members.len()]
            }
        }
    }

    pub fn train(&mut self, train: &TrainingSet, validation: Option<&TrainingSet>) -> Result<(), ModelError> {
        for member in &mut self.members {
            member.train(train, validation)?;
        }
        self.feature_names = train.feature_names.clone();
        Ok(())
    }

    /// Для жёсткого голосования: доля моделей, проголосовавших за 1
    pub fn predict_proba(&self, features: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        let mut probabilities = member_probabilities(&self.members, features)?;
        if self.method == EnsembleMethod::HardVoting {
            for p in &mut probabilities {
                p.mapv_inplace(|v| if v >= 0.5 { 1.0 } else { 0.0 });
            }
        }
        Ok(combine(&probabilities, &self.effective_weights(), features.nrows()))
    }

    pub fn predict(&self, features: &Array2<f64>, threshold: f64) -> Result<Array1<usize>, ModelError> {
        let proba = self.predict_proba(features)?;
        Ok(match self.method {
            // строго больше половины голосов
            EnsembleMethod::HardVoting => proba.mapv(|share| usize::from(share > 0.5)),
            _ => proba.mapv(|p| usize::from(p >= threshold)),
        })
    }

    /// Каждая модель в `<dir>/<name>.json`, состав и веса в `<dir>/ensemble.json`
    pub fn save(&self, dir: &Path) -> Result<(), ModelError> {
        for member in &self.members {
            member.save(&dir.join(format!("{}.json", member.name())))?;
        }
        let manifest = EnsembleManifest {
            members: self.member_names().into_iter().map(str::to_string).collect(),
            weights: self.weights.clone(),
            method: self.method,
            feature_names: self.feature_names.clone(),
        };
        write_json(&dir.join(MANIFEST_FILE), &manifest)
    }

    /// Обратное к [`ModelEnsemble::save`]
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let manifest = EnsembleManifest::load(dir)?;
        let members = manifest
            .members
            .iter()
            .map(|name| load_member(dir, name))
            .collect::<Result<Vec<_>, _>>()?;
        let mut ensemble = Self::new(members, Some(manifest.weights))?.with_method(manifest.method);
        ensemble.feature_names = manifest.feature_names;
        tracing::info!(
            "Ensemble loaded from {}: {:?} ({:?})",
            dir.display(),
            ensemble.member_names(),
            ensemble.method
        );
        Ok(ensemble)
    }

    /// Средневзвешенная важность признаков по моделям
    pub fn feature_importance(&self) -> Result<Vec<FeatureImportance>, ModelError> {
        let mut totals: Vec<FeatureImportance> = Vec::new();
        for (member, weight) in self.members.iter().zip(self.effective_weights()) {
            let ranked = member.feature_importance()?;
            let sum: f64 = ranked.iter().map(|f| f.importance).sum();
            for item in ranked {
                let share = if sum > 0.0 { item.importance / sum } else { 0.0 };
                match totals.iter_mut().find(|t| t.feature == item.feature) {
                    Some(total) => total.importance += weight * share,
                    None => totals.push(FeatureImportance {
                        feature: item.feature,
                        importance: weight * share,
                    }),
                }
            }
        }
        totals.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        Ok(totals)
    }

    /// Случайный поиск по симплексу весов, метрика максимизируется.
    /// Текущие веса и вершины симплекса всегда участвуют в сравнении.
    pub fn optimize_weights<M>(
        &mut self,
        validation: &TrainingSet,
        metric: M,
        trials: usize,
        seed: u64,
    ) -> Result<Vec<f64>, ModelError>
    where
        M: Fn(&[usize], &[f64]) -> f64,
    {
        if self.method != EnsembleMethod::Weighted {
            return Err(ModelError::InvalidEnsemble(format!(
                "{:?} ensemble does not use weights",
                self.method
            )));
        }
        if validation.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let probabilities = member_probabilities(&self.members, &validation.features)?;
        let labels = validation.labels.to_vec();
        let rows = validation.len();
        let k = self.members.len();

        let score = |weights: &[f64]| metric(&labels, &combine(&probabilities, weights, rows).to_vec());

        let mut best_weights = self.weights.clone();
        let mut best_score = score(&best_weights);

        let mut candidates: Vec<Vec<f64>> = (0..k)
            .map(|i| (0..k).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..trials {
            // равномерная точка симплекса через экспоненциальные величины
            let raw: Vec<f64> = (0..k).map(|_| -(1.0 - rng.gen::<f64>()).ln()).collect();
            let sum: f64 = raw.iter().sum();
            candidates.push(raw.into_iter().map(|x| x / sum).collect());
        }

        for candidate in candidates {
            let candidate_score = score(&candidate);
            if candidate_score > best_score {
                best_score = candidate_score;
                best_weights = candidate;
            }
        }

        tracing::info!("Ensemble weights optimised: {:?} (score {:.4})", best_weights, best_score);
        self.weights = best_weights.clone();
        Ok(best_weights)
    }
}
