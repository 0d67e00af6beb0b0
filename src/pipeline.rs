//! Сборка этапов: объединение -> очистка -> кодирование -> метки -> признаки -> проверка утечек,
//! а также обучение ансамбля и оценка риска закрытия по последнему месяцу мерчанта

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, PipelineConfig};
use crate::error::PipelineError;
use crate::evaluation::{EvaluationReport, LeakageReport, LeakageVerifier, ModelEvaluator};
use crate::features::{
    CompositeFeatureEngine, CustomerFeatureEngine, FeatureEngine, IntervalPatternEngine, TimeSeriesFeatureEngine,
};
use crate::models::{AdaBoostClassifier, Classifier, EnsembleMethod, FeatureImportance, GbdtClassifier, ModelEnsemble};
use crate::preprocessing::labels::{will_close_column, MONTHS_UNTIL_CLOSE};
use crate::preprocessing::{
    DataLoader, DateFeatureEncoder, EncodingSummary, FeatureEngineer, ImputationRecord, IntervalEncoder,
    MergeSummary, SpecialValueNormalizer, SpecialValueStat, TargetLabeler, TrainingSet,
};
use crate::types::{Panel, RawTables, StageReport};

/// Сколько признаков показывать в сводке важности
const TOP_FEATURES: usize = 20;

/// Всё, что пайплайн сообщает о прогоне, кроме самой панели
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub merge: Option<MergeSummary>,
    pub special_values: Vec<SpecialValueStat>,
    pub imputations: Vec<ImputationRecord>,
    pub encodings: Vec<EncodingSummary>,
    pub stages: Vec<StageReport>,
    pub feature_columns: Vec<String>,
    pub leakage: LeakageReport,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub panel: Panel,
    pub summary: PipelineSummary,
}

pub struct FeaturePipeline {
    config: PipelineConfig,
    engines: Vec<Box<dyn FeatureEngine>>,
}

impl FeaturePipeline {
    /// Конфигурация проверяется до запуска каких-либо этапов
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let engines: Vec<Box<dyn FeatureEngine>> = vec![
            Box::new(TimeSeriesFeatureEngine::new(config.time_series.clone())),
            Box::new(CustomerFeatureEngine::new(config.customer.clone())),
            Box::new(IntervalPatternEngine::new(config.intervals.clone())),
            // композитные индексы используют результаты предыдущих движков
            Box::new(CompositeFeatureEngine::new(config.composite.clone())),
        ];
        Ok(Self { config, engines })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Полный прогон от трёх сырых таблиц
    pub fn run(&self, tables: &RawTables) -> Result<PipelineOutput, PipelineError> {
        let merged = DataLoader::new(self.config.keys.clone()).merge(tables)?;
        merged.report.log();

        let mut output = self.enrich(&merged.panel)?;
        output.summary.merge = Some(merged.summary);
        output.summary.stages.insert(0, merged.report);
        Ok(output)
    }

    /// Этапы после объединения: панель уже содержит по строке на (мерчант, месяц)
    pub fn enrich(&self, panel: &Panel) -> Result<PipelineOutput, PipelineError> {
        if let Some((merchant, period)) = panel.find_duplicate_key() {
            return Err(PipelineError::DuplicateKey { merchant, period });
        }
        let mut summary = PipelineSummary::default();

        let normalized = SpecialValueNormalizer::new(self.config.special_values.clone(), self.config.schema.clone())
            .normalize(panel)?;
        summary.special_values = normalized.special_values;
        summary.imputations = normalized.imputations;
        let mut panel = Self::record(&mut summary, normalized.panel, normalized.report);

        let encoded = IntervalEncoder::new(self.config.encoding.keep_original).encode(&panel, &self.config.encoding.columns)?;
        summary.encodings = encoded.summaries;
        panel = Self::record(&mut summary, encoded.panel, encoded.report);

        let labeled = TargetLabeler::new(self.config.labels.horizons.clone())?.apply(&panel, &self.config.keys.closure_date)?;
        panel = Self::record(&mut summary, labeled.panel, labeled.report);

        let dated = DateFeatureEncoder::apply(&panel)?;
        panel = Self::record(&mut summary, dated.panel, dated.report);

        for engine in &self.engines {
            let stage = engine.apply(&panel)?;
            panel = Self::record(&mut summary, stage.panel, stage.report);
        }

        let closure_column = self.config.keys.closure_date.as_str();
        summary.feature_columns = FeatureEngineer::feature_columns(&panel, closure_column);
        summary.leakage = LeakageVerifier::new(
            self.config.labels.horizons.clone(),
            self.config.labels.training_horizon,
            closure_column,
        )
        .verify(&panel, &summary.feature_columns);
        summary.leakage.log();

        tracing::info!(
            "Pipeline finished: {} rows, {} columns, {} model features",
            panel.len(),
            panel.width(),
            summary.feature_columns.len()
        );
        Ok(PipelineOutput { panel, summary })
    }

    fn record(summary: &mut PipelineSummary, panel: Panel, report: StageReport) -> Panel {
        report.log();
        summary.stages.push(report);
        panel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    Watch,
    Important,
    Urgent,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 70.0 {
            RiskLevel::High
        } else if score >= 40.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl Priority {
    pub fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            Priority::Urgent
        } else if score >= 50.0 {
            Priority::Important
        } else if score >= 25.0 {
            Priority::Watch
        } else {
            Priority::Normal
        }
    }
}

/// Риск одного мерчанта на его последний месяц
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantRisk {
    pub merchant: String,
    pub period: String,
    pub probability: f64,
    /// 0..100, один знак после запятой
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub priority: Priority,
    /// Последний месяц уже на дате закрытия или после неё
    pub already_closed: bool,
}

impl MerchantRisk {
    pub fn new(merchant: String, period: String, probability: f64, already_closed: bool) -> Self {
        let probability = probability.clamp(0.0, 1.0);
        let risk_score = (probability * 1000.0).round() / 10.0;
        Self {
            merchant,
            period,
            probability,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            priority: Priority::from_score(risk_score),
            already_closed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerchantRiskReport {
    /// По убыванию риска
    pub merchants: Vec<MerchantRisk>,
    pub by_level: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
}

impl MerchantRiskReport {
    pub fn new(mut merchants: Vec<MerchantRisk>) -> Self {
        merchants.sort_by(|a, b| b.risk_score.total_cmp(&a.risk_score).then_with(|| a.merchant.cmp(&b.merchant)));
        let mut by_level = BTreeMap::new();
        let mut by_priority = BTreeMap::new();
        for m in &merchants {
            *by_level.entry(label(&m.risk_level)).or_insert(0) += 1;
            *by_priority.entry(label(&m.priority)).or_insert(0) += 1;
        }
        Self {
            merchants,
            by_level,
            by_priority,
        }
    }

    pub fn get(&self, merchant: &str) -> Option<&MerchantRisk> {
        self.merchants.iter().find(|m| m.merchant == merchant)
    }
}

fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Последняя строка каждого мерчанта
pub fn latest_rows(panel: &Panel) -> Vec<usize> {
    let mut latest: BTreeMap<&str, usize> = BTreeMap::new();
    for row in 0..panel.len() {
        let merchant = panel.merchant_ids()[row].as_str();
        match latest.get(merchant) {
            Some(&current) if panel.periods()[current] >= panel.periods()[row] => {}
            _ => {
                latest.insert(merchant, row);
            }
        }
    }
    latest.into_values().collect()
}

/// Итог обучения и оценки
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskModelSummary {
    pub target: String,
    pub feature_count: usize,
    pub train_rows: usize,
    pub train_positives: usize,
    pub validation_rows: usize,
    pub members: Vec<String>,
    pub weights: Vec<f64>,
    pub method: EnsembleMethod,
    pub evaluations: Vec<EvaluationReport>,
    pub top_features: Vec<FeatureImportance>,
}

pub struct TrainedRiskModel {
    pub ensemble: ModelEnsemble,
    pub summary: RiskModelSummary,
}

/// Обучение ансамбля [gbdt, adaboost] на валидных строках и скоринг мерчантов
pub struct RiskScorer {
    model: ModelConfig,
    target: String,
    closure_column: String,
}

impl RiskScorer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            model: config.model.clone(),
            target: will_close_column(config.labels.training_horizon),
            closure_column: config.keys.closure_date.clone(),
        }
    }

    fn ensemble(&self) -> Result<ModelEnsemble, PipelineError> {
        let members: Vec<Box<dyn Classifier>> = vec![
            Box::new(GbdtClassifier::new(self.model.gbdt.clone(), self.model.seed)),
            Box::new(AdaBoostClassifier::new(self.model.adaboost.clone())),
        ];
        Ok(ModelEnsemble::new(members, self.model.ensemble_weights.clone())?.with_method(self.model.ensemble))
    }

    /// Последние `validation_months` месяцев откладываются; без них оценка идёт на обучающих строках
    pub fn train(&self, panel: &Panel) -> Result<TrainedRiskModel, PipelineError> {
        let feature_names = FeatureEngineer::feature_columns(panel, &self.closure_column);
        let rows = FeatureEngineer::training_rows(panel, &self.target)?;
        let (train_rows, validation_rows) = FeatureEngineer::split_by_period(panel, &rows, self.model.validation_months);

        let train = FeatureEngineer::extract(panel, &feature_names, &self.target, &train_rows)?;
        let validation = if validation_rows.is_empty() {
            None
        } else {
            Some(FeatureEngineer::extract(panel, &feature_names, &self.target, &validation_rows)?)
        };
        tracing::info!(
            "Training {} on {} rows ({} positive), {} validation rows, {} features",
            self.target,
            train.len(),
            train.positives(),
            validation.as_ref().map_or(0, TrainingSet::len),
            feature_names.len()
        );

        let mut ensemble = self.ensemble()?;
        ensemble.train(&train, validation.as_ref())?;

        if self.model.optimize_weights {
            match &validation {
                _ if ensemble.method() != EnsembleMethod::Weighted => {
                    tracing::warn!("weight optimisation skipped: {:?} ensemble has no weights", ensemble.method())
                }
                Some(set) => {
                    let auc = |y: &[usize], p: &[f64]| crate::evaluation::metrics::roc_auc(y, p).unwrap_or(0.0);
                    ensemble.optimize_weights(set, auc, self.model.optimization_trials, self.model.seed)?;
                }
                None => tracing::warn!("weight optimisation skipped: no validation months"),
            }
        }

        let (eval_set, dataset) = match &validation {
            Some(set) => (set, "validation"),
            None => (&train, "train"),
        };
        let evaluator = ModelEvaluator::new(self.model.threshold);
        let mut evaluations = Vec::new();
        for member in ensemble.members() {
            evaluations.push(evaluator.evaluate(member.as_ref(), eval_set, dataset)?);
        }
        let ensemble_scores = ensemble.predict_proba(&eval_set.features)?;
        evaluations.push(evaluator.evaluate_scores("ensemble", dataset, &eval_set.labels, &ensemble_scores));
        for evaluation in &evaluations {
            evaluation.log();
        }

        let mut top_features = ensemble.feature_importance()?;
        top_features.truncate(TOP_FEATURES);

        let summary = RiskModelSummary {
            target: self.target.clone(),
            feature_count: feature_names.len(),
            train_rows: train.len(),
            train_positives: train.positives(),
            validation_rows: validation.as_ref().map_or(0, TrainingSet::len),
            members: ensemble.member_names().into_iter().map(str::to_string).collect(),
            weights: ensemble.weights().to_vec(),
            method: ensemble.method(),
            evaluations,
            top_features,
        };
        Ok(TrainedRiskModel { ensemble, summary })
    }

    /// Вероятность закрытия на последний месяц каждого мерчанта.
    /// Ансамбль может быть только что обученным или загруженным с диска.
    pub fn score_latest(&self, panel: &Panel, ensemble: &ModelEnsemble) -> Result<MerchantRiskReport, PipelineError> {
        let rows = latest_rows(panel);
        let features = FeatureEngineer::matrix(panel, ensemble.feature_names(), &rows)?;
        let probabilities = ensemble.predict_proba(&features)?;
        let months = panel.numeric(MONTHS_UNTIL_CLOSE);

        let merchants = rows
            .iter()
            .zip(probabilities.iter())
            .map(|(&row, &p)| {
                let closed = months.is_some_and(|m| m[row].is_some_and(|m| m <= 0.0));
                MerchantRisk::new(panel.merchant_ids()[row].clone(), panel.periods()[row].clone(), p, closed)
            })
            .collect();

        let report = MerchantRiskReport::new(merchants);
        tracing::info!("Scored {} merchants: {:?}", report.merchants.len(), report.by_level);
        Ok(report)
    }
}
