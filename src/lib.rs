//! Closure risk - панель мерчантов, признаки и прогноз закрытия

pub mod config;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod models;
pub mod pipeline;
pub mod preprocessing;
pub mod types;

pub use config::PipelineConfig;
pub use error::{ModelError, PipelineError};
pub use evaluation::{EvaluationReport, LeakageReport, LeakageVerifier, ModelEvaluator};
pub use features::FeatureEngine;
pub use models::{AdaBoostClassifier, Classifier, EnsembleMethod, GbdtClassifier, ModelEnsemble};
pub use pipeline::{FeaturePipeline, MerchantRisk, MerchantRiskReport, PipelineOutput, PipelineSummary, RiskScorer};
pub use preprocessing::*;
pub use types::*;
