//! Ошибки пайплайна и моделей

use thiserror::Error;

/// Структурные ошибки пайплайна: конфигурация, ключи, ввод-вывод.
/// Локальные проблемы этапов (нет колонки, неизвестная категория) сюда не попадают,
/// они идут в `StageReport`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Column '{column}' has {actual} rows, panel has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Key column '{0}' is missing or empty")]
    MissingKeyColumn(String),

    #[error("Feature column '{0}' is missing or not numeric")]
    MissingFeature(String),

    #[error("Duplicate observation for merchant '{merchant}' in period {period}")]
    DuplicateKey { merchant: String, period: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model not trained yet")]
    NotTrained,

    #[error("Training set is empty")]
    EmptyTrainingSet,

    #[error("Training set contains a single class ({0}); need both outcomes")]
    SingleClass(usize),

    #[error("Feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid ensemble: {0}")]
    InvalidEnsemble(String),

    #[error("{backend} backend failed: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("Model persistence failed: {0}")]
    Persistence(String),
}
