/// Модуль предобработки данных

pub mod feature_engineering;
pub mod interval_encoder;
pub mod labels;
pub mod loader;
pub mod missing_values;
pub mod normalization;

pub use feature_engineering::{FeatureEngineer, TrainingSet};
pub use interval_encoder::{EncodingSummary, IntervalEncoder};
pub use labels::{DateFeatureEncoder, TargetLabeler};
pub use loader::{DataLoader, MergeSummary};
pub use missing_values::{ImputationRecord, SpecialValueNormalizer, SpecialValueStat};
pub use normalization::{DataNormalizer, ScalingMethod};
