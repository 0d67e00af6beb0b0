//! Конфигурация пайплайна

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::EnsembleMethod;

/// Класс колонки, объявляется один раз в схеме и определяет политику заполнения пропусков
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Delivery,
    Sales,
    Customer,
    Ratio,
    Category,
    Date,
    Id,
    Other,
}

/// Политика заполнения пропусков
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputationPolicy {
    /// Отсутствие значения означает «канал не используется», это настоящий ноль
    Zero,
    /// Медиана после удаления спецзначений (только числовые колонки)
    Median,
    /// Мода, либо "Unknown", если мода не существует (только текстовые колонки)
    ModeOrUnknown,
    /// Медиана для числовых, "Unknown" для текстовых
    MedianOrUnknown,
    /// Не заполнять (даты, идентификаторы)
    Keep,
}

impl ColumnKind {
    pub fn policy(self) -> ImputationPolicy {
        match self {
            ColumnKind::Delivery => ImputationPolicy::Zero,
            ColumnKind::Sales | ColumnKind::Customer | ColumnKind::Ratio => ImputationPolicy::Median,
            ColumnKind::Category => ImputationPolicy::ModeOrUnknown,
            ColumnKind::Other => ImputationPolicy::MedianOrUnknown,
            ColumnKind::Date | ColumnKind::Id => ImputationPolicy::Keep,
        }
    }
}

/// Явное соответствие «колонка -> класс». Необъявленные колонки считаются `Other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSchema {
    kinds: BTreeMap<String, ColumnKind>,
}

impl ColumnSchema {
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, kind: ColumnKind) -> Self {
        self.kinds.insert(column.into(), kind);
        self
    }

    pub fn kind_of(&self, column: &str) -> Option<ColumnKind> {
        self.kinds.get(column).copied()
    }

    pub fn resolve(&self, column: &str) -> ColumnKind {
        self.kind_of(column).unwrap_or(ColumnKind::Other)
    }

    /// Схема трёх датасетов панели мерчантов
    pub fn merchant_panel() -> Self {
        use ColumnKind::*;
        let declared: &[(&str, ColumnKind)] = &[
            // информация о мерчанте
            ("MCT_BSE_AR", Category),
            ("MCT_NM", Category),
            ("MCT_BRD_NUM", Category),
            ("MCT_SIGUNGU_NM", Category),
            ("HPSN_MCT_ZCD_NM", Category),
            ("HPSN_MCT_BZN_CD_NM", Category),
            ("ARE_D", Date),
            ("MCT_ME_D", Date),
            // продажи / использование
            ("MCT_OPE_MS_CN", Sales),
            ("RC_M1_SAA", Sales),
            ("RC_M1_TO_UE_CT", Sales),
            ("RC_M1_UE_CUS_CN", Customer),
            ("RC_M1_AV_NP_AT", Sales),
            ("APV_CE_RAT", Ratio),
            ("DLV_SAA_RAT", Delivery),
            ("M1_SME_RY_SAA_RAT", Ratio),
            ("M1_SME_RY_CNT_RAT", Ratio),
            ("M12_SME_RY_SAA_PCE_RT", Ratio),
            ("M12_SME_BZN_SAA_PCE_RT", Ratio),
            ("M12_SME_RY_ME_MCT_RAT", Ratio),
            ("M12_SME_BZN_ME_MCT_RAT", Ratio),
            // клиенты
            ("M12_MAL_1020_RAT", Customer),
            ("M12_MAL_30_RAT", Customer),
            ("M12_MAL_40_RAT", Customer),
            ("M12_MAL_50_RAT", Customer),
            ("M12_MAL_60_RAT", Customer),
            ("M12_FME_1020_RAT", Customer),
            ("M12_FME_30_RAT", Customer),
            ("M12_FME_40_RAT", Customer),
            ("M12_FME_50_RAT", Customer),
            ("M12_FME_60_RAT", Customer),
            ("MCT_UE_CLN_REU_RAT", Customer),
            ("MCT_UE_CLN_NEW_RAT", Customer),
            ("RC_M1_SHC_RSD_UE_CLN_RAT", Customer),
            ("RC_M1_SHC_WP_UE_CLN_RAT", Customer),
            ("RC_M1_SHC_FLP_UE_CLN_RAT", Customer),
        ];
        declared
            .iter()
            .fold(Self::empty(), |schema, (name, kind)| schema.with(*name, *kind))
    }
}

impl Default for ColumnSchema {
    fn default() -> Self {
        Self::merchant_panel()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyColumns {
    #[serde(default = "default_merchant_column")]
    pub merchant: String,
    #[serde(default = "default_period_column")]
    pub period: String,
    #[serde(default = "default_closure_column")]
    pub closure_date: String,
}

fn default_merchant_column() -> String { "ENCODED_MCT".to_string() }
fn default_period_column() -> String { "TA_YM".to_string() }
fn default_closure_column() -> String { "MCT_ME_D".to_string() }

impl Default for KeyColumns {
    fn default() -> Self {
        Self {
            merchant: default_merchant_column(),
            period: default_period_column(),
            closure_date: default_closure_column(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialValueConfig {
    #[serde(default = "default_sentinel")]
    pub sentinel: f64,
    /// Всё, что не больше порога, считается спецзначением
    #[serde(default = "default_sentinel_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub create_missing_flags: bool,
}

fn default_sentinel() -> f64 { -999999.9 }
fn default_sentinel_threshold() -> f64 { -999999.0 }

impl Default for SpecialValueConfig {
    fn default() -> Self {
        Self {
            sentinel: default_sentinel(),
            threshold: default_sentinel_threshold(),
            create_missing_flags: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Горизонты прогноза в месяцах
    #[serde(default = "default_horizons")]
    pub horizons: Vec<u32>,
    /// Горизонт, на котором обучаются модели
    #[serde(default = "default_training_horizon")]
    pub training_horizon: u32,
}

fn default_horizons() -> Vec<u32> { vec![1, 3] }
fn default_training_horizon() -> u32 { 3 }

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            horizons: default_horizons(),
            training_horizon: default_training_horizon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesConfig {
    #[serde(default = "default_series_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_lags")]
    pub lags: Vec<usize>,
    #[serde(default = "default_windows")]
    pub moving_average_windows: Vec<usize>,
    #[serde(default = "default_change_periods")]
    pub change_periods: Vec<usize>,
    #[serde(default = "default_windows")]
    pub trend_windows: Vec<usize>,
    #[serde(default = "default_windows")]
    pub volatility_windows: Vec<usize>,
    #[serde(default = "default_rank_columns")]
    pub rank_columns: Vec<String>,
    #[serde(default = "default_rank_change_periods")]
    pub rank_change_periods: Vec<usize>,
}

fn default_series_columns() -> Vec<String> {
    ["RC_M1_SAA", "RC_M1_TO_UE_CT", "RC_M1_UE_CUS_CN", "RC_M1_AV_NP_AT", "MCT_UE_CLN_REU_RAT", "MCT_UE_CLN_NEW_RAT", "DLV_SAA_RAT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_lags() -> Vec<usize> { vec![1, 3, 6, 12] }
fn default_windows() -> Vec<usize> { vec![3, 6, 12] }
fn default_change_periods() -> Vec<usize> { vec![1, 3, 12] }
fn default_rank_columns() -> Vec<String> { vec!["RC_M1_SAA".to_string(), "RC_M1_UE_CUS_CN".to_string()] }
fn default_rank_change_periods() -> Vec<usize> { vec![1, 3, 6] }

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            columns: default_series_columns(),
            lags: default_lags(),
            moving_average_windows: default_windows(),
            change_periods: default_change_periods(),
            trend_windows: default_windows(),
            volatility_windows: default_windows(),
            rank_columns: default_rank_columns(),
            rank_change_periods: default_rank_change_periods(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerConfig {
    #[serde(default = "default_returning_column")]
    pub returning_ratio_column: String,
    #[serde(default = "default_new_column")]
    pub new_ratio_column: String,
    #[serde(default = "default_windows")]
    pub windows: Vec<usize>,
}

fn default_returning_column() -> String { "MCT_UE_CLN_REU_RAT".to_string() }
fn default_new_column() -> String { "MCT_UE_CLN_NEW_RAT".to_string() }

impl Default for CustomerConfig {
    fn default() -> Self {
        Self {
            returning_ratio_column: default_returning_column(),
            new_ratio_column: default_new_column(),
            windows: default_windows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeConfig {
    #[serde(default = "default_sales_column")]
    pub sales_column: String,
    #[serde(default = "default_customer_count_column")]
    pub customer_count_column: String,
    #[serde(default = "default_windows")]
    pub windows: Vec<usize>,
    #[serde(default)]
    pub interaction_pairs: Vec<(String, String)>,
    #[serde(default)]
    pub ratio_numerators: Vec<String>,
    #[serde(default)]
    pub ratio_denominators: Vec<String>,
}

fn default_sales_column() -> String { "RC_M1_SAA".to_string() }
fn default_customer_count_column() -> String { "RC_M1_UE_CUS_CN".to_string() }

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            sales_column: default_sales_column(),
            customer_count_column: default_customer_count_column(),
            windows: default_windows(),
            interaction_pairs: Vec::new(),
            ratio_numerators: Vec::new(),
            ratio_denominators: Vec::new(),
        }
    }
}

/// Кодирование интервальных колонок
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalEncodingConfig {
    /// Пустой список: автоопределение по значениям
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub keep_original: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalPatternConfig {
    /// Первая колонка основная для кросс-метрик
    #[serde(default = "default_interval_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_windows")]
    pub decline_windows: Vec<usize>,
}

fn default_interval_columns() -> Vec<String> {
    ["RC_M1_SAA", "RC_M1_TO_UE_CT", "RC_M1_UE_CUS_CN", "RC_M1_AV_NP_AT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for IntervalPatternConfig {
    fn default() -> Self {
        Self {
            columns: default_interval_columns(),
            decline_windows: default_windows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbdtParams {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_gbdt_depth")]
    pub max_depth: u32,
    #[serde(default = "default_shrinkage")]
    pub shrinkage: f32,
}

fn default_iterations() -> usize { 100 }
fn default_gbdt_depth() -> u32 { 4 }
fn default_shrinkage() -> f32 { 0.1 }

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            max_depth: default_gbdt_depth(),
            shrinkage: default_shrinkage(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaBoostParams {
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    #[serde(default = "default_ada_depth")]
    pub max_depth: usize,
}

fn default_rounds() -> usize { 50 }
fn default_ada_depth() -> usize { 2 }

impl Default for AdaBoostParams {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            max_depth: default_ada_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub gbdt: GbdtParams,
    #[serde(default)]
    pub adaboost: AdaBoostParams,
    /// Веса ансамбля в порядке [gbdt, adaboost]; None = равные веса
    #[serde(default)]
    pub ensemble_weights: Option<Vec<f64>>,
    /// weighted | hard_voting | soft_voting
    #[serde(default)]
    pub ensemble: EnsembleMethod,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Сколько последних месяцев отложить для оценки
    #[serde(default = "default_validation_months")]
    pub validation_months: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Подбор весов ансамбля на отложенных месяцах
    #[serde(default)]
    pub optimize_weights: bool,
    #[serde(default = "default_optimization_trials")]
    pub optimization_trials: usize,
}

fn default_threshold() -> f64 { 0.5 }
fn default_validation_months() -> usize { 1 }
fn default_seed() -> u64 { 42 }
fn default_optimization_trials() -> usize { 200 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            gbdt: GbdtParams::default(),
            adaboost: AdaBoostParams::default(),
            ensemble_weights: None,
            ensemble: EnsembleMethod::default(),
            threshold: default_threshold(),
            validation_months: default_validation_months(),
            seed: default_seed(),
            optimize_weights: false,
            optimization_trials: default_optimization_trials(),
        }
    }
}

/// Число бэкендов, из которых собирается ансамбль
pub const ENSEMBLE_BACKENDS: usize = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub keys: KeyColumns,
    #[serde(default)]
    pub special_values: SpecialValueConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub time_series: TimeSeriesConfig,
    #[serde(default)]
    pub customer: CustomerConfig,
    #[serde(default)]
    pub composite: CompositeConfig,
    #[serde(default)]
    pub encoding: IntervalEncodingConfig,
    #[serde(default)]
    pub intervals: IntervalPatternConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub schema: ColumnSchema,
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Ошибки конфигурации фатальны и обнаруживаются до запуска этапов
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.labels.horizons.is_empty() {
            return invalid("at least one prediction horizon is required".into());
        }
        if self.labels.horizons.contains(&0) {
            return invalid("prediction horizons must be positive".into());
        }
        if !self.labels.horizons.contains(&self.labels.training_horizon) {
            return invalid(format!(
                "training horizon {} is not among horizons {:?}",
                self.labels.training_horizon, self.labels.horizons
            ));
        }

        let windows: [(&str, &[usize]); 9] = [
            ("time_series.lags", self.time_series.lags.as_slice()),
            ("time_series.moving_average_windows", self.time_series.moving_average_windows.as_slice()),
            ("time_series.change_periods", self.time_series.change_periods.as_slice()),
            ("time_series.trend_windows", self.time_series.trend_windows.as_slice()),
            ("time_series.volatility_windows", self.time_series.volatility_windows.as_slice()),
            ("time_series.rank_change_periods", self.time_series.rank_change_periods.as_slice()),
            ("customer.windows", self.customer.windows.as_slice()),
            ("composite.windows", self.composite.windows.as_slice()),
            ("intervals.decline_windows", self.intervals.decline_windows.as_slice()),
        ];
        for (name, values) in windows {
            if values.contains(&0) {
                return invalid(format!("{name} must not contain zero"));
            }
        }

        if let Some(weights) = &self.model.ensemble_weights {
            crate::models::ensemble::validate_weights(weights, ENSEMBLE_BACKENDS)
                .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        }
        if !(self.model.threshold > 0.0 && self.model.threshold < 1.0) {
            return invalid(format!("threshold {} must be in (0, 1)", self.model.threshold));
        }
        if self.special_values.sentinel > self.special_values.threshold {
            return invalid(format!(
                "sentinel {} is above the detection threshold {}",
                self.special_values.sentinel, self.special_values.threshold
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.labels.horizons, vec![1, 3]);
        assert_eq!(config.special_values.sentinel, -999999.9);
        assert_eq!(config.keys.merchant, "ENCODED_MCT");
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.time_series.lags, vec![1, 3, 6, 12]);
        assert_eq!(config.schema.resolve("DLV_SAA_RAT"), ColumnKind::Delivery);
    }

    #[test]
    fn schema_from_json_is_explicit_mapping() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"schema": {"FOO": "sales", "BAR": "category"}}"#).unwrap();
        assert_eq!(config.schema.kind_of("FOO"), Some(ColumnKind::Sales));
        assert_eq!(config.schema.resolve("DLV_SAA_RAT"), ColumnKind::Other);
        assert_eq!(ColumnKind::Sales.policy(), ImputationPolicy::Median);
    }

    #[test]
    fn rejects_zero_horizon_and_bad_weights() {
        let mut config = PipelineConfig::default();
        config.labels.horizons = vec![0, 3];
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.model.ensemble_weights = Some(vec![0.5, 0.6]);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.model.ensemble_weights = Some(vec![1.0]);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.labels.training_horizon = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ensemble_method_from_json() {
        let config: PipelineConfig = serde_json::from_str(r#"{"model": {"ensemble": "hard_voting"}}"#).unwrap();
        assert_eq!(config.model.ensemble, EnsembleMethod::HardVoting);
        assert_eq!(PipelineConfig::default().model.ensemble, EnsembleMethod::Weighted);
        assert!(serde_json::from_str::<PipelineConfig>(r#"{"model": {"ensemble": "stacking"}}"#).is_err());
    }

    #[test]
    fn rejects_zero_window() {
        let mut config = PipelineConfig::default();
        config.time_series.trend_windows = vec![0];
        assert!(config.validate().is_err());
    }
}
