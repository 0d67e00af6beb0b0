//! Спецзначения и заполнение пропусков

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ColumnKind, ColumnSchema, ImputationPolicy, SpecialValueConfig};
use crate::error::PipelineError;
use crate::types::{format_number, Column, Panel, StageReport};

/// Метка для категорий без моды
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Префикс флагов пропуска
pub const MISSING_FLAG_PREFIX: &str = "is_missing_";

/// Статистика спецзначений по колонке до замены
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialValueStat {
    pub column: String,
    pub count: usize,
    pub ratio: f64,
}

/// Что сделано с колонкой при заполнении
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImputationRecord {
    pub column: String,
    pub kind: ColumnKind,
    pub method: String,
    /// None, если колонку заполнить нечем
    pub fill_value: Option<String>,
    /// Сколько пропусков было заполнено
    pub filled: usize,
}

#[derive(Debug, Clone)]
pub struct NormalizationOutput {
    pub panel: Panel,
    pub special_values: Vec<SpecialValueStat>,
    pub imputations: Vec<ImputationRecord>,
    pub report: StageReport,
}

pub struct SpecialValueNormalizer {
    config: SpecialValueConfig,
    schema: ColumnSchema,
}

impl SpecialValueNormalizer {
    pub fn new(config: SpecialValueConfig, schema: ColumnSchema) -> Self {
        Self { config, schema }
    }

    /// Подсчёт спецзначений без изменения панели
    pub fn detect(&self, panel: &Panel) -> Vec<SpecialValueStat> {
        panel
            .columns()
            .filter_map(|(name, column)| {
                let values = column.as_numeric()?;
                let count = values.iter().flatten().filter(|&&v| self.is_sentinel(v)).count();
                (count > 0).then(|| SpecialValueStat {
                    column: name.to_string(),
                    count,
                    ratio: count as f64 / values.len().max(1) as f64,
                })
            })
            .collect()
    }

    fn is_sentinel(&self, value: f64) -> bool {
        value <= self.config.threshold
    }

    /// Замена спецзначений на пропуски и заполнение по политике класса колонки.
    /// Входная панель не изменяется.
    pub fn normalize(&self, panel: &Panel) -> Result<NormalizationOutput, PipelineError> {
        let mut report = StageReport::new("special_values");
        let special_values = self.detect(panel);
        for stat in &special_values {
            tracing::debug!(
                "{}: {} special values ({:.2}%)",
                stat.column,
                stat.count,
                stat.ratio * 100.0
            );
        }

        let mut output = panel.clone();
        let mut imputations = Vec::new();
        let mut flags: Vec<(String, Vec<Option<f64>>)> = Vec::new();

        for (name, column) in panel.columns() {
            let kind = self.schema.resolve(name);
            let cleaned = match column {
                Column::Numeric(values) => Column::Numeric(
                    values
                        .iter()
                        .map(|v| v.filter(|&x| !self.is_sentinel(x)))
                        .collect(),
                ),
                Column::Text(values) => Column::Text(values.clone()),
            };

            let missing = cleaned.null_count();
            if missing == 0 {
                continue;
            }

            if self.config.create_missing_flags && !matches!(kind, ColumnKind::Date | ColumnKind::Id) {
                let flag = missing_flag(&cleaned);
                flags.push((format!("{MISSING_FLAG_PREFIX}{name}"), flag));
            }

            let (filled, record) = self.impute(name, kind, cleaned, missing);
            if let Some(record) = record {
                if record.fill_value.is_none() {
                    report.warn(format!("{}: all values missing, left as null", record.column));
                }
                imputations.push(record);
            }
            output.insert_column(name, filled)?;
        }

        for (name, flag) in flags {
            output.insert_numeric(name.clone(), flag)?;
            report.created(name);
        }

        let total: usize = special_values.iter().map(|s| s.count).sum();
        tracing::info!(
            "Replaced {} special values in {} columns, imputed {} columns",
            total,
            special_values.len(),
            imputations.len()
        );

        Ok(NormalizationOutput {
            panel: output,
            special_values,
            imputations,
            report,
        })
    }

    fn impute(
        &self,
        name: &str,
        kind: ColumnKind,
        column: Column,
        missing: usize,
    ) -> (Column, Option<ImputationRecord>) {
        let record = |method: &str, fill_value: Option<String>| ImputationRecord {
            column: name.to_string(),
            kind,
            method: method.to_string(),
            filled: if fill_value.is_some() { missing } else { 0 },
            fill_value,
        };

        match (kind.policy(), column) {
            (ImputationPolicy::Keep, column) => (column, None),
            (ImputationPolicy::Zero, Column::Numeric(values)) => (
                Column::Numeric(fill_numeric(values, Some(0.0))),
                Some(record("zero", Some("0".to_string()))),
            ),
            (
                ImputationPolicy::Median | ImputationPolicy::MedianOrUnknown,
                Column::Numeric(values),
            ) => {
                let fill = median(&values);
                (
                    Column::Numeric(fill_numeric(values, fill)),
                    Some(record("median", fill.map(format_number))),
                )
            }
            (ImputationPolicy::ModeOrUnknown, Column::Numeric(values)) => {
                let fill = numeric_mode(&values);
                (
                    Column::Numeric(fill_numeric(values, fill)),
                    Some(record("mode", fill.map(format_number))),
                )
            }
            (
                ImputationPolicy::ModeOrUnknown | ImputationPolicy::MedianOrUnknown,
                Column::Text(values),
            ) => {
                let (method, fill) = match text_mode(&values) {
                    Some(mode) if kind == ColumnKind::Category => ("mode", mode),
                    _ => ("unknown", UNKNOWN_LABEL.to_string()),
                };
                let filled = values
                    .into_iter()
                    .map(|v| v.or_else(|| Some(fill.clone())))
                    .collect();
                (Column::Text(filled), Some(record(method, Some(fill))))
            }
            // числовые политики к текстовым колонкам не применяются
            (_, column @ Column::Text(_)) => (column, None),
        }
    }
}

fn fill_numeric(values: Vec<Option<f64>>, fill: Option<f64>) -> Vec<Option<f64>> {
    values.into_iter().map(|v| v.or(fill)).collect()
}

fn missing_flag(column: &Column) -> Vec<Option<f64>> {
    let len = column.len();
    (0..len)
        .map(|row| {
            let missing = match column {
                Column::Numeric(values) => values[row].is_none(),
                Column::Text(values) => values[row].is_none(),
            };
            Some(if missing { 1.0 } else { 0.0 })
        })
        .collect()
}

pub fn median(values: &[Option<f64>]) -> Option<f64> {
    let mut present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    present.sort_by(|a, b| a.total_cmp(b));
    let mid = present.len() / 2;
    Some(if present.len() % 2 == 0 {
        (present[mid - 1] + present[mid]) / 2.0
    } else {
        present[mid]
    })
}

/// Самое частое значение; при равенстве частот берётся наименьшее
fn numeric_mode(values: &[Option<f64>]) -> Option<f64> {
    let mut present: Vec<f64> = values.iter().flatten().copied().collect();
    present.sort_by(|a, b| a.total_cmp(b));
    let mut best: Option<(f64, usize)> = None;
    let mut start = 0;
    while start < present.len() {
        let end = start + present[start..].iter().take_while(|&&v| v == present[start]).count();
        if best.map_or(true, |(_, count)| end - start > count) {
            best = Some((present[start], end - start));
        }
        start = end;
    }
    best.map(|(value, _)| value)
}

fn text_mode(values: &[Option<String>]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values.iter().flatten() {
        *counts.entry(value.as_str()).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.to_string())
}
