//! Генерация признаков по истории мерчантов
//!
//! Каждый движок получает полную панель, сортирует её по (мерчант, месяц)
//! и возвращает новую панель с добавленными колонками и отчётом.

pub mod composite;
pub mod customer;
pub mod interval_patterns;
pub mod rolling;
pub mod time_series;

pub use composite::CompositeFeatureEngine;
pub use customer::CustomerFeatureEngine;
pub use interval_patterns::IntervalPatternEngine;
pub use time_series::TimeSeriesFeatureEngine;

use crate::error::PipelineError;
use crate::types::{Panel, StageOutput, StageReport};

pub trait FeatureEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, panel: &Panel) -> Result<StageOutput, PipelineError>;
}

/// Копия панели в хронологическом порядке внутри каждого мерчанта
pub(crate) fn chronological(panel: &Panel) -> Panel {
    if panel.is_sorted_by_merchant_period() {
        panel.clone()
    } else {
        panel.sorted_by_merchant_period()
    }
}

/// Применение последовательной функции к каждому мерчанту отдельно.
/// Панель должна быть отсортирована, см. [`chronological`].
pub(crate) fn per_merchant<F>(panel: &Panel, values: &[Option<f64>], f: F) -> Vec<Option<f64>>
where
    F: Fn(&[Option<f64>]) -> Vec<Option<f64>>,
{
    let mut result = Vec::with_capacity(values.len());
    for range in panel.merchant_partitions() {
        result.extend(f(&values[range]));
    }
    result
}

/// Числовая базовая колонка или пропуск признака с предупреждением
pub(crate) fn numeric_source(panel: &Panel, column: &str, report: &mut StageReport) -> Option<Vec<Option<f64>>> {
    match panel.column(column) {
        None => {
            report.skip(column, "column not found");
            None
        }
        Some(c) => match c.as_numeric() {
            Some(values) => Some(values.to_vec()),
            None => {
                report.skip(column, "column is not numeric");
                None
            }
        },
    }
}

/// Добавление колонки с записью в отчёт; NaN и бесконечности становятся пропусками
pub(crate) fn emit(
    panel: &mut Panel,
    report: &mut StageReport,
    name: String,
    values: Vec<Option<f64>>,
) -> Result<(), PipelineError> {
    let values = values.into_iter().map(|v| v.and_then(rolling::finite)).collect();
    panel.insert_numeric(name.clone(), values)?;
    report.created(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_merchant_does_not_cross_partitions() {
        let mut panel = Panel::new(
            vec!["B".into(), "A".into(), "A".into()],
            vec!["202401".into(), "202402".into(), "202401".into()],
        )
        .unwrap();
        panel.insert_numeric("x", vec![Some(100.0), Some(2.0), Some(1.0)]).unwrap();

        let sorted = chronological(&panel);
        let values = sorted.numeric("x").unwrap();
        let lagged = per_merchant(&sorted, values, |s| rolling::lag(s, 1));
        assert_eq!(lagged, vec![None, Some(1.0), None]);
    }

    #[test]
    fn emit_drops_non_finite_values() {
        let mut panel = Panel::new(vec!["A".into(); 4], (1..=4).map(|m| format!("20240{m}")).collect()).unwrap();
        let mut report = StageReport::new("test");
        emit(
            &mut panel,
            &mut report,
            "ratio".into(),
            vec![Some(1.5), Some(f64::NAN), Some(f64::INFINITY), None],
        )
        .unwrap();
        assert_eq!(panel.numeric("ratio").unwrap(), &[Some(1.5), None, None, None]);
        assert_eq!(report.created, vec!["ratio".to_string()]);
    }
}
