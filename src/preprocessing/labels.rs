//! Целевые переменные без утечки будущего и календарные признаки

use std::f64::consts::PI;

use crate::error::PipelineError;
use crate::types::{Panel, StageReport, StageOutput, YearMonth};

pub const MONTHS_UNTIL_CLOSE: &str = "months_until_close";
pub const IS_VALID_FOR_TRAINING: &str = "is_valid_for_training";
/// Колонка, которой не должно быть в панели: прямая утечка статуса закрытия
pub const IS_CLOSED: &str = "is_closed";

pub fn will_close_column(horizon: u32) -> String {
    format!("will_close_{horizon}m")
}

/// Метки одного наблюдения
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationLabel {
    pub months_until_close: Option<i64>,
    /// По одному флагу на горизонт; None: дата закрытия есть, но не разобрана
    pub will_close: Vec<Option<bool>>,
    pub is_valid_for_training: bool,
}

pub struct TargetLabeler {
    horizons: Vec<u32>,
}

impl TargetLabeler {
    pub fn new(horizons: Vec<u32>) -> Result<Self, PipelineError> {
        if horizons.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "labeler needs at least one horizon".to_string(),
            ));
        }
        if let Some(bad) = horizons.iter().find(|&&h| h == 0) {
            return Err(PipelineError::InvalidConfig(format!(
                "prediction horizon must be positive, got {bad}"
            )));
        }
        Ok(Self { horizons })
    }

    pub fn horizons(&self) -> &[u32] {
        &self.horizons
    }

    /// Метки для одного наблюдения.
    /// `closure` = None: у мерчанта нет даты закрытия;
    /// `Some(None)`: дата есть, но не разбирается.
    pub fn label(&self, observation: Option<YearMonth>, closure: Option<Option<YearMonth>>) -> ObservationLabel {
        match closure {
            None => ObservationLabel {
                months_until_close: None,
                will_close: vec![Some(false); self.horizons.len()],
                is_valid_for_training: true,
            },
            Some(parsed) => {
                let months = observation
                    .zip(parsed)
                    .map(|(obs, close)| obs.months_until(&close));
                match months {
                    Some(m) => ObservationLabel {
                        months_until_close: Some(m),
                        will_close: self
                            .horizons
                            .iter()
                            .map(|&h| Some(m > 0 && m <= h as i64))
                            .collect(),
                        is_valid_for_training: m > 0,
                    },
                    None => ObservationLabel {
                        months_until_close: None,
                        will_close: vec![None; self.horizons.len()],
                        is_valid_for_training: false,
                    },
                }
            }
        }
    }

    /// Добавляет `months_until_close`, `will_close_{k}m` и `is_valid_for_training`.
    /// Разобранные даты в панель не попадают.
    pub fn apply(&self, panel: &Panel, closure_column: &str) -> Result<StageOutput, PipelineError> {
        let mut report = StageReport::new("labels");
        let closure = panel.column(closure_column);
        if closure.is_none() {
            report.warn(format!(
                "closure column '{closure_column}' not found, every merchant treated as operating"
            ));
        }

        let mut malformed_periods = 0usize;
        let mut malformed_closures = 0usize;
        let labels: Vec<ObservationLabel> = (0..panel.len())
            .map(|row| {
                let observation = panel.year_month(row);
                if observation.is_none() {
                    malformed_periods += 1;
                }
                let closure_cell = closure.and_then(|c| c.cell_as_string(row));
                let parsed = closure_cell.map(|raw| {
                    let date = YearMonth::parse_date(&raw);
                    if date.is_none() {
                        malformed_closures += 1;
                    }
                    date
                });
                self.label(observation, parsed)
            })
            .collect();

        if malformed_periods > 0 {
            report.warn(format!("{malformed_periods} rows with malformed period"));
        }
        if malformed_closures > 0 {
            report.warn(format!("{malformed_closures} rows with malformed closure date"));
        }

        let mut output = panel.clone();
        output.insert_numeric(
            MONTHS_UNTIL_CLOSE,
            labels.iter().map(|l| l.months_until_close.map(|m| m as f64)).collect(),
        )?;
        report.created(MONTHS_UNTIL_CLOSE);

        for (i, &horizon) in self.horizons.iter().enumerate() {
            let name = will_close_column(horizon);
            output.insert_numeric(
                name.clone(),
                labels
                    .iter()
                    .map(|l| l.will_close[i].map(|flag| if flag { 1.0 } else { 0.0 }))
                    .collect(),
            )?;
            report.created(name);
        }

        output.insert_numeric(
            IS_VALID_FOR_TRAINING,
            labels
                .iter()
                .map(|l| Some(if l.is_valid_for_training { 1.0 } else { 0.0 }))
                .collect(),
        )?;
        report.created(IS_VALID_FOR_TRAINING);

        let valid = labels.iter().filter(|l| l.is_valid_for_training).count();
        tracing::info!(
            "Labels: {} rows, {} valid for training, {} excluded",
            labels.len(),
            valid,
            labels.len() - valid
        );
        for (i, &horizon) in self.horizons.iter().enumerate() {
            let positives = labels
                .iter()
                .filter(|l| l.is_valid_for_training && l.will_close[i] == Some(true))
                .count();
            tracing::info!("will_close_{}m = 1 among valid rows: {}", horizon, positives);
        }

        Ok(StageOutput { panel: output, report })
    }
}

/// Календарные признаки периода: год, месяц, квартал и циклическое кодирование месяца
pub struct DateFeatureEncoder;

impl DateFeatureEncoder {
    pub const COLUMNS: [&'static str; 5] = ["year", "month", "quarter", "month_sin", "month_cos"];

    pub fn apply(panel: &Panel) -> Result<StageOutput, PipelineError> {
        let mut report = StageReport::new("date_features");
        let periods: Vec<Option<YearMonth>> = (0..panel.len()).map(|row| panel.year_month(row)).collect();

        let extract = |f: fn(&YearMonth) -> f64| -> Vec<Option<f64>> {
            periods.iter().map(|p| p.as_ref().map(f)).collect()
        };
        let columns = [
            extract(|p| p.year as f64),
            extract(|p| p.month as f64),
            extract(|p| p.quarter() as f64),
            extract(|p| (2.0 * PI * p.month as f64 / 12.0).sin()),
            extract(|p| (2.0 * PI * p.month as f64 / 12.0).cos()),
        ];

        let mut output = panel.clone();
        for (name, values) in Self::COLUMNS.iter().zip(columns) {
            output.insert_numeric(*name, values)?;
            report.created(*name);
        }
        Ok(StageOutput { panel: output, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Column;

    fn ym(year: i32, month: u32) -> Option<YearMonth> {
        YearMonth::new(year, month)
    }

    fn labeler() -> TargetLabeler {
        TargetLabeler::new(vec![1, 3]).unwrap()
    }

    #[test]
    fn rejects_non_positive_horizon() {
        assert!(TargetLabeler::new(vec![0]).is_err());
        assert!(TargetLabeler::new(vec![]).is_err());
    }

    #[test]
    fn two_months_before_closure() {
        let label = labeler().label(ym(2024, 1), Some(ym(2024, 3)));
        assert_eq!(label.months_until_close, Some(2));
        assert_eq!(label.will_close, vec![Some(false), Some(true)]);
        assert!(label.is_valid_for_training);
    }

    #[test]
    fn closure_month_is_not_trainable() {
        let label = labeler().label(ym(2024, 3), Some(ym(2024, 3)));
        assert_eq!(label.months_until_close, Some(0));
        assert_eq!(label.will_close, vec![Some(false), Some(false)]);
        assert!(!label.is_valid_for_training);

        let after = labeler().label(ym(2024, 5), Some(ym(2024, 3)));
        assert_eq!(after.months_until_close, Some(-2));
        assert!(!after.is_valid_for_training);
    }

    #[test]
    fn horizon_boundary_is_inclusive() {
        let label = labeler().label(ym(2023, 12), Some(ym(2024, 3)));
        assert_eq!(label.months_until_close, Some(3));
        assert_eq!(label.will_close, vec![Some(false), Some(true)]);

        let one = labeler().label(ym(2024, 2), Some(ym(2024, 3)));
        assert_eq!(one.will_close, vec![Some(true), Some(true)]);
    }

    #[test]
    fn operating_merchant_is_always_valid() {
        let label = labeler().label(ym(2024, 1), None);
        assert_eq!(label.months_until_close, None);
        assert_eq!(label.will_close, vec![Some(false), Some(false)]);
        assert!(label.is_valid_for_training);
    }

    #[test]
    fn malformed_closure_gives_null_labels() {
        let label = labeler().label(ym(2024, 1), Some(None));
        assert_eq!(label.months_until_close, None);
        assert_eq!(label.will_close, vec![None, None]);
        assert!(!label.is_valid_for_training);
    }

    #[test]
    fn apply_adds_only_label_columns() {
        let mut panel = Panel::new(
            vec!["A".into(), "A".into(), "B".into(), "C".into()],
            vec!["202401".into(), "202403".into(), "202401".into(), "202401".into()],
        )
        .unwrap();
        panel
            .insert_column(
                "MCT_ME_D",
                Column::Text(vec![
                    Some("20240315".into()),
                    Some("20240315".into()),
                    None,
                    Some("garbage".into()),
                ]),
            )
            .unwrap();

        let output = labeler().apply(&panel, "MCT_ME_D").unwrap();
        let out = &output.panel;
        assert_eq!(
            out.column_names(),
            &["MCT_ME_D", "months_until_close", "will_close_1m", "will_close_3m", "is_valid_for_training"]
        );
        assert_eq!(out.numeric(MONTHS_UNTIL_CLOSE).unwrap(), &[Some(2.0), Some(0.0), None, None]);
        assert_eq!(out.numeric("will_close_3m").unwrap(), &[Some(1.0), Some(0.0), Some(0.0), None]);
        assert_eq!(out.numeric("will_close_1m").unwrap(), &[Some(0.0), Some(0.0), Some(0.0), None]);
        assert_eq!(
            out.numeric(IS_VALID_FOR_TRAINING).unwrap(),
            &[Some(1.0), Some(0.0), Some(1.0), Some(0.0)]
        );
        assert_eq!(output.report.warnings.len(), 1);
    }

    #[test]
    fn numeric_closure_dates_are_accepted() {
        let mut panel = Panel::new(vec!["A".into()], vec!["202312".into()]).unwrap();
        panel.insert_numeric("MCT_ME_D", vec![Some(20240110.0)]).unwrap();
        let output = labeler().apply(&panel, "MCT_ME_D").unwrap();
        assert_eq!(output.panel.numeric(MONTHS_UNTIL_CLOSE).unwrap(), &[Some(1.0)]);
        assert_eq!(output.panel.numeric("will_close_1m").unwrap(), &[Some(1.0)]);
    }

    #[test]
    fn date_features() {
        let panel = Panel::new(vec!["A".into(), "A".into()], vec!["202404".into(), "bad".into()]).unwrap();
        let output = DateFeatureEncoder::apply(&panel).unwrap();
        let out = &output.panel;
        assert_eq!(out.numeric("quarter").unwrap(), &[Some(2.0), None]);
        assert_eq!(out.numeric("year").unwrap()[0], Some(2024.0));
        let sin = out.numeric("month_sin").unwrap()[0].unwrap();
        assert!((sin - (2.0 * PI * 4.0 / 12.0).sin()).abs() < 1e-12);
    }
}
