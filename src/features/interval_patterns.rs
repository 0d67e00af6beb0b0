//! Паттерны движения по интервальным уровням (1 = лучший, 6 = худший)
//!
//! Рост кода уровня означает ухудшение. Плоский месяц (изменение 0) не считается
//! ни падением, ни восстановлением и обрывает обе серии.

use crate::config::IntervalPatternConfig;
use crate::error::PipelineError;
use crate::features::{chronological, emit, numeric_source, per_merchant, rolling, FeatureEngine};
use crate::types::{Panel, StageOutput, StageReport};

const TOTAL_DECLINE_PERIODS: [usize; 3] = [3, 6, 12];
const SHORT_WINDOWS: [usize; 2] = [3, 6];

pub struct IntervalPatternEngine {
    config: IntervalPatternConfig,
}

fn flag(condition: bool) -> Option<f64> {
    Some(if condition { 1.0 } else { 0.0 })
}

fn flags_where(values: &[Option<f64>], predicate: impl Fn(f64) -> bool) -> Vec<Option<f64>> {
    values.iter().map(|v| flag(v.is_some_and(&predicate))).collect()
}

fn run_lengths(flags: &[Option<f64>]) -> Vec<Option<f64>> {
    let raw: Vec<bool> = flags.iter().map(|f| *f == Some(1.0)).collect();
    rolling::run_length(&raw).into_iter().map(|n| Some(n as f64)).collect()
}

/// Месяцев с момента, когда значение совпадало с лучшим на тот момент уровнем
pub fn months_since_best(values: &[Option<f64>], best: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut counter = 0u32;
    values
        .iter()
        .zip(best.iter())
        .map(|(value, best)| {
            counter = match (value, best) {
                (Some(v), Some(b)) if v == b => 0,
                _ => counter + 1,
            };
            Some(counter as f64)
        })
        .collect()
}

impl IntervalPatternEngine {
    pub fn new(config: IntervalPatternConfig) -> Self {
        Self { config }
    }

    /// Признаки одной колонки; возвращает ряд помесячных изменений для кросс-метрик
    fn column_features(
        &self,
        panel: &mut Panel,
        column: &str,
        report: &mut StageReport,
    ) -> Result<Option<Vec<Option<f64>>>, PipelineError> {
        let Some(values) = numeric_source(panel, column, report) else {
            return Ok(None);
        };

        // падение
        let change = per_merchant(panel, &values, |s| rolling::diff(s, 1));
        let declining = flags_where(&change, |c| c > 0.0);
        let consecutive_declines = per_merchant(panel, &declining, run_lengths);
        emit(panel, report, format!("{column}_interval_change"), change.clone())?;
        emit(panel, report, format!("{column}_is_declining"), declining.clone())?;
        emit(panel, report, format!("{column}_consecutive_declines"), consecutive_declines)?;

        for &w in &self.config.decline_windows {
            let count = per_merchant(panel, &declining, |s| rolling::rolling_sum(s, w));
            emit(panel, report, format!("{column}_decline_count_{w}m"), count)?;
        }
        for p in TOTAL_DECLINE_PERIODS {
            let total = per_merchant(panel, &values, |s| rolling::diff(s, p));
            emit(panel, report, format!("{column}_total_decline_{p}m"), total)?;
        }
        for w in SHORT_WINDOWS {
            let speed = per_merchant(panel, &values, |s| rolling::diff(s, w))
                .into_iter()
                .map(|d| d.map(|d| d / w as f64))
                .collect();
            emit(panel, report, format!("{column}_decline_speed_{w}m"), speed)?;
        }

        // исторические экстремумы
        let worst = per_merchant(panel, &values, rolling::cumulative_max);
        let best = per_merchant(panel, &values, rolling::cumulative_min);
        let at_worst: Vec<Option<f64>> = values
            .iter()
            .zip(worst.iter())
            .map(|(v, w)| flag(v.is_some() && v == w))
            .collect();
        let distance: Vec<Option<f64>> = values
            .iter()
            .zip(best.iter())
            .map(|(v, b)| v.zip(*b).map(|(v, b)| v - b))
            .collect();
        let since_best = {
            let mut result = Vec::with_capacity(values.len());
            for range in panel.merchant_partitions() {
                result.extend(months_since_best(&values[range.clone()], &best[range]));
            }
            result
        };
        emit(panel, report, format!("{column}_worst_ever"), worst)?;
        emit(panel, report, format!("{column}_best_ever"), best)?;
        emit(panel, report, format!("{column}_at_worst_now"), at_worst)?;
        emit(panel, report, format!("{column}_distance_from_best"), distance)?;
        emit(panel, report, format!("{column}_months_since_best"), since_best)?;

        // восстановление
        let recovering = flags_where(&change, |c| c < 0.0);
        let consecutive_recovery = per_merchant(panel, &recovering, run_lengths);
        let previous_decline = per_merchant(panel, &declining, |s| rolling::lag(s, 1));
        let recovery_after_decline: Vec<Option<f64>> = previous_decline
            .iter()
            .zip(recovering.iter())
            .map(|(prev, rec)| flag(*prev == Some(1.0) && *rec == Some(1.0)))
            .collect();
        emit(panel, report, format!("{column}_is_recovering"), recovering)?;
        emit(panel, report, format!("{column}_consecutive_recovery"), consecutive_recovery)?;
        emit(panel, report, format!("{column}_recovery_after_decline"), recovery_after_decline)?;

        let previous_change = per_merchant(panel, &change, |s| rolling::lag(s, 1));
        let reversal: Vec<Option<f64>> = change
            .iter()
            .zip(previous_change.iter())
            .map(|(c, p)| flag(c.zip(*p).is_some_and(|(c, p)| c * p < 0.0)))
            .collect();
        for w in SHORT_WINDOWS {
            let volatility = per_merchant(panel, &change, |s| rolling::rolling_std(s, w));
            let reversals = per_merchant(panel, &reversal, |s| rolling::rolling_sum(s, w));
            emit(panel, report, format!("{column}_interval_volatility_{w}m"), volatility)?;
            emit(panel, report, format!("{column}_direction_changes_{w}m"), reversals)?;
        }

        Ok(Some(change))
    }

    /// Сравнение основной колонки с остальными по знаку одновременных изменений
    fn cross_metric(
        panel: &mut Panel,
        report: &mut StageReport,
        primary: (&str, &[Option<f64>]),
        secondary: (&str, &[Option<f64>]),
    ) -> Result<(), PipelineError> {
        let (p_name, p_change) = primary;
        let (s_name, s_change) = secondary;

        let pairs: Vec<Option<(f64, f64)>> = p_change.iter().zip(s_change.iter()).map(|(p, s)| p.zip(*s)).collect();
        let divergence = pairs.iter().map(|pair| flag(pair.is_some_and(|(p, s)| p > 0.0 && s <= 0.0))).collect();
        let aligned = pairs.iter().map(|pair| flag(pair.is_some_and(|(p, s)| p > 0.0 && s > 0.0))).collect();
        let magnitude = pairs.iter().map(|pair| pair.map(|(p, s)| p - s)).collect();

        emit(panel, report, format!("divergence_{p_name}_vs_{s_name}"), divergence)?;
        emit(panel, report, format!("aligned_decline_{p_name}_{s_name}"), aligned)?;
        emit(panel, report, format!("divergence_magnitude_{p_name}_{s_name}"), magnitude)?;
        Ok(())
    }
}

impl FeatureEngine for IntervalPatternEngine {
    fn name(&self) -> &'static str {
        "interval_patterns"
    }

    fn apply(&self, panel: &Panel) -> Result<StageOutput, PipelineError> {
        let mut report = StageReport::new(self.name());
        let mut output = chronological(panel);

        let mut changes: Vec<(&str, Vec<Option<f64>>)> = Vec::new();
        for column in &self.config.columns {
            if let Some(change) = self.column_features(&mut output, column, &mut report)? {
                changes.push((column.as_str(), change));
            }
        }

        // основная колонка идёт первой
        if let Some(primary) = self.config.columns.first() {
            match changes.iter().find(|(name, _)| *name == primary.as_str()) {
                Some((p_name, p_change)) => {
                    for (s_name, s_change) in changes.iter().filter(|(name, _)| *name != primary.as_str()) {
                        Self::cross_metric(
                            &mut output,
                            &mut report,
                            (*p_name, p_change.as_slice()),
                            (*s_name, s_change.as_slice()),
                        )?;
                    }
                }
                None if self.config.columns.len() > 1 => {
                    report.warn(format!("primary column '{primary}' unavailable, cross-metric features skipped"));
                }
                None => {}
            }
        }

        tracing::info!("Interval pattern features: {} created", report.created.len());
        Ok(StageOutput { panel: output, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IntervalPatternConfig {
        IntervalPatternConfig {
            columns: vec!["RC_M1_SAA".to_string(), "RC_M1_UE_CUS_CN".to_string()],
            decline_windows: vec![3],
        }
    }

    fn panel() -> Panel {
        let months = ["202401", "202402", "202403", "202404", "202405", "202406"];
        let mut panel = Panel::new(
            vec!["A".to_string(); months.len()],
            months.iter().map(|m| m.to_string()).collect(),
        )
        .unwrap();
        // 2 -> 3 -> 4 -> 4 -> 3 -> 5
        panel
            .insert_numeric("RC_M1_SAA", vec![Some(2.0), Some(3.0), Some(4.0), Some(4.0), Some(3.0), Some(5.0)])
            .unwrap();
        panel
            .insert_numeric("RC_M1_UE_CUS_CN", vec![Some(3.0), Some(3.0), Some(4.0), Some(2.0), None, Some(6.0)])
            .unwrap();
        panel
    }

    fn column<'a>(panel: &'a Panel, name: &str) -> &'a [Option<f64>] {
        panel.numeric(name).unwrap()
    }

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn decline_streak_ends_on_flat_month() {
        let output = IntervalPatternEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        assert_eq!(
            column(out, "RC_M1_SAA_interval_change"),
            &[None, Some(1.0), Some(1.0), Some(0.0), Some(-1.0), Some(2.0)]
        );
        assert_eq!(column(out, "RC_M1_SAA_is_declining"), some(&[0.0, 1.0, 1.0, 0.0, 0.0, 1.0]).as_slice());
        assert_eq!(column(out, "RC_M1_SAA_consecutive_declines"), some(&[0.0, 1.0, 2.0, 0.0, 0.0, 1.0]).as_slice());
        assert_eq!(column(out, "RC_M1_SAA_decline_count_3m"), some(&[0.0, 1.0, 2.0, 2.0, 1.0, 1.0]).as_slice());
    }

    #[test]
    fn totals_and_speed() {
        let output = IntervalPatternEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        assert_eq!(column(out, "RC_M1_SAA_total_decline_3m")[3], Some(2.0));
        assert_eq!(column(out, "RC_M1_SAA_decline_speed_3m")[5], Some(1.0 / 3.0));
        assert_eq!(column(out, "RC_M1_SAA_total_decline_12m")[5], None);
    }

    #[test]
    fn historical_extremes() {
        let output = IntervalPatternEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        assert_eq!(column(out, "RC_M1_SAA_worst_ever"), some(&[2.0, 3.0, 4.0, 4.0, 4.0, 5.0]).as_slice());
        assert_eq!(column(out, "RC_M1_SAA_at_worst_now"), some(&[1.0, 1.0, 1.0, 1.0, 0.0, 1.0]).as_slice());
        assert_eq!(column(out, "RC_M1_SAA_distance_from_best"), some(&[0.0, 1.0, 2.0, 2.0, 1.0, 3.0]).as_slice());
        assert_eq!(column(out, "RC_M1_SAA_months_since_best"), some(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).as_slice());
    }

    #[test]
    fn months_since_best_resets_on_new_best() {
        let values = some(&[4.0, 3.0, 5.0, 2.0]);
        let best = rolling::cumulative_min(&values);
        assert_eq!(months_since_best(&values, &best), some(&[0.0, 0.0, 1.0, 0.0]));
        assert_eq!(months_since_best(&[None, Some(1.0)], &[None, Some(1.0)]), some(&[1.0, 0.0]));
    }

    #[test]
    fn recovery_after_decline_and_reversals() {
        let output = IntervalPatternEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        assert_eq!(column(out, "RC_M1_SAA_is_recovering"), some(&[0.0, 0.0, 0.0, 0.0, 1.0, 0.0]).as_slice());
        // перед восстановлением был плоский месяц
        assert_eq!(column(out, "RC_M1_SAA_recovery_after_decline")[4], Some(0.0));
        // -1 после 0 не разворот, +2 после -1 уже разворот
        assert_eq!(column(out, "RC_M1_SAA_direction_changes_3m"), some(&[0.0, 0.0, 0.0, 0.0, 0.0, 1.0]).as_slice());
    }

    #[test]
    fn cross_metric_divergence() {
        let output = IntervalPatternEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        // клиенты: None, 0, 1, -2, None, None
        assert_eq!(
            column(out, "divergence_RC_M1_SAA_vs_RC_M1_UE_CUS_CN"),
            some(&[0.0, 1.0, 0.0, 0.0, 0.0, 0.0]).as_slice()
        );
        assert_eq!(
            column(out, "aligned_decline_RC_M1_SAA_RC_M1_UE_CUS_CN"),
            some(&[0.0, 0.0, 1.0, 0.0, 0.0, 0.0]).as_slice()
        );
        assert_eq!(
            column(out, "divergence_magnitude_RC_M1_SAA_RC_M1_UE_CUS_CN"),
            &[None, Some(1.0), Some(0.0), Some(2.0), None, None]
        );
    }

    #[test]
    fn missing_primary_skips_cross_metrics() {
        let mut panel = panel();
        panel.drop_column("RC_M1_SAA");
        let output = IntervalPatternEngine::new(config()).apply(&panel).unwrap();
        assert!(!output.panel.has_column("divergence_RC_M1_SAA_vs_RC_M1_UE_CUS_CN"));
        assert_eq!(output.report.skipped, vec!["RC_M1_SAA".to_string()]);
        assert!(output.panel.has_column("RC_M1_UE_CUS_CN_is_declining"));
    }
}
