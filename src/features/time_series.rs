//! Временные признаки: лаги, скользящие средние, изменения, тренды, волатильность, ранги

use crate::config::TimeSeriesConfig;
use crate::error::PipelineError;
use crate::features::{chronological, emit, numeric_source, per_merchant, rolling, FeatureEngine};
use crate::types::{Panel, StageOutput, StageReport};

pub struct TimeSeriesFeatureEngine {
    config: TimeSeriesConfig,
}

impl TimeSeriesFeatureEngine {
    pub fn new(config: TimeSeriesConfig) -> Self {
        Self { config }
    }

    fn series_features(&self, panel: &mut Panel, column: &str, report: &mut StageReport) -> Result<(), PipelineError> {
        let Some(values) = numeric_source(panel, column, report) else {
            return Ok(());
        };

        for &k in &self.config.lags {
            let lagged = per_merchant(panel, &values, |s| rolling::lag(s, k));
            emit(panel, report, format!("{column}_lag_{k}m"), lagged)?;
        }

        for &w in &self.config.moving_average_windows {
            let ma = per_merchant(panel, &values, |s| rolling::rolling_mean(s, w));
            emit(panel, report, format!("{column}_ma_{w}m"), ma)?;
        }

        for &p in &self.config.change_periods {
            let change = per_merchant(panel, &values, |s| rolling::pct_change(s, p));
            emit(panel, report, format!("{column}_change_{p}m"), change)?;
        }

        for &w in &self.config.trend_windows {
            let trend = per_merchant(panel, &values, |s| rolling::rolling_slope(s, w));
            emit(panel, report, format!("{column}_trend_{w}m"), trend)?;
        }

        for &w in &self.config.volatility_windows {
            let std = per_merchant(panel, &values, |s| rolling::rolling_std(s, w));
            let mean = per_merchant(panel, &values, |s| rolling::rolling_mean(s, w));
            let cv = rolling::coefficient_of_variation(&std, &mean);
            emit(panel, report, format!("{column}_std_{w}m"), std)?;
            emit(panel, report, format!("{column}_cv_{w}m"), cv)?;
        }
        Ok(())
    }

    /// Ранг внутри месяца по всем мерчантам и изменение ранга во времени
    fn rank_features(&self, panel: &mut Panel, column: &str, report: &mut StageReport) -> Result<(), PipelineError> {
        let Some(values) = numeric_source(panel, column, report) else {
            return Ok(());
        };

        let mut rank = vec![None; panel.len()];
        let mut rank_pct = vec![None; panel.len()];
        for rows in panel.period_groups().values() {
            let slice: Vec<Option<f64>> = rows.iter().map(|&r| values[r]).collect();
            let ranks = rolling::rank_descending_min(&slice);
            let pcts = rolling::percentile_rank(&slice);
            for (i, &row) in rows.iter().enumerate() {
                rank[row] = ranks[i];
                rank_pct[row] = pcts[i];
            }
        }

        for &p in &self.config.rank_change_periods {
            let change = per_merchant(panel, &rank, |s| rolling::diff(s, p));
            emit(panel, report, format!("{column}_rank_change_{p}m"), change)?;
        }
        emit(panel, report, format!("{column}_rank"), rank)?;
        emit(panel, report, format!("{column}_rank_pct"), rank_pct)?;
        Ok(())
    }
}

impl FeatureEngine for TimeSeriesFeatureEngine {
    fn name(&self) -> &'static str {
        "time_series"
    }

    fn apply(&self, panel: &Panel) -> Result<StageOutput, PipelineError> {
        let mut report = StageReport::new(self.name());
        let mut output = chronological(panel);

        for column in &self.config.columns {
            self.series_features(&mut output, column, &mut report)?;
        }
        for column in &self.config.rank_columns {
            self.rank_features(&mut output, column, &mut report)?;
        }

        tracing::info!(
            "Time series features: {} created for {} merchants",
            report.created.len(),
            output.merchant_count()
        );
        Ok(StageOutput { panel: output, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Column;

    fn config() -> TimeSeriesConfig {
        TimeSeriesConfig {
            columns: vec!["RATIO".to_string()],
            lags: vec![1],
            moving_average_windows: vec![3],
            change_periods: vec![1],
            trend_windows: vec![3],
            volatility_windows: vec![3],
            rank_columns: vec!["RATIO".to_string()],
            rank_change_periods: vec![1],
        }
    }

    /// Мерчанты A и B за три месяца, строки перемешаны
    fn panel() -> Panel {
        let mut panel = Panel::new(
            vec!["B".into(), "A".into(), "A".into(), "B".into(), "A".into(), "B".into()],
            vec!["202403".into(), "202402".into(), "202401".into(), "202401".into(), "202403".into(), "202402".into()],
        )
        .unwrap();
        panel
            .insert_numeric("RATIO", vec![Some(5.0), Some(20.0), Some(10.0), Some(40.0), Some(30.0), Some(20.0)])
            .unwrap();
        panel
    }

    #[test]
    fn moving_average_over_sorted_history() {
        let output = TimeSeriesFeatureEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        assert!(out.is_sorted_by_merchant_period());
        // A: 10, 20, 30
        assert_eq!(out.numeric("RATIO_ma_3m").unwrap()[2], Some(20.0));
        assert_eq!(&out.numeric("RATIO_lag_1m").unwrap()[..4], &[None, Some(10.0), Some(20.0), None]);
        assert_eq!(out.numeric("RATIO_trend_3m").unwrap()[2], Some(10.0));
        // B: 40, 20, 5 -> -50%, -75%
        assert_eq!(out.numeric("RATIO_change_1m").unwrap()[4], Some(-50.0));
        assert_eq!(out.numeric("RATIO_change_1m").unwrap()[5], Some(-75.0));
    }

    #[test]
    fn cross_sectional_rank_and_change() {
        let output = TimeSeriesFeatureEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        let rank = out.numeric("RATIO_rank").unwrap();
        // 202401: A=10, B=40; 202402: ничья; 202403: A=30, B=5
        assert_eq!(rank, &[Some(2.0), Some(1.0), Some(1.0), Some(1.0), Some(1.0), Some(2.0)]);
        let change = out.numeric("RATIO_rank_change_1m").unwrap();
        assert_eq!(change[1], Some(-1.0));
        assert_eq!(change[5], Some(1.0));
        assert_eq!(out.numeric("RATIO_rank_pct").unwrap()[0], Some(50.0));
    }

    #[test]
    fn ties_in_a_month_share_minimum_rank() {
        let mut panel = Panel::new(
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
            vec!["202401".into(); 4],
        )
        .unwrap();
        panel.insert_numeric("RATIO", vec![Some(7.0), Some(7.0), Some(7.0), Some(1.0)]).unwrap();
        let output = TimeSeriesFeatureEngine::new(config()).apply(&panel).unwrap();
        assert_eq!(
            output.panel.numeric("RATIO_rank").unwrap(),
            &[Some(1.0), Some(1.0), Some(1.0), Some(4.0)]
        );
    }

    #[test]
    fn missing_or_text_columns_are_skipped() {
        let mut panel = panel();
        panel.insert_column("TIER", Column::Text(vec![None; 6])).unwrap();
        let mut config = config();
        config.columns = vec!["NOPE".to_string(), "TIER".to_string()];
        config.rank_columns.clear();

        let output = TimeSeriesFeatureEngine::new(config).apply(&panel).unwrap();
        assert!(output.report.created.is_empty());
        assert_eq!(output.report.skipped, vec!["NOPE".to_string(), "TIER".to_string()]);
    }
}
