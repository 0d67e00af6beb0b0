//! Поведение клиентов и лояльность

use crate::config::CustomerConfig;
use crate::error::PipelineError;
use crate::features::{chronological, emit, numeric_source, per_merchant, rolling, FeatureEngine};
use crate::types::{Panel, StageOutput, StageReport};

pub const LOYALTY_SCORE: &str = "loyalty_score";

pub struct CustomerFeatureEngine {
    config: CustomerConfig,
}

impl CustomerFeatureEngine {
    pub fn new(config: CustomerConfig) -> Self {
        Self { config }
    }
}

impl FeatureEngine for CustomerFeatureEngine {
    fn name(&self) -> &'static str {
        "customer"
    }

    fn apply(&self, panel: &Panel) -> Result<StageOutput, PipelineError> {
        let mut report = StageReport::new(self.name());
        let mut output = chronological(panel);

        let returning = numeric_source(&output, &self.config.returning_ratio_column, &mut report);
        let new = numeric_source(&output, &self.config.new_ratio_column, &mut report);
        let (Some(returning), Some(new)) = (returning, new) else {
            report.warn("customer ratio columns unavailable, loyalty features skipped");
            return Ok(StageOutput { panel: output, report });
        };

        // повторные / новые; ноль в знаменателе -> пропуск
        let loyalty: Vec<Option<f64>> = returning
            .iter()
            .zip(new.iter())
            .map(|(&r, &n)| rolling::safe_div(r, n))
            .collect();

        for &w in &self.config.windows {
            let reu_avg = per_merchant(&output, &returning, |s| rolling::rolling_mean(s, w));
            let new_avg = per_merchant(&output, &new, |s| rolling::rolling_mean(s, w));
            let reu_std = per_merchant(&output, &returning, |s| rolling::rolling_std(s, w));
            let new_trend = per_merchant(&output, &new, |s| rolling::rolling_slope(s, w));
            emit(&mut output, &mut report, format!("customer_reu_avg_{w}m"), reu_avg.clone())?;
            emit(&mut output, &mut report, format!("customer_new_avg_{w}m"), new_avg)?;
            emit(&mut output, &mut report, format!("customer_reu_std_{w}m"), reu_std.clone())?;
            emit(&mut output, &mut report, format!("customer_new_trend_{w}m"), new_trend)?;

            let loyalty_avg = per_merchant(&output, &loyalty, |s| rolling::rolling_mean(s, w));
            let loyalty_trend = per_merchant(&output, &loyalty, |s| rolling::rolling_slope(s, w));
            // стабильность = 1 / (1 + CV повторных клиентов)
            let stability: Vec<Option<f64>> = rolling::coefficient_of_variation(&reu_std, &reu_avg)
                .into_iter()
                .map(|cv| cv.and_then(|cv| rolling::finite(1.0 / (1.0 + cv))))
                .collect();
            emit(&mut output, &mut report, format!("loyalty_score_avg_{w}m"), loyalty_avg)?;
            emit(&mut output, &mut report, format!("loyalty_trend_{w}m"), loyalty_trend)?;
            emit(&mut output, &mut report, format!("customer_stability_{w}m"), stability)?;
        }
        emit(&mut output, &mut report, LOYALTY_SCORE.to_string(), loyalty)?;

        tracing::info!("Customer features: {} created", report.created.len());
        Ok(StageOutput { panel: output, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CustomerConfig {
        CustomerConfig {
            windows: vec![3],
            ..CustomerConfig::default()
        }
    }

    fn panel() -> Panel {
        let mut panel = Panel::new(
            vec!["A".into(), "A".into(), "A".into()],
            vec!["202401".into(), "202402".into(), "202403".into()],
        )
        .unwrap();
        panel
            .insert_numeric("MCT_UE_CLN_REU_RAT", vec![Some(30.0), Some(40.0), Some(50.0)])
            .unwrap();
        panel
            .insert_numeric("MCT_UE_CLN_NEW_RAT", vec![Some(10.0), Some(0.0), Some(25.0)])
            .unwrap();
        panel
    }

    #[test]
    fn loyalty_score_drops_zero_denominator() {
        let output = CustomerFeatureEngine::new(config()).apply(&panel()).unwrap();
        let out = &output.panel;
        assert_eq!(out.numeric(LOYALTY_SCORE).unwrap(), &[Some(3.0), None, Some(2.0)]);
        assert_eq!(out.numeric("loyalty_score_avg_3m").unwrap()[2], Some(2.5));
        assert_eq!(out.numeric("customer_reu_avg_3m").unwrap()[2], Some(40.0));
        assert_eq!(out.numeric("loyalty_trend_3m").unwrap()[2], Some(-0.5));
    }

    #[test]
    fn stability_is_inverse_of_cv() {
        let output = CustomerFeatureEngine::new(config()).apply(&panel()).unwrap();
        let stability = output.panel.numeric("customer_stability_3m").unwrap();
        assert_eq!(stability[0], None);
        // std(30, 40, 50) = 10, mean = 40 -> cv = 0.25
        let last = stability[2].unwrap();
        assert!((last - 1.0 / 1.25).abs() < 1e-12);
    }

    #[test]
    fn missing_ratio_column_skips_engine() {
        let mut panel = panel();
        panel.drop_column("MCT_UE_CLN_NEW_RAT");
        let output = CustomerFeatureEngine::new(config()).apply(&panel).unwrap();
        assert!(output.report.created.is_empty());
        assert_eq!(output.report.skipped, vec!["MCT_UE_CLN_NEW_RAT".to_string()]);
        assert!(!output.panel.has_column(LOYALTY_SCORE));
    }
}
