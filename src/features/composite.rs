//! Композитные индексы здоровья, риска и роста, взаимодействия и отношения признаков

use crate::config::CompositeConfig;
use crate::error::PipelineError;
use crate::features::{chronological, emit, rolling, FeatureEngine};
use crate::preprocessing::normalization::{DataNormalizer, ScalingMethod};
use crate::types::{Panel, StageOutput, StageReport};

pub struct CompositeFeatureEngine {
    config: CompositeConfig,
}

/// Компонент индекса: значения колонки после преобразования
struct Component {
    source: String,
    values: Vec<Option<f64>>,
}

impl CompositeFeatureEngine {
    pub fn new(config: CompositeConfig) -> Self {
        Self { config }
    }

    fn component(panel: &Panel, column: &str, transform: impl Fn(Option<f64>) -> Option<f64>) -> Option<Component> {
        let values = panel.numeric(column)?;
        Some(Component {
            source: column.to_string(),
            values: values.iter().map(|&v| transform(v)).collect(),
        })
    }

    fn health_components(&self, panel: &Panel, w: usize) -> Vec<Component> {
        let sales = &self.config.sales_column;
        [
            Self::component(panel, &format!("{sales}_trend_{w}m"), |v| v),
            Self::component(panel, &format!("loyalty_score_avg_{w}m"), |v| v),
            Self::component(panel, &format!("customer_stability_{w}m"), |v| v),
            // низкая волатильность лучше
            Self::component(panel, &format!("{sales}_cv_{w}m"), |v| {
                rolling::finite(1.0 / (1.0 + v.unwrap_or(0.0)))
            }),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn risk_components(&self, panel: &Panel, w: usize) -> Vec<Component> {
        let sales = &self.config.sales_column;
        let rank_period = w.min(6);
        [
            Self::component(panel, &format!("{sales}_cv_{w}m"), |v| v),
            Self::component(panel, &format!("{sales}_trend_{w}m"), |v| {
                Some((-v.unwrap_or(0.0)).max(0.0))
            }),
            Self::component(panel, &format!("{sales}_rank_change_{rank_period}m"), |v| {
                Some(v.unwrap_or(0.0).max(0.0))
            }),
            Self::component(panel, &format!("customer_stability_{w}m"), |v| {
                Some(1.0 - v.unwrap_or(0.5))
            }),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn growth_components(&self, panel: &Panel, w: usize) -> Vec<Component> {
        let sales = &self.config.sales_column;
        let customers = &self.config.customer_count_column;
        let change_period = w.min(12);
        [
            Self::component(panel, &format!("{sales}_change_{change_period}m"), |v| v),
            Self::component(panel, &format!("{customers}_change_{change_period}m"), |v| v),
            Self::component(panel, &format!("{sales}_trend_{w}m"), |v| v),
            Self::component(panel, &format!("customer_new_trend_{w}m"), |v| v),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Среднее нормализованных компонентов; вырожденные компоненты не участвуют
    fn index(
        components: Vec<Component>,
        method: ScalingMethod,
        rows: usize,
    ) -> Option<Vec<Option<f64>>> {
        let normalized: Vec<Vec<Option<f64>>> = components
            .into_iter()
            .filter_map(|c| {
                let scaled = DataNormalizer::new(method).fit_transform(&c.values);
                if let Err(reason) = &scaled {
                    tracing::debug!("component {} dropped: {}", c.source, reason);
                }
                scaled.ok()
            })
            .collect();
        if normalized.is_empty() {
            return None;
        }

        let count = normalized.len() as f64;
        Some(
            (0..rows)
                .map(|row| {
                    normalized
                        .iter()
                        .map(|values| values[row])
                        .sum::<Option<f64>>()
                        .map(|sum| sum / count)
                })
                .collect(),
        )
    }

    fn interactions(&self, panel: &mut Panel, report: &mut StageReport) -> Result<(), PipelineError> {
        for (a, b) in &self.config.interaction_pairs {
            let name = format!("{a}_X_{b}");
            let (Some(left), Some(right)) = (panel.numeric(a), panel.numeric(b)) else {
                report.skip(name, "source column not found");
                continue;
            };
            let product = left
                .iter()
                .zip(right.iter())
                .map(|(&x, &y)| x.zip(y).and_then(|(x, y)| rolling::finite(x * y)))
                .collect();
            emit(panel, report, name, product)?;
        }
        Ok(())
    }

    fn ratios(&self, panel: &mut Panel, report: &mut StageReport) -> Result<(), PipelineError> {
        for numerator in &self.config.ratio_numerators {
            for denominator in &self.config.ratio_denominators {
                let name = format!("{numerator}_div_{denominator}");
                let (Some(top), Some(bottom)) = (panel.numeric(numerator), panel.numeric(denominator)) else {
                    report.skip(name, "source column not found");
                    continue;
                };
                let ratio = top
                    .iter()
                    .zip(bottom.iter())
                    .map(|(&x, &y)| rolling::safe_div(x, y))
                    .collect();
                emit(panel, report, name, ratio)?;
            }
        }
        Ok(())
    }
}

impl FeatureEngine for CompositeFeatureEngine {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn apply(&self, panel: &Panel) -> Result<StageOutput, PipelineError> {
        let mut report = StageReport::new(self.name());
        let mut output = chronological(panel);
        let rows = output.len();

        for &w in &self.config.windows {
            let indices = [
                (format!("health_index_{w}m"), self.health_components(&output, w), ScalingMethod::MinMax),
                (format!("risk_index_{w}m"), self.risk_components(&output, w), ScalingMethod::MinMax),
                (format!("growth_index_{w}m"), self.growth_components(&output, w), ScalingMethod::AbsMax),
            ];
            for (name, components, method) in indices {
                match Self::index(components, method, rows) {
                    Some(values) => emit(&mut output, &mut report, name, values)?,
                    None => report.skip(name, "no usable components"),
                }
            }
        }

        self.interactions(&mut output, &mut report)?;
        self.ratios(&mut output, &mut report)?;

        tracing::info!("Composite features: {} created", report.created.len());
        Ok(StageOutput { panel: output, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompositeConfig {
        CompositeConfig {
            windows: vec![3],
            ..CompositeConfig::default()
        }
    }

    fn panel() -> Panel {
        let mut panel = Panel::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec!["202401".into(); 3],
        )
        .unwrap();
        panel.insert_numeric("RC_M1_SAA_trend_3m", vec![Some(-2.0), Some(0.0), Some(2.0)]).unwrap();
        panel.insert_numeric("customer_stability_3m", vec![Some(0.5), Some(0.7), None]).unwrap();
        panel.insert_numeric("RC_M1_SAA_change_3m", vec![Some(-50.0), Some(25.0), Some(0.0)]).unwrap();
        panel
    }

    #[test]
    fn health_index_averages_min_max_components() {
        let output = CompositeFeatureEngine::new(config()).apply(&panel()).unwrap();
        let health = output.panel.numeric("health_index_3m").unwrap();
        // trend -> [0, 0.5, 1], stability -> [0, 1, null]
        assert_eq!(health[0], Some(0.0));
        assert!((health[1].unwrap() - 0.75).abs() < 1e-12);
        assert_eq!(health[2], None);
    }

    #[test]
    fn risk_index_uses_transformed_components() {
        let output = CompositeFeatureEngine::new(config()).apply(&panel()).unwrap();
        let risk = output.panel.numeric("risk_index_3m").unwrap();
        // neg_trend = [2, 0, 0] -> [1, 0, 0]; instability = [0.5, 0.3, 0.5] -> [1, 0, 1]
        assert_eq!(risk, &[Some(1.0), Some(0.0), Some(0.5)]);
    }

    #[test]
    fn growth_index_preserves_sign() {
        let output = CompositeFeatureEngine::new(config()).apply(&panel()).unwrap();
        let growth = output.panel.numeric("growth_index_3m").unwrap();
        // change / 50 = [-1, 0.5, 0]; trend / 2 = [-1, 0, 1]
        assert_eq!(growth, &[Some(-1.0), Some(0.25), Some(0.5)]);
    }

    #[test]
    fn index_without_components_is_skipped() {
        let panel = Panel::new(vec!["A".into()], vec!["202401".into()]).unwrap();
        let output = CompositeFeatureEngine::new(config()).apply(&panel).unwrap();
        assert!(output.report.created.is_empty());
        assert_eq!(output.report.skipped.len(), 3);
    }

    #[test]
    fn interaction_and_ratio_features() {
        let config = CompositeConfig {
            windows: vec![],
            interaction_pairs: vec![("RC_M1_SAA_trend_3m".into(), "RC_M1_SAA_change_3m".into())],
            ratio_numerators: vec!["RC_M1_SAA_change_3m".into()],
            ratio_denominators: vec!["RC_M1_SAA_trend_3m".into(), "missing".into()],
            ..CompositeConfig::default()
        };
        let output = CompositeFeatureEngine::new(config).apply(&panel()).unwrap();
        let out = &output.panel;
        assert_eq!(
            out.numeric("RC_M1_SAA_trend_3m_X_RC_M1_SAA_change_3m").unwrap(),
            &[Some(100.0), Some(0.0), Some(0.0)]
        );
        assert_eq!(
            out.numeric("RC_M1_SAA_change_3m_div_RC_M1_SAA_trend_3m").unwrap(),
            &[Some(25.0), None, Some(0.0)]
        );
        assert_eq!(output.report.skipped, vec!["RC_M1_SAA_change_3m_div_missing".to_string()]);
    }
}
