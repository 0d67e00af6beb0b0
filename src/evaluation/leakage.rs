//! Проверка панели на утечку будущей информации в признаки и метки

use serde::{Deserialize, Serialize};

use crate::preprocessing::labels::{will_close_column, IS_CLOSED, IS_VALID_FOR_TRAINING, MONTHS_UNTIL_CLOSE};
use crate::types::Panel;

/// Доля невалидных строк, выше которой выдаётся предупреждение
pub const INVALID_RATIO_WARNING: f64 = 0.10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakageCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeakageReport {
    pub checks: Vec<LeakageCheck>,
    /// Колонки, которые нельзя подавать в модель, но которые есть в панели
    pub forbidden_present: Vec<String>,
    pub invalid_ratio: Option<f64>,
    pub warnings: Vec<String>,
}

impl LeakageReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    fn check(&mut self, name: &str, passed: bool, detail: impl Into<String>) {
        self.checks.push(LeakageCheck {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        });
    }

    pub fn log(&self) {
        for check in &self.checks {
            if check.passed {
                tracing::info!("[leakage] PASS {}: {}", check.name, check.detail);
            } else {
                tracing::error!("[leakage] FAIL {}: {}", check.name, check.detail);
            }
        }
        for warning in &self.warnings {
            tracing::warn!("[leakage] {}", warning);
        }
    }
}

pub struct LeakageVerifier {
    horizons: Vec<u32>,
    training_horizon: u32,
    closure_column: String,
}

impl LeakageVerifier {
    pub fn new(horizons: Vec<u32>, training_horizon: u32, closure_column: impl Into<String>) -> Self {
        Self {
            horizons,
            training_horizon,
            closure_column: closure_column.into(),
        }
    }

    fn forbidden_columns(&self) -> [&str; 3] {
        [IS_CLOSED, self.closure_column.as_str(), MONTHS_UNTIL_CLOSE]
    }

    /// `feature_names`: колонки, которые пойдут в модель
    pub fn verify(&self, panel: &Panel, feature_names: &[String]) -> LeakageReport {
        let mut report = LeakageReport::default();

        self.verify_targets(panel, &mut report);
        self.verify_features(panel, feature_names, &mut report);
        Self::verify_valid_ratio(panel, &mut report);
        self.verify_target_logic(panel, &mut report);

        report
    }

    fn verify_targets(&self, panel: &Panel, report: &mut LeakageReport) {
        report.check(
            "no_is_closed",
            !panel.has_column(IS_CLOSED),
            if panel.has_column(IS_CLOSED) {
                "is_closed column present"
            } else {
                "is_closed column absent"
            },
        );

        let missing: Vec<String> = self
            .horizons
            .iter()
            .map(|&h| will_close_column(h))
            .chain(std::iter::once(IS_VALID_FOR_TRAINING.to_string()))
            .filter(|name| panel.numeric(name).is_none())
            .collect();
        let detail = if missing.is_empty() {
            "all label columns present".to_string()
        } else {
            format!("missing label columns: {}", missing.join(", "))
        };
        report.check("required_labels", missing.is_empty(), detail);
    }

    fn verify_features(&self, panel: &Panel, feature_names: &[String], report: &mut LeakageReport) {
        let forbidden = self.forbidden_columns();

        report.forbidden_present = forbidden
            .iter()
            .filter(|name| panel.has_column(name))
            .map(|name| name.to_string())
            .collect();
        if !report.forbidden_present.is_empty() {
            report.warnings.push(format!(
                "columns must be excluded from features: {}",
                report.forbidden_present.join(", ")
            ));
        }

        let used: Vec<&str> = feature_names
            .iter()
            .map(String::as_str)
            .filter(|name| forbidden.contains(name) || name.starts_with("will_close_") || *name == IS_VALID_FOR_TRAINING)
            .collect();
        let detail = if used.is_empty() {
            format!("{} feature columns clean", feature_names.len())
        } else {
            format!("forbidden columns used as features: {}", used.join(", "))
        };
        report.check("feature_columns", used.is_empty(), detail);
    }

    fn verify_valid_ratio(panel: &Panel, report: &mut LeakageReport) {
        let Some(valid) = panel.numeric(IS_VALID_FOR_TRAINING) else {
            return;
        };
        if valid.is_empty() {
            return;
        }
        let invalid = valid.iter().filter(|v| **v != Some(1.0)).count();
        let ratio = invalid as f64 / valid.len() as f64;
        report.invalid_ratio = Some(ratio);
        if ratio > INVALID_RATIO_WARNING {
            report.warnings.push(format!(
                "invalid row ratio {:.2}% exceeds {:.0}%",
                ratio * 100.0,
                INVALID_RATIO_WARNING * 100.0
            ));
        }
    }

    fn verify_target_logic(&self, panel: &Panel, report: &mut LeakageReport) {
        let target = will_close_column(self.training_horizon);
        let (Some(labels), Some(months)) = (panel.numeric(&target), panel.numeric(MONTHS_UNTIL_CLOSE)) else {
            report.check("target_logic", false, format!("{target} or {MONTHS_UNTIL_CLOSE} missing"));
            return;
        };

        let horizon = self.training_horizon as f64;
        let positives: Vec<Option<f64>> = labels
            .iter()
            .zip(months.iter())
            .filter(|(label, _)| **label == Some(1.0))
            .map(|(_, m)| *m)
            .collect();
        if positives.is_empty() {
            report.warnings.push(format!("{target} has no positive rows"));
        }
        let out_of_range = positives
            .iter()
            .filter(|m| !m.is_some_and(|m| (1.0..=horizon).contains(&m)))
            .count();
        report.check(
            "positive_horizon",
            out_of_range == 0,
            format!("{out_of_range} positive rows outside 1..={} months", self.training_horizon),
        );

        if let Some(valid) = panel.numeric(IS_VALID_FOR_TRAINING) {
            let leaking = valid
                .iter()
                .zip(months.iter())
                .filter(|(v, m)| **v == Some(0.0) && m.is_some_and(|m| m > 0.0))
                .count();
            report.check(
                "invalid_rows_closed",
                leaking == 0,
                format!("{leaking} invalid rows with months_until_close > 0"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled_panel() -> Panel {
        let mut panel = Panel::new(
            vec!["A".into(), "A".into(), "A".into(), "B".into()],
            vec!["202401".into(), "202402".into(), "202403".into(), "202401".into()],
        )
        .unwrap();
        panel.insert_numeric(MONTHS_UNTIL_CLOSE, vec![Some(2.0), Some(1.0), Some(0.0), None]).unwrap();
        panel.insert_numeric("will_close_1m", vec![Some(0.0), Some(1.0), Some(0.0), Some(0.0)]).unwrap();
        panel.insert_numeric("will_close_3m", vec![Some(1.0), Some(1.0), Some(0.0), Some(0.0)]).unwrap();
        panel.insert_numeric(IS_VALID_FOR_TRAINING, vec![Some(1.0), Some(1.0), Some(0.0), Some(1.0)]).unwrap();
        panel
    }

    fn verifier() -> LeakageVerifier {
        LeakageVerifier::new(vec![1, 3], 3, "MCT_ME_D")
    }

    #[test]
    fn consistent_panel_passes() {
        let report = verifier().verify(&labelled_panel(), &["RC_M1_SAA".to_string()]);
        assert!(report.passed(), "{:?}", report.checks);
        assert_eq!(report.invalid_ratio, Some(0.25));
        // 25% невалидных строк выше порога
        assert!(report.warnings.iter().any(|w| w.contains("invalid row ratio")));
        // months_until_close есть в панели, но не в признаках
        assert_eq!(report.forbidden_present, vec![MONTHS_UNTIL_CLOSE.to_string()]);
    }

    #[test]
    fn is_closed_column_fails() {
        let mut panel = labelled_panel();
        panel.insert_numeric(IS_CLOSED, vec![Some(0.0); 4]).unwrap();
        let report = verifier().verify(&panel, &[]);
        assert!(!report.passed());
        assert!(report.checks.iter().any(|c| c.name == "no_is_closed" && !c.passed));
    }

    #[test]
    fn forbidden_feature_fails() {
        let report = verifier().verify(&labelled_panel(), &[MONTHS_UNTIL_CLOSE.to_string()]);
        assert!(report.checks.iter().any(|c| c.name == "feature_columns" && !c.passed));
    }

    #[test]
    fn positive_outside_horizon_fails() {
        let mut panel = labelled_panel();
        panel.insert_numeric("will_close_3m", vec![Some(1.0), Some(1.0), Some(1.0), Some(0.0)]).unwrap();
        let report = verifier().verify(&panel, &[]);
        assert!(report.checks.iter().any(|c| c.name == "positive_horizon" && !c.passed));
    }

    #[test]
    fn missing_labels_fail() {
        let mut panel = labelled_panel();
        panel.drop_column("will_close_1m");
        let report = verifier().verify(&panel, &[]);
        let check = report.checks.iter().find(|c| c.name == "required_labels").unwrap();
        assert!(!check.passed);
        assert!(check.detail.contains("will_close_1m"));
    }
}
