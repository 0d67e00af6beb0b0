//! Сборка матриц признаков для ML моделей из обогащённой панели

use std::collections::BTreeSet;

use ndarray::{Array1, Array2};

use crate::error::PipelineError;
use crate::preprocessing::labels::{IS_CLOSED, IS_VALID_FOR_TRAINING, MONTHS_UNTIL_CLOSE};
use crate::types::Panel;

/// Обучающая выборка: признаки (пропуск = NaN), бинарная цель и исходные строки панели
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Array2<f64>,
    pub labels: Array1<usize>,
    pub feature_names: Vec<String>,
    pub rows: Vec<usize>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&y| y == 1).count()
    }
}

pub struct FeatureEngineer;

impl FeatureEngineer {
    /// Колонка, которую нельзя подавать в модель: метки, расстояние до закрытия, дата закрытия
    pub fn is_leakage_column(name: &str, closure_column: &str) -> bool {
        name == MONTHS_UNTIL_CLOSE
            || name == IS_VALID_FOR_TRAINING
            || name == IS_CLOSED
            || name == closure_column
            || name.starts_with("will_close_")
    }

    /// Все числовые колонки панели, кроме запрещённых
    pub fn feature_columns(panel: &Panel, closure_column: &str) -> Vec<String> {
        panel
            .columns()
            .filter(|(name, column)| {
                column.as_numeric().is_some() && !Self::is_leakage_column(name, closure_column)
            })
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Строки, пригодные для обучения: `is_valid_for_training = 1` и известная цель
    pub fn training_rows(panel: &Panel, target: &str) -> Result<Vec<usize>, PipelineError> {
        let valid = panel
            .numeric(IS_VALID_FOR_TRAINING)
            .ok_or_else(|| PipelineError::MissingFeature(IS_VALID_FOR_TRAINING.to_string()))?;
        let labels = panel
            .numeric(target)
            .ok_or_else(|| PipelineError::MissingFeature(target.to_string()))?;
        Ok((0..panel.len())
            .filter(|&row| valid[row] == Some(1.0) && labels[row].is_some())
            .collect())
    }

    /// Деление строк по времени: последние `holdout` периодов уходят в валидацию
    pub fn split_by_period(panel: &Panel, rows: &[usize], holdout: usize) -> (Vec<usize>, Vec<usize>) {
        let periods: BTreeSet<&str> = rows.iter().map(|&r| panel.periods()[r].as_str()).collect();
        let cutoff = periods.iter().rev().nth(holdout.saturating_sub(1)).copied();
        match cutoff {
            Some(cutoff) if holdout > 0 && periods.len() > holdout => rows
                .iter()
                .partition(|&&r| panel.periods()[r].as_str() < cutoff),
            _ => (rows.to_vec(), Vec::new()),
        }
    }

    /// Матрица признаков для выбранных строк
    pub fn matrix(panel: &Panel, feature_names: &[String], rows: &[usize]) -> Result<Array2<f64>, PipelineError> {
        let mut features = Array2::from_elem((rows.len(), feature_names.len()), f64::NAN);
        for (j, name) in feature_names.iter().enumerate() {
            let values = panel
                .numeric(name)
                .ok_or_else(|| PipelineError::MissingFeature(name.clone()))?;
            for (i, &row) in rows.iter().enumerate() {
                if let Some(v) = values[row] {
                    features[[i, j]] = v;
                }
            }
        }
        Ok(features)
    }

    pub fn extract(
        panel: &Panel,
        feature_names: &[String],
        target: &str,
        rows: &[usize],
    ) -> Result<TrainingSet, PipelineError> {
        let labels = panel
            .numeric(target)
            .ok_or_else(|| PipelineError::MissingFeature(target.to_string()))?;
        let rows: Vec<usize> = rows.iter().copied().filter(|&r| labels[r].is_some()).collect();
        let targets: Array1<usize> = rows
            .iter()
            .map(|&r| if labels[r] == Some(1.0) { 1 } else { 0 })
            .collect();

        Ok(TrainingSet {
            features: Self::matrix(panel, feature_names, &rows)?,
            labels: targets,
            feature_names: feature_names.to_vec(),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Column;

    fn panel() -> Panel {
        let mut panel = Panel::new(
            vec!["A".into(), "A".into(), "A".into(), "B".into()],
            vec!["202401".into(), "202402".into(), "202403".into(), "202403".into()],
        )
        .unwrap();
        panel.insert_numeric("RC_M1_SAA", vec![Some(1.0), None, Some(3.0), Some(4.0)]).unwrap();
        panel.insert_column("MCT_NM", Column::Text(vec![None; 4])).unwrap();
        panel.insert_numeric("MCT_ME_D", vec![Some(20240315.0), Some(20240315.0), Some(20240315.0), None]).unwrap();
        panel.insert_numeric(MONTHS_UNTIL_CLOSE, vec![Some(2.0), Some(1.0), Some(0.0), None]).unwrap();
        panel.insert_numeric("will_close_3m", vec![Some(1.0), Some(1.0), Some(0.0), Some(0.0)]).unwrap();
        panel.insert_numeric(IS_VALID_FOR_TRAINING, vec![Some(1.0), Some(1.0), Some(0.0), Some(1.0)]).unwrap();
        panel
    }

    #[test]
    fn leakage_columns_are_never_features() {
        let features = FeatureEngineer::feature_columns(&panel(), "MCT_ME_D");
        assert_eq!(features, vec!["RC_M1_SAA".to_string()]);
    }

    #[test]
    fn only_valid_rows_are_trainable() {
        let rows = FeatureEngineer::training_rows(&panel(), "will_close_3m").unwrap();
        assert_eq!(rows, vec![0, 1, 3]);
    }

    #[test]
    fn extract_keeps_missing_as_nan() {
        let panel = panel();
        let set = FeatureEngineer::extract(&panel, &["RC_M1_SAA".to_string()], "will_close_3m", &[0, 1, 3]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.positives(), 2);
        assert!(set.features[[1, 0]].is_nan());
        assert_eq!(set.features[[2, 0]], 4.0);
    }

    #[test]
    fn split_holds_out_latest_period() {
        let panel = panel();
        let (train, validation) = FeatureEngineer::split_by_period(&panel, &[0, 1, 3], 1);
        assert_eq!(train, vec![0, 1]);
        assert_eq!(validation, vec![3]);

        // если периодов не хватает, всё уходит в обучение
        let (train, validation) = FeatureEngineer::split_by_period(&panel, &[3], 1);
        assert_eq!(train, vec![3]);
        assert!(validation.is_empty());
    }

    #[test]
    fn missing_feature_is_an_error() {
        assert!(FeatureEngineer::matrix(&panel(), &["nope".to_string()], &[0]).is_err());
    }
}
