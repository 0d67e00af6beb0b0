//! Нормализация колонок для композитных индексов

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMethod {
    /// (x - min) / (max - min), результат в [0, 1]
    MinMax,
    /// x / max|x|, знак сохраняется, результат в [-1, 1]
    AbsMax,
}

/// Масштабирование одной колонки с пропусками.
/// Вырожденная колонка (пустая, нулевой размах) не обучается, компонент нужно пропустить.
#[derive(Debug, Clone)]
pub struct DataNormalizer {
    method: ScalingMethod,
    offset: f64,
    scale: f64,
    is_fitted: bool,
}

impl DataNormalizer {
    pub fn new(method: ScalingMethod) -> Self {
        Self {
            method,
            offset: 0.0,
            scale: 1.0,
            is_fitted: false,
        }
    }

    pub fn fit(&mut self, values: &[Option<f64>]) -> Result<(), String> {
        let present: Vec<f64> = values.iter().flatten().copied().filter(|v| v.is_finite()).collect();
        if present.is_empty() {
            return Err("No values to fit".to_string());
        }

        let min = present.iter().copied().fold(f64::INFINITY, f64::min);
        let max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        if range <= 0.0 {
            return Err("Zero range".to_string());
        }

        match self.method {
            ScalingMethod::MinMax => {
                self.offset = min;
                self.scale = range;
            }
            ScalingMethod::AbsMax => {
                let abs_max = min.abs().max(max.abs());
                if abs_max <= 0.0 {
                    return Err("Zero magnitude".to_string());
                }
                self.offset = 0.0;
                self.scale = abs_max;
            }
        }

        self.is_fitted = true;
        Ok(())
    }

    pub fn transform(&self, values: &[Option<f64>]) -> Result<Vec<Option<f64>>, String> {
        if !self.is_fitted {
            return Err("Normalizer not fitted".to_string());
        }
        Ok(values
            .iter()
            .map(|v| v.map(|x| (x - self.offset) / self.scale).filter(|x| x.is_finite()))
            .collect())
    }

    pub fn fit_transform(&mut self, values: &[Option<f64>]) -> Result<Vec<Option<f64>>, String> {
        self.fit(values)?;
        self.transform(values)
    }
}
