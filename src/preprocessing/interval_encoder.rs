//! Кодирование 6-уровневых интервальных колонок в порядковые числа 1..6

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{Column, Panel, StageReport};

/// Известные написания уровней: процентильные сегменты и ранговые группы
const INTERVAL_LABELS: [(&str, u8); 12] = [
    ("1_10%이하", 1),
    ("2_10-25%", 2),
    ("3_25-50%", 3),
    ("4_50-75%", 4),
    ("5_75-90%", 5),
    ("6_90%초과(하위 10% 이하)", 6),
    ("1_상위1구간", 1),
    ("2_상위2구간", 2),
    ("3_상위3구간", 3),
    ("4_상위4구간", 4),
    ("5_상위5구간", 5),
    ("6_상위6구간(하위1구간)", 6),
];

/// Сколько уникальных значений смотреть при автоопределении колонок
const DETECTION_SAMPLE: usize = 10;

/// Код уровня для строки; одна и та же строка всегда даёт один код
pub fn encode_label(raw: &str) -> Option<u8> {
    let raw = raw.trim();
    INTERVAL_LABELS
        .iter()
        .find(|(label, _)| *label == raw)
        .map(|&(_, level)| level)
}

/// Каноническая (процентильная) метка уровня
pub fn canonical_label(level: u8) -> Option<&'static str> {
    INTERVAL_LABELS[..6]
        .iter()
        .find(|&&(_, l)| l == level)
        .map(|&(label, _)| label)
}

fn looks_like_interval(value: &str) -> bool {
    let bytes = value.trim().as_bytes();
    bytes.len() > 2 && (b'1'..=b'6').contains(&bytes[0]) && bytes[1] == b'_'
}

/// Итог кодирования одной колонки
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingSummary {
    pub column: String,
    pub min: Option<u8>,
    pub max: Option<u8>,
    pub null_count: usize,
    pub unmapped_count: usize,
    /// Нераспознанные строки (первые несколько уникальных)
    pub unmapped_samples: Vec<String>,
    pub distribution: BTreeMap<u8, usize>,
}

#[derive(Debug, Clone)]
pub struct EncodingOutput {
    pub panel: Panel,
    pub summaries: Vec<EncodingSummary>,
    pub report: StageReport,
}

#[derive(Debug, Clone, Default)]
pub struct IntervalEncoder {
    /// Сохранять исходные строки в `<col>_original`
    pub keep_original: bool,
}

impl IntervalEncoder {
    pub fn new(keep_original: bool) -> Self {
        Self { keep_original }
    }

    /// Текстовые колонки, среди первых уникальных значений которых есть префикс `1_`..`6_`
    pub fn detect_columns(&self, panel: &Panel) -> Vec<String> {
        panel
            .columns()
            .filter_map(|(name, column)| {
                let values = column.as_text()?;
                let mut sample: Vec<&str> = Vec::with_capacity(DETECTION_SAMPLE);
                for value in values.iter().flatten() {
                    if sample.len() == DETECTION_SAMPLE {
                        break;
                    }
                    if !sample.contains(&value.as_str()) {
                        sample.push(value);
                    }
                }
                sample
                    .iter()
                    .any(|v| looks_like_interval(v))
                    .then(|| name.to_string())
            })
            .collect()
    }

    /// Кодирование указанных колонок (или найденных автоматически, если список пуст)
    pub fn encode(&self, panel: &Panel, columns: &[String]) -> Result<EncodingOutput, PipelineError> {
        let mut report = StageReport::new("interval_encoding");
        let targets = if columns.is_empty() {
            self.detect_columns(panel)
        } else {
            columns.to_vec()
        };

        let mut output = panel.clone();
        let mut summaries = Vec::with_capacity(targets.len());

        for name in &targets {
            let values = match panel.column(name) {
                Some(Column::Text(values)) => values,
                Some(Column::Numeric(_)) => {
                    report.skip(name.clone(), "already numeric");
                    continue;
                }
                None => {
                    report.skip(name.clone(), "column not found");
                    continue;
                }
            };

            if self.keep_original {
                let original = format!("{name}_original");
                output.insert_column(original.clone(), Column::Text(values.clone()))?;
                report.created(original);
            }

            let (encoded, summary) = encode_values(name, values);
            if summary.unmapped_count > 0 {
                report.warn(format!(
                    "{}: {} unmapped values, e.g. {:?}",
                    name, summary.unmapped_count, summary.unmapped_samples
                ));
            }
            output.insert_numeric(name.clone(), encoded)?;
            report.created(name.clone());
            summaries.push(summary);
        }

        tracing::info!("Encoded {} interval columns", summaries.len());
        Ok(EncodingOutput {
            panel: output,
            summaries,
            report,
        })
    }
}

fn encode_values(name: &str, values: &[Option<String>]) -> (Vec<Option<f64>>, EncodingSummary) {
    let mut summary = EncodingSummary {
        column: name.to_string(),
        min: None,
        max: None,
        null_count: 0,
        unmapped_count: 0,
        unmapped_samples: Vec::new(),
        distribution: BTreeMap::new(),
    };

    let encoded = values
        .iter()
        .map(|value| {
            let Some(raw) = value else {
                summary.null_count += 1;
                return None;
            };
            match encode_label(raw) {
                Some(level) => {
                    *summary.distribution.entry(level).or_default() += 1;
                    summary.min = Some(summary.min.map_or(level, |m| m.min(level)));
                    summary.max = Some(summary.max.map_or(level, |m| m.max(level)));
                    Some(level as f64)
                }
                None => {
                    summary.null_count += 1;
                    summary.unmapped_count += 1;
                    if summary.unmapped_samples.len() < 5 && !summary.unmapped_samples.contains(raw) {
                        summary.unmapped_samples.push(raw.clone());
                    }
                    None
                }
            }
        })
        .collect();

    (encoded, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(values: &[Option<&str>]) -> Column {
        Column::Text(values.iter().map(|v| v.map(str::to_string)).collect())
    }

    fn panel() -> Panel {
        let mut panel = Panel::new(
            vec!["A".into(), "A".into(), "B".into()],
            vec!["202401".into(), "202402".into(), "202401".into()],
        )
        .unwrap();
        panel
            .insert_column("RC_M1_SAA", text(&[Some("1_10%이하"), Some("6_90%초과(하위 10% 이하)"), None]))
            .unwrap();
        panel
            .insert_column("APV_CE_RAT", text(&[Some("2_상위2구간"), Some("7_unknown"), Some("3_상위3구간")]))
            .unwrap();
        panel
            .insert_column("HPSN_MCT_ZCD_NM", text(&[Some("카페"), Some("한식"), None]))
            .unwrap();
        panel
    }

    #[test]
    fn both_phrasings_share_levels() {
        assert_eq!(encode_label("1_10%이하"), Some(1));
        assert_eq!(encode_label("1_상위1구간"), Some(1));
        assert_eq!(encode_label("6_상위6구간(하위1구간)"), Some(6));
        assert_eq!(encode_label("6_90%초과"), None);
    }

    #[test]
    fn reverse_mapping_preserves_level() {
        for (label, level) in INTERVAL_LABELS {
            let canonical = canonical_label(level).unwrap();
            assert_eq!(encode_label(canonical), Some(level), "{label}");
        }
        assert_eq!(canonical_label(0), None);
    }

    #[test]
    fn detects_interval_columns_only() {
        let detected = IntervalEncoder::default().detect_columns(&panel());
        assert_eq!(detected, vec!["RC_M1_SAA".to_string(), "APV_CE_RAT".to_string()]);
    }

    #[test]
    fn unmapped_values_become_null_with_warning() {
        let output = IntervalEncoder::default().encode(&panel(), &[]).unwrap();
        assert_eq!(output.panel.numeric("RC_M1_SAA").unwrap(), &[Some(1.0), Some(6.0), None]);
        assert_eq!(output.panel.numeric("APV_CE_RAT").unwrap(), &[Some(2.0), None, Some(3.0)]);

        let summary = &output.summaries[1];
        assert_eq!(summary.unmapped_count, 1);
        assert_eq!(summary.unmapped_samples, vec!["7_unknown".to_string()]);
        assert_eq!(summary.min, Some(2));
        assert_eq!(output.report.warnings.len(), 1);
    }

    #[test]
    fn keep_original_and_missing_column() {
        let output = IntervalEncoder::new(true)
            .encode(&panel(), &["RC_M1_SAA".to_string(), "NOT_THERE".to_string()])
            .unwrap();
        assert_eq!(
            output.panel.text("RC_M1_SAA_original").unwrap()[0].as_deref(),
            Some("1_10%이하")
        );
        assert_eq!(output.report.skipped, vec!["NOT_THERE".to_string()]);
    }
}
