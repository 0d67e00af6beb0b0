/// Типы данных для пайплайна риска закрытия

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Сырая строка одного из трёх датасетов: имя колонки -> значение
pub type RawRecord = BTreeMap<String, serde_json::Value>;

/// Три исходных датасета
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTables {
    /// Базовая информация о мерчанте (одна строка на мерчанта, содержит дату закрытия)
    #[serde(default)]
    pub merchants: Vec<RawRecord>,
    /// Помесячные продажи / использование
    #[serde(default)]
    pub monthly_sales: Vec<RawRecord>,
    /// Помесячные данные о клиентах
    #[serde(default)]
    pub monthly_customers: Vec<RawRecord>,
}

/// Календарный месяц
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    /// Разбор периода `YYYYMM`; некорректная строка -> None
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = strip_integral_suffix(raw.trim());
        if raw.len() != 6 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year: i32 = raw[..4].parse().ok()?;
        let month: u32 = raw[4..].parse().ok()?;
        Self::new(year, month)
    }

    /// Дата закрытия: `YYYYMMDD` (в том числе из float вида `20240315.0`) или `YYYY-MM-DD`
    pub fn parse_date(raw: &str) -> Option<Self> {
        let raw = strip_integral_suffix(raw.trim());
        NaiveDate::parse_from_str(raw, "%Y%m%d")
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
            .ok()
            .map(|date| Self {
                year: date.year(),
                month: date.month(),
            })
    }

    /// Порядковый номер месяца, разность двух значений равна числу месяцев между ними
    pub fn ordinal(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    pub fn months_until(&self, later: &YearMonth) -> i64 {
        later.ordinal() - self.ordinal()
    }

    pub fn quarter(&self) -> u32 {
        (self.month - 1) / 3 + 1
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

fn strip_integral_suffix(raw: &str) -> &str {
    match raw.split_once('.') {
        Some((head, tail)) if tail.bytes().all(|b| b == b'0') => head,
        _ => raw,
    }
}

/// Колонка панели
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum Column {
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_count(&self) -> usize {
        match self {
            Column::Numeric(values) => values.iter().filter(|v| v.is_none()).count(),
            Column::Text(values) => values.iter().filter(|v| v.is_none()).count(),
        }
    }

    pub fn as_numeric(&self) -> Option<&[Option<f64>]> {
        match self {
            Column::Numeric(values) => Some(values),
            Column::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&[Option<String>]> {
        match self {
            Column::Text(values) => Some(values),
            Column::Numeric(_) => None,
        }
    }

    /// Значение ячейки в текстовом виде (целые числа без дробной части)
    pub fn cell_as_string(&self, row: usize) -> Option<String> {
        match self {
            Column::Numeric(values) => values[row].map(format_number),
            Column::Text(values) => values[row].clone(),
        }
    }

    fn take(&self, indices: &[usize]) -> Column {
        match self {
            Column::Numeric(values) => Column::Numeric(indices.iter().map(|&i| values[i]).collect()),
            Column::Text(values) => {
                Column::Text(indices.iter().map(|&i| values[i].clone()).collect())
            }
        }
    }
}

pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Панель наблюдений: одна строка на (мерчант, месяц), колонки в порядке добавления
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Panel {
    merchant_ids: Vec<String>,
    periods: Vec<String>,
    names: Vec<String>,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

impl Panel {
    pub fn new(merchant_ids: Vec<String>, periods: Vec<String>) -> Result<Self, PipelineError> {
        if merchant_ids.len() != periods.len() {
            return Err(PipelineError::LengthMismatch {
                column: "period".to_string(),
                expected: merchant_ids.len(),
                actual: periods.len(),
            });
        }
        Ok(Self {
            merchant_ids,
            periods,
            ..Self::default()
        })
    }

    pub fn len(&self) -> usize {
        self.merchant_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merchant_ids.is_empty()
    }

    pub fn merchant_ids(&self) -> &[String] {
        &self.merchant_ids
    }

    /// Периоды в исходном виде `YYYYMM`
    pub fn periods(&self) -> &[String] {
        &self.periods
    }

    pub fn year_month(&self, row: usize) -> Option<YearMonth> {
        YearMonth::parse(&self.periods[row])
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    pub fn numeric(&self, name: &str) -> Option<&[Option<f64>]> {
        self.column(name).and_then(Column::as_numeric)
    }

    pub fn text(&self, name: &str) -> Option<&[Option<String>]> {
        self.column(name).and_then(Column::as_text)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names.iter().map(String::as_str).zip(self.columns.iter())
    }

    /// Добавление колонки; существующая колонка с тем же именем заменяется на месте
    pub fn insert_column(&mut self, name: impl Into<String>, column: Column) -> Result<(), PipelineError> {
        let name = name.into();
        if column.len() != self.len() {
            return Err(PipelineError::LengthMismatch {
                column: name,
                expected: self.len(),
                actual: column.len(),
            });
        }
        match self.index.get(&name) {
            Some(&i) => self.columns[i] = column,
            None => {
                self.index.insert(name.clone(), self.columns.len());
                self.names.push(name);
                self.columns.push(column);
            }
        }
        Ok(())
    }

    pub fn insert_numeric(&mut self, name: impl Into<String>, values: Vec<Option<f64>>) -> Result<(), PipelineError> {
        self.insert_column(name, Column::Numeric(values))
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Column> {
        let position = self.index.remove(name)?;
        self.names.remove(position);
        let column = self.columns.remove(position);
        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Some(column)
    }

    /// Новая панель из выбранных строк в заданном порядке
    pub fn take(&self, indices: &[usize]) -> Panel {
        Panel {
            merchant_ids: indices.iter().map(|&i| self.merchant_ids[i].clone()).collect(),
            periods: indices.iter().map(|&i| self.periods[i].clone()).collect(),
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
            index: self.index.clone(),
        }
    }

    /// Копия, отсортированная по (мерчант, период); сортировка стабильная
    pub fn sorted_by_merchant_period(&self) -> Panel {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| {
            self.merchant_ids[a]
                .cmp(&self.merchant_ids[b])
                .then_with(|| self.periods[a].cmp(&self.periods[b]))
        });
        self.take(&order)
    }

    pub fn is_sorted_by_merchant_period(&self) -> bool {
        (1..self.len()).all(|i| {
            (&self.merchant_ids[i - 1], &self.periods[i - 1]) <= (&self.merchant_ids[i], &self.periods[i])
        })
    }

    /// Непрерывные диапазоны строк одного мерчанта. Требует отсортированной панели.
    pub fn merchant_partitions(&self) -> Vec<Range<usize>> {
        let mut partitions = Vec::new();
        let mut start = 0;
        for i in 1..=self.len() {
            if i == self.len() || self.merchant_ids[i] != self.merchant_ids[start] {
                if i > start {
                    partitions.push(start..i);
                }
                start = i;
            }
        }
        partitions
    }

    /// Индексы строк по каждому периоду (срез по всем мерчантам)
    pub fn period_groups(&self) -> BTreeMap<&str, Vec<usize>> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, period) in self.periods.iter().enumerate() {
            groups.entry(period.as_str()).or_default().push(i);
        }
        groups
    }

    /// Первая повторяющаяся пара (мерчант, период), если есть
    pub fn find_duplicate_key(&self) -> Option<(String, String)> {
        let mut seen = std::collections::HashSet::with_capacity(self.len());
        self.merchant_ids
            .iter()
            .zip(self.periods.iter())
            .find(|key| !seen.insert(*key))
            .map(|(m, p)| (m.clone(), p.clone()))
    }

    pub fn merchant_count(&self) -> usize {
        self.merchant_ids.iter().collect::<std::collections::HashSet<_>>().len()
    }

    /// Строки панели в виде JSON-записей (ключевые колонки под указанными именами)
    pub fn to_records(&self, merchant_column: &str, period_column: &str) -> Vec<serde_json::Map<String, serde_json::Value>> {
        (0..self.len())
            .map(|row| {
                let mut record = serde_json::Map::new();
                record.insert(merchant_column.to_string(), self.merchant_ids[row].clone().into());
                record.insert(period_column.to_string(), self.periods[row].clone().into());
                for (name, column) in self.columns() {
                    let value = match column {
                        Column::Numeric(values) => values[row]
                            .and_then(serde_json::Number::from_f64)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null),
                        Column::Text(values) => values[row]
                            .clone()
                            .map(serde_json::Value::String)
                            .unwrap_or(serde_json::Value::Null),
                    };
                    record.insert(name.to_string(), value);
                }
                record
            })
            .collect()
    }

    /// Сборка панели из сырых записей
    pub fn from_records(
        records: &[RawRecord],
        merchant_column: &str,
        period_column: &str,
    ) -> Result<Panel, PipelineError> {
        let mut merchant_ids = Vec::with_capacity(records.len());
        let mut periods = Vec::with_capacity(records.len());
        for record in records {
            let merchant = record
                .get(merchant_column)
                .and_then(value_as_key)
                .ok_or_else(|| PipelineError::MissingKeyColumn(merchant_column.to_string()))?;
            let period = record
                .get(period_column)
                .and_then(value_as_key)
                .ok_or_else(|| PipelineError::MissingKeyColumn(period_column.to_string()))?;
            merchant_ids.push(merchant);
            periods.push(period);
        }

        let mut panel = Panel::new(merchant_ids, periods)?;
        for (name, column) in records_to_columns(records, &[merchant_column, period_column]) {
            panel.insert_column(name, column)?;
        }

        Ok(panel)
    }
}

/// Колонки из сырых записей в порядке первого появления.
/// Колонка числовая, если все непустые значения числовые.
pub fn records_to_columns(records: &[RawRecord], skip: &[&str]) -> Vec<(String, Column)> {
    let mut names: Vec<&String> = Vec::new();
    for record in records {
        for name in record.keys() {
            if !skip.contains(&name.as_str()) && !names.contains(&name) {
                names.push(name);
            }
        }
    }

    names
        .into_iter()
        .map(|name| {
            let cells: Vec<Option<&serde_json::Value>> = records
                .iter()
                .map(|r| r.get(name).filter(|v| !is_blank(v)))
                .collect();
            let all_numeric = cells.iter().flatten().all(|v| v.is_number());
            let column = if all_numeric {
                Column::Numeric(cells.iter().map(|c| c.and_then(|v| v.as_f64())).collect())
            } else {
                Column::Text(cells.iter().map(|c| c.map(value_to_string)).collect())
            };
            (name.clone(), column)
        })
        .collect()
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

pub(crate) fn value_as_key(value: &serde_json::Value) -> Option<String> {
    if is_blank(value) {
        None
    } else {
        Some(value_to_string(value))
    }
}

/// Итог этапа: что создано, что пропущено и о чём стоит предупредить
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub created: Vec<String>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
}

impl StageReport {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }

    pub fn created(&mut self, column: impl Into<String>) {
        self.created.push(column.into());
    }

    pub fn skip(&mut self, column: impl Into<String>, reason: impl fmt::Display) {
        let column = column.into();
        self.warnings.push(format!("{column}: {reason}"));
        self.skipped.push(column);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: StageReport) {
        self.created.extend(other.created);
        self.skipped.extend(other.skipped);
        self.warnings.extend(other.warnings);
    }

    pub fn log(&self) {
        tracing::info!(
            "[{}] created {} columns, skipped {}",
            self.stage,
            self.created.len(),
            self.skipped.len()
        );
        for warning in &self.warnings {
            tracing::warn!("[{}] {}", self.stage, warning);
        }
    }
}

/// Панель после этапа вместе с его отчётом
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub panel: Panel,
    pub report: StageReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, serde_json::Value)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn year_month_parsing() {
        assert_eq!(YearMonth::parse("202401"), YearMonth::new(2024, 1));
        assert_eq!(YearMonth::parse("202401.0"), YearMonth::new(2024, 1));
        assert_eq!(YearMonth::parse("202413"), None);
        assert_eq!(YearMonth::parse("2024-01"), None);
        assert_eq!(YearMonth::parse_date("2024-03-15"), YearMonth::new(2024, 3));
        assert_eq!(YearMonth::parse_date("20240315.0"), YearMonth::new(2024, 3));
        assert_eq!(YearMonth::parse_date("not a date"), None);
    }

    #[test]
    fn months_between_crosses_year_boundary() {
        let start = YearMonth::new(2023, 11).unwrap();
        let end = YearMonth::new(2024, 2).unwrap();
        assert_eq!(start.months_until(&end), 3);
        assert_eq!(end.months_until(&start), -3);
    }

    #[test]
    fn from_records_infers_column_kinds() {
        let records = vec![
            record(&[("ENCODED_MCT", json!("A")), ("TA_YM", json!(202401)), ("SALES", json!(10.0)), ("TIER", json!("1_10%이하"))]),
            record(&[("ENCODED_MCT", json!("B")), ("TA_YM", json!(202401)), ("SALES", json!(null)), ("TIER", json!(3))]),
        ];
        let panel = Panel::from_records(&records, "ENCODED_MCT", "TA_YM").unwrap();
        assert_eq!(panel.len(), 2);
        assert_eq!(panel.periods()[0], "202401");
        assert_eq!(panel.numeric("SALES").unwrap(), &[Some(10.0), None]);
        assert_eq!(panel.text("TIER").unwrap()[1].as_deref(), Some("3"));
    }

    #[test]
    fn sorting_and_partitions() {
        let mut panel = Panel::new(
            vec!["B".into(), "A".into(), "B".into(), "A".into()],
            vec!["202402".into(), "202402".into(), "202401".into(), "202401".into()],
        )
        .unwrap();
        panel
            .insert_numeric("x", vec![Some(4.0), Some(2.0), Some(3.0), Some(1.0)])
            .unwrap();
        assert!(!panel.is_sorted_by_merchant_period());

        let sorted = panel.sorted_by_merchant_period();
        assert!(sorted.is_sorted_by_merchant_period());
        assert_eq!(sorted.numeric("x").unwrap(), &[Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
        assert_eq!(sorted.merchant_partitions(), vec![0..2, 2..4]);
        // исходная панель не изменилась
        assert_eq!(panel.numeric("x").unwrap()[0], Some(4.0));
    }

    #[test]
    fn insert_rejects_wrong_length_and_drop_reindexes() {
        let mut panel = Panel::new(vec!["A".into()], vec!["202401".into()]).unwrap();
        assert!(panel.insert_numeric("bad", vec![]).is_err());
        panel.insert_numeric("a", vec![Some(1.0)]).unwrap();
        panel.insert_numeric("b", vec![Some(2.0)]).unwrap();
        assert!(panel.drop_column("a").is_some());
        assert_eq!(panel.numeric("b").unwrap(), &[Some(2.0)]);
        assert_eq!(panel.column_names(), &["b".to_string()]);
    }

    #[test]
    fn duplicate_keys_are_detected() {
        let panel = Panel::new(
            vec!["A".into(), "A".into()],
            vec!["202401".into(), "202401".into()],
        )
        .unwrap();
        assert_eq!(panel.find_duplicate_key(), Some(("A".into(), "202401".into())));
    }
}
