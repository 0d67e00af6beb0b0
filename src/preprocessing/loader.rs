//! Загрузка трёх датасетов и сборка панели (мерчант, месяц)

use std::collections::HashMap;
use std::path::Path;

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};

use crate::config::KeyColumns;
use crate::error::PipelineError;
use crate::types::{records_to_columns, value_as_key, Column, Panel, RawRecord, RawTables, StageReport};

const SALES_SUFFIX: &str = "_sales";
const CUSTOMER_SUFFIX: &str = "_customer";
const INFO_SUFFIX: &str = "_info";

/// Потери и пропуски при объединении
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeSummary {
    pub sales_rows: usize,
    pub customer_rows: usize,
    pub merged_rows: usize,
    /// Доля строк продаж без пары в клиентских данных, %
    pub merge_loss_pct: f64,
    pub merchants: usize,
    pub merchants_without_info: usize,
    pub null_cells: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutput {
    pub panel: Panel,
    pub summary: MergeSummary,
    pub report: StageReport,
}

/// Чтение CSV в сырые записи. Числа становятся числами, пустые ячейки становятся null.
/// Колонки из `text_columns` (ключи) всегда читаются как строки.
pub fn read_csv(path: &Path, text_columns: &[&str]) -> Result<Vec<RawRecord>, PipelineError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(name, raw)| (name.to_string(), parse_cell(raw, text_columns.contains(&name))))
            .collect();
        records.push(record);
    }
    tracing::info!("Loaded {} rows from {}", records.len(), path.display());
    Ok(records)
}

fn parse_cell(raw: &str, keep_text: bool) -> serde_json::Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return serde_json::Value::Null;
    }
    if !keep_text {
        if let Some(number) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return serde_json::Value::Number(number);
        }
    }
    serde_json::Value::String(raw.to_string())
}

/// Запись панели в CSV: ключи, затем колонки в порядке добавления
pub fn write_csv(panel: &Panel, path: &Path, keys: &KeyColumns) -> Result<(), PipelineError> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec![keys.merchant.as_str(), keys.period.as_str()];
    header.extend(panel.column_names().iter().map(String::as_str));
    writer.write_record(&header)?;

    let columns: Vec<&Column> = panel.columns().map(|(_, c)| c).collect();
    for row in 0..panel.len() {
        let mut record = vec![panel.merchant_ids()[row].clone(), panel.periods()[row].clone()];
        record.extend(columns.iter().map(|c| c.cell_as_string(row).unwrap_or_default()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    tracing::info!("Wrote {} rows x {} columns to {}", panel.len(), panel.width() + 2, path.display());
    Ok(())
}

pub struct DataLoader {
    keys: KeyColumns,
}

impl DataLoader {
    pub fn new(keys: KeyColumns) -> Self {
        Self { keys }
    }

    /// Чтение трёх CSV-файлов: мерчанты, продажи, клиенты
    pub fn load_csv(&self, merchants: &Path, sales: &Path, customers: &Path) -> Result<RawTables, PipelineError> {
        let keys = [self.keys.merchant.as_str(), self.keys.period.as_str(), self.keys.closure_date.as_str()];
        Ok(RawTables {
            merchants: read_csv(merchants, &keys)?,
            monthly_sales: read_csv(sales, &keys)?,
            monthly_customers: read_csv(customers, &keys)?,
        })
    }

    /// Продажи ⋈ клиенты по (мерчант, месяц), затем левое присоединение информации о мерчанте.
    /// Совпадающие имена колонок получают суффиксы `_sales`/`_customer`, у информации `_info`.
    pub fn merge(&self, tables: &RawTables) -> Result<MergeOutput, PipelineError> {
        let mut report = StageReport::new("merge");
        let merchant_col = self.keys.merchant.as_str();
        let period_col = self.keys.period.as_str();

        let sales = Panel::from_records(&tables.monthly_sales, merchant_col, period_col)?;
        let customers = Panel::from_records(&tables.monthly_customers, merchant_col, period_col)?;

        let customer_index: HashMap<(&str, &str), usize> = (0..customers.len())
            .map(|row| {
                (
                    (customers.merchant_ids()[row].as_str(), customers.periods()[row].as_str()),
                    row,
                )
            })
            .collect();
        if customer_index.len() < customers.len() {
            report.warn(format!(
                "{} duplicate (merchant, month) keys in customer data, last one kept",
                customers.len() - customer_index.len()
            ));
        }

        let (sales_rows, customer_rows): (Vec<usize>, Vec<usize>) = (0..sales.len())
            .filter_map(|row| {
                let key = (sales.merchant_ids()[row].as_str(), sales.periods()[row].as_str());
                customer_index.get(&key).map(|&c| (row, c))
            })
            .unzip();

        let sales_part = sales.take(&sales_rows);
        let customer_part = customers.take(&customer_rows);
        let mut panel = Panel::new(
            sales_part.merchant_ids().to_vec(),
            sales_part.periods().to_vec(),
        )?;

        for (name, column) in sales_part.columns() {
            let name = if customer_part.has_column(name) {
                format!("{name}{SALES_SUFFIX}")
            } else {
                name.to_string()
            };
            panel.insert_column(name, column.clone())?;
        }
        for (name, column) in customer_part.columns() {
            let name = if sales_part.has_column(name) {
                format!("{name}{CUSTOMER_SUFFIX}")
            } else {
                name.to_string()
            };
            panel.insert_column(name, column.clone())?;
        }

        if let Some((merchant, period)) = panel.find_duplicate_key() {
            return Err(PipelineError::DuplicateKey { merchant, period });
        }

        let merchants_without_info = self.attach_merchant_info(&mut panel, &tables.merchants, &mut report)?;

        let merge_loss_pct = if sales.is_empty() {
            0.0
        } else {
            (sales.len() - panel.len()) as f64 / sales.len() as f64 * 100.0
        };
        let summary = MergeSummary {
            sales_rows: sales.len(),
            customer_rows: customers.len(),
            merged_rows: panel.len(),
            merge_loss_pct,
            merchants: panel.merchant_count(),
            merchants_without_info,
            null_cells: panel.columns().map(|(_, c)| c.null_count()).sum(),
        };

        tracing::info!(
            "Merged panel: {} rows ({} merchants), merge loss {:.2}%",
            summary.merged_rows,
            summary.merchants,
            summary.merge_loss_pct
        );
        if summary.null_cells > 0 {
            tracing::debug!("{} null cells after merge", summary.null_cells);
        }

        Ok(MergeOutput {
            panel,
            summary,
            report,
        })
    }

    /// Левое присоединение: строки без информации получают пропуски
    fn attach_merchant_info(
        &self,
        panel: &mut Panel,
        merchants: &[RawRecord],
        report: &mut StageReport,
    ) -> Result<usize, PipelineError> {
        let merchant_col = self.keys.merchant.as_str();

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<RawRecord> = Vec::new();
        let mut duplicates = 0usize;
        for record in merchants {
            let Some(id) = record.get(merchant_col).and_then(value_as_key) else {
                report.warn(format!("merchant record without '{merchant_col}' ignored"));
                continue;
            };
            if index.contains_key(&id) {
                duplicates += 1;
                continue;
            }
            index.insert(id, unique.len());
            unique.push(record.clone());
        }
        if duplicates > 0 {
            report.warn(format!("{duplicates} duplicate merchant records, first one kept"));
        }

        let rows: Vec<Option<usize>> = panel
            .merchant_ids()
            .iter()
            .map(|id| index.get(id).copied())
            .collect();
        let missing: std::collections::HashSet<&str> = panel
            .merchant_ids()
            .iter()
            .zip(rows.iter())
            .filter(|(_, r)| r.is_none())
            .map(|(id, _)| id.as_str())
            .collect();
        let merchants_without_info = missing.len();
        if merchants_without_info > 0 {
            report.warn(format!("{merchants_without_info} merchants have no info record"));
        }

        for (name, column) in records_to_columns(&unique, &[merchant_col]) {
            let name = if panel.has_column(&name) {
                format!("{name}{INFO_SUFFIX}")
            } else {
                name
            };
            let expanded = match column {
                Column::Numeric(values) => Column::Numeric(rows.iter().map(|r| r.and_then(|i| values[i])).collect()),
                Column::Text(values) => {
                    Column::Text(rows.iter().map(|r| r.and_then(|i| values[i].clone())).collect())
                }
            };
            panel.insert_column(name, expanded)?;
        }
        Ok(merchants_without_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, serde_json::Value)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn tables() -> RawTables {
        RawTables {
            merchants: vec![
                record(&[("ENCODED_MCT", json!("A")), ("MCT_ME_D", json!(20240315)), ("HPSN_MCT_ZCD_NM", json!("카페"))]),
                record(&[("ENCODED_MCT", json!("B")), ("MCT_ME_D", json!(null)), ("HPSN_MCT_ZCD_NM", json!("한식"))]),
            ],
            monthly_sales: vec![
                record(&[("ENCODED_MCT", json!("A")), ("TA_YM", json!(202401)), ("RC_M1_SAA", json!("1_10%이하")), ("FLAG", json!(1))]),
                record(&[("ENCODED_MCT", json!("B")), ("TA_YM", json!(202401)), ("RC_M1_SAA", json!("2_10-25%")), ("FLAG", json!(0))]),
                record(&[("ENCODED_MCT", json!("C")), ("TA_YM", json!(202401)), ("RC_M1_SAA", json!("3_25-50%")), ("FLAG", json!(0))]),
                record(&[("ENCODED_MCT", json!("A")), ("TA_YM", json!(202402)), ("RC_M1_SAA", json!("2_10-25%")), ("FLAG", json!(1))]),
            ],
            monthly_customers: vec![
                record(&[("ENCODED_MCT", json!("A")), ("TA_YM", json!(202401)), ("MCT_UE_CLN_REU_RAT", json!(30.0)), ("FLAG", json!(5))]),
                record(&[("ENCODED_MCT", json!("A")), ("TA_YM", json!(202402)), ("MCT_UE_CLN_REU_RAT", json!(25.0)), ("FLAG", json!(6))]),
                record(&[("ENCODED_MCT", json!("B")), ("TA_YM", json!(202401)), ("MCT_UE_CLN_REU_RAT", json!(40.0)), ("FLAG", json!(7))]),
            ],
        }
    }

    #[test]
    fn inner_then_left_join() {
        let output = DataLoader::new(KeyColumns::default()).merge(&tables()).unwrap();
        let panel = &output.panel;

        assert_eq!(panel.len(), 3);
        assert_eq!(output.summary.sales_rows, 4);
        assert!((output.summary.merge_loss_pct - 25.0).abs() < 1e-9);
        assert!(panel.has_column("FLAG_sales"));
        assert!(panel.has_column("FLAG_customer"));
        assert!(!panel.has_column("FLAG"));
        assert_eq!(panel.numeric("MCT_ME_D").unwrap(), &[Some(20240315.0), None, Some(20240315.0)]);
        assert_eq!(panel.text("HPSN_MCT_ZCD_NM").unwrap()[1].as_deref(), Some("한식"));
        assert_eq!(output.summary.merchants, 2);
    }

    #[test]
    fn duplicate_keys_are_fatal() {
        let mut tables = tables();
        tables.monthly_sales.push(tables.monthly_sales[0].clone());
        let result = DataLoader::new(KeyColumns::default()).merge(&tables);
        assert!(matches!(result, Err(PipelineError::DuplicateKey { .. })));
    }

    #[test]
    fn merchants_without_info_are_kept() {
        let mut tables = tables();
        tables.merchants.remove(1);
        let output = DataLoader::new(KeyColumns::default()).merge(&tables).unwrap();
        assert_eq!(output.panel.len(), 3);
        assert_eq!(output.summary.merchants_without_info, 1);
        assert_eq!(output.panel.text("HPSN_MCT_ZCD_NM").unwrap()[1], None);
    }

    #[test]
    fn cells_parse_as_numbers_except_keys() {
        assert_eq!(parse_cell("12.5", false), json!(12.5));
        assert_eq!(parse_cell("000123", true), json!("000123"));
        assert_eq!(parse_cell(" ", false), serde_json::Value::Null);
        assert_eq!(parse_cell("1_10%이하", false), json!("1_10%이하"));
    }
}
