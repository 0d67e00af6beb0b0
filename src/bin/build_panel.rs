/// Сборка панели признаков из трёх CSV и, по желанию, обучение модели риска

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use closure_risk::preprocessing::loader::write_csv;
use closure_risk::{DataLoader, FeaturePipeline, ModelEnsemble, PipelineConfig, RiskScorer};

#[derive(Parser, Debug)]
#[command(name = "build-panel", version, about = "Merchant panel feature builder")]
struct Cli {
    /// Базовая информация о мерчантах
    #[arg(long)]
    merchants: PathBuf,

    /// Помесячные продажи
    #[arg(long)]
    sales: PathBuf,

    /// Помесячные данные о клиентах
    #[arg(long)]
    customers: PathBuf,

    /// Итоговая панель (CSV)
    #[arg(long, short)]
    output: PathBuf,

    /// JSON-конфигурация; без неё используются значения по умолчанию
    #[arg(long)]
    config: Option<PathBuf>,

    /// Сводка прогона (JSON)
    #[arg(long)]
    summary: Option<PathBuf>,

    /// Обучить ансамбль и сохранить отчёт о риске мерчантов (JSON)
    #[arg(long)]
    risk_output: Option<PathBuf>,

    /// Каталог для сохранения обученных моделей
    #[arg(long, requires = "risk_output", conflicts_with = "load_models")]
    model_dir: Option<PathBuf>,

    /// Оценить риск ранее сохранёнными моделями без обучения
    #[arg(long, requires = "risk_output")]
    load_models: Option<PathBuf>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    tracing::info!("Wrote {}", path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let pipeline = FeaturePipeline::new(config)?;
    let keys = pipeline.config().keys.clone();
    let tables = DataLoader::new(keys.clone())
        .load_csv(&cli.merchants, &cli.sales, &cli.customers)
        .context("failed to read input tables")?;

    let output = pipeline.run(&tables)?;
    write_csv(&output.panel, &cli.output, &keys)?;
    tracing::info!(
        "Panel written to {}: {} rows, {} columns",
        cli.output.display(),
        output.panel.len(),
        output.panel.width()
    );

    if let Some(path) = &cli.summary {
        write_json(path, &output.summary)?;
    }
    if !output.summary.leakage.passed() {
        tracing::warn!("leakage checks failed, model training skipped");
        return Ok(());
    }

    if let (Some(path), Some(dir)) = (&cli.risk_output, &cli.load_models) {
        let scorer = RiskScorer::new(pipeline.config());
        let ensemble = ModelEnsemble::load(dir).with_context(|| format!("failed to load models from {}", dir.display()))?;
        let risk = scorer.score_latest(&output.panel, &ensemble)?;
        write_json(path, &serde_json::json!({ "risk": risk }))?;
        return Ok(());
    }

    if let Some(path) = &cli.risk_output {
        let scorer = RiskScorer::new(pipeline.config());
        let model = scorer.train(&output.panel)?;
        let risk = scorer.score_latest(&output.panel, &model.ensemble)?;
        write_json(
            path,
            &serde_json::json!({
                "model": model.summary,
                "risk": risk,
            }),
        )?;

        if let Some(dir) = &cli.model_dir {
            std::fs::create_dir_all(dir)?;
            model.ensemble.save(dir)?;
            tracing::info!("Models saved to {}", dir.display());
        }
    }
    Ok(())
}
