//! 计费流水线命令行
//!
//! 对 JSON 格式的计费表执行单个步骤或全部四个步骤，也可把规则文本转换为规则集 JSON。

use anyhow::{Context, Result, bail};
use billing_shared::config::AppConfig;
use billing_shared::observability;
use clap::{Parser, Subcommand};
use rule_engine::pipeline::{StageReport, variables_from_config};
use rule_engine::{
    BillingPipeline, RuleSet, RuleSetStore, RuleTextConverter, Stage, StageContext, Table,
    run_stage,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const SERVICE_NAME: &str = "billing-pipeline";

/// Society billing rule pipeline.
#[derive(Parser)]
#[command(name = "billing-pipeline", version, about = "Society billing rule pipeline")]
struct Cli {
    /// Print the Prometheus metrics snapshot after the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single stage on a table
    Run {
        /// Stage number (1-4)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
        stage: u8,
        /// Input table (JSON array of rows)
        #[arg(long)]
        input: PathBuf,
        /// Rule set JSON (optional for stage 4)
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Output file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
        /// Log which conditional branch each row took
        #[arg(long)]
        trace: bool,
    },

    /// Run all four stages with rule sets loaded from a directory
    RunAll {
        /// Input table (JSON array of rows)
        #[arg(long)]
        input: PathBuf,
        /// Directory of rule set JSON files; defaults to pipeline.rules_dir
        #[arg(long)]
        rules_dir: Option<PathBuf>,
        /// Output file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Convert line-oriented rule text into rule set JSON
    Convert {
        /// Rule text file
        #[arg(long)]
        input: PathBuf,
        /// Output file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
        /// Stage number recorded in the rule set metadata
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
        step: Option<u8>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let mut obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    // 生产环境日志统一为 JSON
    if config.is_production() {
        obs_config.log_format = "json".to_string();
    }
    let guard = observability::init(&obs_config)?;

    let result = match cli.command {
        Commands::Run {
            stage,
            input,
            rules,
            output,
            trace,
        } => run_single(
            &config,
            stage,
            &input,
            rules.as_deref(),
            output.as_deref(),
            trace,
        ),
        Commands::RunAll {
            input,
            rules_dir,
            output,
        } => run_all(&config, &input, rules_dir.as_deref(), output.as_deref()),
        Commands::Convert {
            input,
            output,
            step,
        } => convert(&input, output.as_deref(), step),
    };

    if cli.print_metrics {
        match guard.render_metrics() {
            Some(snapshot) => println!("{}", snapshot),
            None => warn!("Metrics are disabled; nothing to print"),
        }
    }

    result
}

fn run_single(
    config: &AppConfig,
    stage: u8,
    input: &Path,
    rules: Option<&Path>,
    output: Option<&Path>,
    trace: bool,
) -> Result<()> {
    let stage = Stage::from_number(stage).with_context(|| format!("invalid stage {}", stage))?;
    let table = read_table(input)?;

    let rule_set = match rules {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read rules {}", path.display()))?;
            Some(RuleSet::from_json(&json).with_context(|| format!("invalid rules {}", path.display()))?)
        }
        None => None,
    };

    let mut ctx = StageContext::new(chrono::Local::now().date_naive())
        .with_variables(variables_from_config(&config.pipeline)?)
        .with_due_days(config.pipeline.due_days);
    if trace {
        ctx = ctx.with_trace();
    }

    let report = run_stage(stage, &table, rule_set.as_ref(), &ctx)?;
    log_report(&report);

    write_json(output, &report.table.to_json_value())
}

fn run_all(
    config: &AppConfig,
    input: &Path,
    rules_dir: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let rules_dir = rules_dir.unwrap_or(config.pipeline.rules_dir.as_path());

    let store = Arc::new(RuleSetStore::new());
    let loaded = store
        .load_dir(rules_dir)
        .with_context(|| format!("failed to read rules directory {}", rules_dir.display()))?;
    info!(stages = ?loaded, "Rule sets loaded");

    let mut pipeline = BillingPipeline::from_config(&config.pipeline)?.with_rule_store(store);
    pipeline.load_table(read_table(input)?);

    for stage in Stage::ALL {
        let report = pipeline.run_with_store(stage)?;
        log_report(&report);
    }

    let Some(table) = pipeline.output(Stage::Finalize) else {
        bail!("pipeline finished without a final table");
    };
    write_json(output, &table.to_json_value())
}

fn convert(input: &Path, output: Option<&Path>, step: Option<u8>) -> Result<()> {
    let text = fs::read_to_string(input)
        .with_context(|| format!("failed to read rule text {}", input.display()))?;

    let name = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "converted".to_string());

    let mut converter = RuleTextConverter::new(name)
        .with_description(format!("Converted from {}", input.display()));
    if let Some(step) = step {
        converter = converter.with_step(step);
    }

    let report = converter.convert(&text);
    for skipped in &report.skipped {
        warn!(line = skipped.line, "Skipped line: {}", skipped.text);
    }
    for suppressed in &report.suppressed {
        warn!(line = suppressed.line, field = %suppressed.field, "{}", suppressed.reason);
    }

    write_json(output, &serde_json::to_value(&report.rule_set)?)
}

fn read_table(path: &Path) -> Result<Table> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read table {}", path.display()))?;
    Table::from_json_str(&json).with_context(|| format!("invalid table {}", path.display()))
}

fn write_json(output: Option<&Path>, value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Output written");
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn log_report(report: &StageReport) {
    info!(
        step = report.stage.number(),
        rows = report.table.len(),
        rules = report.rules_applied,
        failed_rows = report.failed_rows.len(),
        diagnostics = report.diagnostics.len(),
        validation_issues = report.validation.len(),
        "Stage finished"
    );
    for diagnostic in &report.diagnostics {
        info!("{}", diagnostic);
    }
    for line in &report.trace {
        info!(step = report.stage.number(), "{}", line);
    }
    if report.has_errors() {
        warn!(step = report.stage.number(), "Stage finished with validation errors");
    }
}
