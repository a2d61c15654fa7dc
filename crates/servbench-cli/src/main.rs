use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use servbench_analysis::{
    load_result_entries, render_analysis_markdown, render_summary_markdown, Configuration,
    GroupedReport, ReportCatalog,
};
use servbench_runner::store::atomic_write_bytes;
use servbench_runner::{
    run_batch, run_session, BatchPlan, CommandSpec, DeviceSlot, ModelSpec, ResultStore, Scenario,
    ServerSettings, SessionConfig, SessionOutcome, Timings, PLAN_TEMPLATE,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "servbench",
    version = "0.3.0",
    about = "Benchmark orchestration for model-inference servers"
)]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark one model on one configuration.
    Run {
        #[arg(long)]
        model_name: String,
        #[arg(long)]
        model_path: String,
        #[arg(long)]
        quantization: Option<String>,
        #[arg(long, default_value_t = 0)]
        gpu: u32,
        #[arg(long, default_value_t = 30000)]
        port: u16,
        #[arg(long, default_value_t = 32)]
        batch_size: u64,
        #[arg(long, default_value_t = 256)]
        input_len: u64,
        #[arg(long, default_value_t = 32)]
        output_len: u64,
        #[arg(long, default_value_t = 3)]
        n_repeats: usize,
        #[arg(long)]
        config_label: Option<String>,
        #[arg(long, default_value = "logs/performance_logs")]
        output_dir: PathBuf,
        /// Server program and leading arguments, whitespace separated.
        #[arg(long)]
        server_cmd: Option<String>,
        /// Workload client program and leading arguments, whitespace separated.
        #[arg(long)]
        workload_cmd: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run every (model, configuration) pair of a plan.
    Batch {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        json: bool,
    },
    /// Validate a plan and list its assignments without running anything.
    Describe {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write a commented template plan.
    Init {
        #[arg(long, default_value = "servbench_plan.yaml")]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Render the Markdown analysis report from result.jsonl.
    Analyze {
        #[arg(long, default_value = "result.jsonl")]
        results: PathBuf,
        #[arg(long, default_value = "benchmark_analysis.md")]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Render the mean ± max-deviation report for the catalog's models.
    Summary {
        #[arg(long, default_value = "result.jsonl")]
        results: PathBuf,
        #[arg(long, default_value = "summary_report.md")]
        out: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Compare the newest saved record of every model.
    View {
        #[arg(long, default_value = "logs/performance_logs")]
        output_dir: PathBuf,
    },
}

/// What a command printed (or wants printed) and how the process should exit.
struct CommandResult {
    payload: Option<Value>,
    success: bool,
}

impl CommandResult {
    fn done() -> Self {
        Self {
            payload: None,
            success: true,
        }
    }

    fn json(payload: Value, success: bool) -> Self {
        Self {
            payload: Some(payload),
            success,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(result) => {
            if let Some(payload) = result.payload.as_ref() {
                emit_json(payload);
            }
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<CommandResult> {
    match command {
        Commands::Run {
            model_name,
            model_path,
            quantization,
            gpu,
            port,
            batch_size,
            input_len,
            output_len,
            n_repeats,
            config_label,
            output_dir,
            server_cmd,
            workload_cmd,
            json,
        } => {
            let config = SessionConfig {
                model: ModelSpec {
                    name: model_name,
                    path: model_path,
                    quantization,
                },
                scenario: Scenario {
                    label: config_label,
                    configuration: Configuration::new(batch_size, input_len, output_len),
                },
                slot: DeviceSlot {
                    resource_unit: gpu,
                    port,
                },
                repeats: n_repeats,
                server: ServerSettings {
                    command: parse_command(server_cmd.as_deref(), CommandSpec::default_server)?,
                    ..ServerSettings::default()
                },
                workload: parse_command(workload_cmd.as_deref(), CommandSpec::default_workload)?,
                timings: Timings::default(),
                output_dir,
            };
            if config.repeats == 0 {
                return Err(anyhow!("--n-repeats must be at least 1"));
            }
            if !config.configuration().is_valid() {
                return Err(anyhow!(
                    "configuration has a zero dimension: {}",
                    config.configuration()
                ));
            }
            let outcome = run_session(&config)?;
            let success = outcome.succeeded();
            if json {
                return Ok(CommandResult::json(
                    json!({
                        "ok": success,
                        "command": "run",
                        "model": config.model.name,
                        "configuration": config.configuration(),
                        "session": outcome.to_json(),
                    }),
                    success,
                ));
            }
            print_session(&config, &outcome);
            Ok(CommandResult {
                payload: None,
                success,
            })
        }
        Commands::Batch {
            plan,
            parallel,
            json,
        } => {
            let loaded = BatchPlan::load(&plan)?;
            let parallel = parallel || loaded.parallel;
            let summary = run_batch(&loaded, parallel, run_session)?;
            let success = summary.succeeded > 0;
            if json {
                let mut payload = summary.to_json();
                payload["ok"] = json!(success);
                payload["command"] = json!("batch");
                payload["parallel"] = json!(parallel);
                return Ok(CommandResult::json(payload, success));
            }
            for report in summary.reports.iter() {
                println!("{}", report.describe());
            }
            println!(
                "sessions succeeded: {}/{}",
                summary.succeeded, summary.attempted
            );
            println!("output_dir: {}", loaded.output_dir.display());
            Ok(CommandResult {
                payload: None,
                success,
            })
        }
        Commands::Describe {
            plan,
            parallel,
            json,
        } => {
            let loaded = BatchPlan::load(&plan)?;
            let parallel = parallel || loaded.parallel;
            loaded.validate(parallel)?;
            let assignments = loaded.assignments(parallel);
            if json {
                let rows: Vec<Value> = assignments
                    .iter()
                    .map(|a| {
                        let config = loaded.session_config(a);
                        json!({
                            "model": a.model.name,
                            "model_path": a.model.path,
                            "quantization": a.model.quantization,
                            "label": a.scenario.label,
                            "configuration": a.scenario.configuration,
                            "resource_unit": a.slot.resource_unit,
                            "port": a.slot.port,
                            "first_run_name": config.run_name(1),
                        })
                    })
                    .collect();
                return Ok(CommandResult::json(
                    json!({
                        "ok": true,
                        "command": "describe",
                        "parallel": parallel,
                        "repeats": loaded.repeats,
                        "output_dir": loaded.output_dir.display().to_string(),
                        "server": loaded.server.command.display(),
                        "workload": loaded.workload.display(),
                        "assignments": rows,
                    }),
                    true,
                ));
            }
            println!("plan: {}", plan.display());
            println!("mode: {}", if parallel { "parallel" } else { "sequential" });
            println!("repeats: {}", loaded.repeats);
            println!("output_dir: {}", loaded.output_dir.display());
            println!("server: {}", loaded.server.command.display());
            println!("workload: {}", loaded.workload.display());
            println!("assignments: {}", assignments.len());
            for (idx, a) in assignments.iter().enumerate() {
                println!(
                    "  {:>3}. {} [{}] unit={} port={}",
                    idx + 1,
                    a.model.name,
                    a.scenario.configuration,
                    a.slot.resource_unit,
                    a.slot.port
                );
            }
            Ok(CommandResult::done())
        }
        Commands::Init { out, force } => {
            write_plan_template(&out, force)?;
            println!("wrote: {}", out.display());
            println!("next: servbench describe --plan {}", out.display());
            Ok(CommandResult::done())
        }
        Commands::Analyze { results, out, json } => {
            let loaded = load_result_entries(&results)?;
            let report = GroupedReport::build(&loaded.entries);
            let markdown = render_analysis_markdown(&report, &results.display().to_string());
            atomic_write_bytes(&out, markdown.as_bytes())?;
            info!(entries = loaded.entries.len(), malformed = loaded.malformed, "analysis written");
            if json {
                return Ok(CommandResult::json(
                    json!({
                        "ok": true,
                        "command": "analyze",
                        "results": results.display().to_string(),
                        "out": out.display().to_string(),
                        "entries": loaded.entries.len(),
                        "malformed": loaded.malformed,
                        "configurations": report.configs.len(),
                    }),
                    true,
                ));
            }
            println!("entries: {}", loaded.entries.len());
            println!("malformed_lines: {}", loaded.malformed);
            println!("configurations: {}", report.configs.len());
            println!("report: {}", out.display());
            Ok(CommandResult::done())
        }
        Commands::Summary {
            results,
            out,
            catalog,
            json,
        } => {
            let catalog = match catalog {
                Some(path) => ReportCatalog::load(&path)?,
                None => ReportCatalog::default(),
            };
            let loaded = load_result_entries(&results)?;
            let summary = render_summary_markdown(&loaded.entries, &catalog);
            atomic_write_bytes(&out, summary.markdown.as_bytes())?;
            if json {
                return Ok(CommandResult::json(
                    json!({
                        "ok": true,
                        "command": "summary",
                        "out": out.display().to_string(),
                        "processed": summary.processed,
                        "malformed": loaded.malformed,
                        "skipped_models": summary.exclusions.skipped_models,
                        "skipped_configs": summary.exclusions.skipped_configs,
                    }),
                    true,
                ));
            }
            println!("processed: {}", summary.processed);
            println!("skipped_models: {}", summary.exclusions.skipped_models);
            println!("skipped_configs: {}", summary.exclusions.skipped_configs);
            println!("report: {}", out.display());
            Ok(CommandResult::done())
        }
        Commands::View { output_dir } => {
            let store = ResultStore::new(&output_dir);
            let records = store.load_latest_records()?;
            if records.is_empty() {
                println!(
                    "no benchmark results under {}",
                    output_dir.join("result_logs").display()
                );
                return Ok(CommandResult::done());
            }
            print!("{}", servbench_runner::render_comparison(&records));
            Ok(CommandResult::done())
        }
    }
}

fn parse_command(raw: Option<&str>, default: fn() -> CommandSpec) -> Result<CommandSpec> {
    match raw {
        Some(text) => {
            let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
            CommandSpec::from_words(&words)
        }
        None => Ok(default()),
    }
}

fn print_session(config: &SessionConfig, outcome: &SessionOutcome) {
    println!("model: {}", config.model.name);
    println!("configuration: {}", config.configuration());
    match outcome {
        SessionOutcome::Completed {
            record,
            paths,
            attempted,
        } => {
            println!("succeeded: {}/{}", record.trials().len(), attempted);
            for (name, stats) in record.aggregate() {
                println!("  {}: {:.2} ± {:.2}", name, stats.mean, stats.std);
            }
            println!("record: {}", paths.record.display());
            println!("summary: {}", paths.summary.display());
        }
        SessionOutcome::StartupFailed(err) => {
            eprintln!("server failed to start: {}", err);
        }
        SessionOutcome::NoSuccessfulTrials { attempted } => {
            eprintln!("no successful trials (0/{})", attempted);
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Batch { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Analyze { json, .. }
        | Commands::Summary { json, .. } => *json,
        Commands::Init { .. } | Commands::View { .. } => false,
    }
}

fn write_plan_template(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            out.display()
        ));
    }
    atomic_write_bytes(out, PLAN_TEMPLATE.as_bytes())
}
