use anyhow::Context;
use ap_engine::{SweepSettings, ERROR_EXIT_CODE, FINISHED_EXIT_CODE, SETTINGS_ENV};
use ap_queue::{collect_completions, write_batches, JobQueueReconciler};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

/// Compare a sweep against its completion files and write the outstanding
/// work as batch task files.
///
/// Exits with the finished code once nothing remains.
#[derive(Parser, Debug)]
#[command(name = "ap-reconcile")]
struct Cli {
    /// Sweep settings JSON.
    #[arg(long, env = SETTINGS_ENV)]
    settings: PathBuf,

    /// Name of the directory this pass writes its batches under.
    #[arg(long)]
    label: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Sampling plan CSV; overrides the one in the settings file.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Print the plan without writing batch files.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut settings = SweepSettings::load(&cli.settings)
        .with_context(|| format!("loading {}", cli.settings.display()))?;
    if let Some(batch_size) = cli.batch_size {
        settings = settings.with_batch_size(batch_size);
    }
    if let Some(plan) = cli.plan {
        settings = settings.with_plan(plan);
    }

    let required = settings.required()?;
    let completions = collect_completions(&settings.sweep_dir, &settings.sweep)?;
    let mut reconciler = JobQueueReconciler::new(settings.sweep.clone(), settings.batch_size)?;
    if let Some(timeout) = settings.timeout_value() {
        reconciler = reconciler.with_timeout_value(timeout);
    }
    let reconciliation = reconciler.reconcile(&required, &completions)?;

    if reconciliation.is_finished() {
        info!("All {} configs are complete", reconciliation.required);
        return Ok(FINISHED_EXIT_CODE);
    }
    if cli.dry_run {
        for batch in &reconciliation.batches {
            info!("{}: {} configs", batch.dir_name(), batch.configs.len());
        }
        return Ok(0);
    }

    let dirs = write_batches(
        &settings.sweep_dir,
        &settings.sweep,
        &reconciliation,
        cli.label.as_deref(),
    )?;
    for dir in dirs {
        println!("{}", dir.display());
    }
    Ok(0)
}

fn main() {
    ap_engine::init_logging();
    let cli = Cli::parse();

    let code = run(cli).unwrap_or_else(|e| {
        error!("Reconciliation failed: {:#}", e);
        ERROR_EXIT_CODE
    });
    std::process::exit(code);
}
