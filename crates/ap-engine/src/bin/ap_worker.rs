use anyhow::Context;
use ap_engine::{
    BatchWorker, BudgetSettings, SweepSettings, WorkerReport, ERROR_EXIT_CODE, SETTINGS_ENV,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

/// Evaluate the configs of one batch directory.
#[derive(Parser, Debug)]
#[command(name = "ap-worker")]
struct Cli {
    /// Sweep settings JSON.
    #[arg(long, env = SETTINGS_ENV)]
    settings: PathBuf,

    /// A `job_<i>_of_<n>` directory containing `todo.csv`.
    batch_dir: PathBuf,

    /// Wall-clock seconds this process may run, overriding the settings.
    #[arg(long)]
    time_budget: Option<f64>,
}

async fn run(cli: Cli) -> anyhow::Result<WorkerReport> {
    let settings = SweepSettings::load(&cli.settings)
        .with_context(|| format!("loading {}", cli.settings.display()))?;
    let budget = match cli.time_budget {
        Some(seconds) => Some(BudgetSettings {
            seconds,
            reserve_seconds: settings.budget.map_or(60.0, |b| b.reserve_seconds),
        }),
        None => settings.budget,
    };

    let evaluator = settings.evaluator.build(&settings.sweep)?;
    let mut worker = BatchWorker::new(settings.sweep.clone(), &cli.batch_dir, evaluator)
        .with_preemption(BudgetSettings::signal(budget.as_ref()));
    let report = worker
        .run()
        .await
        .with_context(|| format!("running {}", cli.batch_dir.display()))?;
    Ok(report)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    ap_engine::init_logging();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(report) => {
            info!("{:?}", report);
            report.exit_code()
        }
        Err(e) => {
            error!("Worker failed: {:#}", e);
            ERROR_EXIT_CODE
        }
    };
    std::process::exit(code);
}
