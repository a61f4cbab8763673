use anyhow::Context;
use ap_engine::{SearchOutcome, SearchSettings, ERROR_EXIT_CODE, SETTINGS_ENV};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

/// Run (or resume) one optimizer search over a program's runtime knobs.
#[derive(Parser, Debug)]
#[command(name = "ap-search")]
struct Cli {
    /// Search settings JSON.
    #[arg(long, env = SETTINGS_ENV)]
    settings: PathBuf,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    max_steps: Option<usize>,

    /// Overrides the ledger directory from the settings file.
    #[arg(long)]
    ledger_dir: Option<PathBuf>,
}

async fn run(cli: Cli) -> anyhow::Result<SearchOutcome> {
    let mut settings = SearchSettings::load(&cli.settings)
        .with_context(|| format!("loading {}", cli.settings.display()))?;
    if let Some(seed) = cli.seed {
        settings = settings.with_seed(seed);
    }
    if let Some(max_steps) = cli.max_steps {
        settings = settings.with_max_steps(max_steps);
    }
    if let Some(dir) = cli.ledger_dir {
        settings = settings.with_ledger_dir(dir);
    }

    info!(
        "{} {} with {} (seed {}, {} steps)",
        settings.program,
        settings.problem_size,
        settings.optimizer.tag(),
        settings.seed,
        settings.max_steps
    );
    let mut search = settings.build()?;
    let outcome = search.run().await?;

    if let Some(best) = search.ledger().best_n(1).first() {
        info!("Best so far: {} at {:.4}s", best.config, best.time);
    }
    Ok(outcome)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    ap_engine::init_logging();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(outcome) => {
            info!("{:?}", outcome);
            outcome.exit_code()
        }
        Err(e) => {
            error!("Search failed: {:#}", e);
            ERROR_EXIT_CODE
        }
    };
    std::process::exit(code);
}
