use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use skeleton_trainer::config::{Phase, RunConfig};
use skeleton_trainer::metrics::sink::{log_dir, MetricsChannels};
use skeleton_trainer::train::controller::TrainingController;

/// Train or evaluate a skeleton action-recognition classifier.
#[derive(Debug, Parser)]
#[command(name = "skeleton-trainer", version, about)]
struct Cli {
    /// TOML run configuration; command-line values override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    work_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    phase: Option<Phase>,
    #[arg(long)]
    weights: Option<PathBuf>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    stream: Option<String>,
    #[arg(long)]
    num_classes: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    num_epoch: Option<usize>,
    #[arg(long)]
    start_epoch: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    forward_batch_size: Option<usize>,
    #[arg(long)]
    test_batch_size: Option<usize>,
    #[arg(long)]
    base_lr: Option<f64>,
    #[arg(long)]
    num_worker: Option<usize>,
    #[arg(long)]
    early_stopping: Option<usize>,
    /// Evaluate every configured TTA view instead of only the first.
    #[arg(long)]
    use_tta: bool,
    /// Write fused scores after each evaluation.
    #[arg(long)]
    save_score: bool,
    /// Truncate the training data and mute validation metrics.
    #[arg(long)]
    debug: bool,
    #[arg(long)]
    no_progress: bool,
    /// Remove an existing metrics directory without asking.
    #[arg(long, short = 'y')]
    assume_yes: bool,
}

impl Cli {
    fn apply(self, cfg: &mut RunConfig) {
        macro_rules! set {
            ($cli:ident => $cfg:ident: $($field:ident),*) => {
                $(if let Some(value) = $cli.$field { $cfg.$field = value; })*
            };
        }
        let cli = self;
        set!(cli => cfg: work_dir, phase, dataset, stream, num_classes, seed, num_epoch, start_epoch,
             batch_size, forward_batch_size, test_batch_size, base_lr, num_worker, early_stopping);
        if cli.weights.is_some() {
            cfg.weights = cli.weights;
        }
        if cli.checkpoint.is_some() {
            cfg.checkpoint = cli.checkpoint;
        }
        cfg.use_tta |= cli.use_tta;
        cfg.save_score |= cli.save_score;
        cfg.debug |= cli.debug;
        if cli.no_progress {
            cfg.show_progress = false;
        }
    }
}

fn init_logging(work_dir: &Path, to_file: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = if to_file {
        std::fs::create_dir_all(work_dir)
            .with_context(|| format!("cannot create work dir {}", work_dir.display()))?;
        let appender = tracing_appender::rolling::never(work_dir, "log.txt");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Asks before deleting a previous run's metrics.
fn clear_metrics_dir(work_dir: &Path, assume_yes: bool) -> anyhow::Result<()> {
    let dir = log_dir(work_dir);
    if !dir.exists() {
        return Ok(());
    }
    if !assume_yes {
        print!("log_dir {} already exists. Delete it? [y/N] ", dir.display());
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            bail!("refusing to overwrite {}", dir.display());
        }
    }
    std::fs::remove_dir_all(&dir).with_context(|| format!("cannot remove {}", dir.display()))?;
    println!("Dir removed: {}", dir.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let assume_yes = cli.assume_yes;

    let mut cfg = match &cli.config {
        Some(path) => RunConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => RunConfig::default(),
    };
    cli.apply(&mut cfg);
    let cfg = cfg.resolve();
    cfg.validate().context("invalid configuration")?;

    let _guard = init_logging(&cfg.work_dir, cfg.print_log)?;

    let metrics = match cfg.phase {
        Phase::Train => {
            clear_metrics_dir(&cfg.work_dir, assume_yes)?;
            MetricsChannels::open(&cfg.work_dir, cfg.debug)?
        }
        Phase::Test => MetricsChannels::null(),
    };
    let saved = cfg.save().context("saving resolved configuration")?;
    tracing::info!("configuration written to {}", saved.display());

    let mut controller = TrainingController::from_config(cfg, metrics).context("initializing run")?;
    let summary = controller.run()?;
    tracing::info!(reason = ?summary.reason, epochs = summary.epochs_run, "run finished");
    Ok(())
}
