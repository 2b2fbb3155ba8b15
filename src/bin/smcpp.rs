use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ndarray::Array2;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use smcpp_rs::inference::{InferenceManager, RecomputeCounts};
use smcpp_rs::io::obs::read_obs;
use smcpp_rs::io::params::{ModelFile, load_model};
use smcpp_rs::pool::{WorkerPool, default_threads};
use smcpp_rs::{Adouble, progress, sfs};

#[derive(Parser, Debug)]
#[command(name = "smcpp")]
#[command(about = "Concurrent E-step engine for SMC++-style demographic HMMs", long_about = None)]
struct Cli {
    /// Print debug logs and span timings to stderr
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one E-step and print log-likelihoods and Q as JSON
    Estep(EstepArgs),
    /// Print the expected site frequency spectrum as JSON
    Sfs(SfsArgs),
}

#[derive(Args, Debug)]
struct EstepArgs {
    model: PathBuf,
    #[arg(required = true)]
    observations: Vec<PathBuf>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, help = "Include per-row posteriors in the output")]
    gamma: bool,
    #[arg(long, short)]
    output: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct SfsArgs {
    model: PathBuf,
    #[arg(long, help = "Undistinguished sample size; defaults to the model's first population")]
    n: Option<usize>,
    #[arg(long)]
    folded: bool,
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct AdValue {
    value: f64,
    grad: Vec<f64>,
}

impl From<&Adouble> for AdValue {
    fn from(x: &Adouble) -> Self {
        Self {
            value: x.value(),
            grad: x.grad().to_vec(),
        }
    }
}

#[derive(Serialize)]
struct EstepSummary {
    sequences: usize,
    hidden_states: usize,
    threads: usize,
    loglik: Vec<f64>,
    total_loglik: f64,
    q: Vec<AdValue>,
    pi: Vec<f64>,
    transition: Vec<Vec<f64>>,
    recompute: RecomputeCounts,
    expm_evaluations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    gamma: Option<Vec<Vec<Vec<f64>>>>,
}

#[derive(Serialize)]
struct SfsSummary {
    n: usize,
    folded: bool,
    sfs: Vec<Vec<AdValue>>,
}

fn init_logging() {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        init_logging();
    }
    match cli.command {
        Command::Estep(args) => run_estep(args),
        Command::Sfs(args) => run_sfs(args),
    }
}

fn rows_of(m: &Array2<f64>) -> Vec<Vec<f64>> {
    m.rows().into_iter().map(|r| r.to_vec()).collect()
}

fn table_from_rows(k: usize, rows: &[Vec<f64>]) -> Result<Array2<f64>> {
    let n_rows = rows.len();
    let n_cols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != n_cols) {
        bail!("emission table {k} is ragged");
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat)
        .with_context(|| format!("failed to reshape emission table {k}"))
}

fn build_manager(model: &ModelFile, obs: Vec<Array2<i32>>, pool: Arc<WorkerPool>) -> Result<InferenceManager> {
    let emission = model.emission_model()?;
    let mut manager = InferenceManager::new(emission, obs, model.boundaries(), pool)?;
    manager.set_rho(model.rho)?;
    manager.set_theta(model.theta)?;
    match (&model.tables, model.sample_sizes.len()) {
        (Some(tables), 2) => {
            let tables = tables
                .iter()
                .enumerate()
                .map(|(k, t)| table_from_rows(k, t))
                .collect::<Result<Vec<_>>>()?;
            manager.set_params_with_sfs(&model.params, tables)?;
        }
        (None, 2) => bail!("two-population models need per-state emission tables"),
        (Some(_), _) => bail!("emission tables are only used by two-population models"),
        (None, _) => manager.set_params(&model.params)?,
    }
    Ok(manager)
}

fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value)
                .with_context(|| format!("failed to write {:?}", path))?;
            writer.flush()?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            serde_json::to_writer_pretty(&mut lock, value)?;
            writeln!(lock)?;
        }
    }
    Ok(())
}

fn run_estep(args: EstepArgs) -> Result<()> {
    let threads = match args.threads {
        Some(0) => bail!("--threads must be >= 1"),
        Some(n) => n,
        None => default_threads(),
    };
    let show = !args.no_progress;
    let model = load_model(&args.model)?;
    let n_cols = 1 + 3 * model.sample_sizes.len();

    let pb = progress::bar(show, args.observations.len() as u64, "IO", "Reading observations");
    let mut obs = Vec::with_capacity(args.observations.len());
    for path in &args.observations {
        obs.push(read_obs(path, n_cols)?);
        pb.inc(1);
    }
    pb.finish_with_message("Reading observations done");

    let pool = Arc::new(WorkerPool::new(threads)?);
    let mut manager = build_manager(&model, obs, Arc::clone(&pool))?;
    info!(
        sequences = manager.n_sequences(),
        hidden_states = manager.n_states(),
        threads,
        "starting E-step"
    );

    let sp = progress::spinner(show, "EM", "E-step");
    manager.e_step(args.gamma)?;
    let loglik = manager.loglik()?;
    let q = manager.q()?;
    sp.finish_with_message("E-step done");

    let gamma = if args.gamma {
        Some(
            manager
                .gammas()
                .iter()
                .map(|g| g.as_deref().map(rows_of).unwrap_or_default())
                .collect(),
        )
    } else {
        None
    };
    let transition = manager.transition().map(Adouble::value);
    let summary = EstepSummary {
        sequences: manager.n_sequences(),
        hidden_states: manager.n_states(),
        threads: pool.size(),
        total_loglik: loglik.iter().sum(),
        loglik,
        q: q.iter().map(AdValue::from).collect(),
        pi: manager.pi().iter().map(Adouble::value).collect(),
        transition: rows_of(&transition),
        recompute: manager.recompute_counts(),
        expm_evaluations: manager.expm_evaluations(),
        gamma,
    };
    write_json(args.output.as_deref(), &summary)?;
    pool.shutdown();
    Ok(())
}

fn run_sfs(args: SfsArgs) -> Result<()> {
    let model = load_model(&args.model)?;
    let n = match args.n.or_else(|| model.sample_sizes.first().copied()) {
        Some(n) => n,
        None => bail!("no sample size given and the model lists none"),
    };
    let spectrum = sfs::sfs(n, &model.params, model.rho, model.theta, args.folded)?;
    let summary = SfsSummary {
        n,
        folded: args.folded,
        sfs: spectrum
            .rows()
            .into_iter()
            .map(|r| r.iter().map(AdValue::from).collect())
            .collect(),
    };
    write_json(args.output.as_deref(), &summary)
}
