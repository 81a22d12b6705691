use clap::{Args, ValueEnum};
use colored::Colorize;
use serde_json::Value;
use std::time::Duration;

use abs_structuring_core::optimizer::progress::{
    NoopProgress, Phase, ProgressObserver, ProgressUpdate, RunControl,
};
use abs_structuring_core::optimizer::{self, OptimizationInput, OptimizationMethod};

use crate::input;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MethodArg {
    Deterministic,
    Genetic,
}

impl From<MethodArg> for OptimizationMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::Deterministic => OptimizationMethod::Deterministic,
            MethodArg::Genetic => OptimizationMethod::Genetic,
        }
    }
}

/// Arguments for structure optimisation
#[derive(Args)]
pub struct OptimizeArgs {
    /// Path to JSON or YAML input (schedule, settings, optimization)
    #[arg(long)]
    pub input: Option<String>,

    /// Search method (overrides the input)
    #[arg(long)]
    pub method: Option<MethodArg>,

    /// Seed for the genetic search; runs with the same seed repeat exactly
    #[arg(long)]
    pub seed: Option<u64>,

    /// Genetic population size
    #[arg(long)]
    pub population: Option<usize>,

    /// Genetic generations
    #[arg(long)]
    pub generations: Option<usize>,

    /// Stop after this many seconds and return the best structure so far
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Print progress updates to stderr
    #[arg(long)]
    pub progress: bool,
}

/// Prints each update as one line on stderr.
struct StderrProgress;

impl ProgressObserver for StderrProgress {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        let phase = format!("{:?}", update.phase);
        let phase = match update.phase {
            Phase::Complete => phase.green().bold(),
            Phase::Error => phase.red().bold(),
            _ => phase.cyan(),
        };
        eprintln!(
            "[{:>3}%] {:<12} {} {}",
            update.percent,
            phase,
            update.message,
            format!("({} ms)", update.elapsed_ms).dimmed()
        );
    }
}

pub fn run_optimize(args: OptimizeArgs, verbose: bool) -> Result<Value, Box<dyn std::error::Error>> {
    let mut opt_input: OptimizationInput = input::load(args.input.as_deref(), "optimisation")?;
    if let Some(m) = args.method {
        opt_input.method = m.into();
    }
    let genetic = &mut opt_input.optimization.genetic;
    if let Some(seed) = args.seed {
        genetic.seed = Some(seed);
    }
    if let Some(p) = args.population {
        genetic.population_size = p;
    }
    if let Some(g) = args.generations {
        genetic.generations = g;
    }

    let mut control = RunControl::new();
    if let Some(secs) = args.timeout_secs {
        control = control.with_timeout(Duration::from_secs(secs));
    }

    // Verbose runs already log every update through tracing.
    let result = if args.progress && !verbose {
        optimizer::optimize_with(&opt_input, &mut StderrProgress, &control)?
    } else {
        optimizer::optimize_with(&opt_input, &mut NoopProgress, &control)?
    };
    Ok(serde_json::to_value(result)?)
}
