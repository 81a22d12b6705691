mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::optimize::OptimizeArgs;
use commands::rates::RatesArgs;
use commands::stress::{CashflowModelArgs, StressTestArgs};
use commands::structuring::{CalibrateArgs, WaterfallArgs};

/// Tranche waterfall, credit stress and structure optimisation for ABS deals
#[derive(Parser)]
#[command(
    name = "abs",
    version,
    about = "Tranche waterfall, credit stress and structure optimisation for ABS deals",
    long_about = "A CLI for structuring asset-backed notes with decimal precision. \
                  Runs the sequential Class A / Class B waterfall, models credit-stressed \
                  collections, calibrates Class A nominals to a target Class B coupon and \
                  searches for the best tranche structure. Inputs are JSON or YAML."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// Log progress and diagnostics to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate collections to the Class A and Class B notes
    Waterfall(WaterfallArgs),
    /// Model credit-stressed collections for a scenario
    CashflowModel(CashflowModelArgs),
    /// Compare a structure on original and stressed collections
    StressTest(StressTestArgs),
    /// Scale Class A nominals to reach a target Class B coupon
    Calibrate(CalibrateArgs),
    /// Search tranche counts, maturities and nominals for the best structure
    Optimize(OptimizeArgs),
    /// Convert a simple annual rate to its compounded quotes
    Rates(RatesArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Waterfall(args) => commands::structuring::run_waterfall(args),
        Commands::CashflowModel(args) => commands::stress::run_cashflow_model(args),
        Commands::StressTest(args) => commands::stress::run_stress_test(args),
        Commands::Calibrate(args) => commands::structuring::run_calibrate(args),
        Commands::Optimize(args) => commands::optimize::run_optimize(args, cli.verbose),
        Commands::Rates(args) => commands::rates::run_rates(args),
        Commands::Version => {
            println!("abs {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
