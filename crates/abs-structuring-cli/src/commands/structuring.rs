use clap::Args;
use rust_decimal::Decimal;
use serde_json::Value;

use abs_structuring_core::calibration::nominal::{self, CalibrationInput};
use abs_structuring_core::waterfall::allocator::{self, WaterfallInput};

use crate::input;

/// Arguments for a single waterfall run
#[derive(Args)]
pub struct WaterfallArgs {
    /// Path to JSON or YAML input (schedule, structure, settings)
    #[arg(long)]
    pub input: Option<String>,
}

/// Arguments for Class A nominal calibration
#[derive(Args)]
pub struct CalibrateArgs {
    /// Path to JSON or YAML input (schedule, structure, settings, targets)
    #[arg(long)]
    pub input: Option<String>,

    /// Target Class B coupon, percent (overrides the input)
    #[arg(long)]
    pub target_coupon: Option<Decimal>,

    /// Target subordination, percent (overrides the input)
    #[arg(long)]
    pub target_subordination: Option<Decimal>,

    /// Maximum calibration iterations (overrides the input)
    #[arg(long)]
    pub max_iterations: Option<u32>,
}

pub fn run_waterfall(args: WaterfallArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let wf_input: WaterfallInput = input::load(args.input.as_deref(), "a waterfall run")?;
    let result = allocator::allocate_tranches(&wf_input)?;
    Ok(serde_json::to_value(result)?)
}

pub fn run_calibrate(args: CalibrateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut cal_input: CalibrationInput = input::load(args.input.as_deref(), "calibration")?;
    if let Some(t) = args.target_coupon {
        cal_input.targets.target_coupon_rate = t;
    }
    if let Some(s) = args.target_subordination {
        cal_input.targets.target_subordination_pct = s;
    }
    if let Some(n) = args.max_iterations {
        cal_input.targets.max_iterations = n;
    }
    let result = nominal::calibrate(&cal_input)?;
    Ok(serde_json::to_value(result)?)
}
