use clap::Args;
use rust_decimal::Decimal;
use serde_json::Value;

use abs_structuring_core::stress::cashflow_model::{self, CashflowModelInput, ScenarioParameters};
use abs_structuring_core::stress::stress_test::{self, StressTestInput};

use crate::input;

/// Scenario overrides shared by the stress commands
#[derive(Args)]
pub struct ScenarioOverrides {
    /// Annual default (NPL) rate, percent
    #[arg(long)]
    pub npl_rate: Option<Decimal>,

    /// Annual prepayment rate, percent
    #[arg(long)]
    pub prepayment_rate: Option<Decimal>,

    /// Shift added to every reinvest rate, percentage points
    #[arg(long, allow_hyphen_values = true)]
    pub reinvestment_shift: Option<Decimal>,

    /// Share of defaults recovered (0-1)
    #[arg(long)]
    pub recovery_rate: Option<Decimal>,

    /// Periods between default and recovery
    #[arg(long)]
    pub recovery_lag: Option<usize>,
}

impl ScenarioOverrides {
    fn apply(&self, scenario: &mut ScenarioParameters) {
        if let Some(v) = self.npl_rate {
            scenario.npl_rate = v;
        }
        if let Some(v) = self.prepayment_rate {
            scenario.prepayment_rate = v;
        }
        if let Some(v) = self.reinvestment_shift {
            scenario.reinvestment_shift = v;
        }
        if let Some(v) = self.recovery_rate {
            scenario.recovery_rate = v;
        }
        if let Some(v) = self.recovery_lag {
            scenario.recovery_lag = v;
        }
    }
}

/// Arguments for stressed cash flow modelling
#[derive(Args)]
pub struct CashflowModelArgs {
    /// Path to JSON or YAML input (schedule, scenario)
    #[arg(long)]
    pub input: Option<String>,

    #[command(flatten)]
    pub scenario: ScenarioOverrides,
}

/// Arguments for the baseline vs stressed waterfall comparison
#[derive(Args)]
pub struct StressTestArgs {
    /// Path to JSON or YAML input (schedule, structure, settings, scenario)
    #[arg(long)]
    pub input: Option<String>,

    #[command(flatten)]
    pub scenario: ScenarioOverrides,
}

pub fn run_cashflow_model(args: CashflowModelArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut cf_input: CashflowModelInput =
        input::load(args.input.as_deref(), "cash flow modelling")?;
    args.scenario.apply(&mut cf_input.scenario);
    let result = cashflow_model::model_cashflows(&cf_input)?;
    Ok(serde_json::to_value(result)?)
}

pub fn run_stress_test(args: StressTestArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut st_input: StressTestInput = input::load(args.input.as_deref(), "a stress test")?;
    args.scenario.apply(&mut st_input.scenario);
    let result = stress_test::run_stress_test(&st_input)?;
    Ok(serde_json::to_value(result)?)
}
