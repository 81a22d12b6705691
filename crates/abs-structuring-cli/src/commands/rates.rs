use clap::Args;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use abs_structuring_core::rates;

/// Arguments for rate conversion
#[derive(Args)]
pub struct RatesArgs {
    /// Simple annual rate, percent (e.g. 45 for 45%)
    #[arg(long, allow_hyphen_values = true)]
    pub rate: Decimal,

    /// Days to maturity
    #[arg(long, default_value = "365")]
    pub days: i64,
}

pub fn run_rates(args: RatesArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let compound_annual = rates::simple_to_compound_annual(args.rate);
    Ok(json!({
        "result": {
            "simple_annual": args.rate,
            "days": args.days,
            "overnight_compound_annual": rates::overnight_to_annual_compound(args.rate),
            "compound_for_period": rates::simple_to_maturity_compound(args.rate, args.days),
            "growth_over_period": rates::compound_growth_factor(compound_annual, args.days),
            "daily_decay": rates::annual_to_daily_decay(args.rate / Decimal::ONE_HUNDRED),
        },
        "methodology": "ACT/365 simple, overnight-compounded and period-compounded quotes",
        "warnings": [],
    }))
}
