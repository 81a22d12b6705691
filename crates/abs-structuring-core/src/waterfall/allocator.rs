use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::rates::{
    compound_growth_factor, overnight_to_annual_compound, simple_to_compound_annual,
    simple_to_maturity_compound, DAYS_PER_YEAR,
};
use crate::schedule::{ExpenseRule, Schedule};
use crate::types::{with_metadata, ComputationOutput, Days, Money, Percent};
use crate::waterfall::cash_buckets::assign_cash_flows;
use crate::waterfall::structure::{Structure, TrancheClass};
use crate::StructuringResult;

/// Floor applied to the Class B principal so its coupon ratios stay defined.
const MIN_CLASS_B_PRINCIPAL: Decimal = dec!(0.001);

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// Run-level settings shared by every waterfall evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallSettings {
    /// Issue date; tranche maturities count from here
    pub start_date: NaiveDate,
    /// One-time operating expense taken out of a single installment
    #[serde(default)]
    pub expense: ExpenseRule,
}

impl WaterfallSettings {
    pub fn new(start_date: NaiveDate) -> Self {
        Self {
            start_date,
            expense: ExpenseRule::none(),
        }
    }
}

/// Input for a single waterfall run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallInput {
    pub schedule: Schedule,
    pub structure: Structure,
    pub settings: WaterfallSettings,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Payment detail for one tranche.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheResult {
    pub name: String,
    pub class: TrancheClass,
    pub maturity_days: Days,
    pub maturity_date: NaiveDate,
    pub base_rate: Percent,
    /// Basis points
    pub spread: Decimal,
    pub total_rate: Percent,
    pub nominal: Money,
    pub buffer_in: Money,
    pub cash_flow_total: Money,
    pub reinvestment_return: Money,
    pub buffer_reinvestment: Money,
    pub total_available: Money,
    pub discount_factor: Decimal,
    pub principal: Money,
    pub interest: Money,
    pub coupon: Money,
    pub coupon_rate: Percent,
    pub effective_coupon: Percent,
    pub total_payment: Money,
    /// Part of the Class A redemption the available cash does not cover
    pub shortfall: Money,
    pub buffer_out: Money,
    /// Buffer out as a percentage of nominal
    pub buffer_ratio: Percent,
}

/// Rate quotes for one tranche. Fields that do not apply to the class are
/// left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConversionRow {
    pub name: String,
    pub maturity_days: Days,
    pub simple_annual: Option<Percent>,
    pub compound_for_period: Option<Percent>,
    pub reinvest_simple: Percent,
    pub reinvest_overnight_compound: Percent,
    pub coupon_rate: Option<Percent>,
    pub effective_coupon_rate: Option<Percent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallSummary {
    pub class_a_total: Money,
    pub class_b_total: Money,
    pub class_a_principal: Money,
    pub class_b_principal: Money,
    pub class_a_interest: Money,
    pub class_b_coupon: Money,
    /// Lowest Class A buffer ratio (percent)
    pub min_buffer_actual: Percent,
    pub total_principal_paid: Money,
    pub total_loan_principal: Money,
    /// Note principal raised minus collateral principal
    pub financing_cost: Money,
    pub direct_coupon_rate: Percent,
    pub effective_coupon_rate: Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallOutput {
    pub tranche_results: Vec<TrancheResult>,
    pub rate_conversions: Vec<RateConversionRow>,
    pub summary: WaterfallSummary,
}

// ---------------------------------------------------------------------------
// Main functions
// ---------------------------------------------------------------------------

/// Allocate pool collections to the notes and report per-tranche payments,
/// wrapped in the standard computation envelope.
pub fn allocate_tranches(
    input: &WaterfallInput,
) -> StructuringResult<ComputationOutput<WaterfallOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    let output = run_waterfall(&input.schedule, &input.structure, &input.settings)?;

    for t in &output.tranche_results {
        if t.shortfall > Decimal::ZERO {
            warnings.push(format!(
                "{}: available cash {} does not cover nominal {} (shortfall {})",
                t.name,
                t.total_available.round_dp(2),
                t.nominal,
                t.shortfall.round_dp(2)
            ));
        }
        if t.cash_flow_total.is_zero() {
            warnings.push(format!("{}: no collections fall before maturity", t.name));
        }
    }
    if input.settings.start_date > input.schedule.first_date() {
        warnings.push(format!(
            "Start date {} is after the first installment ({}); earlier collections still fund the first tranche",
            input.settings.start_date,
            input.schedule.first_date()
        ));
    }

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Sequential maturity waterfall: discounted Class A redemption, residual Class B coupon",
        &serde_json::json!({
            "start_date": input.settings.start_date.to_string(),
            "installments": input.schedule.len(),
            "class_a_tranches": input.structure.class_a.len(),
            "day_count": "ACT/365",
            "collection_reinvestment": "simple to tranche maturity",
            "buffer_reinvestment": "daily-compounded reinvest rate over maturity gap",
            "expense": input.settings.expense,
        }),
        warnings,
        elapsed,
        output,
    ))
}

/// The bare waterfall kernel. Pure; the schedule is never mutated.
pub fn run_waterfall(
    schedule: &Schedule,
    structure: &Structure,
    settings: &WaterfallSettings,
) -> StructuringResult<WaterfallOutput> {
    structure.validate()?;

    let rows = schedule.working_cash_flows(&settings.expense);
    let tranches: Vec<_> = structure.tranches().collect();
    let maturity_dates: Vec<NaiveDate> = tranches
        .iter()
        .map(|t| settings.start_date + Duration::days(t.maturity_days))
        .collect();
    let reinvest_rates: Vec<Percent> = tranches.iter().map(|t| t.reinvest_rate).collect();
    let buckets = assign_cash_flows(&rows, &maturity_dates, &reinvest_rates);

    let mut results: Vec<TrancheResult> = Vec::with_capacity(tranches.len());
    let mut buffer = Decimal::ZERO;
    let mut prev_days: Option<Days> = None;

    for (i, tranche) in tranches.iter().enumerate() {
        let days = tranche.maturity_days;
        let bucket = &buckets[i];

        let buffer_reinvestment = match prev_days {
            Some(prev) if buffer > Decimal::ZERO && days > prev => {
                let annual = simple_to_compound_annual(tranche.reinvest_rate);
                buffer * compound_growth_factor(annual, days - prev)
            }
            _ => Decimal::ZERO,
        };

        let available =
            bucket.cash_flow + bucket.reinvestment_return + buffer + buffer_reinvestment;
        let nominal = tranche.nominal;
        let total_rate = tranche.total_rate();

        let (discount_factor, principal, interest, coupon, coupon_rate, effective_coupon, total_payment) =
            match tranche.class {
                TrancheClass::A => {
                    let df = simple_discount_factor(total_rate, days);
                    let principal = nominal * df;
                    (
                        df,
                        principal,
                        nominal - principal,
                        Decimal::ZERO,
                        Decimal::ZERO,
                        Decimal::ZERO,
                        nominal,
                    )
                }
                TrancheClass::B => {
                    let principal = nominal.max(MIN_CLASS_B_PRINCIPAL);
                    let coupon = (available - principal).max(Decimal::ZERO);
                    let coupon_rate = coupon / principal * Decimal::ONE_HUNDRED;
                    let effective = if days > 0 {
                        coupon / principal * DAYS_PER_YEAR / Decimal::from(days)
                            * Decimal::ONE_HUNDRED
                    } else {
                        Decimal::ZERO
                    };
                    (
                        Decimal::ONE,
                        principal,
                        Decimal::ZERO,
                        coupon,
                        coupon_rate,
                        effective,
                        principal + coupon,
                    )
                }
            };

        // The senior claim is due in full; any gap is reported, not netted.
        let shortfall = match tranche.class {
            TrancheClass::A => (total_payment - available).max(Decimal::ZERO),
            TrancheClass::B => Decimal::ZERO,
        };
        let buffer_out = (available - total_payment).max(Decimal::ZERO);
        let buffer_ratio = if nominal.is_zero() {
            Decimal::ZERO
        } else {
            buffer_out / nominal * Decimal::ONE_HUNDRED
        };

        results.push(TrancheResult {
            name: tranche_name(tranche.class, i),
            class: tranche.class,
            maturity_days: days,
            maturity_date: maturity_dates[i],
            base_rate: tranche.base_rate,
            spread: tranche.spread,
            total_rate,
            nominal,
            buffer_in: buffer,
            cash_flow_total: bucket.cash_flow,
            reinvestment_return: bucket.reinvestment_return,
            buffer_reinvestment,
            total_available: available,
            discount_factor,
            principal,
            interest,
            coupon,
            coupon_rate,
            effective_coupon,
            total_payment,
            shortfall,
            buffer_out,
            buffer_ratio,
        });

        buffer = buffer_out;
        prev_days = Some(days);
    }

    let summary = summarise(&results, schedule.total_principal());
    let rate_conversions = rate_conversions(&results, structure);

    tracing::debug!(
        tranches = results.len(),
        effective_coupon = %summary.effective_coupon_rate.round_dp(4),
        min_buffer = %summary.min_buffer_actual.round_dp(4),
        "waterfall evaluated"
    );

    Ok(WaterfallOutput {
        tranche_results: results,
        rate_conversions,
        summary,
    })
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn tranche_name(class: TrancheClass, index: usize) -> String {
    match class {
        TrancheClass::A => format!("Class A{}", index + 1),
        TrancheClass::B => "Class B".to_string(),
    }
}

/// Simple-interest discount factor `1 / (1 + r * d / 365)`.
fn simple_discount_factor(total_rate: Percent, days: Days) -> Decimal {
    if days == 0 {
        return Decimal::ONE;
    }
    let denom =
        Decimal::ONE + total_rate / Decimal::ONE_HUNDRED * Decimal::from(days) / DAYS_PER_YEAR;
    if denom <= Decimal::ZERO {
        Decimal::ONE
    } else {
        Decimal::ONE / denom
    }
}

fn summarise(results: &[TrancheResult], total_loan_principal: Money) -> WaterfallSummary {
    let (a, b): (Vec<&TrancheResult>, Vec<&TrancheResult>) =
        results.iter().partition(|r| r.class == TrancheClass::A);

    let class_a_principal: Money = a.iter().map(|r| r.principal).sum();
    let class_b_principal: Money = b.iter().map(|r| r.principal).sum();
    let min_buffer_actual = a
        .iter()
        .map(|r| r.buffer_ratio)
        .min()
        .unwrap_or(Decimal::ZERO);
    let total_principal_paid = class_a_principal + class_b_principal;
    let last_b = b.last();

    WaterfallSummary {
        class_a_total: a.iter().map(|r| r.total_payment).sum(),
        class_b_total: b.iter().map(|r| r.total_payment).sum(),
        class_a_principal,
        class_b_principal,
        class_a_interest: a.iter().map(|r| r.interest).sum(),
        class_b_coupon: b.iter().map(|r| r.coupon).sum(),
        min_buffer_actual,
        total_principal_paid,
        total_loan_principal,
        financing_cost: total_principal_paid - total_loan_principal,
        direct_coupon_rate: last_b.map(|r| r.coupon_rate).unwrap_or(Decimal::ZERO),
        effective_coupon_rate: last_b.map(|r| r.effective_coupon).unwrap_or(Decimal::ZERO),
    }
}

fn rate_conversions(results: &[TrancheResult], structure: &Structure) -> Vec<RateConversionRow> {
    results
        .iter()
        .zip(structure.tranches())
        .map(|(r, t)| {
            let reinvest_overnight_compound = overnight_to_annual_compound(t.reinvest_rate);
            match r.class {
                TrancheClass::A => RateConversionRow {
                    name: r.name.clone(),
                    maturity_days: r.maturity_days,
                    simple_annual: Some(r.total_rate),
                    compound_for_period: Some(simple_to_maturity_compound(
                        r.total_rate,
                        r.maturity_days,
                    )),
                    reinvest_simple: t.reinvest_rate,
                    reinvest_overnight_compound,
                    coupon_rate: None,
                    effective_coupon_rate: None,
                },
                TrancheClass::B => RateConversionRow {
                    name: r.name.clone(),
                    maturity_days: r.maturity_days,
                    simple_annual: None,
                    compound_for_period: None,
                    reinvest_simple: t.reinvest_rate,
                    reinvest_overnight_compound,
                    coupon_rate: Some(r.coupon_rate),
                    effective_coupon_rate: Some(r.effective_coupon),
                },
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
