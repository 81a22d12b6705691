//! Credit-stressed collections for a receivables pool.
//!
//! Covers:
//! - **Prepayment**: daily SMM from an annual CPR, applied to the balance
//!   left after scheduled principal.
//! - **Delinquency**: daily rate with a repeat-delinquency amplifier; a share
//!   migrates to default in the same period.
//! - **Default**: daily rate from an annual NPL rate on the remaining balance.
//! - **Recovery**: defaults and delinquencies recover exactly `recovery_lag`
//!   periods later. Unrecovered delinquency rolls to default after a grace
//!   period.
//!
//! The modeled periods convert back into a [`Schedule`] so stressed
//! collections can run through the same waterfall as the baseline.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::StructuringError;
use crate::rates::annual_to_daily_decay;
use crate::schedule::{InstallmentRecord, Schedule};
use crate::types::{with_metadata, ComputationOutput, Fraction, Money, Percent};
use crate::StructuringResult;

/// Periods between the end of the recovery lag and the point where the
/// unrecovered part of a delinquency is written off as default.
pub const DELINQUENCY_GRACE_PERIODS: usize = 3;

/// Cap on the share of the balance that counts towards repeat delinquency.
const REPEAT_DELINQUENCY_CAP: Decimal = dec!(0.5);

/// Extra interest accrued on delinquent balances, as a share of the
/// scheduled interest.
const DELINQUENCY_PENALTY_UPLIFT: Decimal = dec!(0.5);

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// Credit scenario. Rates are annual percentages; recovery and transition
/// rates are fractions in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioParameters {
    #[serde(default = "default_scenario_name")]
    pub name: String,
    /// Annual default (NPL) rate, percent
    pub npl_rate: Percent,
    /// Annual prepayment (CPR) rate, percent
    pub prepayment_rate: Percent,
    /// Shift added to every reinvest rate in the stressed waterfall (percentage points)
    #[serde(default)]
    pub reinvestment_shift: Percent,
    #[serde(default = "default_recovery_rate")]
    pub recovery_rate: Fraction,
    /// Periods between a default and its recovery
    #[serde(default = "default_recovery_lag")]
    pub recovery_lag: usize,
    /// Annual delinquency rate, percent. Half the NPL rate when absent.
    #[serde(default)]
    pub delinquency_rate: Option<Percent>,
    #[serde(default = "default_delinquency_recovery_rate")]
    pub delinquency_recovery_rate: Fraction,
    #[serde(default = "default_delinquency_to_default_rate")]
    pub delinquency_to_default_rate: Fraction,
    #[serde(default = "default_repeat_delinquency_factor")]
    pub repeat_delinquency_factor: Decimal,
}

fn default_scenario_name() -> String {
    "custom".to_string()
}

fn default_recovery_rate() -> Fraction {
    dec!(0.5)
}

fn default_recovery_lag() -> usize {
    6
}

fn default_delinquency_recovery_rate() -> Fraction {
    dec!(0.85)
}

fn default_delinquency_to_default_rate() -> Fraction {
    dec!(0.20)
}

fn default_repeat_delinquency_factor() -> Decimal {
    dec!(1.5)
}

impl ScenarioParameters {
    /// Scenario with the given NPL and prepayment rates and default
    /// recovery/delinquency assumptions.
    pub fn new(name: impl Into<String>, npl_rate: Percent, prepayment_rate: Percent) -> Self {
        Self {
            name: name.into(),
            npl_rate,
            prepayment_rate,
            reinvestment_shift: Decimal::ZERO,
            recovery_rate: default_recovery_rate(),
            recovery_lag: default_recovery_lag(),
            delinquency_rate: None,
            delinquency_recovery_rate: default_delinquency_recovery_rate(),
            delinquency_to_default_rate: default_delinquency_to_default_rate(),
            repeat_delinquency_factor: default_repeat_delinquency_factor(),
        }
    }

    pub fn effective_delinquency_rate(&self) -> Percent {
        self.delinquency_rate.unwrap_or(self.npl_rate / dec!(2))
    }

    pub fn validate(&self) -> StructuringResult<()> {
        let pct_fields = [
            ("npl_rate", self.npl_rate),
            ("prepayment_rate", self.prepayment_rate),
            ("delinquency_rate", self.effective_delinquency_rate()),
        ];
        for (field, value) in pct_fields {
            if value < Decimal::ZERO || value > dec!(100) {
                return Err(StructuringError::invalid(field, "must be between 0 and 100"));
            }
        }
        let fraction_fields = [
            ("recovery_rate", self.recovery_rate),
            ("delinquency_recovery_rate", self.delinquency_recovery_rate),
            ("delinquency_to_default_rate", self.delinquency_to_default_rate),
        ];
        for (field, value) in fraction_fields {
            if value < Decimal::ZERO || value > Decimal::ONE {
                return Err(StructuringError::invalid(field, "must be between 0 and 1"));
            }
        }
        if self.repeat_delinquency_factor < Decimal::ONE {
            return Err(StructuringError::invalid(
                "repeat_delinquency_factor",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Input for standalone cash flow modeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashflowModelInput {
    pub schedule: Schedule,
    pub scenario: ScenarioParameters,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// One stressed period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeledPeriod {
    pub installment_date: NaiveDate,
    pub scheduled_principal: Money,
    pub scheduled_interest: Money,
    /// Performing balance entering the period
    pub beginning_balance: Money,
    pub scaling_factor: Decimal,
    /// Scheduled principal after scaling, plus prepayment
    pub actual_principal: Money,
    pub actual_interest: Money,
    pub prepayment: Money,
    /// New delinquency net of the share migrated to default
    pub delinquency: Money,
    /// New default drawn from the performing balance this period
    pub default_amount: Money,
    /// Unrecovered delinquency written off this period
    pub rolled_default: Money,
    pub loss: Money,
    pub default_recovery: Money,
    pub delinquency_recovery: Money,
    pub prepayment_interest_loss: Money,
    pub actual_cashflow: Money,
    pub ending_balance: Money,
    pub cumulative_actual_cashflow: Money,
    pub cumulative_prepayment: Money,
    pub cumulative_default: Money,
    pub cumulative_delinquency: Money,
    pub cumulative_loss: Money,
    pub cumulative_default_recovery: Money,
    pub cumulative_delinquency_recovery: Money,
}

/// Totals over the horizon, with percentages of original principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowModelSummary {
    pub total_original_principal: Money,
    pub total_modeled_principal: Money,
    pub total_original_cashflow: Money,
    pub total_modeled_cashflow: Money,
    pub total_default: Money,
    pub total_default_pct: Percent,
    pub total_loss: Money,
    pub total_loss_pct: Percent,
    pub total_delinquency: Money,
    pub total_delinquency_pct: Percent,
    pub total_recovery: Money,
    pub cashflow_reduction_pct: Percent,
    pub principal_reduction_pct: Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioCashflows {
    pub scenario: String,
    pub periods: Vec<ModeledPeriod>,
    pub summary: CashflowModelSummary,
}

impl ScenarioCashflows {
    /// Modeled collections as a schedule whose baseline cash flow is the
    /// stressed cash flow, recoveries included.
    pub fn to_schedule(&self) -> StructuringResult<Schedule> {
        let records = self
            .periods
            .iter()
            .map(|p| InstallmentRecord {
                installment_date: p.installment_date,
                principal_amount: p.actual_principal,
                interest_amount: p.actual_interest,
                cash_flow: p.actual_cashflow,
                original_cash_flow: p.actual_cashflow,
            })
            .collect();
        Schedule::new(records)
    }
}

// ---------------------------------------------------------------------------
// Main functions
// ---------------------------------------------------------------------------

/// Model stressed collections, wrapped in the standard computation envelope.
pub fn model_cashflows(
    input: &CashflowModelInput,
) -> StructuringResult<ComputationOutput<ScenarioCashflows>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    let result = model_scenario_cashflows(&input.schedule, &input.scenario)?;

    if input.scenario.recovery_lag >= input.schedule.len() {
        warnings.push(format!(
            "Recovery lag of {} periods exceeds the {}-period horizon; no recoveries are realised",
            input.scenario.recovery_lag,
            input.schedule.len()
        ));
    }
    if input.scenario.delinquency_rate.is_none() {
        warnings.push(format!(
            "Delinquency rate not supplied; using half the NPL rate ({}%)",
            input.scenario.effective_delinquency_rate()
        ));
    }

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Per-period prepayment, delinquency and default decay with lagged recovery",
        &input.scenario,
        warnings,
        elapsed,
        result,
    ))
}

/// Apply a credit scenario to every period of the schedule. The schedule is
/// read, never modified.
pub fn model_scenario_cashflows(
    schedule: &Schedule,
    scenario: &ScenarioParameters,
) -> StructuringResult<ScenarioCashflows> {
    scenario.validate()?;

    let daily_prepay = annual_to_daily_decay(scenario.prepayment_rate / dec!(100));
    let daily_default = annual_to_daily_decay(scenario.npl_rate / dec!(100));
    let daily_delinquency =
        annual_to_daily_decay(scenario.effective_delinquency_rate() / dec!(100));

    let records = schedule.records();
    let scheduled_balances = scheduled_beginning_balances(records);
    let lag = scenario.recovery_lag;

    let mut current_balance = schedule.total_principal();
    let mut periods: Vec<ModeledPeriod> = Vec::with_capacity(records.len());
    let mut cumulative = Cumulative::default();
    let mut prev_delinquency = Decimal::ZERO;

    for (i, row) in records.iter().enumerate() {
        let entering = current_balance;
        let scheduled_balance = scheduled_balances[i];
        let scaling_factor = if scheduled_balance > Decimal::ZERO {
            entering / scheduled_balance
        } else {
            Decimal::ZERO
        };
        let principal_adj = (row.principal_amount * scaling_factor).min(entering);
        let interest_adj = row.interest_amount * scaling_factor;

        let remaining = entering - principal_adj;
        let prepayment = remaining * daily_prepay;
        let remaining_after_prepay = remaining - prepayment;

        let mut delinquency = remaining_after_prepay * daily_delinquency;
        if prev_delinquency > Decimal::ZERO && entering > Decimal::ZERO {
            let repeat_share = (prev_delinquency / entering).min(REPEAT_DELINQUENCY_CAP);
            delinquency += repeat_share
                * remaining_after_prepay
                * (scenario.repeat_delinquency_factor - Decimal::ONE)
                * daily_delinquency;
        }
        delinquency = delinquency.min(remaining_after_prepay);
        let remaining_after_delinquency = remaining_after_prepay - delinquency;

        let migrated = delinquency * scenario.delinquency_to_default_rate;
        delinquency -= migrated;

        let default_amount = remaining_after_delinquency * daily_default + migrated;

        let (default_recovery, delinquency_recovery) = if i >= lag {
            (
                periods
                    .get(i - lag)
                    .map_or(default_amount, |p| p.default_amount)
                    * scenario.recovery_rate,
                periods
                    .get(i - lag)
                    .map_or(delinquency, |p| p.delinquency)
                    * scenario.delinquency_recovery_rate,
            )
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };

        let rolled_default = if i >= lag + DELINQUENCY_GRACE_PERIODS {
            periods[i - lag - DELINQUENCY_GRACE_PERIODS].delinquency
                * (Decimal::ONE - scenario.delinquency_recovery_rate)
        } else {
            Decimal::ZERO
        };
        let loss = default_amount * (Decimal::ONE - scenario.recovery_rate) + rolled_default;

        let due = principal_adj + interest_adj;
        let penalty = if due > Decimal::ZERO {
            interest_adj * DELINQUENCY_PENALTY_UPLIFT * delinquency / due
        } else {
            Decimal::ZERO
        };
        let prepayment_interest_loss = if principal_adj + prepayment > Decimal::ZERO {
            interest_adj * prepayment / (principal_adj + prepayment)
        } else {
            Decimal::ZERO
        };
        let actual_interest = (interest_adj + penalty - prepayment_interest_loss).max(Decimal::ZERO);
        let actual_principal = principal_adj + prepayment;

        let actual_cashflow =
            actual_principal + actual_interest + default_recovery + delinquency_recovery;
        current_balance =
            (entering - actual_principal - default_amount - delinquency).max(Decimal::ZERO);

        cumulative.add(
            actual_cashflow,
            prepayment,
            default_amount + rolled_default,
            delinquency,
            loss,
            default_recovery,
            delinquency_recovery,
        );

        periods.push(ModeledPeriod {
            installment_date: row.installment_date,
            scheduled_principal: row.principal_amount,
            scheduled_interest: row.interest_amount,
            beginning_balance: entering,
            scaling_factor,
            actual_principal,
            actual_interest,
            prepayment,
            delinquency,
            default_amount,
            rolled_default,
            loss,
            default_recovery,
            delinquency_recovery,
            prepayment_interest_loss,
            actual_cashflow,
            ending_balance: current_balance,
            cumulative_actual_cashflow: cumulative.cashflow,
            cumulative_prepayment: cumulative.prepayment,
            cumulative_default: cumulative.default,
            cumulative_delinquency: cumulative.delinquency,
            cumulative_loss: cumulative.loss,
            cumulative_default_recovery: cumulative.default_recovery,
            cumulative_delinquency_recovery: cumulative.delinquency_recovery,
        });

        prev_delinquency = delinquency;
    }

    let summary = summarise(schedule, &periods);
    tracing::debug!(
        scenario = %scenario.name,
        periods = periods.len(),
        default_pct = %summary.total_default_pct.round_dp(4),
        loss_pct = %summary.total_loss_pct.round_dp(4),
        "scenario cash flows modeled"
    );

    Ok(ScenarioCashflows {
        scenario: scenario.name.clone(),
        periods,
        summary,
    })
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Cumulative {
    cashflow: Money,
    prepayment: Money,
    default: Money,
    delinquency: Money,
    loss: Money,
    default_recovery: Money,
    delinquency_recovery: Money,
}

impl Cumulative {
    #[allow(clippy::too_many_arguments)]
    fn add(
        &mut self,
        cashflow: Money,
        prepayment: Money,
        default: Money,
        delinquency: Money,
        loss: Money,
        default_recovery: Money,
        delinquency_recovery: Money,
    ) {
        self.cashflow += cashflow;
        self.prepayment += prepayment;
        self.default += default;
        self.delinquency += delinquency;
        self.loss += loss;
        self.default_recovery += default_recovery;
        self.delinquency_recovery += delinquency_recovery;
    }
}

/// Outstanding scheduled principal entering each period.
fn scheduled_beginning_balances(records: &[InstallmentRecord]) -> Vec<Money> {
    let mut balance: Money = records.iter().map(|r| r.principal_amount).sum();
    records
        .iter()
        .map(|r| {
            let entering = balance;
            balance = (balance - r.principal_amount).max(Decimal::ZERO);
            entering
        })
        .collect()
}

fn pct_of(part: Money, whole: Money) -> Percent {
    if whole.is_zero() {
        Decimal::ZERO
    } else {
        part / whole * dec!(100)
    }
}

fn summarise(schedule: &Schedule, periods: &[ModeledPeriod]) -> CashflowModelSummary {
    let total_original_principal = schedule.total_principal();
    let total_original_cashflow = schedule.total_original_cash_flow();
    let total_modeled_principal: Money = periods.iter().map(|p| p.actual_principal).sum();
    let total_modeled_cashflow: Money = periods.iter().map(|p| p.actual_cashflow).sum();
    let total_default: Money = periods
        .iter()
        .map(|p| p.default_amount + p.rolled_default)
        .sum();
    let total_loss: Money = periods.iter().map(|p| p.loss).sum();
    let total_delinquency: Money = periods.iter().map(|p| p.delinquency).sum();
    let total_recovery: Money = periods
        .iter()
        .map(|p| p.default_recovery + p.delinquency_recovery)
        .sum();

    CashflowModelSummary {
        total_original_principal,
        total_modeled_principal,
        total_original_cashflow,
        total_modeled_cashflow,
        total_default,
        total_default_pct: pct_of(total_default, total_original_principal),
        total_loss,
        total_loss_pct: pct_of(total_loss, total_original_principal),
        total_delinquency,
        total_delinquency_pct: pct_of(total_delinquency, total_original_principal),
        total_recovery,
        cashflow_reduction_pct: pct_of(
            total_original_cashflow - total_modeled_cashflow,
            total_original_cashflow,
        ),
        principal_reduction_pct: pct_of(
            total_original_principal - total_modeled_principal,
            total_original_principal,
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    /// `total` principal paid evenly over `periods` daily installments with
    /// 2% interest per installment.
    fn daily_schedule(total: Money, periods: i64) -> Schedule {
        let per = total / Decimal::from(periods);
        let rows = (1..=periods)
            .map(|k| InstallmentRecord::new(start() + Duration::days(k), per, per * dec!(0.02)))
            .collect();
        Schedule::new(rows).unwrap()
    }

    #[test]
    fn test_zero_stress_reproduces_schedule() {
        let schedule = daily_schedule(dec!(1_000_000), 30);
        let scenario = ScenarioParameters {
            delinquency_rate: Some(Decimal::ZERO),
            ..ScenarioParameters::new("flat", Decimal::ZERO, Decimal::ZERO)
        };
        let out = model_scenario_cashflows(&schedule, &scenario).unwrap();
        for (p, r) in out.periods.iter().zip(schedule.records()) {
            assert_eq!(p.actual_principal, r.principal_amount);
            assert_eq!(p.default_amount, Decimal::ZERO);
            assert_eq!(p.delinquency, Decimal::ZERO);
        }
        assert!(out.summary.total_default.is_zero());
        assert!(out.summary.principal_reduction_pct.abs() < dec!(0.000001));
    }

    #[test]
    fn test_principal_default_delinquency_bounded_by_balance() {
        let schedule = daily_schedule(dec!(1_000_000), 60);
        let scenario = ScenarioParameters {
            repeat_delinquency_factor: dec!(40),
            ..ScenarioParameters::new("severe", dec!(80), dec!(60))
        };
        let out = model_scenario_cashflows(&schedule, &scenario).unwrap();
        for p in &out.periods {
            assert!(
                p.actual_principal + p.default_amount + p.delinquency
                    <= p.beginning_balance + dec!(0.0000001),
                "period {} overdraws its balance",
                p.installment_date
            );
            assert!(p.ending_balance >= Decimal::ZERO);
        }
    }

    #[test]
    fn test_cumulative_series_non_decreasing() {
        let schedule = daily_schedule(dec!(1_000_000), 40);
        let scenario = ScenarioParameters::new("base", dec!(10), dec!(15));
        let out = model_scenario_cashflows(&schedule, &scenario).unwrap();
        for w in out.periods.windows(2) {
            assert!(w[1].cumulative_actual_cashflow >= w[0].cumulative_actual_cashflow);
            assert!(w[1].cumulative_prepayment >= w[0].cumulative_prepayment);
            assert!(w[1].cumulative_default >= w[0].cumulative_default);
            assert!(w[1].cumulative_delinquency >= w[0].cumulative_delinquency);
            assert!(w[1].cumulative_loss >= w[0].cumulative_loss);
            assert!(w[1].cumulative_default_recovery >= w[0].cumulative_default_recovery);
        }
    }

    #[test]
    fn test_recovery_realised_exactly_after_lag() {
        let schedule = daily_schedule(dec!(1_000_000), 20);
        let scenario = ScenarioParameters {
            recovery_lag: 4,
            ..ScenarioParameters::new("lagged", dec!(20), Decimal::ZERO)
        };
        let out = model_scenario_cashflows(&schedule, &scenario).unwrap();
        for i in 0..4 {
            assert_eq!(out.periods[i].default_recovery, Decimal::ZERO);
        }
        assert_eq!(
            out.periods[4].default_recovery,
            out.periods[0].default_amount * dec!(0.5)
        );
        assert_eq!(
            out.periods[10].delinquency_recovery,
            out.periods[6].delinquency * dec!(0.85)
        );
    }

    #[test]
    fn test_unrecovered_delinquency_rolls_to_default() {
        let schedule = daily_schedule(dec!(1_000_000), 20);
        let scenario = ScenarioParameters {
            recovery_lag: 2,
            ..ScenarioParameters::new("roll", dec!(20), Decimal::ZERO)
        };
        let out = model_scenario_cashflows(&schedule, &scenario).unwrap();
        let first_roll = 2 + DELINQUENCY_GRACE_PERIODS;
        assert_eq!(out.periods[first_roll - 1].rolled_default, Decimal::ZERO);
        assert_eq!(
            out.periods[first_roll].rolled_default,
            out.periods[0].delinquency * dec!(0.15)
        );
    }

    #[test]
    fn test_delinquency_defaults_to_half_npl() {
        let s = ScenarioParameters::new("x", dec!(6), dec!(0));
        assert_eq!(s.effective_delinquency_rate(), dec!(3));
    }

    #[test]
    fn test_prepayment_reduces_interest() {
        let schedule = daily_schedule(dec!(1_000_000), 30);
        let base = ScenarioParameters {
            delinquency_rate: Some(Decimal::ZERO),
            ..ScenarioParameters::new("none", Decimal::ZERO, Decimal::ZERO)
        };
        let fast = ScenarioParameters {
            delinquency_rate: Some(Decimal::ZERO),
            ..ScenarioParameters::new("fast", Decimal::ZERO, dec!(50))
        };
        let a = model_scenario_cashflows(&schedule, &base).unwrap();
        let b = model_scenario_cashflows(&schedule, &fast).unwrap();
        let interest = |s: &ScenarioCashflows| -> Money {
            s.periods.iter().map(|p| p.actual_interest).sum()
        };
        assert!(interest(&b) < interest(&a));
        assert!(b.periods[0].prepayment_interest_loss > Decimal::ZERO);
    }

    #[test]
    fn test_invalid_scenario_rejected() {
        let schedule = daily_schedule(dec!(1_000), 5);
        let bad_recovery = ScenarioParameters {
            recovery_rate: dec!(1.5),
            ..ScenarioParameters::new("bad", dec!(5), dec!(5))
        };
        assert!(model_scenario_cashflows(&schedule, &bad_recovery).is_err());
        let bad_npl = ScenarioParameters::new("bad", dec!(150), dec!(5));
        assert!(model_scenario_cashflows(&schedule, &bad_npl).is_err());
        let bad_factor = ScenarioParameters {
            repeat_delinquency_factor: dec!(0.5),
            ..ScenarioParameters::new("bad", dec!(5), dec!(5))
        };
        assert!(model_scenario_cashflows(&schedule, &bad_factor).is_err());
    }

    #[test]
    fn test_to_schedule_uses_modeled_flows() {
        let schedule = daily_schedule(dec!(1_000_000), 15);
        let out =
            model_scenario_cashflows(&schedule, &ScenarioParameters::new("s", dec!(5), dec!(10)))
                .unwrap();
        let stressed = out.to_schedule().unwrap();
        assert_eq!(stressed.len(), schedule.len());
        assert_eq!(
            stressed.records()[3].original_cash_flow,
            out.periods[3].actual_cashflow
        );
    }

    #[test]
    fn test_envelope_warns_on_long_lag() {
        let input = CashflowModelInput {
            schedule: daily_schedule(dec!(1_000), 4),
            scenario: ScenarioParameters::new("s", dec!(5), dec!(10)),
        };
        let out = model_cashflows(&input).unwrap();
        assert!(out.warnings.iter().any(|w| w.contains("Recovery lag")));
    }
}
