use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::StructuringError;
use crate::schedule::Schedule;
use crate::types::{round_to_unit, with_metadata, ComputationOutput, Money, Percent};
use crate::waterfall::allocator::{run_waterfall, WaterfallSettings, WaterfallSummary};
use crate::waterfall::structure::{subordination_percent, Structure};
use crate::StructuringResult;

pub const MIN_ADJUSTMENT: Decimal = dec!(0.001);
pub const MAX_ADJUSTMENT: Decimal = dec!(3.0);
/// Nominals are issued in round lots.
pub const NOMINAL_LOT: Decimal = dec!(1000);
/// Bounds on the subordination window regardless of target and deviation.
pub const MIN_SUBORDINATION_PCT: Decimal = dec!(0.1);
pub const MAX_SUBORDINATION_PCT: Decimal = dec!(50);

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// Which Class B coupon quote the target refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponBasis {
    /// Coupon annualised over the Class B maturity
    #[default]
    Effective,
    /// Coupon over the Class B life, not annualised
    Direct,
}

impl CouponBasis {
    pub fn rate(&self, summary: &WaterfallSummary) -> Percent {
        match self {
            CouponBasis::Effective => summary.effective_coupon_rate,
            CouponBasis::Direct => summary.direct_coupon_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTargets {
    /// Target Class B coupon rate, percent
    pub target_coupon_rate: Percent,
    /// Target Class B share of all notes, percent
    pub target_subordination_pct: Percent,
    #[serde(default = "default_subordination_deviation")]
    pub subordination_deviation: Percent,
    /// Minimum Class A buffer ratio, percent
    #[serde(default)]
    pub min_buffer: Percent,
    #[serde(default = "default_max_allowed_diff")]
    pub max_allowed_diff: Percent,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub coupon_basis: CouponBasis,
}

fn default_subordination_deviation() -> Percent {
    dec!(1.0)
}

fn default_max_allowed_diff() -> Percent {
    dec!(0.5)
}

fn default_max_iterations() -> u32 {
    30
}

impl CalibrationTargets {
    pub fn new(target_coupon_rate: Percent, target_subordination_pct: Percent) -> Self {
        Self {
            target_coupon_rate,
            target_subordination_pct,
            subordination_deviation: default_subordination_deviation(),
            min_buffer: Decimal::ZERO,
            max_allowed_diff: default_max_allowed_diff(),
            max_iterations: default_max_iterations(),
            coupon_basis: CouponBasis::default(),
        }
    }

    /// Admissible subordination range `[max(0.1, t - dev), min(50, t + dev)]`.
    pub fn subordination_window(&self) -> (Percent, Percent) {
        subordination_window(self.target_subordination_pct, self.subordination_deviation)
    }

    fn validate(&self) -> StructuringResult<()> {
        if self.target_coupon_rate <= Decimal::ZERO {
            return Err(StructuringError::invalid(
                "target_coupon_rate",
                "must be positive",
            ));
        }
        if self.target_subordination_pct <= Decimal::ZERO
            || self.target_subordination_pct > MAX_SUBORDINATION_PCT
        {
            return Err(StructuringError::invalid(
                "target_subordination_pct",
                "must be in (0, 50]",
            ));
        }
        if self.subordination_deviation < Decimal::ZERO {
            return Err(StructuringError::invalid(
                "subordination_deviation",
                "cannot be negative",
            ));
        }
        if self.max_allowed_diff < Decimal::ZERO {
            return Err(StructuringError::invalid(
                "max_allowed_diff",
                "cannot be negative",
            ));
        }
        Ok(())
    }
}

pub fn subordination_window(target: Percent, deviation: Percent) -> (Percent, Percent) {
    (
        (target - deviation).max(MIN_SUBORDINATION_PCT),
        (target + deviation).min(MAX_SUBORDINATION_PCT),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationInput {
    pub schedule: Schedule,
    /// Maturities, rates and the initial Class A nominal distribution
    pub structure: Structure,
    pub settings: WaterfallSettings,
    pub targets: CalibrationTargets,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    /// Coupon within `max_allowed_diff` with buffer and subordination met
    pub success: bool,
    /// Buffer and subordination met, regardless of coupon distance
    pub within_constraints: bool,
    pub adjustment: Decimal,
    pub class_a_nominals: Vec<Money>,
    pub class_b_nominal: Money,
    pub subordination_pct: Percent,
    /// Coupon rate on the requested basis
    pub achieved_rate: Percent,
    pub effective_coupon_rate: Percent,
    pub direct_coupon_rate: Percent,
    pub min_buffer: Percent,
    pub iterations: u32,
}

// ---------------------------------------------------------------------------
// Main functions
// ---------------------------------------------------------------------------

/// Calibrate Class A nominals, wrapped in the standard computation envelope.
pub fn calibrate(input: &CalibrationInput) -> StructuringResult<ComputationOutput<CalibrationOutcome>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    let outcome = calibrate_class_a_nominals(
        &input.schedule,
        &input.structure,
        &input.settings,
        &input.targets,
    )?;

    if !outcome.success {
        warnings.push(format!(
            "Target coupon {}% not reached within {} iterations; best achieved {}%",
            input.targets.target_coupon_rate,
            outcome.iterations,
            outcome.achieved_rate.round_dp(4)
        ));
    }
    if !outcome.within_constraints {
        warnings.push("No trial met both the buffer and subordination constraints".into());
    }

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Proportional Class A scaling: direct estimate, then bracketed secant search",
        &input.targets,
        warnings,
        elapsed,
        outcome,
    ))
}

/// Scale the Class A nominals (proportions preserved, Class B resized to the
/// subordination target) until the Class B coupon reaches the target.
///
/// A missed target is reported through `success = false`; only structurally
/// invalid input is an error.
pub fn calibrate_class_a_nominals(
    schedule: &Schedule,
    structure: &Structure,
    settings: &WaterfallSettings,
    targets: &CalibrationTargets,
) -> StructuringResult<CalibrationOutcome> {
    calibrate_with(structure, targets, |candidate| {
        run_waterfall(schedule, candidate, settings).map(|w| w.summary)
    })
}

/// Calibration loop over an arbitrary evaluator, so callers can memoise
/// waterfall runs.
pub(crate) fn calibrate_with<F>(
    structure: &Structure,
    targets: &CalibrationTargets,
    mut evaluate: F,
) -> StructuringResult<CalibrationOutcome>
where
    F: FnMut(&Structure) -> StructuringResult<WaterfallSummary>,
{
    structure.validate()?;
    targets.validate()?;

    let proportions = proportions(&structure.class_a_nominals());
    let base_total = match structure.class_a_total() {
        t if t > Decimal::ZERO => t,
        _ => NOMINAL_LOT * Decimal::from(structure.class_a.len() as u64),
    };
    let target = targets.target_coupon_rate;
    let (sub_lo, sub_hi) = targets.subordination_window();

    let mut search = Search::default();
    let mut trial = |adjustment: Decimal, search: &mut Search| -> StructuringResult<Trial> {
        let nominals: Vec<Money> = proportions
            .iter()
            .map(|p| round_to_unit(*p * base_total * adjustment, NOMINAL_LOT, NOMINAL_LOT))
            .collect();
        let class_a_total: Money = nominals.iter().copied().sum();
        let class_b = class_b_for_target(class_a_total, targets.target_subordination_pct);
        let summary = evaluate(&structure.with_nominals(&nominals, class_b))?;
        let rate = targets.coupon_basis.rate(&summary);
        let subordination = subordination_percent(class_a_total, class_b);
        let valid = subordination >= sub_lo
            && subordination <= sub_hi
            && summary.min_buffer_actual >= targets.min_buffer;
        let t = Trial {
            adjustment,
            nominals,
            class_b,
            rate,
            summary,
            subordination,
            valid,
            diff: (rate - target).abs(),
        };
        search.record(&t, target);
        tracing::debug!(
            adjustment = %t.adjustment.round_dp(6),
            rate = %t.rate.round_dp(4),
            subordination = %t.subordination.round_dp(4),
            valid = t.valid,
            "calibration trial"
        );
        Ok(t)
    };

    // Baseline, then the direct estimate.
    let baseline = trial(Decimal::ONE, &mut search)?;
    let direct = if baseline.rate > Decimal::ZERO {
        (target / baseline.rate).clamp(MIN_ADJUSTMENT, MAX_ADJUSTMENT)
    } else {
        dec!(0.5)
    };
    let mut current = trial(direct, &mut search)?;
    let mut previous = baseline;

    if !search.succeeded(targets.max_allowed_diff) {
        for _ in 0..targets.max_iterations {
            let next = search.next_adjustment(&previous, &current, target);
            if (next - current.adjustment).abs() < dec!(0.000001) {
                break;
            }
            let t = trial(next, &mut search)?;
            previous = current;
            current = t;
            if search.succeeded(targets.max_allowed_diff) {
                break;
            }
        }
    }

    let iterations = search.evaluations;
    let chosen = search
        .best_valid
        .take()
        .or_else(|| search.closest.take())
        .unwrap_or(current);
    let success = chosen.valid && chosen.diff <= targets.max_allowed_diff;

    Ok(CalibrationOutcome {
        success,
        within_constraints: chosen.valid,
        adjustment: chosen.adjustment,
        class_a_nominals: chosen.nominals,
        class_b_nominal: chosen.class_b,
        subordination_pct: chosen.subordination,
        achieved_rate: chosen.rate,
        effective_coupon_rate: chosen.summary.effective_coupon_rate,
        direct_coupon_rate: chosen.summary.direct_coupon_rate,
        min_buffer: chosen.summary.min_buffer_actual,
        iterations,
    })
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// Class B nominal giving `target_pct` subordination over `class_a_total`,
/// in round lots.
pub fn class_b_for_target(class_a_total: Money, target_pct: Percent) -> Money {
    if target_pct >= dec!(100) {
        return class_a_total;
    }
    let raw = class_a_total * target_pct / (dec!(100) - target_pct);
    round_to_unit(raw, NOMINAL_LOT, NOMINAL_LOT)
}

fn proportions(nominals: &[Money]) -> Vec<Decimal> {
    let total: Money = nominals.iter().copied().sum();
    if total <= Decimal::ZERO {
        let n = Decimal::from(nominals.len().max(1) as u64);
        return vec![Decimal::ONE / n; nominals.len()];
    }
    nominals.iter().map(|n| *n / total).collect()
}

#[derive(Debug, Clone)]
struct Trial {
    adjustment: Decimal,
    nominals: Vec<Money>,
    class_b: Money,
    rate: Percent,
    summary: WaterfallSummary,
    subordination: Percent,
    valid: bool,
    diff: Percent,
}

/// Search state: best candidates plus the tightest bracket around the target.
#[derive(Default)]
struct Search {
    evaluations: u32,
    best_valid: Option<Trial>,
    closest: Option<Trial>,
    /// Nearest adjustment whose rate is above target
    above: Option<(Decimal, Percent)>,
    /// Nearest adjustment whose rate is below target
    below: Option<(Decimal, Percent)>,
    /// Sign of d(rate)/d(adjustment) once observed
    slope_sign: Option<i8>,
}

impl Search {
    fn record(&mut self, t: &Trial, target: Percent) {
        self.evaluations += 1;
        if t.valid && self.best_valid.as_ref().map_or(true, |b| t.diff < b.diff) {
            self.best_valid = Some(t.clone());
        }
        if self.closest.as_ref().map_or(true, |b| t.diff < b.diff) {
            self.closest = Some(t.clone());
        }
        let slot = if t.rate > target {
            &mut self.above
        } else {
            &mut self.below
        };
        let closer = slot.map_or(true, |(_, r)| (r - target).abs() > t.diff);
        if closer {
            *slot = Some((t.adjustment, t.rate));
        }
    }

    fn succeeded(&self, max_allowed_diff: Percent) -> bool {
        self.best_valid
            .as_ref()
            .map_or(false, |b| b.diff <= max_allowed_diff)
    }

    fn next_adjustment(&mut self, previous: &Trial, current: &Trial, target: Percent) -> Decimal {
        let da = current.adjustment - previous.adjustment;
        let dr = current.rate - previous.rate;
        if !da.is_zero() && !dr.is_zero() {
            self.slope_sign = Some(if (dr > Decimal::ZERO) == (da > Decimal::ZERO) { 1 } else { -1 });
        }

        let cur = current.adjustment;
        let lo = (cur * dec!(0.5)).max(MIN_ADJUSTMENT);
        let hi = (cur * dec!(2)).min(MAX_ADJUSTMENT);

        let mut next = if !da.is_zero() && (dr / da).abs() > dec!(0.000001) {
            let secant = current.adjustment + (target - current.rate) * da / dr;
            secant.clamp(lo, hi)
        } else {
            self.exponential_step(current, target).clamp(lo, hi)
        };

        if let (Some((a_above, _)), Some((a_below, _))) = (self.above, self.below) {
            let (b_lo, b_hi) = if a_above < a_below {
                (a_above, a_below)
            } else {
                (a_below, a_above)
            };
            if next <= b_lo || next >= b_hi {
                next = (b_lo + b_hi) / dec!(2);
            }
        }
        next.clamp(MIN_ADJUSTMENT, MAX_ADJUSTMENT)
    }

    /// Step proportional to the relative distance from target, in the
    /// direction implied by the observed slope (inverse until observed).
    fn exponential_step(&self, current: &Trial, target: Percent) -> Decimal {
        let distance = if target.is_zero() {
            Decimal::ONE
        } else {
            ((current.rate - target).abs() / target).min(Decimal::ONE)
        };
        let factor = Decimal::ONE + distance;
        let need_higher_rate = current.rate < target;
        let increase_adjustment = match self.slope_sign.unwrap_or(-1) {
            s if s > 0 => need_higher_rate,
            _ => !need_higher_rate,
        };
        if increase_adjustment {
            current.adjustment * factor
        } else {
            current.adjustment / factor
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
