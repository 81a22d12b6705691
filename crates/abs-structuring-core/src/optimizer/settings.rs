use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::calibration::nominal::{
    subordination_window, CalibrationTargets, CouponBasis, MAX_SUBORDINATION_PCT,
};
use crate::error::StructuringError;
use crate::types::{Days, Money, Percent};
use crate::waterfall::structure::Structure;
use crate::StructuringResult;

/// Base rate used when the reference curve is empty.
pub const FALLBACK_BASE_RATE: Decimal = dec!(42);
/// Reinvest rate used when the reference curve is empty.
pub const FALLBACK_REINVEST_RATE: Decimal = dec!(30);
/// Longest maturity any note may carry.
pub const MAX_MATURITY_DAYS: Days = 365;

// ---------------------------------------------------------------------------
// Nominal distribution heuristics
// ---------------------------------------------------------------------------

/// How the Class A total is split across tranches before calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NominalStrategy {
    /// Same nominal for every tranche
    Equal,
    /// Proportional to maturity
    Increasing,
    /// Proportional to 1 / maturity
    Decreasing,
    /// Middle tranches weighted 1.5 (and 1.3 either side)
    MiddleWeighted,
}

impl NominalStrategy {
    pub const ALL: [NominalStrategy; 4] = [
        NominalStrategy::Equal,
        NominalStrategy::Increasing,
        NominalStrategy::Decreasing,
        NominalStrategy::MiddleWeighted,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            NominalStrategy::Equal => "equal",
            NominalStrategy::Increasing => "increasing",
            NominalStrategy::Decreasing => "decreasing",
            NominalStrategy::MiddleWeighted => "middle_weighted",
        }
    }
}

impl fmt::Display for NominalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Reference rate curve
// ---------------------------------------------------------------------------

/// Market quote for a Class A note of a given maturity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    pub maturity_days: Days,
    pub base_rate: Percent,
    pub reinvest_rate: Percent,
}

impl RatePoint {
    pub fn new(maturity_days: Days, base_rate: Percent, reinvest_rate: Percent) -> Self {
        Self {
            maturity_days,
            base_rate,
            reinvest_rate,
        }
    }
}

/// Reference points priced by the market. Candidate tranches take the rates
/// of the point with the nearest maturity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateCurve {
    pub points: Vec<RatePoint>,
    /// Class A total that goes with this curve
    pub total_class_a_nominal: Money,
}

impl RateCurve {
    /// Two-note programme: 88 and 150 days.
    pub fn previous_model() -> Self {
        Self {
            points: vec![
                RatePoint::new(88, dec!(51.0), dec!(46.0)),
                RatePoint::new(150, dec!(50.5), dec!(42.0)),
            ],
            total_class_a_nominal: dec!(243_300_000),
        }
    }

    /// Single-note programme at 155 days.
    pub fn new_model() -> Self {
        Self {
            points: vec![RatePoint::new(155, dec!(50.75), dec!(42.0))],
            total_class_a_nominal: dec!(250_200_000),
        }
    }

    /// Point whose maturity is closest to `days`; ties go to the shorter one.
    pub fn nearest(&self, days: Days) -> Option<&RatePoint> {
        self.points
            .iter()
            .min_by_key(|p| ((p.maturity_days - days).abs(), p.maturity_days))
    }

    pub fn base_rate(&self, days: Days) -> Percent {
        self.nearest(days)
            .map_or(FALLBACK_BASE_RATE, |p| p.base_rate)
    }

    pub fn reinvest_rate(&self, days: Days) -> Percent {
        self.nearest(days)
            .map_or(FALLBACK_REINVEST_RATE, |p| p.reinvest_rate)
    }
}

impl Default for RateCurve {
    fn default() -> Self {
        Self::previous_model()
    }
}

// ---------------------------------------------------------------------------
// Genetic search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticSettings {
    pub population_size: usize,
    pub generations: usize,
    /// Class A tranche count; defaults to the number of curve points
    pub tranche_count: Option<usize>,
    /// Probability of mutating each gene group
    pub mutation_rate: f64,
    pub tournament_size: usize,
    /// Seed for reproducible runs; entropy when absent
    pub seed: Option<u64>,
}

impl GeneticSettings {
    /// Survivors carried unchanged into the next generation.
    pub fn elite_count(&self) -> usize {
        (self.population_size / 10).max(2)
    }
}

impl Default for GeneticSettings {
    fn default() -> Self {
        Self {
            population_size: 50,
            generations: 40,
            tranche_count: None,
            mutation_rate: 0.3,
            tournament_size: 3,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Optimization settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    /// Inclusive range of Class A tranche counts
    pub tranche_range: (usize, usize),
    /// Inclusive range of Class A maturities, in days
    pub maturity_range: (Days, Days),
    pub maturity_step: Days,
    pub min_maturity_gap: Days,
    /// Maturity tuples tried per tranche count
    pub max_samples: usize,
    pub target_subordination_pct: Percent,
    pub subordination_deviation: Percent,
    pub target_coupon_rate: Percent,
    pub coupon_basis: CouponBasis,
    /// Added to the last collection day to set the Class B maturity
    pub additional_days_for_class_b: Days,
    pub strategies: Vec<NominalStrategy>,
    pub max_allowed_diff: Percent,
    pub max_consecutive_failures: u32,
    pub max_calibration_iterations: u32,
    /// Minimum Class A buffer ratio, percent
    pub min_buffer: Percent,
    pub class_b_reinvest_rate: Percent,
    pub rate_curve: RateCurve,
    /// Used as-is when no candidate meets the constraints
    pub fallback: Option<Structure>,
    pub genetic: GeneticSettings,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            tranche_range: (2, 6),
            maturity_range: (32, MAX_MATURITY_DAYS),
            maturity_step: 10,
            min_maturity_gap: 15,
            max_samples: 20,
            target_subordination_pct: dec!(10),
            subordination_deviation: dec!(1.0),
            target_coupon_rate: dec!(30),
            coupon_basis: CouponBasis::Effective,
            additional_days_for_class_b: 10,
            strategies: NominalStrategy::ALL.to_vec(),
            max_allowed_diff: dec!(1.0),
            max_consecutive_failures: 10,
            max_calibration_iterations: 30,
            min_buffer: Decimal::ZERO,
            class_b_reinvest_rate: dec!(42),
            rate_curve: RateCurve::default(),
            fallback: None,
            genetic: GeneticSettings::default(),
        }
    }
}

impl OptimizationSettings {
    pub fn validate(&self) -> StructuringResult<()> {
        let (min_t, max_t) = self.tranche_range;
        if min_t == 0 || min_t > max_t {
            return Err(StructuringError::invalid(
                "tranche_range",
                "expected 1 <= min <= max",
            ));
        }
        let (lo, hi) = self.maturity_range;
        if lo <= 0 || lo > hi {
            return Err(StructuringError::invalid(
                "maturity_range",
                "expected 0 < min <= max",
            ));
        }
        if self.maturity_step <= 0 {
            return Err(StructuringError::invalid("maturity_step", "must be positive"));
        }
        if self.min_maturity_gap <= 0 {
            return Err(StructuringError::invalid(
                "min_maturity_gap",
                "must be positive",
            ));
        }
        if self.max_samples == 0 {
            return Err(StructuringError::invalid("max_samples", "must be positive"));
        }
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
        if self.rate_curve.total_class_a_nominal <= Decimal::ZERO {
            return Err(StructuringError::invalid(
                "rate_curve.total_class_a_nominal",
                "must be positive",
            ));
        }
        let g = &self.genetic;
        if g.population_size < 2 {
            return Err(StructuringError::invalid(
                "genetic.population_size",
                "at least 2 genomes are required",
            ));
        }
        if g.tournament_size == 0 {
            return Err(StructuringError::invalid(
                "genetic.tournament_size",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&g.mutation_rate) {
            return Err(StructuringError::invalid(
                "genetic.mutation_rate",
                "must be a probability in [0, 1]",
            ));
        }
        if let Some(fallback) = &self.fallback {
            fallback.validate()?;
        }
        Ok(())
    }

    /// Strategies to try, all four when none are configured.
    pub fn active_strategies(&self) -> Vec<NominalStrategy> {
        let mut s = self.strategies.clone();
        s.sort();
        s.dedup();
        if s.is_empty() {
            tracing::warn!("no nominal strategies configured, using all");
            return NominalStrategy::ALL.to_vec();
        }
        s
    }

    pub fn subordination_window(&self) -> (Percent, Percent) {
        subordination_window(self.target_subordination_pct, self.subordination_deviation)
    }

    /// Class B maturity: last collection day plus the configured margin,
    /// kept within `[1, 365]`.
    pub fn class_b_maturity(&self, last_cash_flow_day: Days) -> Days {
        (last_cash_flow_day + self.additional_days_for_class_b).clamp(1, MAX_MATURITY_DAYS)
    }

    /// Calibration targets matching these settings.
    pub fn calibration_targets(&self) -> CalibrationTargets {
        CalibrationTargets {
            target_coupon_rate: self.target_coupon_rate,
            target_subordination_pct: self.target_subordination_pct,
            subordination_deviation: self.subordination_deviation,
            min_buffer: self.min_buffer,
            max_allowed_diff: self.max_allowed_diff,
            max_iterations: self.max_calibration_iterations,
            coupon_basis: self.coupon_basis,
        }
    }

    /// Genetic tranche count: explicit, else the curve size, clamped to the
    /// tranche range.
    pub fn genetic_tranche_count(&self) -> usize {
        let (min_t, max_t) = self.tranche_range;
        self.genetic
            .tranche_count
            .unwrap_or(self.rate_curve.points.len())
            .clamp(min_t, max_t)
    }
}
