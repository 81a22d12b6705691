use rust_decimal::prelude::MathematicalOps;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::calibration::nominal::{calibrate_with, CalibrationOutcome, CalibrationTargets};
use crate::optimizer::settings::OptimizationSettings;
use crate::schedule::Schedule;
use crate::types::{Days, Money, Percent};
use crate::waterfall::allocator::{run_waterfall, WaterfallSettings, WaterfallSummary};
use crate::waterfall::structure::{Structure, TrancheSpec};
use crate::StructuringResult;

const COUPON_WEIGHT: Decimal = dec!(0.6);
const SUBORDINATION_WEIGHT: Decimal = dec!(0.4);

/// Metrics of one evaluated structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetrics {
    pub class_a_principal: Money,
    pub class_b_principal: Money,
    pub class_a_interest: Money,
    pub class_b_coupon: Money,
    pub total_principal: Money,
    pub effective_coupon_rate: Percent,
    pub direct_coupon_rate: Percent,
    /// Coupon rate on the configured basis
    pub achieved_rate: Percent,
    pub coupon_diff: Percent,
    pub subordination_pct: Percent,
    pub subordination_diff: Percent,
    pub min_buffer_actual: Percent,
    /// Total principal weighted by closeness to both targets
    pub fitness: Decimal,
}

/// Outcome of checking a candidate against the hard constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Evaluation {
    Valid { metrics: CandidateMetrics },
    Invalid { reason: String },
}

impl Evaluation {
    pub fn metrics(&self) -> Option<&CandidateMetrics> {
        match self {
            Evaluation::Valid { metrics } => Some(metrics),
            Evaluation::Invalid { .. } => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Evaluation::Valid { .. })
    }
}

/// `0.6 * exp(-coupon_diff / 2) + 0.4 * exp(-subordination_diff / 2)`
pub fn fitness_weight(coupon_diff: Percent, subordination_diff: Percent) -> Decimal {
    COUPON_WEIGHT * decay(coupon_diff) + SUBORDINATION_WEIGHT * decay(subordination_diff)
}

fn decay(diff: Decimal) -> Decimal {
    (-diff.abs() / dec!(2)).checked_exp().unwrap_or(Decimal::ZERO)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    /// (maturity, total rate, reinvest rate, nominal) per note, Class B last
    notes: Vec<(Days, Percent, Percent, Money)>,
}

impl CacheKey {
    fn of(structure: &Structure) -> Self {
        Self {
            notes: structure
                .tranches()
                .map(|t| (t.maturity_days, t.total_rate(), t.reinvest_rate, t.nominal))
                .collect(),
        }
    }
}

/// Waterfall evaluation shared by both searches, memoised per run.
pub(crate) struct Evaluator<'a> {
    schedule: &'a Schedule,
    waterfall: &'a WaterfallSettings,
    settings: &'a OptimizationSettings,
    cache: HashMap<CacheKey, WaterfallSummary>,
    hits: u64,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        schedule: &'a Schedule,
        waterfall: &'a WaterfallSettings,
        settings: &'a OptimizationSettings,
    ) -> Self {
        Self {
            schedule,
            waterfall,
            settings,
            cache: HashMap::new(),
            hits: 0,
        }
    }

    /// Distinct waterfall runs so far.
    pub fn waterfall_runs(&self) -> u64 {
        self.cache.len() as u64
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits
    }

    /// Candidate structure priced off the reference curve. Class B takes the
    /// longest Class A base rate.
    pub fn build_structure(
        &self,
        maturities: &[Days],
        nominals: &[Money],
        class_b_maturity: Days,
        class_b_nominal: Money,
    ) -> StructuringResult<Structure> {
        let curve = &self.settings.rate_curve;
        let class_a: Vec<TrancheSpec> = maturities
            .iter()
            .zip(nominals)
            .map(|(&m, &n)| {
                TrancheSpec::class_a(
                    m,
                    curve.base_rate(m),
                    Decimal::ZERO,
                    curve.reinvest_rate(m),
                    n,
                )
            })
            .collect();
        let b_base = class_a
            .last()
            .map_or(Decimal::ZERO, |t: &TrancheSpec| t.base_rate);
        let class_b = TrancheSpec::class_b(
            class_b_maturity,
            b_base,
            Decimal::ZERO,
            self.settings.class_b_reinvest_rate,
            class_b_nominal,
        );
        Structure::new(class_a, class_b)
    }

    pub fn summary(&mut self, structure: &Structure) -> StructuringResult<WaterfallSummary> {
        let key = CacheKey::of(structure);
        if let Some(s) = self.cache.get(&key) {
            self.hits += 1;
            return Ok(s.clone());
        }
        let summary = run_waterfall(self.schedule, structure, self.waterfall)?.summary;
        self.cache.insert(key, summary.clone());
        Ok(summary)
    }

    /// Calibrate Class A nominals through the memoised waterfall.
    pub fn calibrate(
        &mut self,
        structure: &Structure,
        targets: &CalibrationTargets,
    ) -> StructuringResult<CalibrationOutcome> {
        calibrate_with(structure, targets, |candidate| self.summary(candidate))
    }

    /// Metrics for a structure, constraints not applied.
    pub fn measure(&mut self, structure: &Structure) -> StructuringResult<CandidateMetrics> {
        let summary = self.summary(structure)?;
        let s = self.settings;
        let achieved_rate = s.coupon_basis.rate(&summary);
        let subordination_pct = structure.subordination_percent();
        let coupon_diff = (achieved_rate - s.target_coupon_rate).abs();
        let subordination_diff = (subordination_pct - s.target_subordination_pct).abs();
        let total_principal = summary.class_a_principal + summary.class_b_principal;
        Ok(CandidateMetrics {
            class_a_principal: summary.class_a_principal,
            class_b_principal: summary.class_b_principal,
            class_a_interest: summary.class_a_interest,
            class_b_coupon: summary.class_b_coupon,
            total_principal,
            effective_coupon_rate: summary.effective_coupon_rate,
            direct_coupon_rate: summary.direct_coupon_rate,
            achieved_rate,
            coupon_diff,
            subordination_pct,
            subordination_diff,
            min_buffer_actual: summary.min_buffer_actual,
            fitness: total_principal * fitness_weight(coupon_diff, subordination_diff),
        })
    }

    /// Measure and apply the hard constraints: buffer, subordination window
    /// and coupon distance.
    pub fn evaluate(&mut self, structure: &Structure) -> StructuringResult<Evaluation> {
        let metrics = self.measure(structure)?;
        let s = self.settings;
        let (lo, hi) = s.subordination_window();
        let reason = if metrics.min_buffer_actual < s.min_buffer {
            Some(format!(
                "minimum buffer {}% below required {}%",
                metrics.min_buffer_actual.round_dp(4),
                s.min_buffer
            ))
        } else if metrics.subordination_pct < lo || metrics.subordination_pct > hi {
            Some(format!(
                "subordination {}% outside [{}, {}]",
                metrics.subordination_pct.round_dp(4),
                lo,
                hi
            ))
        } else if metrics.coupon_diff > s.max_allowed_diff {
            Some(format!(
                "coupon {}% is {} from target",
                metrics.achieved_rate.round_dp(4),
                metrics.coupon_diff.round_dp(4)
            ))
        } else {
            None
        };
        Ok(match reason {
            Some(reason) => Evaluation::Invalid { reason },
            None => Evaluation::Valid { metrics },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::settings::{RateCurve, RatePoint};
    use crate::schedule::InstallmentRecord;
    use chrono::{Duration, NaiveDate};

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    fn schedule() -> Schedule {
        let rows = (1..=40)
            .map(|k| {
                InstallmentRecord::new(start() + Duration::days(k * 5), dec!(250_000), dec!(50_000))
            })
            .collect();
        Schedule::new(rows).unwrap()
    }

    fn settings() -> OptimizationSettings {
        OptimizationSettings {
            target_coupon_rate: dec!(60),
            rate_curve: RateCurve {
                points: vec![
                    RatePoint::new(90, dec!(40), dec!(30)),
                    RatePoint::new(180, dec!(38), dec!(30)),
                ],
                total_class_a_nominal: dec!(8_000_000),
            },
            class_b_reinvest_rate: dec!(30),
            ..Default::default()
        }
    }

    #[test]
    fn test_fitness_weight_bounds() {
        let full = fitness_weight(Decimal::ZERO, Decimal::ZERO);
        assert!((full - Decimal::ONE).abs() < dec!(0.000001));
        let w = fitness_weight(dec!(2), dec!(0));
        // 0.6 * e^-1 + 0.4
        assert!((w - dec!(0.6207)).abs() < dec!(0.0001));
        assert!(fitness_weight(dec!(1000), dec!(1000)) < dec!(0.0001));
    }

    #[test]
    fn test_build_structure_uses_curve() {
        let sched = schedule();
        let wf = WaterfallSettings::new(start());
        let s = settings();
        let ev = Evaluator::new(&sched, &wf, &s);
        let st = ev
            .build_structure(&[80, 170], &[dec!(4_000_000), dec!(4_000_000)], 210, dec!(889_000))
            .unwrap();
        assert_eq!(st.class_a[0].base_rate, dec!(40));
        assert_eq!(st.class_a[1].base_rate, dec!(38));
        assert_eq!(st.class_b.base_rate, dec!(38));
        assert_eq!(st.class_b.reinvest_rate, dec!(30));
    }

    #[test]
    fn test_cache_hits_on_repeat() {
        let sched = schedule();
        let wf = WaterfallSettings::new(start());
        let s = settings();
        let mut ev = Evaluator::new(&sched, &wf, &s);
        let st = ev
            .build_structure(&[90, 180], &[dec!(4_000_000), dec!(4_000_000)], 210, dec!(889_000))
            .unwrap();
        let a = ev.summary(&st).unwrap();
        let b = ev.summary(&st).unwrap();
        assert_eq!(a, b);
        assert_eq!(ev.waterfall_runs(), 1);
        assert_eq!(ev.cache_hits(), 1);
    }

    #[test]
    fn test_subordination_outside_window_is_invalid() {
        let sched = schedule();
        let wf = WaterfallSettings::new(start());
        let s = settings();
        let mut ev = Evaluator::new(&sched, &wf, &s);
        // 20% subordination against a 10 +/- 1 window
        let st = ev
            .build_structure(&[90, 180], &[dec!(2_000_000), dec!(2_000_000)], 210, dec!(1_000_000))
            .unwrap();
        match ev.evaluate(&st).unwrap() {
            Evaluation::Invalid { reason } => assert!(reason.contains("subordination")),
            other => panic!("expected invalid, got {:?}", other),
        }
        let m = ev.measure(&st).unwrap();
        assert_eq!(m.subordination_pct, dec!(20));
    }

    #[test]
    fn test_calibrated_structure_is_valid() {
        let sched = schedule();
        let wf = WaterfallSettings::new(start());
        let s = settings();
        let mut ev = Evaluator::new(&sched, &wf, &s);
        let st = ev
            .build_structure(&[90, 180], &[dec!(4_000_000), dec!(4_000_000)], 210, dec!(889_000))
            .unwrap();
        let out = ev.calibrate(&st, &s.calibration_targets()).unwrap();
        assert!(out.success, "{:?}", out);
        let calibrated = st.with_nominals(&out.class_a_nominals, out.class_b_nominal);
        let eval = ev.evaluate(&calibrated).unwrap();
        let m = eval.metrics().expect("valid candidate");
        assert!(m.coupon_diff <= dec!(1.0));
        assert!(m.fitness > Decimal::ZERO);
        assert!(m.fitness <= m.total_principal);
        assert!(ev.cache_hits() >= 1);
    }
}
