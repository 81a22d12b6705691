pub mod deterministic;
pub mod evaluation;
pub mod genetic;
pub mod progress;
pub mod settings;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::schedule::Schedule;
use crate::types::{with_metadata, ComputationOutput, Days, Money, Percent};
use crate::waterfall::allocator::WaterfallSettings;
use crate::waterfall::structure::{Structure, TrancheSpec};
use crate::StructuringResult;

use evaluation::{CandidateMetrics, Evaluator};
use progress::{NoopProgress, Phase, ProgressObserver, ProgressTracker, RunControl};
use settings::OptimizationSettings;

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    /// Stratified grid over tranche counts and maturities
    #[default]
    Deterministic,
    Genetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationInput {
    pub schedule: Schedule,
    pub settings: WaterfallSettings,
    #[serde(default)]
    pub method: OptimizationMethod,
    #[serde(default)]
    pub optimization: OptimizationSettings,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub method: OptimizationMethod,
    /// Winning heuristic, `genetic`, or `fallback`
    pub best_strategy: String,
    pub class_a_maturities: Vec<Days>,
    pub class_a_nominals: Vec<Money>,
    pub class_a_base_rates: Vec<Percent>,
    pub class_a_reinvest_rates: Vec<Percent>,
    pub class_b_maturity: Days,
    pub class_b_base_rate: Percent,
    pub class_b_reinvest_rate: Percent,
    pub class_b_nominal: Money,
    pub subordination_pct: Percent,
    pub effective_coupon_rate: Percent,
    pub direct_coupon_rate: Percent,
    pub min_buffer_actual: Percent,
    pub last_cash_flow_day: Days,
    pub additional_days: Days,
    pub metrics: CandidateMetrics,
    /// Best candidate of every strategy that produced one
    pub results_by_strategy: BTreeMap<String, CandidateMetrics>,
    /// Genetic search found nothing and the deterministic search ran instead
    pub fell_back: bool,
    pub waterfall_runs: u64,
    pub cache_hits: u64,
}

impl OptimizationResult {
    /// The chosen structure, ready for the waterfall.
    pub fn structure(&self) -> StructuringResult<Structure> {
        let class_a = self
            .class_a_maturities
            .iter()
            .zip(&self.class_a_base_rates)
            .zip(&self.class_a_reinvest_rates)
            .zip(&self.class_a_nominals)
            .map(|(((&m, &base), &reinvest), &nominal)| {
                TrancheSpec::class_a(m, base, Decimal::ZERO, reinvest, nominal)
            })
            .collect();
        let class_b = TrancheSpec::class_b(
            self.class_b_maturity,
            self.class_b_base_rate,
            Decimal::ZERO,
            self.class_b_reinvest_rate,
            self.class_b_nominal,
        );
        Structure::new(class_a, class_b)
    }
}

// ---------------------------------------------------------------------------
// Shared search state
// ---------------------------------------------------------------------------

/// A scored structure found during a run.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub label: String,
    pub structure: Structure,
    pub metrics: CandidateMetrics,
}

pub(crate) struct SearchOutcome {
    pub best: Candidate,
    pub by_strategy: BTreeMap<String, CandidateMetrics>,
    pub fell_back: bool,
}

/// Everything one run owns besides its progress tracker.
pub(crate) struct SearchContext<'a> {
    pub settings: &'a OptimizationSettings,
    pub evaluator: Evaluator<'a>,
    pub control: &'a RunControl,
    pub warnings: Vec<String>,
    pub last_cash_flow_day: Days,
    pub class_b_maturity: Days,
}

impl<'a> SearchContext<'a> {
    fn new(input: &'a OptimizationInput, control: &'a RunControl) -> Self {
        let settings = &input.optimization;
        let last_cash_flow_day = input.schedule.last_cash_flow_day(input.settings.start_date);
        Self {
            settings,
            evaluator: Evaluator::new(&input.schedule, &input.settings, settings),
            control,
            warnings: Vec::new(),
            last_cash_flow_day,
            class_b_maturity: settings.class_b_maturity(last_cash_flow_day),
        }
    }

    /// Longest Class A maturity that still precedes Class B.
    pub fn max_class_a_maturity(&self) -> Days {
        self.settings.maturity_range.1.min(self.class_b_maturity)
    }
}

// ---------------------------------------------------------------------------
// Main functions
// ---------------------------------------------------------------------------

/// Search for the best structure with the configured method, no progress
/// reporting and no cancellation.
pub fn optimize(input: &OptimizationInput) -> StructuringResult<ComputationOutput<OptimizationResult>> {
    optimize_with(input, &mut NoopProgress, &RunControl::default())
}

/// As [`optimize`], reporting to `observer` and honouring `control`. The
/// genetic search is seeded from `optimization.genetic.seed`, or from
/// entropy when no seed is set.
pub fn optimize_with(
    input: &OptimizationInput,
    observer: &mut dyn ProgressObserver,
    control: &RunControl,
) -> StructuringResult<ComputationOutput<OptimizationResult>> {
    let mut rng = match input.optimization.genetic.seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    optimize_with_rng(input, &mut rng, observer, control)
}

/// As [`optimize_with`] with an injected random source.
pub fn optimize_with_rng<R: Rng>(
    input: &OptimizationInput,
    rng: &mut R,
    observer: &mut dyn ProgressObserver,
    control: &RunControl,
) -> StructuringResult<ComputationOutput<OptimizationResult>> {
    let start = Instant::now();
    let mut tracker = ProgressTracker::new(observer);

    match run(input, rng, &mut tracker, control) {
        Ok((result, warnings)) => {
            tracker.complete(format!(
                "Selected {}: coupon {}%, subordination {}%",
                result.best_strategy,
                result.metrics.achieved_rate.round_dp(2),
                result.subordination_pct.round_dp(2)
            ));
            let elapsed = start.elapsed().as_micros() as u64;
            Ok(with_metadata(
                match input.method {
                    OptimizationMethod::Deterministic => {
                        "Stratified maturity grid x nominal heuristics, each calibrated to the target coupon"
                    }
                    OptimizationMethod::Genetic => {
                        "Genetic search over maturities, Class A weights and subordination"
                    }
                },
                &serde_json::json!({
                    "method": input.method,
                    "start_date": input.settings.start_date.to_string(),
                    "optimization": input.optimization,
                }),
                warnings,
                elapsed,
                result,
            ))
        }
        Err(e) => {
            tracker.fail(e.to_string());
            Err(e)
        }
    }
}

fn run<R: Rng>(
    input: &OptimizationInput,
    rng: &mut R,
    tracker: &mut ProgressTracker<'_>,
    control: &RunControl,
) -> StructuringResult<(OptimizationResult, Vec<String>)> {
    input.optimization.validate()?;
    let mut ctx = SearchContext::new(input, control);

    tracker.advance(
        Phase::Initializing,
        10,
        format!(
            "Last cash flow day {}, Class B maturity {}, target coupon {}%, subordination {}+/-{}%",
            ctx.last_cash_flow_day,
            ctx.class_b_maturity,
            ctx.settings.target_coupon_rate,
            ctx.settings.target_subordination_pct,
            ctx.settings.subordination_deviation
        ),
    );

    let outcome = match input.method {
        OptimizationMethod::Deterministic => deterministic::search(&mut ctx, tracker)?,
        OptimizationMethod::Genetic => genetic::search(&mut ctx, tracker, rng)?,
    };

    tracker.advance(
        Phase::Finalizing,
        90,
        format!("Preparing result for {}", outcome.best.label),
    );

    let result = build_result(input.method, &ctx, outcome);
    Ok((result, ctx.warnings))
}

fn build_result(
    method: OptimizationMethod,
    ctx: &SearchContext<'_>,
    outcome: SearchOutcome,
) -> OptimizationResult {
    let SearchOutcome {
        best,
        by_strategy,
        fell_back,
    } = outcome;
    let s = &best.structure;
    OptimizationResult {
        method,
        best_strategy: best.label,
        class_a_maturities: s.class_a_maturities(),
        class_a_nominals: s.class_a_nominals(),
        class_a_base_rates: s.class_a.iter().map(|t| t.base_rate).collect(),
        class_a_reinvest_rates: s.class_a.iter().map(|t| t.reinvest_rate).collect(),
        class_b_maturity: s.class_b.maturity_days,
        class_b_base_rate: s.class_b.base_rate,
        class_b_reinvest_rate: s.class_b.reinvest_rate,
        class_b_nominal: s.class_b.nominal,
        subordination_pct: best.metrics.subordination_pct,
        effective_coupon_rate: best.metrics.effective_coupon_rate,
        direct_coupon_rate: best.metrics.direct_coupon_rate,
        min_buffer_actual: best.metrics.min_buffer_actual,
        last_cash_flow_day: ctx.last_cash_flow_day,
        additional_days: ctx.settings.additional_days_for_class_b,
        metrics: best.metrics,
        results_by_strategy: by_strategy,
        fell_back,
        waterfall_runs: ctx.evaluator.waterfall_runs(),
        cache_hits: ctx.evaluator.cache_hits(),
    }
}
