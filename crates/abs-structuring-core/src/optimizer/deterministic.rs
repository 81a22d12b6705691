use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use crate::calibration::nominal::{class_b_for_target, NOMINAL_LOT};
use crate::error::StructuringError;
use crate::optimizer::evaluation::{CandidateMetrics, Evaluation};
use crate::optimizer::progress::{Phase, ProgressTracker};
use crate::optimizer::settings::{NominalStrategy, OptimizationSettings};
use crate::optimizer::{Candidate, SearchContext, SearchOutcome};
use crate::types::{round_to_unit, Days, Money};
use crate::StructuringResult;

/// A strategy is "near target" inside these distances.
const NEAR_COUPON_DIFF: Decimal = dec!(0.3);
const NEAR_SUBORDINATION_DIFF: Decimal = dec!(0.5);
/// Near-target strategies needed before a tranche count stops early.
const NEAR_TARGET_QUORUM: usize = 2;

const SEARCH_START_PCT: usize = 20;
const SEARCH_SPAN_PCT: usize = 60;

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Grid search: every tranche count, a stratified sample of maturity tuples,
/// every nominal heuristic, each calibrated and then scored.
pub(crate) fn search(
    ctx: &mut SearchContext<'_>,
    tracker: &mut ProgressTracker<'_>,
) -> StructuringResult<SearchOutcome> {
    let s = ctx.settings;
    let strategies = s.active_strategies();
    let (min_t, max_t) = s.tranche_range;
    let grid = maturity_grid(s.maturity_range.0, ctx.max_class_a_maturity(), s.maturity_step);
    let total_a = s.rate_curve.total_class_a_nominal;
    let class_b = class_b_for_target(total_a, s.target_subordination_pct);
    let targets = s.calibration_targets();
    let counts: Vec<usize> = (min_t..=max_t).collect();

    tracker.advance(
        Phase::Searching,
        SEARCH_START_PCT as u8,
        format!(
            "Searching {}-{} Class A tranches over {} maturities, strategies: {}",
            min_t,
            max_t,
            grid.len(),
            strategies
                .iter()
                .map(|st| st.label())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    );

    let mut best: BTreeMap<NominalStrategy, Candidate> = BTreeMap::new();
    let mut interrupted = false;

    'counts: for (ci, &n) in counts.iter().enumerate() {
        let tuples = sampled_maturity_tuples(&grid, n, s.min_maturity_gap, s.max_samples);
        if tuples.is_empty() {
            tracing::debug!(tranches = n, "no maturity tuple fits the grid");
            continue;
        }
        tracker.report(
            progress_pct(ci, 0, counts.len(), tuples.len()),
            format!("Testing {} maturity tuples with {} Class A tranches", tuples.len(), n),
        );

        let mut consecutive_failures: u32 = 0;
        for (ti, maturities) in tuples.iter().enumerate() {
            if ctx.control.should_stop() {
                interrupted = true;
                break 'counts;
            }

            for &strategy in &strategies {
                let nominals = distribute_nominals(strategy, maturities, total_a);
                let initial = match ctx.evaluator.build_structure(
                    maturities,
                    &nominals,
                    ctx.class_b_maturity,
                    class_b,
                ) {
                    Ok(st) => st,
                    Err(e) => {
                        tracing::debug!(?maturities, %strategy, error = %e, "skipped candidate");
                        consecutive_failures += 1;
                        continue;
                    }
                };

                let outcome = ctx.evaluator.calibrate(&initial, &targets)?;
                let structure = if outcome.success {
                    consecutive_failures = 0;
                    initial.with_nominals(&outcome.class_a_nominals, outcome.class_b_nominal)
                } else {
                    consecutive_failures += 1;
                    initial
                };

                match ctx.evaluator.evaluate(&structure)? {
                    Evaluation::Valid { metrics } => {
                        if is_better(&metrics, best.get(&strategy).map(|c| &c.metrics), s) {
                            consecutive_failures = 0;
                            tracing::debug!(
                                %strategy,
                                ?maturities,
                                coupon = %metrics.achieved_rate.round_dp(4),
                                subordination = %metrics.subordination_pct.round_dp(4),
                                fitness = %metrics.fitness.round_dp(2),
                                "better candidate"
                            );
                            best.insert(
                                strategy,
                                Candidate {
                                    label: strategy.label().to_string(),
                                    structure,
                                    metrics,
                                },
                            );
                        }
                    }
                    Evaluation::Invalid { reason } => {
                        tracing::trace!(%strategy, ?maturities, %reason, "rejected candidate");
                    }
                }

                if fast_fail(consecutive_failures, s) {
                    break;
                }
            }

            if fast_fail(consecutive_failures, s) {
                tracing::debug!(
                    tranches = n,
                    failures = consecutive_failures,
                    "abandoning tranche count after consecutive calibration failures"
                );
                break;
            }
            if near_target_count(&best) >= NEAR_TARGET_QUORUM && ti > tuples.len() / 4 {
                tracker.report(
                    progress_pct(ci, ti + 1, counts.len(), tuples.len()),
                    format!(
                        "{} strategies near target with {} tranches, moving on",
                        near_target_count(&best),
                        n
                    ),
                );
                break;
            }
            if ti % 5 == 4 {
                tracker.report(
                    progress_pct(ci, ti + 1, counts.len(), tuples.len()),
                    format!("{} tranches: tuple {}/{}", n, ti + 1, tuples.len()),
                );
            }
        }
    }

    if interrupted {
        if best.is_empty() {
            return Err(StructuringError::Cancelled);
        }
        ctx.warnings.push(format!(
            "Search interrupted after {} waterfall runs; returning the best structure found so far",
            ctx.evaluator.waterfall_runs()
        ));
    }

    tracker.advance(Phase::Finalizing, 85, "Comparing strategies");

    let mut by_strategy: BTreeMap<String, CandidateMetrics> = best
        .values()
        .map(|c| (c.label.clone(), c.metrics.clone()))
        .collect();

    if let Some(winner) = select_winner(best.values(), s) {
        return Ok(SearchOutcome {
            best: winner.clone(),
            by_strategy,
            fell_back: false,
        });
    }

    match &s.fallback {
        Some(fallback) => {
            let metrics = ctx.evaluator.measure(fallback)?;
            ctx.warnings.push(
                "No candidate met the buffer, subordination and coupon constraints; using the fallback structure"
                    .into(),
            );
            by_strategy.insert("fallback".into(), metrics.clone());
            Ok(SearchOutcome {
                best: Candidate {
                    label: "fallback".into(),
                    structure: fallback.clone(),
                    metrics,
                },
                by_strategy,
                fell_back: false,
            })
        }
        None => Err(StructuringError::OptimizationInfeasible(format!(
            "no structure with {}-{} Class A tranches reached coupon {}% +/- {} at {}% +/- {} subordination",
            min_t,
            max_t,
            s.target_coupon_rate,
            s.max_allowed_diff,
            s.target_subordination_pct,
            s.subordination_deviation
        ))),
    }
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// `lo, lo + step, ...` up to `hi` inclusive.
pub fn maturity_grid(lo: Days, hi: Days, step: Days) -> Vec<Days> {
    if step <= 0 || lo > hi {
        return Vec::new();
    }
    (0..)
        .map(|k| lo + k * step)
        .take_while(|m| *m <= hi)
        .collect()
}

/// Ascending `count`-tuples from `grid` with at least `min_gap` days between
/// neighbours. Above `max_samples` tuples, sort by mean maturity and take
/// evenly spaced picks.
pub fn sampled_maturity_tuples(
    grid: &[Days],
    count: usize,
    min_gap: Days,
    max_samples: usize,
) -> Vec<Vec<Days>> {
    if count == 0 || count > grid.len() {
        return Vec::new();
    }
    // Tuples are stored flat as grid indices; the full set can run to
    // hundreds of thousands for six tranches.
    let mut flat: Vec<u32> = Vec::new();
    let mut current: Vec<usize> = Vec::with_capacity(count);
    collect_tuples(grid, count, min_gap, 0, &mut current, &mut flat);

    let total = flat.len() / count;
    let tuple_at = |i: usize| -> Vec<Days> {
        flat[i * count..(i + 1) * count]
            .iter()
            .map(|&g| grid[g as usize])
            .collect()
    };

    if total <= max_samples {
        return (0..total).map(tuple_at).collect();
    }
    let sum_at = |i: usize| -> Days {
        flat[i * count..(i + 1) * count]
            .iter()
            .map(|&g| grid[g as usize])
            .sum()
    };
    let mut order: Vec<usize> = (0..total).collect();
    order.sort_by_key(|&i| sum_at(i));
    let step = total / max_samples;
    (0..max_samples).map(|k| tuple_at(order[k * step])).collect()
}

fn collect_tuples(
    grid: &[Days],
    count: usize,
    min_gap: Days,
    from: usize,
    current: &mut Vec<usize>,
    out: &mut Vec<u32>,
) {
    let remaining = count - current.len();
    if grid.len() < from + remaining {
        return;
    }
    for idx in from..=grid.len() - remaining {
        if let Some(&last) = current.last() {
            if grid[idx] - grid[last] < min_gap {
                continue;
            }
        }
        current.push(idx);
        if current.len() == count {
            out.extend(current.iter().map(|&i| i as u32));
        } else {
            collect_tuples(grid, count, min_gap, idx + 1, current, out);
        }
        current.pop();
    }
}

/// Split `total` across tranches by heuristic, in round lots; the last
/// tranche absorbs the rounding residual so the sum is exact.
pub fn distribute_nominals(strategy: NominalStrategy, maturities: &[Days], total: Money) -> Vec<Money> {
    let n = maturities.len();
    if n == 0 {
        return Vec::new();
    }
    let weights: Vec<Decimal> = match strategy {
        NominalStrategy::Equal => vec![Decimal::ONE; n],
        NominalStrategy::Increasing => maturities.iter().map(|&m| Decimal::from(m)).collect(),
        NominalStrategy::Decreasing => maturities
            .iter()
            .map(|&m| {
                if m > 0 {
                    Decimal::ONE / Decimal::from(m)
                } else {
                    Decimal::ZERO
                }
            })
            .collect(),
        NominalStrategy::MiddleWeighted => middle_weights(n),
    };
    let weight_sum: Decimal = weights.iter().copied().sum();
    let count = Decimal::from(n as u64);

    let raw: Vec<Money> = if weight_sum.is_zero() {
        vec![total / count; n]
    } else {
        weights.iter().map(|w| total * *w / weight_sum).collect()
    };
    let rounded: Vec<Money> = raw
        .iter()
        .map(|v| round_to_unit(*v, NOMINAL_LOT, Decimal::ZERO))
        .collect();
    let adjustment = (total - rounded.iter().copied().sum::<Money>()) / count;
    let mut nominals: Vec<Money> = rounded
        .iter()
        .map(|v| round_to_unit(*v + adjustment, NOMINAL_LOT, Decimal::ZERO))
        .collect();
    let residual = total - nominals.iter().copied().sum::<Money>();
    nominals[n - 1] += residual;
    nominals
}

/// 1.5 on the middle tranche and 1.3 either side (four or more tranches);
/// flat below three.
fn middle_weights(n: usize) -> Vec<Decimal> {
    let mut w = vec![Decimal::ONE; n];
    if n >= 3 {
        let mid = n / 2;
        w[mid] = dec!(1.5);
        if n > 3 {
            w[mid - 1] = dec!(1.3);
            w[mid + 1] = dec!(1.3);
        }
    }
    w
}

fn fast_fail(consecutive_failures: u32, s: &OptimizationSettings) -> bool {
    s.max_consecutive_failures > 0 && consecutive_failures >= s.max_consecutive_failures
}

/// Whether `c` replaces the incumbent best of its strategy:
/// comparable on both distances and fitter; or inside the hard limits and
/// at least 15% fitter; or 30% closer on one distance while keeping 90% of
/// the fitness.
fn is_better(
    c: &CandidateMetrics,
    incumbent: Option<&CandidateMetrics>,
    s: &OptimizationSettings,
) -> bool {
    let b = match incumbent {
        Some(b) => b,
        None => return c.fitness > Decimal::ZERO,
    };
    if c.coupon_diff <= b.coupon_diff * dec!(1.1)
        && c.subordination_diff <= b.subordination_diff * dec!(1.1)
    {
        return c.fitness > b.fitness;
    }
    if c.coupon_diff <= s.max_allowed_diff
        && c.subordination_diff <= s.subordination_deviation
        && c.fitness > b.fitness * dec!(1.15)
    {
        return true;
    }
    (c.coupon_diff < b.coupon_diff * dec!(0.7)
        || c.subordination_diff < b.subordination_diff * dec!(0.7))
        && c.fitness > b.fitness * dec!(0.9)
}

fn near_target_count(best: &BTreeMap<NominalStrategy, Candidate>) -> usize {
    best.values()
        .filter(|c| {
            c.metrics.coupon_diff <= NEAR_COUPON_DIFF
                && c.metrics.subordination_diff <= NEAR_SUBORDINATION_DIFF
        })
        .count()
}

/// Smallest `0.6 * coupon_diff / target + 0.4 * subordination_diff / target`,
/// ties to the larger total principal.
fn select_winner<'c>(
    candidates: impl Iterator<Item = &'c Candidate>,
    s: &OptimizationSettings,
) -> Option<&'c Candidate> {
    let score = |m: &CandidateMetrics| {
        m.coupon_diff / s.target_coupon_rate * dec!(0.6)
            + m.subordination_diff / s.target_subordination_pct * dec!(0.4)
    };
    candidates.min_by(|a, b| {
        score(&a.metrics)
            .cmp(&score(&b.metrics))
            .then_with(|| b.metrics.total_principal.cmp(&a.metrics.total_principal))
    })
}

fn progress_pct(count_idx: usize, tuple_idx: usize, counts: usize, tuples: usize) -> u8 {
    let per_count = SEARCH_SPAN_PCT / counts.max(1);
    let within = per_count * tuple_idx / tuples.max(1);
    (SEARCH_START_PCT + count_idx * per_count + within).min(SEARCH_START_PCT + SEARCH_SPAN_PCT) as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waterfall::structure::{Structure, TrancheSpec};
    use pretty_assertions::assert_eq;

    fn metrics(coupon_diff: Decimal, sub_diff: Decimal, fitness: Decimal) -> CandidateMetrics {
        CandidateMetrics {
            class_a_principal: dec!(900),
            class_b_principal: dec!(100),
            class_a_interest: dec!(0),
            class_b_coupon: dec!(0),
            total_principal: dec!(1000),
            effective_coupon_rate: dec!(30),
            direct_coupon_rate: dec!(15),
            achieved_rate: dec!(30),
            coupon_diff,
            subordination_pct: dec!(10),
            subordination_diff: sub_diff,
            min_buffer_actual: dec!(1),
            fitness,
        }
    }

    // -----------------------------------------------------------------------
    // Test 1: Grid is inclusive of the upper bound when it lands on a step
    // -----------------------------------------------------------------------
    #[test]
    fn test_maturity_grid() {
        assert_eq!(maturity_grid(30, 60, 10), vec![30, 40, 50, 60]);
        assert_eq!(maturity_grid(32, 365, 10).len(), 34);
        assert!(maturity_grid(100, 50, 10).is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 2: Tuples respect the minimum gap
    // -----------------------------------------------------------------------
    #[test]
    fn test_tuples_respect_gap() {
        let tuples = sampled_maturity_tuples(&[30, 40, 50, 60], 2, 15, 20);
        assert_eq!(tuples, vec![vec![30, 50], vec![30, 60], vec![40, 60]]);
    }

    // -----------------------------------------------------------------------
    // Test 3: Stratified sample sorted by mean, evenly spaced
    // -----------------------------------------------------------------------
    #[test]
    fn test_stratified_sample() {
        let tuples = sampled_maturity_tuples(&[30, 40, 50, 60], 2, 15, 2);
        assert_eq!(tuples, vec![vec![30, 50], vec![30, 60]]);

        let grid = maturity_grid(32, 365, 10);
        let sample = sampled_maturity_tuples(&grid, 4, 15, 20);
        assert_eq!(sample.len(), 20);
        let means: Vec<Days> = sample.iter().map(|t| t.iter().sum::<Days>()).collect();
        assert!(means.windows(2).all(|w| w[0] <= w[1]));
        for t in &sample {
            assert!(t.windows(2).all(|w| w[1] - w[0] >= 15));
        }
    }

    // -----------------------------------------------------------------------
    // Test 4: More tranches than grid points yields nothing
    // -----------------------------------------------------------------------
    #[test]
    fn test_no_tuples_when_grid_too_small() {
        assert!(sampled_maturity_tuples(&[30, 40], 3, 5, 20).is_empty());
        assert!(sampled_maturity_tuples(&[30, 40, 50], 3, 15, 20).is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 5: Nominal heuristics sum to the total in round lots
    // -----------------------------------------------------------------------
    #[test]
    fn test_equal_distribution_residual_on_last() {
        let n = distribute_nominals(NominalStrategy::Equal, &[60, 120, 180], dec!(1_000_000));
        assert_eq!(n, vec![dec!(333_000), dec!(333_000), dec!(334_000)]);
    }

    #[test]
    fn test_increasing_and_decreasing() {
        let inc = distribute_nominals(NominalStrategy::Increasing, &[100, 300], dec!(1_000_000));
        assert_eq!(inc, vec![dec!(250_000), dec!(750_000)]);
        let dec_ = distribute_nominals(NominalStrategy::Decreasing, &[100, 300], dec!(1_000_000));
        assert_eq!(dec_, vec![dec!(750_000), dec!(250_000)]);
    }

    #[test]
    fn test_middle_weighted() {
        let n = distribute_nominals(
            NominalStrategy::MiddleWeighted,
            &[40, 80, 120, 160],
            dec!(5_100_000),
        );
        assert_eq!(
            n,
            vec![dec!(1_000_000), dec!(1_300_000), dec!(1_500_000), dec!(1_300_000)]
        );
        // Two tranches fall back to an equal split
        let two = distribute_nominals(NominalStrategy::MiddleWeighted, &[40, 80], dec!(2_000_000));
        assert_eq!(two, vec![dec!(1_000_000), dec!(1_000_000)]);
    }

    #[test]
    fn test_distribution_sums_exactly() {
        for strategy in NominalStrategy::ALL {
            let n = distribute_nominals(strategy, &[37, 88, 150, 222, 301], dec!(243_300_000));
            assert_eq!(n.iter().copied().sum::<Money>(), dec!(243_300_000));
        }
    }

    // -----------------------------------------------------------------------
    // Test 6: Three-clause comparison
    // -----------------------------------------------------------------------
    #[test]
    fn test_first_candidate_accepted() {
        let s = OptimizationSettings::default();
        assert!(is_better(&metrics(dec!(0.5), dec!(0.5), dec!(900)), None, &s));
    }

    #[test]
    fn test_comparable_needs_higher_fitness() {
        let s = OptimizationSettings::default();
        let inc = metrics(dec!(0.5), dec!(0.5), dec!(900));
        assert!(is_better(&metrics(dec!(0.52), dec!(0.5), dec!(901)), Some(&inc), &s));
        assert!(!is_better(&metrics(dec!(0.52), dec!(0.5), dec!(899)), Some(&inc), &s));
    }

    #[test]
    fn test_much_closer_on_one_distance() {
        let s = OptimizationSettings::default();
        let inc = metrics(dec!(0.5), dec!(0.1), dec!(900));
        // sub diff worse than 1.1x, coupon diff less than 0.7x, fitness above 90%
        let c = metrics(dec!(0.2), dec!(0.4), dec!(850));
        assert!(is_better(&c, Some(&inc), &s));
        let weak = metrics(dec!(0.2), dec!(0.4), dec!(800));
        assert!(!is_better(&weak, Some(&inc), &s));
    }

    #[test]
    fn test_significantly_fitter_within_limits() {
        let s = OptimizationSettings::default();
        let inc = metrics(dec!(0.1), dec!(0.1), dec!(800));
        let c = metrics(dec!(0.9), dec!(0.9), dec!(1000));
        assert!(is_better(&c, Some(&inc), &s));
    }

    // -----------------------------------------------------------------------
    // Test 7: Winner by normalised distance, ties to larger principal
    // -----------------------------------------------------------------------
    #[test]
    fn test_select_winner() {
        let s = OptimizationSettings::default();
        let mk = |label: &str, cd: Decimal, sd: Decimal, principal: Decimal| {
            let mut m = metrics(cd, sd, dec!(1));
            m.total_principal = principal;
            Candidate {
                label: label.into(),
                structure: Structure::new(
                    vec![TrancheSpec::class_a(90, dec!(40), dec!(0), dec!(30), dec!(900))],
                    TrancheSpec::class_b(100, dec!(0), dec!(0), dec!(30), dec!(100)),
                )
                .unwrap(),
                metrics: m,
            }
        };
        let cands = vec![
            mk("equal", dec!(0.6), dec!(0.2), dec!(1000)),
            mk("increasing", dec!(0.3), dec!(0.2), dec!(900)),
            mk("decreasing", dec!(0.3), dec!(0.2), dec!(950)),
        ];
        let w = select_winner(cands.iter(), &s).unwrap();
        assert_eq!(w.label, "decreasing");
        assert!(select_winner(Vec::<Candidate>::new().iter(), &s).is_none());
    }

    #[test]
    fn test_progress_pct_within_search_span() {
        assert_eq!(progress_pct(0, 0, 5, 20), 20);
        assert_eq!(progress_pct(4, 20, 5, 20), 80);
        assert!(progress_pct(2, 10, 5, 20) > progress_pct(2, 0, 5, 20));
    }
}
