//! Genetic search over Class A maturities, Class A weights and the
//! subordination level.
//!
//! Each genome is calibrated to the target coupon before it is scored, so
//! evolution only has to find the maturity profile, the nominal mix and the
//! Class B share. Randomness comes from the caller's [`Rng`]; identical
//! seeds and inputs reproduce the same run.

use rand::seq::index;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use crate::calibration::nominal::{class_b_for_target, CalibrationTargets, NOMINAL_LOT};
use crate::error::StructuringError;
use crate::optimizer::deterministic;
use crate::optimizer::evaluation::Evaluation;
use crate::optimizer::progress::{Phase, ProgressTracker};
use crate::optimizer::settings::GeneticSettings;
use crate::optimizer::{Candidate, SearchContext, SearchOutcome};
use crate::types::{round_to_unit, Days, Money, Percent};
use crate::StructuringResult;

/// First maturity is drawn from `[min, min + 60]`.
const FIRST_MATURITY_SPAN: Days = 60;
/// Largest gap drawn between neighbouring maturities.
const MAX_MATURITY_STEP: Days = 120;
const WEIGHT_FLOOR: Decimal = dec!(0.1);
const WEIGHT_CAP: Decimal = dec!(0.4);
const WEIGHT_JITTER: Decimal = dec!(0.1);
/// Fitness of genomes that fail a constraint; they stay selectable.
const INVALID_FITNESS: Decimal = dec!(-1);
const EXCELLENT_COUPON_DIFF: Decimal = dec!(0.2);
const EXCELLENT_SUBORDINATION_DIFF: Decimal = dec!(0.5);

const EVOLVE_START_PCT: usize = 25;
const EVOLVE_SPAN_PCT: usize = 50;

pub const GENETIC_LABEL: &str = "genetic";

// ---------------------------------------------------------------------------
// Genome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Genome {
    pub maturities: Vec<Days>,
    /// Class A shares, summing to one
    pub weights: Vec<Decimal>,
    pub subordination_pct: Percent,
}

/// Limits every genome must respect.
#[derive(Debug, Clone)]
pub(crate) struct Bounds {
    pub tranches: usize,
    pub min_maturity: Days,
    pub max_maturity: Days,
    pub min_gap: Days,
    pub sub_lo: Percent,
    pub sub_hi: Percent,
    pub deviation: Percent,
}

impl Bounds {
    fn feasible(&self) -> bool {
        self.tranches > 0
            && self.min_maturity + self.min_gap * (self.tranches as Days - 1) <= self.max_maturity
    }

    fn admits(&self, g: &Genome) -> bool {
        g.maturities.len() == self.tranches
            && g.weights.len() == self.tranches
            && g.maturities.first().map_or(false, |&m| m >= self.min_maturity)
            && g.maturities.last().map_or(false, |&m| m <= self.max_maturity)
            && g.maturities.windows(2).all(|w| w[1] - w[0] >= self.min_gap)
            && g.weights.iter().all(|w| *w > Decimal::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

pub(crate) fn search<R: Rng>(
    ctx: &mut SearchContext<'_>,
    tracker: &mut ProgressTracker<'_>,
    rng: &mut R,
) -> StructuringResult<SearchOutcome> {
    let s = ctx.settings;
    let g = &s.genetic;
    let (sub_lo, sub_hi) = s.subordination_window();
    let bounds = Bounds {
        tranches: s.genetic_tranche_count(),
        min_maturity: s.maturity_range.0,
        max_maturity: ctx.max_class_a_maturity(),
        min_gap: s.min_maturity_gap,
        sub_lo,
        sub_hi,
        deviation: s.subordination_deviation,
    };
    let total_a = s.rate_curve.total_class_a_nominal;

    tracker.advance(
        Phase::Evolving,
        20,
        format!(
            "Population {}, {} generations, {} Class A tranches, subordination {}-{}%",
            g.population_size, g.generations, bounds.tranches, sub_lo, sub_hi
        ),
    );

    if !bounds.feasible() {
        return fall_back(
            ctx,
            tracker,
            format!(
                "{} maturities {} days apart do not fit in [{}, {}]",
                bounds.tranches, bounds.min_gap, bounds.min_maturity, bounds.max_maturity
            ),
        );
    }

    let mut population: Vec<Genome> = (0..g.population_size)
        .map(|_| random_genome(rng, &bounds))
        .collect();
    let mut best: Option<Candidate> = None;
    let mut interrupted = false;

    for generation in 0..g.generations {
        if ctx.control.should_stop() {
            interrupted = true;
            break;
        }

        let mut fitness: Vec<Decimal> = Vec::with_capacity(population.len());
        let mut valid = 0usize;
        for genome in &population {
            let (f, candidate) = score(ctx, genome, &bounds, total_a)?;
            if let Some(c) = candidate {
                valid += 1;
                if best
                    .as_ref()
                    .map_or(true, |b| c.metrics.fitness > b.metrics.fitness)
                {
                    tracing::debug!(
                        generation,
                        fitness = %c.metrics.fitness.round_dp(2),
                        coupon = %c.metrics.achieved_rate.round_dp(4),
                        subordination = %c.metrics.subordination_pct.round_dp(4),
                        "better genome"
                    );
                    best = Some(c);
                }
            }
            fitness.push(f);
        }

        tracker.report(
            (EVOLVE_START_PCT + (generation + 1) * EVOLVE_SPAN_PCT / g.generations.max(1)) as u8,
            format!(
                "Generation {}/{}: {} valid, best fitness {}",
                generation + 1,
                g.generations,
                valid,
                best.as_ref()
                    .map_or("none".to_string(), |b| b.metrics.fitness.round_dp(2).to_string())
            ),
        );

        if best.as_ref().map_or(false, |b| {
            b.metrics.coupon_diff < EXCELLENT_COUPON_DIFF
                && b.metrics.subordination_diff < EXCELLENT_SUBORDINATION_DIFF
        }) {
            tracing::info!(generation = generation + 1, "excellent genome found, stopping early");
            break;
        }

        population = next_generation(rng, &population, &fitness, &bounds, g);
    }

    if interrupted {
        if best.is_none() {
            return Err(StructuringError::Cancelled);
        }
        ctx.warnings.push(
            "Evolution interrupted; returning the best structure found so far".into(),
        );
    }

    match best {
        Some(c) if c.metrics.fitness > Decimal::ZERO => {
            let mut by_strategy = BTreeMap::new();
            by_strategy.insert(GENETIC_LABEL.to_string(), c.metrics.clone());
            Ok(SearchOutcome {
                best: c,
                by_strategy,
                fell_back: false,
            })
        }
        _ => fall_back(
            ctx,
            tracker,
            format!("no valid genome in {} generations", g.generations),
        ),
    }
}

fn fall_back(
    ctx: &mut SearchContext<'_>,
    tracker: &mut ProgressTracker<'_>,
    reason: String,
) -> StructuringResult<SearchOutcome> {
    tracing::warn!(%reason, "genetic search failed, running deterministic search");
    ctx.warnings.push(format!(
        "Genetic search fell back to the deterministic search: {}",
        reason
    ));
    tracker.report(0, "Falling back to the deterministic search");
    let mut outcome = deterministic::search(ctx, tracker)?;
    outcome.fell_back = true;
    Ok(outcome)
}

/// Calibrate and evaluate one genome. Invalid genomes score
/// [`INVALID_FITNESS`] and carry no candidate.
fn score(
    ctx: &mut SearchContext<'_>,
    genome: &Genome,
    bounds: &Bounds,
    total_a: Money,
) -> StructuringResult<(Decimal, Option<Candidate>)> {
    if !bounds.admits(genome) {
        return Ok((INVALID_FITNESS, None));
    }
    let nominals = genome_nominals(genome, total_a);
    let class_b = class_b_for_target(nominals.iter().copied().sum(), genome.subordination_pct);
    let initial = match ctx.evaluator.build_structure(
        &genome.maturities,
        &nominals,
        ctx.class_b_maturity,
        class_b,
    ) {
        Ok(st) => st,
        Err(_) => return Ok((INVALID_FITNESS, None)),
    };

    // Calibrate around the genome's own subordination level.
    let targets = CalibrationTargets {
        target_subordination_pct: genome.subordination_pct,
        ..ctx.settings.calibration_targets()
    };
    let outcome = ctx.evaluator.calibrate(&initial, &targets)?;
    let structure = if outcome.success {
        initial.with_nominals(&outcome.class_a_nominals, outcome.class_b_nominal)
    } else {
        initial
    };

    Ok(match ctx.evaluator.evaluate(&structure)? {
        Evaluation::Valid { metrics } => (
            metrics.fitness,
            Some(Candidate {
                label: GENETIC_LABEL.to_string(),
                structure,
                metrics,
            }),
        ),
        Evaluation::Invalid { .. } => (INVALID_FITNESS, None),
    })
}

fn genome_nominals(genome: &Genome, total_a: Money) -> Vec<Money> {
    genome
        .weights
        .iter()
        .map(|w| round_to_unit(*w * total_a, NOMINAL_LOT, NOMINAL_LOT))
        .collect()
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn next_generation<R: Rng>(
    rng: &mut R,
    population: &[Genome],
    fitness: &[Decimal],
    bounds: &Bounds,
    g: &GeneticSettings,
) -> Vec<Genome> {
    let mut order: Vec<usize> = (0..population.len()).collect();
    order.sort_by(|&a, &b| fitness[b].cmp(&fitness[a]));

    let mut next: Vec<Genome> = order
        .iter()
        .take(g.elite_count().min(g.population_size))
        .map(|&i| population[i].clone())
        .collect();

    while next.len() < g.population_size {
        let p1 = tournament(rng, population, fitness, g.tournament_size);
        let p2 = tournament(rng, population, fitness, g.tournament_size);
        let mut child = crossover(rng, p1, p2, bounds);
        mutate(rng, &mut child, bounds, g.mutation_rate);
        next.push(child);
    }
    next
}

fn tournament<'p, R: Rng>(
    rng: &mut R,
    population: &'p [Genome],
    fitness: &[Decimal],
    size: usize,
) -> &'p Genome {
    let k = size.min(population.len()).max(1);
    let winner = index::sample(rng, population.len(), k)
        .into_iter()
        .max_by_key(|&i| fitness[i])
        .unwrap_or(0);
    &population[winner]
}

pub(crate) fn random_genome<R: Rng>(rng: &mut R, bounds: &Bounds) -> Genome {
    let n = bounds.tranches;
    let mut maturities: Vec<Days> = Vec::with_capacity(n);
    // Leave room for the remaining tranches at the minimum gap.
    let room = |j: usize| bounds.max_maturity - bounds.min_gap * (n - 1 - j) as Days;
    let first_hi = (bounds.min_maturity + FIRST_MATURITY_SPAN)
        .min(room(0))
        .max(bounds.min_maturity);
    maturities.push(rng.gen_range(bounds.min_maturity..=first_hi));
    for j in 1..n {
        let prev = maturities[j - 1];
        let hi = room(j).min(prev + MAX_MATURITY_STEP);
        let lo = (prev + bounds.min_gap).min(hi);
        maturities.push(rng.gen_range(lo..=hi));
    }

    let weights = normalise(
        (0..n)
            .map(|_| Decimal::new(rng.gen_range(1..=1_000_000), 6))
            .collect(),
    );
    let subordination_pct = uniform(rng, bounds.sub_lo, bounds.sub_hi);

    Genome {
        maturities,
        weights,
        subordination_pct,
    }
}

pub(crate) fn crossover<R: Rng>(rng: &mut R, p1: &Genome, p2: &Genome, bounds: &Bounds) -> Genome {
    let mut maturities: Vec<Days> = p1
        .maturities
        .iter()
        .zip(&p2.maturities)
        .map(|(&a, &b)| if rng.gen_bool(0.5) { a } else { b })
        .collect();
    maturities.sort_unstable();
    enforce_gap(&mut maturities, bounds.min_gap);

    let weights = normalise(
        p1.weights
            .iter()
            .zip(&p2.weights)
            .map(|(a, b)| (*a + *b) / dec!(2))
            .collect(),
    );

    let subordination_pct = if rng.gen_bool(0.5) {
        let w = unit(rng);
        p1.subordination_pct * w + p2.subordination_pct * (Decimal::ONE - w)
    } else if rng.gen_bool(0.5) {
        p1.subordination_pct
    } else {
        p2.subordination_pct
    };

    Genome {
        maturities,
        weights,
        subordination_pct,
    }
}

pub(crate) fn mutate<R: Rng>(rng: &mut R, genome: &mut Genome, bounds: &Bounds, rate: f64) {
    let n = genome.maturities.len();
    if n == 0 {
        return;
    }

    if rng.gen_bool(rate) {
        let m = &mut genome.maturities;
        let i = rng.gen_range(0..n);
        if i == 0 {
            let cap = if n > 1 {
                m[1] - bounds.min_gap
            } else {
                bounds.max_maturity
            };
            let hi = cap.min(bounds.min_maturity + FIRST_MATURITY_SPAN);
            if hi >= bounds.min_maturity {
                m[0] = rng.gen_range(bounds.min_maturity..=hi);
            }
        } else if i == n - 1 {
            let lo = m[n - 2] + bounds.min_gap;
            if lo <= bounds.max_maturity {
                m[n - 1] = rng.gen_range(lo..=bounds.max_maturity);
            }
        } else {
            let lo = m[i - 1] + bounds.min_gap;
            let hi = m[i + 1] - bounds.min_gap;
            if lo < hi {
                m[i] = rng.gen_range(lo..=hi);
            }
        }
    }

    if rng.gen_bool(rate) {
        let i = rng.gen_range(0..n);
        let jitter = uniform(rng, -WEIGHT_JITTER, WEIGHT_JITTER);
        genome.weights[i] = (genome.weights[i] + jitter).clamp(WEIGHT_FLOOR, WEIGHT_CAP);
        genome.weights = normalise(std::mem::take(&mut genome.weights));
    }

    if rng.gen_bool(rate) {
        let half = bounds.deviation / dec!(2);
        let shift = uniform(rng, -half, half);
        genome.subordination_pct = (genome.subordination_pct + shift).clamp(bounds.sub_lo, bounds.sub_hi);
    }
}

fn enforce_gap(maturities: &mut [Days], min_gap: Days) {
    for i in 1..maturities.len() {
        if maturities[i] - maturities[i - 1] < min_gap {
            maturities[i] = maturities[i - 1] + min_gap;
        }
    }
}

fn normalise(weights: Vec<Decimal>) -> Vec<Decimal> {
    let total: Decimal = weights.iter().copied().sum();
    if total <= Decimal::ZERO {
        let n = Decimal::from(weights.len().max(1) as u64);
        return vec![Decimal::ONE / n; weights.len()];
    }
    weights.into_iter().map(|w| w / total).collect()
}

/// Uniform draw from `[0, 1]` at six decimal places.
fn unit<R: Rng>(rng: &mut R) -> Decimal {
    Decimal::new(rng.gen_range(0..=1_000_000), 6)
}

fn uniform<R: Rng>(rng: &mut R, lo: Decimal, hi: Decimal) -> Decimal {
    lo + (hi - lo) * unit(rng)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bounds(tranches: usize) -> Bounds {
        Bounds {
            tranches,
            min_maturity: 32,
            max_maturity: 200,
            min_gap: 15,
            sub_lo: dec!(9),
            sub_hi: dec!(11),
            deviation: dec!(1),
        }
    }

    fn weights_sum_to_one(g: &Genome) -> bool {
        let total: Decimal = g.weights.iter().copied().sum();
        (total - Decimal::ONE).abs() < dec!(0.000001)
    }

    // -----------------------------------------------------------------------
    // Test 1: Random genomes stay in bounds
    // -----------------------------------------------------------------------
    #[test]
    fn test_random_genome_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let b = bounds(3);
        for _ in 0..200 {
            let g = random_genome(&mut rng, &b);
            assert!(b.admits(&g), "{:?}", g);
            assert!(g.maturities[0] <= 32 + FIRST_MATURITY_SPAN);
            assert!(g.subordination_pct >= dec!(9) && g.subordination_pct <= dec!(11));
            assert!(weights_sum_to_one(&g));
        }
    }

    // -----------------------------------------------------------------------
    // Test 2: Crossover restores the minimum gap
    // -----------------------------------------------------------------------
    #[test]
    fn test_crossover_enforces_gap() {
        let mut rng = StdRng::seed_from_u64(11);
        let b = bounds(3);
        let p1 = Genome {
            maturities: vec![40, 60, 100],
            weights: vec![dec!(0.2), dec!(0.3), dec!(0.5)],
            subordination_pct: dec!(9),
        };
        let p2 = Genome {
            maturities: vec![45, 62, 150],
            weights: vec![dec!(0.4), dec!(0.4), dec!(0.2)],
            subordination_pct: dec!(11),
        };
        for _ in 0..50 {
            let c = crossover(&mut rng, &p1, &p2, &b);
            assert!(c.maturities.windows(2).all(|w| w[1] - w[0] >= 15));
            assert_eq!(c.weights, vec![dec!(0.3), dec!(0.35), dec!(0.35)]);
            assert!(c.subordination_pct >= dec!(9) && c.subordination_pct <= dec!(11));
        }
    }

    // -----------------------------------------------------------------------
    // Test 3: Mutation keeps weights normalised and subordination in window
    // -----------------------------------------------------------------------
    #[test]
    fn test_mutation_keeps_invariants() {
        let mut rng = StdRng::seed_from_u64(3);
        let b = bounds(3);
        let mut g = random_genome(&mut rng, &b);
        for _ in 0..200 {
            mutate(&mut rng, &mut g, &b, 1.0);
            assert!(weights_sum_to_one(&g));
            assert!(g.subordination_pct >= b.sub_lo && g.subordination_pct <= b.sub_hi);
            assert!(g.maturities.windows(2).all(|w| w[1] - w[0] >= 15), "{:?}", g);
            assert!(g.maturities[0] >= 32 && g.maturities[2] <= 200);
        }
    }

    #[test]
    fn test_zero_rate_never_mutates() {
        let mut rng = StdRng::seed_from_u64(5);
        let b = bounds(2);
        let g0 = random_genome(&mut rng, &b);
        let mut g = g0.clone();
        for _ in 0..20 {
            mutate(&mut rng, &mut g, &b, 0.0);
        }
        assert_eq!(g, g0);
    }

    // -----------------------------------------------------------------------
    // Test 4: Bounds
    // -----------------------------------------------------------------------
    #[test]
    fn test_bounds_feasibility() {
        assert!(bounds(3).feasible());
        let tight = Bounds {
            max_maturity: 50,
            ..bounds(3)
        };
        assert!(!tight.feasible());
    }

    #[test]
    fn test_admits_rejects_gap_violation() {
        let g = Genome {
            maturities: vec![40, 50],
            weights: vec![dec!(0.5), dec!(0.5)],
            subordination_pct: dec!(10),
        };
        assert!(!bounds(2).admits(&g));
    }

    // -----------------------------------------------------------------------
    // Test 5: Tournament picks the fittest when it sees everyone
    // -----------------------------------------------------------------------
    #[test]
    fn test_tournament_full_sample_returns_fittest() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut r2 = StdRng::seed_from_u64(2);
        let b = bounds(2);
        let pop: Vec<Genome> = (0..3).map(|_| random_genome(&mut r2, &b)).collect();
        let fit = vec![dec!(5), dec!(-1), dec!(9)];
        let w = tournament(&mut rng, &pop, &fit, 3);
        assert_eq!(w, &pop[2]);
    }

    #[test]
    fn test_elites_survive() {
        let mut rng = StdRng::seed_from_u64(9);
        let b = bounds(2);
        let pop: Vec<Genome> = (0..10).map(|_| random_genome(&mut rng, &b)).collect();
        let fit: Vec<Decimal> = (0..10).map(|i| Decimal::from(i as i64)).collect();
        let g = GeneticSettings {
            population_size: 10,
            ..Default::default()
        };
        let next = next_generation(&mut rng, &pop, &fit, &b, &g);
        assert_eq!(next.len(), 10);
        assert_eq!(next[0], pop[9]);
        assert_eq!(next[1], pop[8]);
    }

    #[test]
    fn test_genome_nominals_in_lots() {
        let g = Genome {
            maturities: vec![60, 120],
            weights: vec![dec!(0.25), dec!(0.75)],
            subordination_pct: dec!(10),
        };
        assert_eq!(
            genome_nominals(&g, dec!(8_000_000)),
            vec![dec!(2_000_000), dec!(6_000_000)]
        );
    }
}
