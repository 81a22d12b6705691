//! Rate conversions between the simple, overnight-compounded and
//! period-compounded quotes used across the waterfall, the stress model and
//! the optimizer.
//!
//! Every function is total: degenerate inputs (non-positive day counts,
//! overflowing powers, rates at or beyond 100% loss) resolve to a neutral
//! value instead of failing.

use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;

use crate::types::{Days, Fraction, Percent};

pub const DAYS_PER_YEAR: Decimal = dec!(365);

/// Annual simple rate compounded daily over a year, in percent.
///
/// `((1 + r/365/100)^365 - 1) * 100`
pub fn simple_to_compound_annual(simple_rate: Percent) -> Percent {
    let daily = simple_rate / DAYS_PER_YEAR / dec!(100);
    match (Decimal::ONE + daily).checked_powi(365) {
        Some(growth) => (growth - Decimal::ONE) * dec!(100),
        None => Decimal::ZERO,
    }
}

/// Overnight rate quoted simple, annualised with daily compounding.
pub fn overnight_to_annual_compound(overnight_rate: Percent) -> Percent {
    simple_to_compound_annual(overnight_rate)
}

/// Simple rate earned over `days`, re-expressed as the annual rate that
/// compounds to the same period return. Zero when `days <= 0`.
pub fn simple_to_maturity_compound(simple_rate: Percent, days: Days) -> Percent {
    if days <= 0 {
        return Decimal::ZERO;
    }
    let days = Decimal::from(days);
    let period_return = simple_rate / dec!(100) * days / DAYS_PER_YEAR;
    let base = Decimal::ONE + period_return;
    if base <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match base.checked_powd(DAYS_PER_YEAR / days) {
        Some(growth) => (growth - Decimal::ONE) * dec!(100),
        None => Decimal::ZERO,
    }
}

/// Growth of one unit over `days` at an annual compound rate, net of the
/// principal: `(1 + c/100)^(days/365) - 1`.
pub fn compound_growth_factor(annual_compound: Percent, days: Days) -> Decimal {
    if days <= 0 {
        return Decimal::ZERO;
    }
    let base = Decimal::ONE + annual_compound / dec!(100);
    if base <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    base.checked_powd(Decimal::from(days) / DAYS_PER_YEAR)
        .map(|growth| growth - Decimal::ONE)
        .unwrap_or(Decimal::ZERO)
}

/// Annual event probability (CPR/CDR style, as a fraction) converted to the
/// equivalent daily probability: `1 - (1 - a)^(1/365)`.
pub fn annual_to_daily_decay(annual: Fraction) -> Fraction {
    if annual <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if annual >= Decimal::ONE {
        return Decimal::ONE;
    }
    (Decimal::ONE - annual)
        .checked_powd(Decimal::ONE / DAYS_PER_YEAR)
        .map(|survival| Decimal::ONE - survival)
        .unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Decimal, b: Decimal, tol: Decimal) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_simple_to_compound_annual_zero_rate() {
        assert_eq!(simple_to_compound_annual(Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_simple_to_compound_annual_ten_percent() {
        // (1 + 0.1/365)^365 - 1 = 10.5156%
        let c = simple_to_compound_annual(dec!(10));
        assert!(approx(c, dec!(10.5156), dec!(0.001)), "got {}", c);
    }

    #[test]
    fn test_compound_exceeds_simple_for_positive_rates() {
        for r in [dec!(1), dec!(20), dec!(45)] {
            assert!(simple_to_compound_annual(r) > r);
        }
    }

    #[test]
    fn test_overnight_matches_simple_to_compound() {
        assert_eq!(
            overnight_to_annual_compound(dec!(42)),
            simple_to_compound_annual(dec!(42))
        );
    }

    #[test]
    fn test_maturity_compound_non_positive_days() {
        assert_eq!(simple_to_maturity_compound(dec!(40), 0), Decimal::ZERO);
        assert_eq!(simple_to_maturity_compound(dec!(40), -5), Decimal::ZERO);
    }

    #[test]
    fn test_maturity_compound_one_year_is_identity() {
        let c = simple_to_maturity_compound(dec!(40), 365);
        assert!(approx(c, dec!(40), dec!(0.0001)), "got {}", c);
    }

    #[test]
    fn test_maturity_compound_short_period_above_simple() {
        // 90 days at 40% simple: (1 + 0.09863)^(365/90) - 1 = 46.3%
        let c = simple_to_maturity_compound(dec!(40), 90);
        assert!(c > dec!(45) && c < dec!(48), "got {}", c);
    }

    #[test]
    fn test_compound_growth_factor() {
        assert_eq!(compound_growth_factor(dec!(10), 0), Decimal::ZERO);
        let g = compound_growth_factor(dec!(10), 365);
        assert!(approx(g, dec!(0.1), dec!(0.000001)), "got {}", g);
    }

    #[test]
    fn test_annual_to_daily_decay_bounds() {
        assert_eq!(annual_to_daily_decay(Decimal::ZERO), Decimal::ZERO);
        assert_eq!(annual_to_daily_decay(dec!(-0.1)), Decimal::ZERO);
        assert_eq!(annual_to_daily_decay(Decimal::ONE), Decimal::ONE);
    }

    #[test]
    fn test_annual_to_daily_decay_recompounds() {
        let daily = annual_to_daily_decay(dec!(0.05));
        // 1 - (1 - d)^365 recovers the annual rate
        let annual = Decimal::ONE - (Decimal::ONE - daily).powi(365);
        assert!(approx(annual, dec!(0.05), dec!(0.00001)), "got {}", annual);
    }
}
