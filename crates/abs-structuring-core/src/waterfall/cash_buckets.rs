use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rates::DAYS_PER_YEAR;
use crate::schedule::InstallmentRecord;
use crate::types::{Money, Percent};

/// Collections routed to one tranche, with the simple interest they earn
/// until that tranche's maturity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CashBucket {
    pub cash_flow: Money,
    pub reinvestment_return: Money,
    pub principal: Money,
    pub interest: Money,
    pub installments: usize,
}

/// Route every installment to the first tranche maturing on or after its
/// date. Installments after the final maturity land in the last bucket and
/// earn nothing.
///
/// `maturity_dates` must be non-decreasing and the same length as
/// `reinvest_rates`.
pub(crate) fn assign_cash_flows(
    rows: &[InstallmentRecord],
    maturity_dates: &[NaiveDate],
    reinvest_rates: &[Percent],
) -> Vec<CashBucket> {
    let mut buckets = vec![CashBucket::default(); maturity_dates.len()];
    if buckets.is_empty() {
        return buckets;
    }
    let last = buckets.len() - 1;
    let mut cursor = 0usize;

    for row in rows {
        while cursor < last && maturity_dates[cursor] < row.installment_date {
            cursor += 1;
        }
        let bucket = &mut buckets[cursor];
        bucket.cash_flow += row.cash_flow;
        bucket.principal += row.principal_amount;
        bucket.interest += row.interest_amount;
        bucket.installments += 1;

        let days = (maturity_dates[cursor] - row.installment_date).num_days();
        if days > 0 {
            bucket.reinvestment_return += row.cash_flow * reinvest_rates[cursor]
                / Decimal::ONE_HUNDRED
                * Decimal::from(days)
                / DAYS_PER_YEAR;
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_installments_route_to_nearest_maturity() {
        let rows = vec![
            InstallmentRecord::new(d(2025, 1, 10), dec!(100), dec!(0)),
            InstallmentRecord::new(d(2025, 1, 31), dec!(100), dec!(0)),
            InstallmentRecord::new(d(2025, 2, 15), dec!(100), dec!(0)),
        ];
        let mats = vec![d(2025, 1, 31), d(2025, 3, 1)];
        let b = assign_cash_flows(&rows, &mats, &[dec!(0), dec!(0)]);
        assert_eq!(b[0].cash_flow, dec!(200));
        assert_eq!(b[0].installments, 2);
        assert_eq!(b[1].cash_flow, dec!(100));
    }

    #[test]
    fn test_simple_reinvestment_to_maturity() {
        let rows = vec![InstallmentRecord::new(d(2025, 1, 1), dec!(365), dec!(0))];
        let mats = vec![d(2025, 1, 11)];
        let b = assign_cash_flows(&rows, &mats, &[dec!(10)]);
        // 365 * 10% * 10/365 = 1
        assert_eq!(b[0].reinvestment_return, dec!(1));
    }

    #[test]
    fn test_late_installments_go_to_last_bucket_without_return() {
        let rows = vec![
            InstallmentRecord::new(d(2025, 1, 1), dec!(100), dec!(0)),
            InstallmentRecord::new(d(2025, 6, 1), dec!(100), dec!(0)),
        ];
        let mats = vec![d(2025, 1, 31), d(2025, 2, 28)];
        let b = assign_cash_flows(&rows, &mats, &[dec!(10), dec!(10)]);
        assert_eq!(b[1].cash_flow, dec!(100));
        assert_eq!(b[1].reinvestment_return, Decimal::ZERO);
    }

    #[test]
    fn test_no_cash_lost() {
        let rows: Vec<_> = (1..=28)
            .map(|i| InstallmentRecord::new(d(2025, 2, i), dec!(10), dec!(1)))
            .collect();
        let mats = vec![d(2025, 2, 5), d(2025, 2, 10), d(2025, 2, 10)];
        let b = assign_cash_flows(&rows, &mats, &[dec!(5); 3]);
        let total: Decimal = b.iter().map(|x| x.cash_flow).sum();
        assert_eq!(total, dec!(308));
    }
}
