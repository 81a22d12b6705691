use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StructuringError;
use crate::types::Money;
use crate::StructuringResult;

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// One dated collection from the receivables pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "InstallmentRow")]
pub struct InstallmentRecord {
    pub installment_date: NaiveDate,
    pub principal_amount: Money,
    pub interest_amount: Money,
    /// Working cash flow; reset from `original_cash_flow` before each use.
    pub cash_flow: Money,
    /// Baseline snapshot taken when the record is built.
    pub original_cash_flow: Money,
}

impl InstallmentRecord {
    pub fn new(installment_date: NaiveDate, principal_amount: Money, interest_amount: Money) -> Self {
        let cash_flow = principal_amount + interest_amount;
        Self {
            installment_date,
            principal_amount,
            interest_amount,
            cash_flow,
            original_cash_flow: cash_flow,
        }
    }
}

/// Wire form of an installment; the cash-flow columns are derived when absent.
#[derive(Deserialize)]
struct InstallmentRow {
    installment_date: NaiveDate,
    principal_amount: Money,
    interest_amount: Money,
    #[serde(default)]
    cash_flow: Option<Money>,
    #[serde(default)]
    original_cash_flow: Option<Money>,
}

impl From<InstallmentRow> for InstallmentRecord {
    fn from(row: InstallmentRow) -> Self {
        let mut record =
            InstallmentRecord::new(row.installment_date, row.principal_amount, row.interest_amount);
        if let Some(original) = row.original_cash_flow.or(row.cash_flow) {
            record.original_cash_flow = original;
            record.cash_flow = row.cash_flow.unwrap_or(original);
        }
        record
    }
}

/// Columnar form of a schedule as handed over by an ingestion layer.
/// Any column may be missing; `Schedule::from_columns` reports which.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleFrame {
    #[serde(default)]
    pub installment_date: Option<Vec<NaiveDate>>,
    #[serde(default)]
    pub principal_amount: Option<Vec<Money>>,
    #[serde(default)]
    pub interest_amount: Option<Vec<Money>>,
}

/// Chronologically ordered loan installments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<InstallmentRecord>", into = "Vec<InstallmentRecord>")]
pub struct Schedule {
    records: Vec<InstallmentRecord>,
}

impl TryFrom<Vec<InstallmentRecord>> for Schedule {
    type Error = StructuringError;

    fn try_from(records: Vec<InstallmentRecord>) -> Result<Self, Self::Error> {
        Schedule::new(records)
    }
}

impl From<Schedule> for Vec<InstallmentRecord> {
    fn from(schedule: Schedule) -> Self {
        schedule.records
    }
}

impl Schedule {
    /// Build a schedule, sorting records by installment date.
    pub fn new(mut records: Vec<InstallmentRecord>) -> StructuringResult<Self> {
        if records.is_empty() {
            return Err(StructuringError::InsufficientData(
                "schedule contains no installments".into(),
            ));
        }
        for (i, r) in records.iter().enumerate() {
            if r.principal_amount < Decimal::ZERO || r.interest_amount < Decimal::ZERO {
                return Err(StructuringError::invalid(
                    format!("schedule[{}]", i),
                    "principal and interest amounts must be non-negative",
                ));
            }
        }
        records.sort_by_key(|r| r.installment_date);
        Ok(Self { records })
    }

    /// Build a schedule from a columnar frame. Missing columns or columns of
    /// unequal length are rejected.
    pub fn from_columns(frame: ScheduleFrame) -> StructuringResult<Self> {
        let dates = frame
            .installment_date
            .ok_or_else(|| StructuringError::invalid("installment_date", "column is missing"))?;
        let principal = frame
            .principal_amount
            .ok_or_else(|| StructuringError::invalid("principal_amount", "column is missing"))?;
        let interest = frame
            .interest_amount
            .ok_or_else(|| StructuringError::invalid("interest_amount", "column is missing"))?;

        if principal.len() != dates.len() || interest.len() != dates.len() {
            return Err(StructuringError::invalid(
                "schedule",
                format!(
                    "column lengths differ: {} dates, {} principal, {} interest",
                    dates.len(),
                    principal.len(),
                    interest.len()
                ),
            ));
        }

        let records = dates
            .into_iter()
            .zip(principal)
            .zip(interest)
            .map(|((d, p), i)| InstallmentRecord::new(d, p, i))
            .collect();
        Self::new(records)
    }

    pub fn records(&self) -> &[InstallmentRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_date(&self) -> NaiveDate {
        self.records[0].installment_date
    }

    pub fn last_date(&self) -> NaiveDate {
        self.records[self.records.len() - 1].installment_date
    }

    pub fn total_principal(&self) -> Money {
        self.records.iter().map(|r| r.principal_amount).sum()
    }

    pub fn total_interest(&self) -> Money {
        self.records.iter().map(|r| r.interest_amount).sum()
    }

    pub fn total_original_cash_flow(&self) -> Money {
        self.records.iter().map(|r| r.original_cash_flow).sum()
    }

    /// Days from `start` to the last installment.
    pub fn last_cash_flow_day(&self, start: NaiveDate) -> i64 {
        (self.last_date() - start).num_days()
    }

    /// Working copy with every `cash_flow` reset to its baseline and the
    /// one-time expense deducted.
    pub(crate) fn working_cash_flows(&self, expense: &ExpenseRule) -> Vec<InstallmentRecord> {
        let mut rows = self.records.clone();
        for r in rows.iter_mut() {
            r.cash_flow = r.original_cash_flow;
        }
        if expense.amount > Decimal::ZERO {
            if let Some(idx) = expense.selector.locate(&rows) {
                rows[idx].cash_flow = (rows[idx].cash_flow - expense.amount).max(Decimal::ZERO);
            }
        }
        rows
    }
}

/// Which installment absorbs the one-time operating expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExpenseSelector {
    /// The installment dated exactly on this day, if any.
    OnDate(NaiveDate),
    /// The first installment dated on or after this day.
    FirstOnOrAfter(NaiveDate),
    /// Zero-based position in the sorted schedule.
    PeriodIndex(usize),
}

impl ExpenseSelector {
    fn locate(&self, rows: &[InstallmentRecord]) -> Option<usize> {
        match self {
            ExpenseSelector::OnDate(d) => rows.iter().position(|r| r.installment_date == *d),
            ExpenseSelector::FirstOnOrAfter(d) => {
                rows.iter().position(|r| r.installment_date >= *d)
            }
            ExpenseSelector::PeriodIndex(i) => (*i < rows.len()).then_some(*i),
        }
    }
}

/// One-time operating expense deducted from a single installment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRule {
    pub amount: Money,
    pub selector: ExpenseSelector,
}

impl ExpenseRule {
    pub fn none() -> Self {
        Self {
            amount: Decimal::ZERO,
            selector: ExpenseSelector::PeriodIndex(0),
        }
    }
}

impl Default for ExpenseRule {
    fn default() -> Self {
        Self::none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn three_rows() -> Schedule {
        Schedule::new(vec![
            InstallmentRecord::new(d(2025, 3, 1), dec!(100), dec!(10)),
            InstallmentRecord::new(d(2025, 1, 1), dec!(100), dec!(10)),
            InstallmentRecord::new(d(2025, 2, 16), dec!(100), dec!(10)),
        ])
        .unwrap()
    }

    #[test]
    fn test_new_sorts_by_date() {
        let s = three_rows();
        assert_eq!(s.first_date(), d(2025, 1, 1));
        assert_eq!(s.last_date(), d(2025, 3, 1));
        assert_eq!(s.records()[1].installment_date, d(2025, 2, 16));
    }

    #[test]
    fn test_record_cash_flow_is_principal_plus_interest() {
        let r = InstallmentRecord::new(d(2025, 1, 1), dec!(100), dec!(7.5));
        assert_eq!(r.cash_flow, dec!(107.5));
        assert_eq!(r.original_cash_flow, dec!(107.5));
    }

    #[test]
    fn test_empty_schedule_rejected() {
        assert!(Schedule::new(vec![]).is_err());
    }

    #[test]
    fn test_from_columns_missing_column() {
        let frame = ScheduleFrame {
            installment_date: Some(vec![d(2025, 1, 1)]),
            principal_amount: Some(vec![dec!(1)]),
            interest_amount: None,
        };
        match Schedule::from_columns(frame) {
            Err(StructuringError::InvalidInput { field, .. }) => assert_eq!(field, "interest_amount"),
            other => panic!("expected missing column error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_columns_length_mismatch() {
        let frame = ScheduleFrame {
            installment_date: Some(vec![d(2025, 1, 1), d(2025, 1, 2)]),
            principal_amount: Some(vec![dec!(1)]),
            interest_amount: Some(vec![dec!(1), dec!(1)]),
        };
        assert!(Schedule::from_columns(frame).is_err());
    }

    #[test]
    fn test_expense_on_date_is_deducted_once() {
        let s = three_rows();
        let rule = ExpenseRule {
            amount: dec!(30),
            selector: ExpenseSelector::OnDate(d(2025, 2, 16)),
        };
        let first = s.working_cash_flows(&rule);
        let second = s.working_cash_flows(&rule);
        assert_eq!(first[1].cash_flow, dec!(80));
        assert_eq!(second[1].cash_flow, dec!(80));
        assert_eq!(s.records()[1].cash_flow, dec!(110));
    }

    #[test]
    fn test_expense_floors_at_zero() {
        let s = three_rows();
        let rule = ExpenseRule {
            amount: dec!(500),
            selector: ExpenseSelector::PeriodIndex(0),
        };
        assert_eq!(s.working_cash_flows(&rule)[0].cash_flow, Decimal::ZERO);
    }

    #[test]
    fn test_expense_no_match_leaves_flows() {
        let s = three_rows();
        let rule = ExpenseRule {
            amount: dec!(30),
            selector: ExpenseSelector::OnDate(d(2025, 2, 17)),
        };
        let rows = s.working_cash_flows(&rule);
        assert!(rows.iter().all(|r| r.cash_flow == dec!(110)));
    }

    #[test]
    fn test_expense_first_on_or_after() {
        let s = three_rows();
        let rule = ExpenseRule {
            amount: dec!(10),
            selector: ExpenseSelector::FirstOnOrAfter(d(2025, 2, 2)),
        };
        assert_eq!(s.working_cash_flows(&rule)[1].cash_flow, dec!(100));
    }

    #[test]
    fn test_schedule_deserialises_and_sorts() {
        let json = r#"[
            {"installment_date":"2025-02-01","principal_amount":"5","interest_amount":"1","cash_flow":"6","original_cash_flow":"6"},
            {"installment_date":"2025-01-01","principal_amount":"5","interest_amount":"1"}
        ]"#;
        let s: Schedule = serde_json::from_str(json).unwrap();
        assert_eq!(s.first_date(), d(2025, 1, 1));
        assert_eq!(s.total_principal(), dec!(10));
        assert_eq!(s.records()[0].original_cash_flow, dec!(6));
    }
}
