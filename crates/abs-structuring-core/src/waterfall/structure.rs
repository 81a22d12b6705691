use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StructuringError;
use crate::types::{Days, Money, Percent};
use crate::StructuringResult;

/// Seniority class of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrancheClass {
    A,
    B,
}

/// Terms of a single note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrancheSpec {
    pub class: TrancheClass,
    /// Days from the structure start date to the note's maturity
    pub maturity_days: Days,
    /// Base interest rate (percent, simple annual)
    pub base_rate: Percent,
    /// Spread over the base rate in basis points
    pub spread: Decimal,
    /// Simple annual rate earned on cash held until maturity (percent)
    pub reinvest_rate: Percent,
    /// Face amount
    pub nominal: Money,
}

impl TrancheSpec {
    pub fn class_a(
        maturity_days: Days,
        base_rate: Percent,
        spread: Decimal,
        reinvest_rate: Percent,
        nominal: Money,
    ) -> Self {
        Self {
            class: TrancheClass::A,
            maturity_days,
            base_rate,
            spread,
            reinvest_rate,
            nominal,
        }
    }

    pub fn class_b(
        maturity_days: Days,
        base_rate: Percent,
        spread: Decimal,
        reinvest_rate: Percent,
        nominal: Money,
    ) -> Self {
        Self {
            class: TrancheClass::B,
            ..Self::class_a(maturity_days, base_rate, spread, reinvest_rate, nominal)
        }
    }

    /// Base rate plus spread, in percent.
    pub fn total_rate(&self) -> Percent {
        self.base_rate + self.spread / Decimal::ONE_HUNDRED
    }
}

/// Senior notes in ascending maturity order followed by the single
/// subordinated note. Deserialises from either the tranche-list form or
/// [`StructureArrays`], validating both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StructureWire")]
pub struct Structure {
    pub class_a: Vec<TrancheSpec>,
    pub class_b: TrancheSpec,
}

impl Structure {
    pub fn new(class_a: Vec<TrancheSpec>, class_b: TrancheSpec) -> StructuringResult<Self> {
        let s = Self { class_a, class_b };
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> StructuringResult<()> {
        if self.class_a.is_empty() {
            return Err(StructuringError::InsufficientData(
                "at least one Class A tranche is required".into(),
            ));
        }
        for (i, t) in self.class_a.iter().enumerate() {
            if t.class != TrancheClass::A {
                return Err(StructuringError::invalid(
                    format!("class_a[{}].class", i),
                    "senior tranches must be Class A",
                ));
            }
            if t.maturity_days <= 0 {
                return Err(StructuringError::invalid(
                    format!("class_a[{}].maturity_days", i),
                    "maturity must be positive",
                ));
            }
            if t.nominal < Decimal::ZERO {
                return Err(StructuringError::invalid(
                    format!("class_a[{}].nominal", i),
                    "nominal cannot be negative",
                ));
            }
        }
        if self
            .class_a
            .windows(2)
            .any(|w| w[1].maturity_days <= w[0].maturity_days)
        {
            return Err(StructuringError::invalid(
                "class_a",
                "maturities must be strictly ascending",
            ));
        }
        if self.class_b.class != TrancheClass::B {
            return Err(StructuringError::invalid(
                "class_b.class",
                "subordinated tranche must be Class B",
            ));
        }
        if self.class_b.nominal < Decimal::ZERO {
            return Err(StructuringError::invalid(
                "class_b.nominal",
                "nominal cannot be negative",
            ));
        }
        let last_a = self.class_a[self.class_a.len() - 1].maturity_days;
        if self.class_b.maturity_days < last_a {
            return Err(StructuringError::invalid(
                "class_b.maturity_days",
                format!(
                    "Class B matures on day {} before the last Class A tranche (day {})",
                    self.class_b.maturity_days, last_a
                ),
            ));
        }
        Ok(())
    }

    /// All tranches in payment order.
    pub fn tranches(&self) -> impl Iterator<Item = &TrancheSpec> {
        self.class_a.iter().chain(std::iter::once(&self.class_b))
    }

    pub fn class_a_total(&self) -> Money {
        self.class_a.iter().map(|t| t.nominal).sum()
    }

    pub fn class_a_maturities(&self) -> Vec<Days> {
        self.class_a.iter().map(|t| t.maturity_days).collect()
    }

    pub fn class_a_nominals(&self) -> Vec<Money> {
        self.class_a.iter().map(|t| t.nominal).collect()
    }

    /// Class B share of all notes, in percent.
    pub fn subordination_percent(&self) -> Percent {
        subordination_percent(self.class_a_total(), self.class_b.nominal)
    }

    /// Same terms with the given Class A nominals and Class B nominal.
    pub fn with_nominals(&self, class_a: &[Money], class_b: Money) -> Self {
        let mut s = self.clone();
        for (t, n) in s.class_a.iter_mut().zip(class_a) {
            t.nominal = *n;
        }
        s.class_b.nominal = class_b;
        s
    }
}

/// `B / (A + B) * 100`, zero when there are no notes.
pub fn subordination_percent(class_a_total: Money, class_b: Money) -> Percent {
    let total = class_a_total + class_b;
    if total.is_zero() {
        Decimal::ZERO
    } else {
        class_b / total * Decimal::ONE_HUNDRED
    }
}

/// Parallel-array form of a structure, as front ends usually submit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureArrays {
    pub a_maturities: Vec<Days>,
    pub a_base_rates: Vec<Percent>,
    pub a_spreads: Vec<Decimal>,
    pub a_reinvest_rates: Vec<Percent>,
    pub a_nominals: Vec<Money>,
    pub b_maturity: Days,
    pub b_base_rate: Percent,
    pub b_spread: Decimal,
    pub b_reinvest_rate: Percent,
    pub b_nominal: Money,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StructureWire {
    Tranches {
        class_a: Vec<TrancheSpec>,
        class_b: TrancheSpec,
    },
    Arrays(StructureArrays),
}

impl TryFrom<StructureWire> for Structure {
    type Error = StructuringError;

    fn try_from(wire: StructureWire) -> Result<Self, Self::Error> {
        match wire {
            StructureWire::Tranches { class_a, class_b } => Structure::new(class_a, class_b),
            StructureWire::Arrays(arrays) => Structure::try_from(arrays),
        }
    }
}

impl TryFrom<StructureArrays> for Structure {
    type Error = StructuringError;

    fn try_from(a: StructureArrays) -> Result<Self, Self::Error> {
        let n = a.a_maturities.len();
        for (field, len) in [
            ("a_base_rates", a.a_base_rates.len()),
            ("a_spreads", a.a_spreads.len()),
            ("a_reinvest_rates", a.a_reinvest_rates.len()),
            ("a_nominals", a.a_nominals.len()),
        ] {
            if len != n {
                return Err(StructuringError::invalid(
                    field,
                    format!("expected {} entries to match a_maturities, got {}", n, len),
                ));
            }
        }
        let class_a = (0..n)
            .map(|i| {
                TrancheSpec::class_a(
                    a.a_maturities[i],
                    a.a_base_rates[i],
                    a.a_spreads[i],
                    a.a_reinvest_rates[i],
                    a.a_nominals[i],
                )
            })
            .collect();
        let class_b = TrancheSpec::class_b(
            a.b_maturity,
            a.b_base_rate,
            a.b_spread,
            a.b_reinvest_rate,
            a.b_nominal,
        );
        Structure::new(class_a, class_b)
    }
}
