use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// All monetary values. Wraps Decimal to prevent accidental f64 usage.
pub type Money = Decimal;

/// Rates quoted in percent (45 = 45%). Spreads are carried in basis points
/// and recovery/transition rates as fractions; both say so at the field.
pub type Percent = Decimal;

/// Fractions in [0, 1] (recovery rates, transition probabilities).
pub type Fraction = Decimal;

/// Day counts on an actual/365 basis.
pub type Days = i64;

/// Standard computation output envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationOutput<T: Serialize> {
    pub result: T,
    pub methodology: String,
    pub assumptions: serde_json::Value,
    pub warnings: Vec<String>,
    pub metadata: ComputationMetadata,
}

/// Metadata for every computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationMetadata {
    pub version: String,
    pub computation_time_us: u64,
    pub precision: String,
}

/// Helper to wrap computation results with metadata
pub fn with_metadata<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> ComputationOutput<T> {
    ComputationOutput {
        result,
        methodology: methodology.to_string(),
        assumptions: serde_json::to_value(assumptions).unwrap_or_default(),
        warnings,
        metadata: ComputationMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            computation_time_us: elapsed_us,
            precision: "rust_decimal_128bit".to_string(),
        },
    }
}

/// Round to the nearest multiple of `unit`, never going below `floor`.
pub(crate) fn round_to_unit(value: Decimal, unit: Decimal, floor: Decimal) -> Decimal {
    if unit.is_zero() {
        return value.max(floor);
    }
    ((value / unit).round() * unit).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_unit_nearest_thousand() {
        assert_eq!(round_to_unit(dec!(12_499), dec!(1000), dec!(1000)), dec!(12_000));
        assert_eq!(round_to_unit(dec!(12_500), dec!(1000), dec!(1000)), dec!(12_000));
        assert_eq!(round_to_unit(dec!(12_501), dec!(1000), dec!(1000)), dec!(13_000));
    }

    #[test]
    fn test_round_to_unit_respects_floor() {
        assert_eq!(round_to_unit(dec!(10), dec!(1000), dec!(1000)), dec!(1000));
        assert_eq!(round_to_unit(dec!(-5000), dec!(1000), dec!(1000)), dec!(1000));
    }

    #[test]
    fn test_with_metadata_serialises_assumptions() {
        let out = with_metadata("m", &serde_json::json!({"a": 1}), vec![], 5, dec!(1));
        assert_eq!(out.assumptions["a"], 1);
        assert_eq!(out.metadata.computation_time_us, 5);
    }
}
