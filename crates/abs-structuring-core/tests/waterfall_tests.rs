use abs_structuring_core::calibration::nominal::{
    calibrate, class_b_for_target, CalibrationInput, CalibrationTargets,
};
use abs_structuring_core::rates;
use abs_structuring_core::schedule::{InstallmentRecord, Schedule};
use abs_structuring_core::waterfall::allocator::{
    allocate_tranches, WaterfallInput, WaterfallSettings,
};
use abs_structuring_core::waterfall::structure::{Structure, TrancheClass, TrancheSpec};
use abs_structuring_core::StructuringError;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

/// $100M principal collected evenly over 200 daily installments, with 30%
/// interest on top.
fn daily_pool() -> Schedule {
    let rows = (1..=200)
        .map(|k| InstallmentRecord::new(start() + Duration::days(k), dec!(500_000), dec!(150_000)))
        .collect();
    Schedule::new(rows).unwrap()
}

fn two_senior_one_junior() -> Structure {
    Structure::new(
        vec![
            TrancheSpec::class_a(90, dec!(45), dec!(0), dec!(40), dec!(50_000_000)),
            TrancheSpec::class_a(180, dec!(40), dec!(0), dec!(40), dec!(50_000_000)),
        ],
        TrancheSpec::class_b(200, dec!(40), dec!(0), dec!(40), dec!(5_000_000)),
    )
    .unwrap()
}

// ===========================================================================
// Tranche allocation
// ===========================================================================

#[test]
fn test_senior_tranches_paid_in_full() {
    let input = WaterfallInput {
        schedule: daily_pool(),
        structure: two_senior_one_junior(),
        settings: WaterfallSettings::new(start()),
    };
    let out = allocate_tranches(&input).unwrap();
    let r = &out.result;

    for t in r.tranche_results.iter().filter(|t| t.class == TrancheClass::A) {
        assert_eq!(t.total_payment, dec!(50_000_000));
        assert_eq!(t.principal + t.interest, t.nominal);
        assert_eq!(t.shortfall, Decimal::ZERO);
    }
    let b = r.tranche_results.last().unwrap();
    assert_eq!(b.class, TrancheClass::B);
    assert!(b.coupon_rate > Decimal::ZERO);
    assert!(r.summary.min_buffer_actual > Decimal::ZERO);
    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
}

#[test]
fn test_every_collection_lands_in_one_bucket() {
    let out = allocate_tranches(&WaterfallInput {
        schedule: daily_pool(),
        structure: two_senior_one_junior(),
        settings: WaterfallSettings::new(start()),
    })
    .unwrap();
    let bucketed: Decimal = out
        .result
        .tranche_results
        .iter()
        .map(|t| t.cash_flow_total)
        .sum();
    assert_eq!(bucketed, dec!(130_000_000));
}

#[test]
fn test_rate_conversion_rows_per_tranche() {
    let out = allocate_tranches(&WaterfallInput {
        schedule: daily_pool(),
        structure: two_senior_one_junior(),
        settings: WaterfallSettings::new(start()),
    })
    .unwrap();
    let rows = &out.result.rate_conversions;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].simple_annual, Some(dec!(45)));
    assert_eq!(
        rows[0].compound_for_period,
        Some(rates::simple_to_maturity_compound(dec!(45), 90))
    );
    assert!(rows[2].simple_annual.is_none());
    assert!(rows[2].coupon_rate.is_some());
}

#[test]
fn test_short_pool_reports_class_a_shortfall() {
    let rows = (1..=20)
        .map(|k| InstallmentRecord::new(start() + Duration::days(k), dec!(100_000), dec!(0)))
        .collect();
    let out = allocate_tranches(&WaterfallInput {
        schedule: Schedule::new(rows).unwrap(),
        structure: two_senior_one_junior(),
        settings: WaterfallSettings::new(start()),
    })
    .unwrap();
    assert!(out.result.tranche_results[0].shortfall > Decimal::ZERO);
    assert!(out.warnings.iter().any(|w| w.contains("shortfall")));
}

#[test]
fn test_unordered_maturities_rejected() {
    let err = Structure::new(
        vec![
            TrancheSpec::class_a(180, dec!(40), dec!(0), dec!(40), dec!(1_000_000)),
            TrancheSpec::class_a(90, dec!(45), dec!(0), dec!(40), dec!(1_000_000)),
        ],
        TrancheSpec::class_b(200, dec!(40), dec!(0), dec!(40), dec!(100_000)),
    )
    .unwrap_err();
    assert!(matches!(err, StructuringError::InvalidInput { .. }));
}

#[test]
fn test_empty_schedule_rejected() {
    let err = Schedule::new(vec![]).unwrap_err();
    assert!(matches!(err, StructuringError::InsufficientData(_)));
}

// ===========================================================================
// Rate conversion
// ===========================================================================

#[test]
fn test_compound_exceeds_simple() {
    assert!(rates::simple_to_compound_annual(dec!(40)) > dec!(40));
    assert_eq!(rates::simple_to_compound_annual(Decimal::ZERO), Decimal::ZERO);
}

#[test]
fn test_maturity_compound_zero_days() {
    assert_eq!(rates::simple_to_maturity_compound(dec!(45), 0), Decimal::ZERO);
}

#[test]
fn test_one_year_maturity_compound_equals_simple() {
    let c = rates::simple_to_maturity_compound(dec!(45), 365);
    assert!((c - dec!(45)).abs() < dec!(0.0001), "got {}", c);
}

// ===========================================================================
// Nominal calibration
// ===========================================================================

fn calibration_input() -> CalibrationInput {
    let rows = (1..=40)
        .map(|k| {
            InstallmentRecord::new(start() + Duration::days(k * 5), dec!(250_000), dec!(50_000))
        })
        .collect();
    let class_a = vec![
        TrancheSpec::class_a(90, dec!(40), dec!(0), dec!(30), dec!(4_000_000)),
        TrancheSpec::class_a(180, dec!(38), dec!(0), dec!(30), dec!(4_000_000)),
    ];
    let class_b = TrancheSpec::class_b(
        210,
        dec!(38),
        dec!(0),
        dec!(30),
        class_b_for_target(dec!(8_000_000), dec!(10)),
    );
    CalibrationInput {
        schedule: Schedule::new(rows).unwrap(),
        structure: Structure::new(class_a, class_b).unwrap(),
        settings: WaterfallSettings::new(start()),
        targets: CalibrationTargets {
            max_allowed_diff: dec!(1.0),
            ..CalibrationTargets::new(dec!(60), dec!(10))
        },
    }
}

#[test]
fn test_calibration_reaches_target_coupon() {
    let out = calibrate(&calibration_input()).unwrap();
    let c = &out.result;
    assert!(c.success, "{:?}", c);
    assert!((c.achieved_rate - dec!(60)).abs() <= dec!(1));
    assert!(c.subordination_pct >= dec!(9) && c.subordination_pct <= dec!(11));
    assert!(c
        .class_a_nominals
        .iter()
        .all(|n| (*n % dec!(1000)).is_zero()));
    assert!(out.warnings.is_empty());
}

#[test]
fn test_calibration_rejects_bad_targets() {
    let mut input = calibration_input();
    input.targets.target_subordination_pct = dec!(80);
    assert!(calibrate(&input).is_err());
}
