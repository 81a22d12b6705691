use serde_json::Value;

use super::format_value;

/// Print just the key answer from the output.
///
/// Looks for the headline field of each command in priority order, one
/// level into nested objects (`summary`, `metrics`, `stressed`), then falls
/// back to the first field of the result.
pub fn print_minimal(value: &Value) {
    let result_obj = value
        .as_object()
        .and_then(|m| m.get("result"))
        .unwrap_or(value);

    let priority_keys = [
        "achieved_rate",
        "effective_coupon_rate",
        "total_loss_pct",
        "compound_for_period",
    ];
    let nested = ["summary", "stressed", "metrics"];

    if let Value::Object(map) = result_obj {
        for key in &priority_keys {
            if let Some(val) = map.get(*key).filter(|v| !v.is_null()) {
                println!("{}", format_value(val, "null"));
                return;
            }
        }
        for outer in &nested {
            if let Some(Value::Object(inner)) = map.get(*outer) {
                for key in &priority_keys {
                    if let Some(val) = inner.get(*key).filter(|v| !v.is_null()) {
                        println!("{}", format_value(val, "null"));
                        return;
                    }
                }
            }
        }

        if let Some((key, val)) = map.iter().next() {
            println!("{}: {}", key, format_value(val, "null"));
            return;
        }
    }

    println!("{}", format_value(result_obj, "null"));
}
