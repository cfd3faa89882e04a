/// Invocation Adapter
///
/// Turns a test case's polymorphic input into the positional arguments the
/// entry point is called with, and defines what "equal to expected" means.
/// The harness and the debug-fix validator both go through here so the two
/// workflows can never disagree on argument shape.
use serde_json::{Number, Value};

/// Arrays spread into positional arguments; anything else is the sole argument.
/// A single list argument is therefore written as `[[1, 2, 3]]`.
pub fn canonical_args(input: &Value) -> Vec<Value> {
    match input {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Strict structural equality, except that numbers compare by value (`5 == 5.0`)
pub fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => numbers_match(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).map(|y| values_match(x, y)).unwrap_or(false))
        }
        _ => actual == expected,
    }
}

/// Integers compare digit for digit, so values past `u64` never round through `f64`
fn numbers_match(a: &Number, b: &Number) -> bool {
    match (integer_digits(a), integer_digits(b)) {
        (Some(x), Some(y)) => x == y,
        (Some(int), None) => float_equals_integer(b, &int),
        (None, Some(int)) => float_equals_integer(a, &int),
        (None, None) => a.as_f64() == b.as_f64(),
    }
}

/// Canonical decimal text of an integer literal, `None` for anything with a fraction or exponent
fn integer_digits(n: &Number) -> Option<String> {
    if let Some(v) = n.as_i64() {
        return Some(v.to_string());
    }
    if let Some(v) = n.as_u64() {
        return Some(v.to_string());
    }
    let text = n.to_string();
    let digits = text.strip_prefix('-').unwrap_or(&text);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(text)
    } else {
        None
    }
}

/// `{:.0}` prints the exact integral value of an f64
fn float_equals_integer(float: &Number, int: &str) -> bool {
    match float.as_f64() {
        Some(v) if v.is_finite() && v.fract() == 0.0 => {
            let v = if v == 0.0 { 0.0 } else { v };
            format!("{:.0}", v) == int
        }
        _ => false,
    }
}
