//! Helpers for reading loosely-shaped upstream JSON.
//!
//! Upstream services disagree on field names and envelopes, so adapters look
//! values up through ordered candidate key lists and take the first usable one.

use serde_json::{Map, Value};

/// JSON object alias used throughout the adapters.
pub type Object = Map<String, Value>;

/// Finite number, or a string whose leading numeric part parses as one
/// (`"12px"` reads as 12, `"px12"` as nothing).
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => leading_number(s.trim_start()),
        _ => None,
    }
}

/// Longest prefix of `text` shaped like `[+-]digits[.digits][e[+-]digits]`.
fn leading_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_end = digits_from(end);
    let mut mantissa_digits = int_end - end;
    end = int_end;
    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        mantissa_digits += frac_end - end - 1;
        if frac_end > end + 1 || int_end > 0 {
            end = frac_end;
        }
    }
    if mantissa_digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let sign = usize::from(matches!(bytes.get(end + 1), Some(b'+' | b'-')));
        let exp_end = digits_from(end + 1 + sign);
        if exp_end > end + 1 + sign {
            end = exp_end;
        }
    }
    text[..end].parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Non-blank string, trimmed.
pub fn trimmed_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// First key (in order) holding a usable number.
pub fn pick_number(obj: &Object, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(to_number)
}

/// First key (in order) holding a non-blank string. The value is returned
/// untrimmed.
pub fn pick_string(obj: &Object, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| v.as_str().filter(|s| !s.trim().is_empty()).map(str::to_string))
}

/// First key whose value is present and not null, like `a ?? b ?? c`.
pub fn first_present<'a>(obj: &'a Object, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// `first_present` followed by `trimmed_str`.
pub fn first_str(obj: &Object, keys: &[&str]) -> Option<String> {
    first_present(obj, keys).and_then(trimmed_str)
}

/// Nested lookup, e.g. `path(v, &["page", "services"])`.
pub fn path<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |cur, k| cur.get(*k))
}

/// The list carried by `value`: the value itself if it is an array, else the
/// first of `keys` whose value is an array.
pub fn extract_list<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(obj) => keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_array)),
        _ => None,
    }
}

/// `trimmed_str` applied across a JSON array.
pub fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(trimmed_str).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEYS: &[&str] = &["items", "data", "agents"];

    #[test]
    fn test_extract_list_shapes_agree() {
        let list = json!([{"id": 1}, {"id": 2}]);
        let shapes = [
            list.clone(),
            json!({"items": list.clone()}),
            json!({"data": list.clone()}),
            json!({"agents": list.clone()}),
            json!({"meta": {"total": 2}, "data": list.clone()}),
        ];
        for shape in &shapes {
            assert_eq!(extract_list(shape, KEYS), list.as_array());
        }
        assert!(extract_list(&json!({"data": {"nested": []}}), KEYS).is_none());
        assert!(extract_list(&json!("text"), KEYS).is_none());
    }

    #[test]
    fn test_pick_number_accepts_numeric_strings() {
        let obj = json!({"a": "n/a", "b": " 12.5 ", "c": 3}).as_object().cloned().unwrap();
        assert_eq!(pick_number(&obj, &["a", "b", "c"]), Some(12.5));
        assert_eq!(pick_number(&obj, &["c", "b"]), Some(3.0));
        assert_eq!(pick_number(&obj, &["missing"]), None);
    }

    #[test]
    fn test_to_number_reads_leading_numeric_prefix() {
        assert_eq!(to_number(&json!("12px")), Some(12.0));
        assert_eq!(to_number(&json!(" -3.5 GB")), Some(-3.5));
        assert_eq!(to_number(&json!(".5")), Some(0.5));
        assert_eq!(to_number(&json!("7.")), Some(7.0));
        assert_eq!(to_number(&json!("1e3x")), Some(1000.0));
        assert_eq!(to_number(&json!("2e")), Some(2.0));
        assert_eq!(to_number(&json!("px12")), None);
        assert_eq!(to_number(&json!("-")), None);
        assert_eq!(to_number(&json!(".")), None);
        assert_eq!(to_number(&json!("")), None);
        assert_eq!(to_number(&json!(true)), None);
    }

    #[test]
    fn test_pick_string_skips_blank() {
        let obj = json!({"a": "  ", "b": 4, "c": "USD"}).as_object().cloned().unwrap();
        assert_eq!(pick_string(&obj, &["a", "b", "c"]), Some("USD".to_string()));
    }

    #[test]
    fn test_first_present_is_null_coalescing() {
        let obj = json!({"a": null, "b": {"x": 1}, "c": "later"}).as_object().cloned().unwrap();
        // An object short-circuits even though it is not a string
        assert_eq!(first_str(&obj, &["a", "b", "c"]), None);
        assert_eq!(first_str(&obj, &["a", "c"]), Some("later".to_string()));
    }

    #[test]
    fn test_path_and_string_list() {
        let v = json!({"page": {"services": ["a", " ", "b "]}});
        let services = path(&v, &["page", "services"]).unwrap();
        assert_eq!(string_list(services), vec!["a".to_string(), "b".to_string()]);
        assert!(path(&v, &["page", "missing"]).is_none());
    }
}
