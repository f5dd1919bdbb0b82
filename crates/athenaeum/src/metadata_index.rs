use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    Neq,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub key: String,
    pub op: FilterOp,
    pub value: Value,
}

fn as_f64(s: &str) -> Option<f64> {
    s.parse::<f64>().ok()
}

/// Evaluate a single filter against a metadata map. Missing keys evaluate to
/// `false` for every operator except `Neq`, which is `true`.
pub fn matches_filter(metadata: &HashMap<String, String>, filter: &MetadataFilter) -> bool {
    let Some(actual) = metadata.get(&filter.key) else {
        return filter.op == FilterOp::Neq;
    };

    match filter.op {
        FilterOp::Eq => filter.value.as_str().is_some_and(|v| v == actual),
        FilterOp::Neq => filter.value.as_str().is_none_or(|v| v != actual),
        FilterOp::Contains => {
            if let Some(needle) = filter.value.as_str() {
                if actual.contains(needle) {
                    return true;
                }
                // Fall through: also treat `actual` as a JSON array and test
                // membership, since `tags`/`topics` are JSON-encoded lists.
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(actual) {
                    return items
                        .iter()
                        .any(|item| item.as_str() == Some(needle));
                }
                false
            } else {
                false
            }
        }
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            let (Some(actual_n), Some(expected_n)) =
                (as_f64(actual), filter.value.as_f64())
            else {
                return false;
            };
            match filter.op {
                FilterOp::Gt => actual_n > expected_n,
                FilterOp::Gte => actual_n >= expected_n,
                FilterOp::Lt => actual_n < expected_n,
                FilterOp::Lte => actual_n <= expected_n,
                _ => unreachable!(),
            }
        }
        FilterOp::In | FilterOp::NotIn => {
            let Value::Array(items) = &filter.value else {
                return false;
            };
            let contains = items.iter().any(|item| item.as_str() == Some(actual));
            if filter.op == FilterOp::In {
                contains
            } else {
                !contains
            }
        }
        FilterOp::Between => {
            let Value::Array(bounds) = &filter.value else {
                return false;
            };
            let (Some(lo), Some(hi), Some(actual_n)) = (
                bounds.first().and_then(Value::as_f64),
                bounds.get(1).and_then(Value::as_f64),
                as_f64(actual),
            ) else {
                return false;
            };
            if lo > hi {
                return false;
            }
            actual_n >= lo && actual_n <= hi
        }
    }
}

/// AND across filters; an empty filter set matches everything.
pub fn matches_all_metadata_filters(
    metadata: &HashMap<String, String>,
    filters: &[MetadataFilter],
) -> bool {
    filters.iter().all(|f| matches_filter(metadata, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn filter(key: &str, op: FilterOp, value: Value) -> MetadataFilter {
        MetadataFilter {
            key: key.to_string(),
            op,
            value,
        }
    }

    #[test]
    fn missing_key_is_false_except_for_neq() {
        let m = meta(&[]);
        assert!(!matches_filter(&m, &filter("topic", FilterOp::Eq, json!("x"))));
        assert!(matches_filter(&m, &filter("topic", FilterOp::Neq, json!("x"))));
        assert!(!matches_filter(&m, &filter("score", FilterOp::Gt, json!(1))));
    }

    #[test]
    fn numeric_comparisons_parse_strings() {
        let m = meta(&[("score", "0.8")]);
        assert!(matches_filter(&m, &filter("score", FilterOp::Gt, json!(0.5))));
        assert!(!matches_filter(&m, &filter("score", FilterOp::Lt, json!(0.5))));
    }

    #[test]
    fn between_with_inverted_bounds_is_always_false() {
        let m = meta(&[("score", "5")]);
        assert!(!matches_filter(
            &m,
            &filter("score", FilterOp::Between, json!([10, 1]))
        ));
    }

    #[test]
    fn in_and_not_in_require_array_membership() {
        let m = meta(&[("topic", "rust")]);
        assert!(matches_filter(
            &m,
            &filter("topic", FilterOp::In, json!(["rust", "python"]))
        ));
        assert!(!matches_filter(
            &m,
            &filter("topic", FilterOp::NotIn, json!(["rust", "python"]))
        ));
    }

    #[test]
    fn and_across_filters() {
        let m = meta(&[("topic", "rust"), ("score", "0.9")]);
        let filters = vec![
            filter("topic", FilterOp::Eq, json!("rust")),
            filter("score", FilterOp::Gte, json!(0.5)),
        ];
        assert!(matches_all_metadata_filters(&m, &filters));

        let filters_fail = vec![
            filter("topic", FilterOp::Eq, json!("rust")),
            filter("score", FilterOp::Gte, json!(0.95)),
        ];
        assert!(!matches_all_metadata_filters(&m, &filters_fail));
    }
}
