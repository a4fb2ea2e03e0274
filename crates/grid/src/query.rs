//! Query model: filters, extractors, comparators, aggregators
//!
//! These are plain serde data. Clients serialize them with their session
//! codec; the proxy forwards the bytes untouched and the grid decodes them
//! with the serializer appropriate to the operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Extracts a comparable fragment from a logical value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extractor {
  /// The whole value
  Identity,
  /// A dotted path into nested objects, e.g. "address.city"
  Path(String),
}

impl Extractor {
  pub fn extract<'a>(&self, value: &'a Value) -> Option<&'a Value> {
    match self {
      Extractor::Identity => Some(value),
      Extractor::Path(path) => {
        let mut current = value;
        for segment in path.split('.') {
          current = current.get(segment)?;
        }
        Some(current)
      }
    }
  }
}

/// Entry filter evaluated against logical values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
  /// Matches every entry; the wire encoding of "empty filter bytes"
  Always,
  Equal {
    extractor: Extractor,
    value: Value,
  },
  Greater {
    extractor: Extractor,
    value: Value,
  },
  Less {
    extractor: Extractor,
    value: Value,
  },
  And(Vec<Filter>),
  Or(Vec<Filter>),
  Not(Box<Filter>),
}

impl Filter {
  pub fn evaluate(&self, value: &Value) -> bool {
    match self {
      Filter::Always => true,
      Filter::Equal { extractor, value: expect } => {
        extractor.extract(value).map(|v| v == expect).unwrap_or(false)
      }
      Filter::Greater { extractor, value: bound } => extractor
        .extract(value)
        .and_then(|v| compare_values(v, bound))
        .map(|ord| ord == Ordering::Greater)
        .unwrap_or(false),
      Filter::Less { extractor, value: bound } => extractor
        .extract(value)
        .and_then(|v| compare_values(v, bound))
        .map(|ord| ord == Ordering::Less)
        .unwrap_or(false),
      Filter::And(filters) => filters.iter().all(|f| f.evaluate(value)),
      Filter::Or(filters) => filters.iter().any(|f| f.evaluate(value)),
      Filter::Not(inner) => !inner.evaluate(value),
    }
  }

  /// Equality on the whole value, as used by containsValue.
  pub fn equal_identity(value: Value) -> Filter {
    Filter::Equal {
      extractor: Extractor::Identity,
      value,
    }
  }
}

/// Value ordering for query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
  /// Natural order of extracted values
  Natural,
  Reverse,
  By {
    extractor: Extractor,
    #[serde(default)]
    descending: bool,
  },
}

impl Comparator {
  pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
    match self {
      Comparator::Natural => compare_values(a, b).unwrap_or(Ordering::Equal),
      Comparator::Reverse => compare_values(b, a).unwrap_or(Ordering::Equal),
      Comparator::By {
        extractor,
        descending,
      } => {
        let left = extractor.extract(a);
        let right = extractor.extract(b);
        let ord = match (left, right) {
          (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
          (Some(_), None) => Ordering::Greater,
          (None, Some(_)) => Ordering::Less,
          (None, None) => Ordering::Equal,
        };
        if *descending {
          ord.reverse()
        } else {
          ord
        }
      }
    }
  }
}

/// Aggregation over matching entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
  /// Number of matching entries
  Count,
  /// Numeric sum of extracted values; non-numeric values are ignored
  Sum(Extractor),
  /// Distinct extracted values in natural order
  Distinct(Extractor),
}

impl Aggregator {
  pub fn aggregate<'a, I>(&self, values: I) -> Value
  where
    I: Iterator<Item = &'a Value>,
  {
    match self {
      Aggregator::Count => Value::from(values.count() as u64),
      Aggregator::Sum(extractor) => {
        let sum: f64 = values
          .filter_map(|v| extractor.extract(v))
          .filter_map(Value::as_f64)
          .sum();
        if sum.fract() == 0.0 && sum.abs() < (i64::MAX as f64) {
          Value::from(sum as i64)
        } else {
          Value::from(sum)
        }
      }
      Aggregator::Distinct(extractor) => {
        let mut seen: Vec<Value> = Vec::new();
        for v in values.filter_map(|v| extractor.extract(v)) {
          if !seen.contains(v) {
            seen.push(v.clone());
          }
        }
        seen.sort_by(|a, b| compare_values(a, b).unwrap_or(Ordering::Equal));
        Value::Array(seen)
      }
    }
  }
}

/// Partial order across JSON scalars; mixed or structured types compare as None
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    (Value::Null, Value::Null) => Some(Ordering::Equal),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn path_extractor_digs_into_objects() {
    let value = json!({"address": {"city": "Oakton"}});
    let extractor = Extractor::Path("address.city".into());
    assert_eq!(extractor.extract(&value), Some(&json!("Oakton")));
    assert_eq!(Extractor::Path("address.zip".into()).extract(&value), None);
  }

  #[test]
  fn filter_evaluation() {
    let value = json!({"age": 30, "name": "sam"});
    let gt = Filter::Greater {
      extractor: Extractor::Path("age".into()),
      value: json!(21),
    };
    let eq = Filter::Equal {
      extractor: Extractor::Path("name".into()),
      value: json!("sam"),
    };
    assert!(gt.evaluate(&value));
    assert!(eq.evaluate(&value));
    assert!(Filter::And(vec![gt.clone(), eq.clone()]).evaluate(&value));
    assert!(!Filter::Not(Box::new(gt)).evaluate(&value));
    assert!(Filter::Always.evaluate(&value));
  }

  #[test]
  fn filter_on_missing_path_does_not_match() {
    let value = json!({"age": 30});
    let filter = Filter::Greater {
      extractor: Extractor::Path("height".into()),
      value: json!(10),
    };
    assert!(!filter.evaluate(&value));
  }

  #[test]
  fn comparator_orders_by_extracted_field() {
    let a = json!({"n": 1});
    let b = json!({"n": 2});
    let cmp = Comparator::By {
      extractor: Extractor::Path("n".into()),
      descending: false,
    };
    assert_eq!(cmp.compare(&a, &b), Ordering::Less);

    let desc = Comparator::By {
      extractor: Extractor::Path("n".into()),
      descending: true,
    };
    assert_eq!(desc.compare(&a, &b), Ordering::Greater);
  }

  #[test]
  fn count_and_sum_aggregators() {
    let values = [json!({"n": 1}), json!({"n": 2}), json!({"n": 4})];
    assert_eq!(Aggregator::Count.aggregate(values.iter()), json!(3));
    assert_eq!(
      Aggregator::Sum(Extractor::Path("n".into())).aggregate(values.iter()),
      json!(7)
    );
  }

  #[test]
  fn distinct_aggregator_dedupes_and_sorts() {
    let values = [json!("b"), json!("a"), json!("b")];
    assert_eq!(
      Aggregator::Distinct(Extractor::Identity).aggregate(values.iter()),
      json!(["a", "b"])
    );
  }

  #[test]
  fn filter_serde_roundtrip_through_value() {
    let filter = Filter::Greater {
      extractor: Extractor::Path("age".into()),
      value: json!(21),
    };
    let value = serde_json::to_value(&filter).unwrap();
    let back: Filter = serde_json::from_value(value).unwrap();
    assert_eq!(back, filter);
  }
}
