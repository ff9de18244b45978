//! Compares a desired document against an observed one and computes the
//! document that would make the observed object compliant.

use crate::{
    list,
    value::{Map, Value},
};
use config_policy_controller_k8s_api::ComplianceType;
use std::fmt;

/// The result of comparing one desired document against one observed
/// document.
#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub merged: Value,
    pub compliant: bool,
    pub diffs: Vec<Difference>,
}

/// A single field that required fixing.
#[derive(Clone, Debug, PartialEq)]
pub struct Difference {
    pub path: String,
    /// `None` when the field was missing from the observed document.
    pub observed: Option<Value>,
    /// `None` when the observed field is not allowed at all.
    pub desired: Option<Value>,
}

/// Compares two arbitrary values.
///
/// `mustnothave` is only meaningful for whole objects; when comparing values
/// it checks whether the observed value matches the desired one, exactly as
/// `musthave` does.
pub fn compare(desired: &Value, observed: &Value, mode: ComplianceType) -> Comparison {
    let mut diffs = Vec::new();
    let merged = merge_value(desired, observed, mode, "", &mut diffs);
    Comparison {
        compliant: diffs.is_empty(),
        merged,
        diffs,
    }
}

/// Compares a desired object against an observed object.
///
/// Only the desired top-level fields are considered, other than `apiVersion`
/// and `kind`. Of `metadata`, only labels and annotations are compared, and
/// they are always compared additively so that annotations set by other
/// controllers never count as drift.
pub fn compare_object(desired: &Value, observed: &Value, mode: ComplianceType) -> Comparison {
    let (Some(desired), Some(observed)) = (desired.as_map(), observed.as_map()) else {
        return compare(desired, observed, mode);
    };

    let mut merged = observed.clone();
    let mut diffs = Vec::new();
    for (key, want) in desired.iter() {
        match key.as_str() {
            "apiVersion" | "kind" => {}
            "metadata" => {
                for field in ["labels", "annotations"] {
                    let Some(want) = want.pointer(&[field]) else {
                        continue;
                    };
                    let have = observed
                        .get("metadata")
                        .and_then(|m| m.pointer(&[field]))
                        .unwrap_or(&Value::Null);
                    let path = format!("metadata.{field}");
                    let value = merge_value(want, have, ComplianceType::MustHave, &path, &mut diffs);
                    if let Some(meta) = merged
                        .entry("metadata".to_string())
                        .or_insert_with(|| Value::Map(Map::new()))
                        .as_map_mut()
                    {
                        meta.insert(field.to_string(), value);
                    }
                }
            }
            _ if want.is_null() => {}
            _ => {
                let have = observed.get(key).unwrap_or(&Value::Null);
                let value = merge_value(want, have, mode, key, &mut diffs);
                merged.insert(key.clone(), value);
            }
        }
    }

    Comparison {
        compliant: diffs.is_empty(),
        merged: Value::Map(merged),
        diffs,
    }
}

/// Renders differences one per line, sorted by path.
pub fn describe(diffs: &[Difference]) -> String {
    let mut lines = diffs.iter().map(ToString::to_string).collect::<Vec<_>>();
    lines.sort();
    lines.join("\n")
}

fn merge_value(
    desired: &Value,
    observed: &Value,
    mode: ComplianceType,
    path: &str,
    diffs: &mut Vec<Difference>,
) -> Value {
    match (desired, observed) {
        (want, have) if is_unconstrained(want) => have.clone(),
        (Value::Map(want), Value::Map(have)) => {
            Value::Map(merge_map(want, have, mode, path, diffs))
        }
        (Value::Seq(want), Value::Seq(have)) => {
            let lists = list::compare_lists(want, have, mode);
            if !lists.compliant {
                diffs.push(Difference {
                    path: path.to_string(),
                    observed: Some(observed.clone()),
                    desired: Some(desired.clone()),
                });
            }
            Value::Seq(lists.merged)
        }
        (want, have) if want == have => have.clone(),
        (want, have) => {
            // Missing, mismatched or re-typed: the desired value wins.
            diffs.push(Difference {
                path: path.to_string(),
                observed: (!have.is_null()).then(|| have.clone()),
                desired: Some(without_nulls(want)),
            });
            without_nulls(want)
        }
    }
}

fn merge_map(
    desired: &Map,
    observed: &Map,
    mode: ComplianceType,
    path: &str,
    diffs: &mut Vec<Difference>,
) -> Map {
    let only = mode == ComplianceType::MustOnlyHave;
    let mut merged = Map::with_capacity(observed.len().max(desired.len()));

    for (key, have) in observed.iter() {
        match desired.get(key) {
            Some(want) => {
                let value = merge_value(want, have, mode, &join(path, key), diffs);
                merged.insert(key.clone(), value);
            }
            None if only => diffs.push(Difference {
                path: join(path, key),
                observed: Some(have.clone()),
                desired: None,
            }),
            None => {
                merged.insert(key.clone(), have.clone());
            }
        }
    }

    for (key, want) in desired.iter() {
        if is_unconstrained(want) || observed.contains_key(key) {
            continue;
        }
        let value = merge_value(want, &Value::Null, mode, &join(path, key), diffs);
        merged.insert(key.clone(), value);
    }

    merged
}

/// Null values, and maps holding nothing but null values, place no
/// constraint on the observed document.
fn is_unconstrained(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Map(map) => !map.is_empty() && map.values().all(is_unconstrained),
        _ => false,
    }
}

/// Strips map entries whose value is null, since they carry no constraint.
pub(crate) fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Map(map) => Value::Map(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        Value::Seq(items) => Value::Seq(items.iter().map(without_nulls).collect()),
        v => v.clone(),
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

// === impl Difference ===

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.path)?;
        match &self.observed {
            Some(v) => write!(f, "{v}")?,
            None => f.write_str("<missing>")?,
        }
        f.write_str(" -> ")?;
        match &self.desired {
            Some(v) => write!(f, "{v}"),
            None => f.write_str("<removed>"),
        }
    }
}
