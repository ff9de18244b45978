use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// A label selector as written in a policy.
///
/// Kept untyped so that a malformed expression can be reported back to the
/// user instead of failing to decode the whole policy. Use
/// [`Selector::try_from`] to validate it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<RawExpression>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawExpression {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A validated label selector.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Map,
    match_expressions: Vec<Expression>,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum SelectorError {
    #[error("{0:?} is not a valid label selector operator")]
    InvalidOperator(String),

    #[error("values: Invalid value: []: for 'in', 'notin' operators, values set can't be empty")]
    EmptyValues,

    #[error(
        "values: Invalid value: [{}]: values set must be empty for exists and does not exist",
        .0.join(", ")
    )]
    UnexpectedValues(Vec<String>),

    #[error("key: Invalid value: \"\": name part must be non-empty")]
    EmptyKey,
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Vec<Expression>) -> Self {
        Self {
            match_labels: Map::new(),
            match_expressions: exprs,
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: map,
            match_expressions: Vec::new(),
        }
    }

    /// An empty selector selects everything.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_map(labels.as_ref())
    }

    pub fn matches_map(&self, labels: &Map) -> bool {
        for expr in self.match_expressions.iter() {
            if !expr.matches(labels) {
                return false;
            }
        }

        for (k, v) in self.match_labels.iter() {
            if labels.get(k) != Some(v) {
                return false;
            }
        }

        true
    }

    /// Renders the selector in the Kubernetes list query syntax, e.g.
    /// `app=web,tier in (a,b),!legacy`.
    pub fn to_query(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            if first {
                first = false;
                Ok(())
            } else {
                f.write_str(",")
            }
        };

        for (k, v) in self.match_labels.iter() {
            sep(f)?;
            write!(f, "{k}={v}")?;
        }
        for expr in self.match_expressions.iter() {
            sep(f)?;
            fmt::Display::fmt(expr, f)?;
        }
        Ok(())
    }
}

impl TryFrom<&RawSelector> for Selector {
    type Error = SelectorError;

    fn try_from(raw: &RawSelector) -> Result<Self, Self::Error> {
        let match_expressions = raw
            .match_expressions
            .iter()
            .flatten()
            .map(Expression::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            match_labels: raw.match_labels.clone().unwrap_or_default(),
            match_expressions,
        })
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: impl ToString,
        operator: Operator,
        values: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map(|v| self.values.contains(v))
                .unwrap_or(false),
            Operator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.contains(v))
                .unwrap_or(true),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, values()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values()),
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

impl TryFrom<&RawExpression> for Expression {
    type Error = SelectorError;

    fn try_from(raw: &RawExpression) -> Result<Self, Self::Error> {
        if raw.key.is_empty() {
            return Err(SelectorError::EmptyKey);
        }

        let operator = match raw.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            op => return Err(SelectorError::InvalidOperator(op.to_string())),
        };

        let values = raw.values.clone().unwrap_or_default();
        match operator {
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(SelectorError::EmptyValues)
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(SelectorError::UnexpectedValues(values))
            }
            _ => {}
        }

        Ok(Self {
            key: raw.key.clone(),
            operator,
            values: values.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    fn raw_expr(key: &str, operator: &str, values: Option<Vec<&str>>) -> RawSelector {
        RawSelector {
            match_labels: None,
            match_expressions: Some(vec![RawExpression {
                key: key.to_string(),
                operator: operator.to_string(),
                values: values.map(|vs| vs.into_iter().map(String::from).collect()),
            }]),
        }
    }

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::In, ["bar"]))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "expression match",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::NotIn, ["bar"]))),
                Labels::from_iter(vec![("foo", "bar")]),
                false,
                "notin excludes listed value",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::NotIn, ["bar"]))),
                Labels::default(),
                true,
                "notin matches absent key",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::Exists,
                    Vec::<String>::new(),
                ))),
                Labels::from_iter(vec![("foo", "x")]),
                true,
                "exists",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::DoesNotExist,
                    Vec::<String>::new(),
                ))),
                Labels::from_iter(vec![("foo", "x")]),
                false,
                "does not exist",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = Selector::try_from(&raw_expr("name", "Seriously", None)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "\"Seriously\" is not a valid label selector operator"
        );
    }

    #[test]
    fn rejects_empty_in_values() {
        let err = Selector::try_from(&raw_expr("name", "In", Some(vec![]))).unwrap_err();
        assert_eq!(err, SelectorError::EmptyValues);
        assert_eq!(
            err.to_string(),
            "values: Invalid value: []: for 'in', 'notin' operators, values set can't be empty"
        );

        let err = Selector::try_from(&raw_expr("name", "NotIn", None)).unwrap_err();
        assert_eq!(err, SelectorError::EmptyValues);
    }

    #[test]
    fn rejects_values_for_exists() {
        let err = Selector::try_from(&raw_expr("name", "Exists", Some(vec!["a"]))).unwrap_err();
        assert_eq!(err, SelectorError::UnexpectedValues(vec!["a".to_string()]));
    }

    #[test]
    fn empty_raw_selectors_select_everything() {
        for raw in [
            RawSelector::default(),
            RawSelector {
                match_labels: Some(Map::new()),
                match_expressions: None,
            },
            RawSelector {
                match_labels: None,
                match_expressions: Some(vec![]),
            },
        ] {
            let selector = Selector::try_from(&raw).unwrap();
            assert!(selector.is_empty());
            assert!(selector.matches(&Labels::from_iter(Some(("any", "thing")))));
        }
    }

    #[test]
    fn renders_list_query() {
        let raw = RawSelector {
            match_labels: Some(maplit::btreemap! {
                "app".to_string() => "web".to_string(),
            }),
            match_expressions: Some(vec![
                RawExpression {
                    key: "tier".into(),
                    operator: "In".into(),
                    values: Some(vec!["b".into(), "a".into()]),
                },
                RawExpression {
                    key: "legacy".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
        };
        let selector = Selector::try_from(&raw).unwrap();
        assert_eq!(selector.to_query(), "app=web,tier in (a,b),!legacy");
    }
}
