//! Abstract filter expressions: `{"field": value, "field__op": value, ...}`.

use crate::error::AppError;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    ILike,
    StartsWith,
    In,
}

impl Operator {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "ne" => Operator::Ne,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "like" => Operator::Like,
            "ilike" => Operator::ILike,
            "startswith" => Operator::StartsWith,
            "in" => Operator::In,
            _ => return None,
        })
    }

    /// Operators whose value is a text pattern.
    pub fn is_pattern(self) -> bool {
        matches!(self, Operator::Like | Operator::ILike | Operator::StartsWith)
    }

    pub fn is_ordering(self) -> bool {
        matches!(self, Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilterEntry {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl FilterEntry {
    /// Split `name__op` into field and operator. Keys whose suffix is not a
    /// known operator are plain equality on the whole key.
    pub fn from_key(key: &str, value: Value) -> Self {
        if let Some((field, suffix)) = key.rsplit_once("__") {
            if let Some(op) = Operator::from_suffix(suffix) {
                if !field.is_empty() {
                    return FilterEntry {
                        field: field.to_string(),
                        op,
                        value,
                    };
                }
            }
        }
        FilterEntry {
            field: key.to_string(),
            op: Operator::Eq,
            value,
        }
    }
}

/// Conjunction of filter entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterExpression {
    entries: Vec<FilterEntry>,
}

impl FilterExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_object(map: &Map<String, Value>) -> Self {
        FilterExpression {
            entries: map
                .iter()
                .map(|(k, v)| FilterEntry::from_key(k, v.clone()))
                .collect(),
        }
    }

    /// Parse a `where` clause. Only JSON objects are accepted.
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| AppError::Validation("unable to parse `where` clause".into()))?;
        match value {
            Value::Object(map) => Ok(Self::from_object(&map)),
            _ => Err(AppError::Validation("`where` clause must be an object".into())),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.entries.push(FilterEntry::from_key(key, value));
        self
    }

    pub fn push(&mut self, entry: FilterEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Conjunction of both expressions.
    pub fn and(mut self, other: FilterExpression) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn references(&self, field: &str) -> bool {
        self.entries.iter().any(|e| e.field == field)
    }

    /// Value of the first equality entry on `field`.
    pub fn equality_value(&self, field: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.field == field && e.op == Operator::Eq)
            .map(|e| &e.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("name", "name", Operator::Eq)]
    #[case("name__ne", "name", Operator::Ne)]
    #[case("name__ilike", "name", Operator::ILike)]
    #[case("name__startswith", "name", Operator::StartsWith)]
    #[case("prog__lte", "prog", Operator::Lte)]
    #[case("first__name", "first__name", Operator::Eq)]
    #[case("__ne", "__ne", Operator::Eq)]
    fn splits_operator_suffix(#[case] key: &str, #[case] field: &str, #[case] op: Operator) {
        let entry = FilterEntry::from_key(key, json!(1));
        assert_eq!(entry.field, field);
        assert_eq!(entry.op, op);
    }

    #[test]
    fn parses_where_object() {
        let f = FilterExpression::parse(r#"{"firstname": "john", "prog__gt": 3}"#).unwrap();
        assert_eq!(f.len(), 2);
        assert!(f.references("prog"));
        assert_eq!(f.equality_value("firstname"), Some(&json!("john")));
        assert_eq!(f.equality_value("prog"), None);
    }

    #[rstest]
    #[case("firstname == 'john'")]
    #[case("[1, 2]")]
    fn rejects_unparseable_where(#[case] text: &str) {
        assert!(FilterExpression::parse(text).unwrap_err().is_validation());
    }

    #[test]
    fn and_concatenates_entries() {
        let a = FilterExpression::new().with("a", json!(1));
        let b = FilterExpression::new().with("b__ne", json!(2));
        let both = a.and(b);
        assert_eq!(both.len(), 2);
        assert_eq!(both.entries()[1].op, Operator::Ne);
    }
}
