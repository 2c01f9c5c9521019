use std::{
    cmp::Ordering,
    fmt,
};

use serde::{
    Deserialize,
    Serialize,
};

/// A dynamically typed, totally ordered index value.
///
/// Integers and floats compare numerically with each other so range
/// queries over mixed numeric data behave; when they are numerically equal
/// the integer sorts first, which keeps the order total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::List(_) => 3,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// View the value as a sequence: lists yield their items, scalars
    /// yield themselves.
    pub fn items(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    /// A `(principal, permission)` pair as stored in allowed indexes.
    pub fn pair(left: &str, right: &str) -> Self {
        Value::List(vec![
            Value::Text(left.to_string()),
            Value::Text(right.to_string()),
        ])
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => {
                (*a as f64).total_cmp(b).then(Ordering::Less)
            }
            (Value::Float(a), Value::Int(b)) => {
                a.total_cmp(&(*b as f64)).then(Ordering::Greater)
            }
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_compare_across_variants() {
        assert!(Value::Int(1) < Value::Float(1.5));
        assert!(Value::Float(0.5) < Value::Int(1));
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert!(Value::Int(1) < Value::Float(1.0));
    }

    #[test]
    fn variants_order_by_rank() {
        assert!(Value::Bool(true) < Value::Int(-5));
        assert!(Value::Int(100) < Value::Text("a".into()));
        assert!(Value::Text("z".into()) < Value::List(vec![]));
    }

    #[test]
    fn deserializes_json_scalars() {
        let v: Value = serde_json::from_str("[1, 2.5, \"x\", true]").unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Text("x".into()),
                Value::Bool(true),
            ])
        );
    }

    #[test]
    fn items_wraps_scalars() {
        assert_eq!(Value::from("a").items(), vec![Value::from("a")]);
        assert_eq!(Value::from(vec!["a", "b"]).items().len(), 2);
    }
}
