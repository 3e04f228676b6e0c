// ABOUTME: Field filters for entity listings
// ABOUTME: "field/op:value" expressions matched against a flattened JSON view of any serializable value

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Separator used when displaying a filter
pub const FILTER_SEPARATOR: &str = ";";
/// Separator between the field path and the comparison
pub const FIELD_VALUE_SEPARATOR: char = '/';

/// Comparison applied by one filter expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    NotEqual,
    Contains,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
}

impl Op {
    /// Split `op:value`; anything without a known operator prefix is an equality test
    fn parse(spec: &str) -> (Op, &str) {
        if let Some((name, operand)) = spec.split_once(':') {
            let op = match name {
                "contains" => Some(Op::Contains),
                "gt" => Some(Op::Greater),
                "lt" => Some(Op::Less),
                "gte" => Some(Op::GreaterOrEqual),
                "lte" => Some(Op::LessOrEqual),
                "not" => Some(Op::NotEqual),
                _ => None,
            };
            if let Some(op) = op {
                return (op, operand);
            }
        }
        (Op::Equal, spec)
    }

    fn eval(self, value: &Value, operand: &str) -> bool {
        match self {
            Op::Equal => text(value) == operand,
            Op::NotEqual => text(value) != operand,
            Op::Contains => text(value).contains(operand),
            Op::Greater => integer(value) > int_operand(operand),
            Op::Less => integer(value) < int_operand(operand),
            Op::GreaterOrEqual => integer(value) >= int_operand(operand),
            Op::LessOrEqual => integer(value) <= int_operand(operand),
        }
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn integer(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::Bool(b) => *b as i64,
        Value::String(s) => int_operand(s),
        _ => 0,
    }
}

fn int_operand(raw: &str) -> i64 {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|f| f as i64))
        .unwrap_or(0)
}

/// A set of `field/op:value` expressions, any one of which may match
///
/// Field paths address nested values with `.`, e.g. `properties.device.class/sound`.
/// Supported operators are `contains`, `gt`, `lt`, `gte`, `lte` and `not`; without an
/// operator the value is compared for equality. Numeric operators compare integers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter(Vec<String>);

impl Filter {
    /// Build a filter from expressions
    pub fn new<I, S>(expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter(expressions.into_iter().map(Into::into).collect())
    }

    /// Add another expression
    pub fn push(&mut self, expression: impl Into<String>) {
        self.0.push(expression.into());
    }

    /// True when there are no expressions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any field of `item` satisfies any expression
    ///
    /// An empty filter matches everything; a value that cannot be serialized matches nothing.
    pub fn is_match<T: Serialize + ?Sized>(&self, item: &T) -> bool {
        if self.0.is_empty() {
            return true;
        }
        match serde_json::to_value(item) {
            Ok(value) => flatten(&value)
                .iter()
                .any(|(field, value)| self.is_field_match(field, value)),
            Err(e) => {
                log::debug!("Filter could not serialize value: {}", e);
                false
            }
        }
    }

    /// Whether one flattened field satisfies any expression naming it
    pub fn is_field_match(&self, field: &str, value: &Value) -> bool {
        if self.0.is_empty() {
            return true;
        }
        self.0.iter().any(|expression| {
            let Some((name, spec)) = expression.split_once(FIELD_VALUE_SEPARATOR) else {
                return false;
            };
            if name.is_empty() || name != field {
                return false;
            }
            let (op, operand) = Op::parse(spec);
            !operand.is_empty() && op.eval(value, operand)
        })
    }

    /// Keep only the fields of `input` that match, preserving their nesting
    pub fn apply(&self, input: &Value) -> Value {
        let mut out = Map::new();
        for (field, value) in flatten(input) {
            if self.is_field_match(&field, &value) {
                deep_set(&mut out, &field, value);
            }
        }
        Value::Object(out)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(FILTER_SEPARATOR))
    }
}

impl<S: Into<String>> FromIterator<S> for Filter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Filter::new(iter)
    }
}

/// Collapse nested objects into `a.b.c` keys; arrays and scalars are leaves
fn flatten(value: &Value) -> Vec<(String, Value)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(&path, child, out);
                }
            }
            leaf => out.push((prefix.to_string(), leaf.clone())),
        }
    }

    let mut out = Vec::new();
    if let Value::Object(_) = value {
        walk("", value, &mut out);
    }
    out
}

fn deep_set(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(last) = parts.pop() else {
        return;
    };

    let mut node = root;
    for part in parts {
        let entry = node
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(child) = entry else {
            return;
        };
        node = child;
    }
    node.insert(last.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn original() -> Value {
        json!({
            "x": { "y": { "z": 123 } },
            "a": { "b": { "c": true } }
        })
    }

    #[test]
    fn test_filter_apply() {
        let only_z = json!({ "x": { "y": { "z": 123 } } });

        let mut flt = Filter::new(["x.y.z/123"]);
        assert_eq!(flt.apply(&original()), only_z);

        flt.push("a.b.c/false");
        assert_eq!(flt.apply(&original()), only_z);

        let flt = Filter::new(["x.y.z/123", "a.b.c/true"]);
        assert_eq!(flt.apply(&original()), original());

        let flt = Filter::new(["x.y.z/gte:123"]);
        assert_eq!(flt.apply(&original()), only_z);

        let flt = Filter::new(["x.y.z/gt:123"]);
        assert_eq!(flt.apply(&original()), json!({}));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let flt = Filter::default();
        assert!(flt.is_match(&json!({ "name": "anything" })));
        assert_eq!(flt.apply(&original()), original());
    }

    #[derive(Serialize)]
    struct Entry {
        name: String,
        index: u32,
        properties: std::collections::BTreeMap<String, String>,
    }

    #[test]
    fn test_is_match_operators() {
        let entry = Entry {
            name: "alsa_output.analog-stereo".to_string(),
            index: 4,
            properties: [("device.class".to_string(), "sound".to_string())].into(),
        };

        assert!(Filter::new(["name/contains:analog"]).is_match(&entry));
        assert!(Filter::new(["index/lte:4"]).is_match(&entry));
        assert!(!Filter::new(["index/lt:4"]).is_match(&entry));
        assert!(Filter::new(["name/not:null"]).is_match(&entry));
        assert!(Filter::new(["properties.device.class/sound"]).is_match(&entry));
        assert!(!Filter::new(["missing/1", "name/null"]).is_match(&entry));
        assert!(Filter::new(["missing/1", "index/4"]).is_match(&entry));
    }

    #[test]
    fn test_unknown_operator_is_equality() {
        let value = json!({ "server": "tcp:host:4713" });
        assert!(Filter::new(["server/tcp:host:4713"]).is_match(&value));
        assert!(!Filter::new(["server/"]).is_match(&value));
    }

    #[test]
    fn test_display_joins_expressions() {
        let flt: Filter = ["a/1", "b/contains:x"].into_iter().collect();
        assert_eq!(flt.to_string(), "a/1;b/contains:x");
    }
}
