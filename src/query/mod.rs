//! Structured queries over prefixes, pools and VRFs.
//!
//! A [`Query`] is a tree of `and`/`or` nodes over leaf comparisons. Before
//! running it is compiled against an entity's attribute table, which
//! resolves attribute names, coerces literals to the attribute's type and
//! compiles regexes. Unknown attributes and ill-typed literals fail at
//! compile time, never silently at match time.

pub mod attrs;
pub mod smart;

use std::cmp::Ordering;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cidr::{Cidr, HostBits};
use crate::db::models::{parse_timestamp, Prefix};
use crate::error::{IpamError, Result};

pub use attrs::{AttrKind, Attribute, Searchable, Value};
pub use smart::{Interpretation, SmartQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    And,
    Or,
    Equals,
    NotEquals,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    RegexMatch,
    RegexNotMatch,
    /// CIDR: strictly contains. Text: substring. Tags: has element.
    Contains,
    ContainsEquals,
    ContainedWithin,
    ContainedWithinEquals,
    /// Equality; on tag sets, membership.
    EqualsAny,
}

impl Operator {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "and" => Operator::And,
            "or" => Operator::Or,
            "equals" | "=" => Operator::Equals,
            "not_equals" | "!=" => Operator::NotEquals,
            "less" | "less_than" | "<" => Operator::Less,
            "less_or_equal" | "<=" => Operator::LessOrEqual,
            "greater" | "greater_than" | ">" => Operator::Greater,
            "greater_or_equal" | ">=" => Operator::GreaterOrEqual,
            "regex_match" | "~" | "~*" => Operator::RegexMatch,
            "regex_not_match" | "!~" | "!~*" => Operator::RegexNotMatch,
            "contains" | ">>" => Operator::Contains,
            "contains_equals" | ">>=" => Operator::ContainsEquals,
            "contained_within" | "<<" => Operator::ContainedWithin,
            "contained_within_equals" | "<<=" => Operator::ContainedWithinEquals,
            "equals_any" => Operator::EqualsAny,
            other => return Err(IpamError::NoSuchOperator(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::And => "and",
            Operator::Or => "or",
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Less => "less",
            Operator::LessOrEqual => "less_or_equal",
            Operator::Greater => "greater",
            Operator::GreaterOrEqual => "greater_or_equal",
            Operator::RegexMatch => "regex_match",
            Operator::RegexNotMatch => "regex_not_match",
            Operator::Contains => "contains",
            Operator::ContainsEquals => "contains_equals",
            Operator::ContainedWithin => "contained_within",
            Operator::ContainedWithinEquals => "contained_within_equals",
            Operator::EqualsAny => "equals_any",
        }
    }

    fn is_boolean(&self) -> bool {
        matches!(self, Operator::And | Operator::Or)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(serde_json::Value),
    Attribute(String),
}

/// A query expression. On the wire this is the nested
/// `{"operator": .., "val1": .., "val2": ..}` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawQuery", into = "RawQuery")]
pub enum Query {
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Compare {
        op: Operator,
        attribute: String,
        operand: Operand,
    },
}

impl Query {
    pub fn compare(op: Operator, attribute: &str, literal: impl Into<serde_json::Value>) -> Self {
        Query::Compare {
            op,
            attribute: attribute.to_string(),
            operand: Operand::Literal(literal.into()),
        }
    }

    /// Compare two attributes of the same record.
    pub fn compare_attributes(op: Operator, left: &str, right: &str) -> Self {
        Query::Compare {
            op,
            attribute: left.to_string(),
            operand: Operand::Attribute(right.to_string()),
        }
    }

    pub fn equals(attribute: &str, literal: impl Into<serde_json::Value>) -> Self {
        Query::compare(Operator::Equals, attribute, literal)
    }

    pub fn and(self, other: Query) -> Self {
        Query::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Query) -> Self {
        Query::Or(Box::new(self), Box::new(other))
    }

    /// Parse the wire form, keeping the error kinds distinct (an unknown
    /// operator is not the same as a malformed tree).
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let raw: RawQuery =
            serde_json::from_value(value).map_err(|e| IpamError::input("query", e))?;
        Query::from_raw(raw)
    }

    fn from_raw(raw: RawQuery) -> Result<Self> {
        let op = Operator::parse(&raw.operator)?;
        if op.is_boolean() {
            let left = Query::from_json(raw.val1)?;
            let right = Query::from_json(raw.val2)?;
            return Ok(match op {
                Operator::And => Query::And(Box::new(left), Box::new(right)),
                _ => Query::Or(Box::new(left), Box::new(right)),
            });
        }

        let attribute = match raw.val1 {
            serde_json::Value::String(s) => s,
            other => {
                return Err(IpamError::input(
                    "query",
                    format!("val1 of '{op}' must be an attribute name, got {other}"),
                ))
            }
        };
        let operand = match raw.val2 {
            serde_json::Value::Object(mut m) if m.len() == 1 && m.contains_key("attribute") => {
                match m.remove("attribute") {
                    Some(serde_json::Value::String(s)) => Operand::Attribute(s),
                    _ => return Err(IpamError::input("query", "attribute reference must be a string")),
                }
            }
            v @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))
                if !matches!(v, serde_json::Value::Array(ref a) if a.iter().all(|e| e.is_string())) =>
            {
                return Err(IpamError::input(
                    "query",
                    format!("val2 of '{op}' must be a literal, got {v}"),
                ))
            }
            v => Operand::Literal(v),
        };
        Ok(Query::Compare { op, attribute, operand })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Query::And(l, r) => json!({"operator": "and", "val1": l.to_json(), "val2": r.to_json()}),
            Query::Or(l, r) => json!({"operator": "or", "val1": l.to_json(), "val2": r.to_json()}),
            Query::Compare { op, attribute, operand } => {
                let val2 = match operand {
                    Operand::Literal(v) => v.clone(),
                    Operand::Attribute(a) => json!({ "attribute": a }),
                };
                json!({"operator": op.name(), "val1": attribute, "val2": val2})
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawQuery {
    operator: String,
    #[serde(default)]
    val1: serde_json::Value,
    #[serde(default)]
    val2: serde_json::Value,
}

impl TryFrom<RawQuery> for Query {
    type Error = IpamError;

    fn try_from(raw: RawQuery) -> Result<Self> {
        Query::from_raw(raw)
    }
}

impl From<Query> for RawQuery {
    fn from(q: Query) -> Self {
        match q.to_json() {
            serde_json::Value::Object(mut m) => RawQuery {
                operator: match m.remove("operator") {
                    Some(serde_json::Value::String(s)) => s,
                    _ => String::new(),
                },
                val1: m.remove("val1").unwrap_or_default(),
                val2: m.remove("val2").unwrap_or_default(),
            },
            _ => RawQuery {
                operator: String::new(),
                val1: serde_json::Value::Null,
                val2: serde_json::Value::Null,
            },
        }
    }
}

/// Options accepted by every search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchOptions {
    /// Cap on returned rows; the engine default applies when unset.
    pub max_result: Option<usize>,
    pub offset: usize,
    /// Ancestor rows to include per match; -1 is unlimited.
    pub parents_depth: i32,
    /// Descendant rows to include per match; -1 is unlimited.
    pub children_depth: i32,
    pub include_all_parents: bool,
    pub include_all_children: bool,
}

/// A search result row for prefixes. Context rows pulled in by the depth
/// options have `matched == false`.
#[derive(Debug, Clone, Serialize)]
pub struct PrefixMatch {
    pub prefix: Prefix,
    #[serde(rename = "match")]
    pub matched: bool,
    pub display: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult<T> {
    pub search_options: SearchOptions,
    pub result: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmartSearchResult<T> {
    pub interpretation: Vec<Interpretation>,
    pub search_options: SearchOptions,
    pub result: Vec<T>,
    /// Set when the query text itself was malformed (e.g. an unclosed quote).
    pub error: Option<String>,
}

/// A query bound to the attribute table of `T`.
pub struct Compiled<T: 'static> {
    root: Node<T>,
}

enum Node<T: 'static> {
    And(Box<Node<T>>, Box<Node<T>>),
    Or(Box<Node<T>>, Box<Node<T>>),
    Leaf {
        attr: &'static Attribute<T>,
        op: Operator,
        rhs: Rhs<T>,
    },
}

enum Rhs<T: 'static> {
    Value(Value),
    Regex(Regex),
    Attr(&'static Attribute<T>),
}

impl<T: Searchable> Compiled<T> {
    pub fn new(query: &Query) -> Result<Self> {
        Ok(Self {
            root: compile(query)?,
        })
    }

    /// Evaluate against one record. Boolean nodes short-circuit left to
    /// right.
    pub fn matches(&self, record: &T) -> bool {
        eval(&self.root, record)
    }
}

fn compile<T: Searchable>(query: &Query) -> Result<Node<T>> {
    match query {
        Query::And(l, r) => Ok(Node::And(Box::new(compile(l)?), Box::new(compile(r)?))),
        Query::Or(l, r) => Ok(Node::Or(Box::new(compile(l)?), Box::new(compile(r)?))),
        Query::Compare { op, attribute, operand } => compile_leaf(*op, attribute, operand),
    }
}

fn lookup<T: Searchable>(name: &str) -> Result<&'static Attribute<T>> {
    T::attribute(name).ok_or_else(|| IpamError::UnknownAttribute {
        entity: T::ENTITY,
        attribute: name.to_string(),
    })
}

fn compile_leaf<T: Searchable>(op: Operator, attribute: &str, operand: &Operand) -> Result<Node<T>> {
    let attr = lookup::<T>(attribute)?;
    let kind = attr.kind;
    let not_applicable = || {
        IpamError::input(
            attribute,
            format!("operator '{op}' does not apply to {} attributes", kind.name()),
        )
    };

    if op.is_boolean() {
        return Err(IpamError::input(attribute, format!("'{op}' needs two sub-queries")));
    }

    let rhs = match operand {
        Operand::Attribute(other) => {
            let other_attr = lookup::<T>(other)?;
            let compatible = other_attr.kind == kind
                || (kind.is_textual() && other_attr.kind.is_textual());
            if !compatible {
                return Err(IpamError::input(
                    attribute,
                    format!("cannot compare with '{other}' of type {}", other_attr.kind.name()),
                ));
            }
            if matches!(op, Operator::RegexMatch | Operator::RegexNotMatch) {
                return Err(not_applicable());
            }
            Rhs::Attr(other_attr)
        }
        Operand::Literal(lit) => match op {
            Operator::RegexMatch | Operator::RegexNotMatch => {
                let pattern = lit
                    .as_str()
                    .ok_or_else(|| IpamError::input(attribute, "regex must be a string"))?;
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| IpamError::input(attribute, e))?;
                Rhs::Regex(re)
            }
            Operator::Less | Operator::LessOrEqual | Operator::Greater | Operator::GreaterOrEqual => {
                if matches!(kind, AttrKind::Boolean | AttrKind::TagSet) {
                    return Err(not_applicable());
                }
                Rhs::Value(coerce(attribute, kind, lit)?)
            }
            Operator::Contains => match kind {
                AttrKind::Cidr => match lit.as_str().map(|s| Cidr::parse(s, HostBits::Mask)) {
                    Some(Ok(c)) => Rhs::Value(Value::Cidr(c)),
                    // not CIDR-shaped: substring on the text form
                    Some(Err(_)) => Rhs::Value(coerce(attribute, AttrKind::Text, lit)?),
                    None => return Err(IpamError::input(attribute, "expected a prefix")),
                },
                AttrKind::Text | AttrKind::Enum(_) | AttrKind::TagSet => {
                    Rhs::Value(coerce(attribute, AttrKind::Text, lit)?)
                }
                _ => return Err(not_applicable()),
            },
            Operator::ContainsEquals | Operator::ContainedWithin | Operator::ContainedWithinEquals => {
                if kind != AttrKind::Cidr {
                    return Err(not_applicable());
                }
                Rhs::Value(coerce(attribute, kind, lit)?)
            }
            _ => Rhs::Value(coerce(attribute, kind, lit)?),
        },
    };

    Ok(Node::Leaf { attr, op, rhs })
}

/// Turn a JSON literal into a value of the attribute's kind.
fn coerce(attribute: &str, kind: AttrKind, lit: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as J;

    let bad = |what: &str| IpamError::input(attribute, format!("expected {what}, got {lit}"));

    if lit.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        AttrKind::Text => match lit {
            J::String(s) => Ok(Value::Text(s.clone())),
            J::Number(n) => Ok(Value::Text(n.to_string())),
            J::Bool(b) => Ok(Value::Text(b.to_string())),
            _ => Err(bad("text")),
        },
        AttrKind::Enum(allowed) => match lit.as_str() {
            Some(s) if allowed.contains(&s) => Ok(Value::Text(s.to_string())),
            Some(s) => Err(IpamError::input(
                attribute,
                format!("'{s}' is not one of {}", allowed.join(", ")),
            )),
            None => Err(bad("text")),
        },
        AttrKind::Integer => {
            let n = match lit {
                J::Number(n) => n
                    .as_i64()
                    .map(i128::from)
                    .or_else(|| n.as_u64().map(i128::from)),
                J::String(s) => s.trim().parse::<i128>().ok(),
                _ => None,
            };
            n.map(Value::Int).ok_or_else(|| bad("an integer"))
        }
        AttrKind::Cidr => {
            let s = lit.as_str().ok_or_else(|| bad("a prefix"))?;
            Cidr::parse(s, HostBits::Mask)
                .map(Value::Cidr)
                .map_err(|e| IpamError::input(attribute, e))
        }
        AttrKind::Timestamp => {
            let s = lit.as_str().ok_or_else(|| bad("a timestamp"))?;
            parse_timestamp(s)
                .map(Value::Time)
                .map_err(|e| IpamError::input(attribute, e))
        }
        AttrKind::Boolean => match lit {
            J::Bool(b) => Ok(Value::Bool(*b)),
            J::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(bad("a boolean")),
            },
            J::Number(n) => Ok(Value::Bool(n.as_i64() != Some(0))),
            _ => Err(bad("a boolean")),
        },
        AttrKind::TagSet => match lit {
            J::String(s) => Ok(Value::Text(s.clone())),
            J::Array(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(|mut v| {
                    v.sort();
                    Value::Tags(v)
                })
                .ok_or_else(|| bad("a list of tags")),
            _ => Err(bad("a tag")),
        },
    }
}

fn eval<T>(node: &Node<T>, record: &T) -> bool {
    match node {
        Node::And(l, r) => eval(l, record) && eval(r, record),
        Node::Or(l, r) => eval(l, record) || eval(r, record),
        Node::Leaf { attr, op, rhs } => {
            let lhs = (attr.get)(record);
            match rhs {
                Rhs::Regex(re) => eval_regex(&lhs, re, *op),
                Rhs::Value(v) => eval_cmp(&lhs, *op, v),
                Rhs::Attr(other) => eval_cmp(&lhs, *op, &(other.get)(record)),
            }
        }
    }
}

fn eval_regex(lhs: &Value, re: &Regex, op: Operator) -> bool {
    let hit = match lhs {
        Value::Null => return false,
        Value::Tags(tags) => tags.iter().any(|t| re.is_match(t)),
        other => other.as_text().is_some_and(|s| re.is_match(&s)),
    };
    match op {
        Operator::RegexNotMatch => !hit,
        _ => hit,
    }
}

/// Comparison with SQL-style nulls: `= null` tests for null, `!= null`
/// for non-null, and anything else involving null is false.
fn eval_cmp(lhs: &Value, op: Operator, rhs: &Value) -> bool {
    match (op, rhs) {
        (Operator::Equals | Operator::EqualsAny, Value::Null) => return lhs.is_null(),
        (Operator::NotEquals, Value::Null) => return !lhs.is_null(),
        _ => {}
    }
    if lhs.is_null() || rhs.is_null() {
        return false;
    }

    match op {
        Operator::Equals | Operator::EqualsAny => equal(lhs, rhs),
        Operator::NotEquals => !equal(lhs, rhs),
        Operator::Less => lhs.compare(rhs) == Some(Ordering::Less),
        Operator::LessOrEqual => matches!(lhs.compare(rhs), Some(Ordering::Less | Ordering::Equal)),
        Operator::Greater => lhs.compare(rhs) == Some(Ordering::Greater),
        Operator::GreaterOrEqual => {
            matches!(lhs.compare(rhs), Some(Ordering::Greater | Ordering::Equal))
        }
        Operator::Contains => match (lhs, rhs) {
            (Value::Cidr(a), Value::Cidr(b)) => a.contains_strict(b),
            (Value::Tags(tags), Value::Text(t)) => tags.contains(t),
            (l, Value::Text(t)) => l.as_text().is_some_and(|s| s.contains(t.as_str())),
            _ => false,
        },
        Operator::ContainsEquals => cidrs(lhs, rhs).is_some_and(|(a, b)| a.contains(b)),
        Operator::ContainedWithin => cidrs(lhs, rhs).is_some_and(|(a, b)| b.contains_strict(a)),
        Operator::ContainedWithinEquals => cidrs(lhs, rhs).is_some_and(|(a, b)| b.contains(a)),
        Operator::And | Operator::Or | Operator::RegexMatch | Operator::RegexNotMatch => false,
    }
}

fn equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Tags(tags), Value::Text(t)) => tags.contains(t),
        (l, r) => l == r,
    }
}

fn cidrs<'a>(lhs: &'a Value, rhs: &'a Value) -> Option<(&'a Cidr, &'a Cidr)> {
    match (lhs, rhs) {
        (Value::Cidr(a), Value::Cidr(b)) => Some((a, b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Pool, PrefixType, Vrf};
    use crate::error::ErrorKind;
    use chrono::{TimeZone, Utc};

    fn prefix(cidr: &str) -> Prefix {
        let mut p = Prefix::new(1, 0, cidr.parse().unwrap(), PrefixType::Reservation, Utc::now());
        p.description = Some("Core Network".into());
        p.node = Some("rtr1.example".into());
        p.vlan = Some(100);
        p.tags.insert("backbone".into());
        p
    }

    fn run(q: serde_json::Value, p: &Prefix) -> bool {
        let q = Query::from_json(q).unwrap();
        Compiled::<Prefix>::new(&q).unwrap().matches(p)
    }

    #[test]
    fn test_wire_roundtrip() {
        let q = Query::equals("type", "assignment").and(Query::compare(
            Operator::ContainedWithin,
            "prefix",
            "10.0.0.0/8",
        ));
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["operator"], "and");
        assert_eq!(json["val2"]["operator"], "contained_within");
        let back: Query = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn test_unknown_operator_and_attribute() {
        let err = Query::from_json(json!({"operator": "near", "val1": "prefix", "val2": "x"})).unwrap_err();
        assert_eq!(err.code(), 1130);

        let q = Query::equals("colour", "blue");
        let err = Compiled::<Prefix>::new(&q).err().unwrap();
        assert!(matches!(err, IpamError::UnknownAttribute { entity: "prefix", .. }));
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_nested_error_keeps_kind() {
        let err = Query::from_json(json!({
            "operator": "or",
            "val1": {"operator": "equals", "val1": "node", "val2": "a"},
            "val2": {"operator": "bogus", "val1": "node", "val2": "b"},
        }))
        .unwrap_err();
        assert!(matches!(err, IpamError::NoSuchOperator(_)));
    }

    #[test]
    fn test_equality_and_null() {
        let p = prefix("10.0.0.0/8");
        assert!(run(json!({"operator": "equals", "val1": "node", "val2": "rtr1.example"}), &p));
        assert!(run(json!({"operator": "equals", "val1": "comment", "val2": null}), &p));
        assert!(!run(json!({"operator": "not_equals", "val1": "comment", "val2": null}), &p));
        // null never compares unequal to a value
        assert!(!run(json!({"operator": "not_equals", "val1": "comment", "val2": "x"}), &p));
    }

    #[test]
    fn test_numeric_not_textual() {
        let p = prefix("10.0.0.0/8");
        // textually "100" < "9", numerically not
        assert!(!run(json!({"operator": "<", "val1": "vlan", "val2": 9}), &p));
        assert!(run(json!({"operator": ">", "val1": "vlan", "val2": "99"}), &p));
        assert!(run(json!({"operator": "<=", "val1": "prefix_length", "val2": 8}), &p));
    }

    #[test]
    fn test_timestamps() {
        let mut p = prefix("10.0.0.0/8");
        p.expires = Some(Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap());
        assert!(run(json!({"operator": ">", "val1": "expires", "val2": "2030-01-01"}), &p));
        assert!(!run(json!({"operator": "<", "val1": "expires", "val2": "2030-01-01T00:00:00Z"}), &p));
    }

    #[test]
    fn test_cidr_operators() {
        let p = prefix("10.1.0.0/16");
        let q = |op: &str, v: &str| json!({"operator": op, "val1": "prefix", "val2": v});
        assert!(run(q("contained_within", "10.0.0.0/8"), &p));
        assert!(!run(q("contained_within", "10.1.0.0/16"), &p));
        assert!(run(q("contained_within_equals", "10.1.0.0/16"), &p));
        assert!(run(q("contains", "10.1.2.0/24"), &p));
        assert!(!run(q("contains", "10.1.0.0/16"), &p));
        assert!(run(q("contains_equals", "10.1.0.0/16"), &p));
        assert!(run(q(">>=", "10.1.2.3"), &p));
        assert!(!run(q("<<", "192.168.0.0/16"), &p));
    }

    #[test]
    fn test_contains_text_and_tags() {
        let p = prefix("10.0.0.0/8");
        assert!(run(json!({"operator": "contains", "val1": "node", "val2": "rtr1"}), &p));
        assert!(run(json!({"operator": "contains", "val1": "tags", "val2": "backbone"}), &p));
        assert!(run(json!({"operator": "equals_any", "val1": "tags", "val2": "backbone"}), &p));
        assert!(!run(json!({"operator": "equals_any", "val1": "tags", "val2": "edge"}), &p));
        // not CIDR-shaped, so substring on the text form
        assert!(run(json!({"operator": "contains", "val1": "prefix", "val2": "10.0"}), &p));
    }

    #[test]
    fn test_regex_case_insensitive() {
        let p = prefix("10.0.0.0/8");
        assert!(run(json!({"operator": "regex_match", "val1": "description", "val2": "core"}), &p));
        assert!(run(json!({"operator": "regex_not_match", "val1": "description", "val2": "^edge"}), &p));
        assert!(!run(json!({"operator": "regex_match", "val1": "comment", "val2": ".*"}), &p));

        let bad = Query::compare(Operator::RegexMatch, "description", "(");
        assert_eq!(Compiled::<Prefix>::new(&bad).err().unwrap().kind(), ErrorKind::Input);
    }

    #[test]
    fn test_attribute_vs_attribute() {
        let mut p = prefix("10.0.0.0/8");
        p.order_id = Some("X1".into());
        p.customer_id = Some("X1".into());
        let q = Query::compare_attributes(Operator::Equals, "order_id", "customer_id");
        assert!(Compiled::<Prefix>::new(&q).unwrap().matches(&p));

        let q = Query::compare_attributes(Operator::Equals, "vlan", "description");
        assert!(Compiled::<Prefix>::new(&q).is_err());
    }

    #[test]
    fn test_type_checks() {
        let cases = [
            Query::equals("type", "subnet"),
            Query::equals("vlan", "ten"),
            Query::compare(Operator::Less, "monitor", true),
            Query::compare(Operator::ContainedWithin, "node", "10.0.0.0/8"),
            Query::equals("prefix", "not-a-prefix"),
        ];
        for q in cases {
            let err = Compiled::<Prefix>::new(&q).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::Input, "{q:?}");
        }
    }

    #[test]
    fn test_short_circuit() {
        // right side would compare a null; left side decides
        let p = prefix("10.0.0.0/8");
        let q = Query::equals("node", "rtr1.example").or(Query::equals("comment", "x"));
        assert!(Compiled::<Prefix>::new(&q).unwrap().matches(&p));
        let q = Query::equals("node", "nope").and(Query::equals("vlan", 100));
        assert!(!Compiled::<Prefix>::new(&q).unwrap().matches(&p));
    }

    #[test]
    fn test_other_entities() {
        let mut pool = Pool::new(1, "customers".into());
        pool.default_type = Some(PrefixType::Assignment);
        let q = Query::equals("default_type", "assignment");
        assert!(Compiled::<Pool>::new(&q).unwrap().matches(&pool));

        let mut vrf = Vrf::new(2, "blue".into());
        vrf.rt = Some("65000:2".into());
        let q = Query::compare(Operator::RegexMatch, "rt", "^65000:");
        assert!(Compiled::<Vrf>::new(&q).unwrap().matches(&vrf));
        assert!(Compiled::<Vrf>::new(&Query::equals("prefix", "10.0.0.0/8")).is_err());
    }

    #[test]
    fn test_search_options_defaults() {
        let opts: SearchOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.max_result, None);
        assert_eq!(opts.children_depth, 0);
        assert!(serde_json::from_str::<SearchOptions>(r#"{"depth": 1}"#).is_err());
    }
}
