//! Typed attribute descriptors for searchable entities.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::cidr::Cidr;
use crate::db::models::{AlarmPriority, Pool, Prefix, PrefixStatus, PrefixType, Vrf};

/// Comparison semantics of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Text,
    /// Text restricted to a fixed vocabulary.
    Enum(&'static [&'static str]),
    Integer,
    Cidr,
    Timestamp,
    Boolean,
    TagSet,
}

impl AttrKind {
    pub fn name(&self) -> &'static str {
        match self {
            AttrKind::Text => "text",
            AttrKind::Enum(_) => "enumeration",
            AttrKind::Integer => "integer",
            AttrKind::Cidr => "prefix",
            AttrKind::Timestamp => "timestamp",
            AttrKind::Boolean => "boolean",
            AttrKind::TagSet => "tag set",
        }
    }

    pub(crate) fn is_textual(&self) -> bool {
        matches!(self, AttrKind::Text | AttrKind::Enum(_))
    }
}

/// A materialized attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i128),
    Cidr(Cidr),
    Time(DateTime<Utc>),
    Bool(bool),
    Tags(Vec<String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Ordering between values of the same variant.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Cidr(a), Value::Cidr(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Tags(a), Value::Tags(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Text form used by regex and substring matching.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null | Value::Tags(_) => None,
            Value::Text(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Cidr(c) => Some(c.to_string()),
            Value::Time(t) => Some(t.to_rfc3339()),
            Value::Bool(b) => Some(b.to_string()),
        }
    }

    fn text(v: &Option<String>) -> Value {
        v.as_ref().map_or(Value::Null, |s| Value::Text(s.clone()))
    }

    fn int(v: impl Into<i128>) -> Value {
        Value::Int(v.into())
    }

    fn opt_int<I: Into<i128> + Copy>(v: Option<I>) -> Value {
        v.map_or(Value::Null, |i| Value::Int(i.into()))
    }

    fn count(v: u128) -> Value {
        Value::Int(i128::try_from(v).unwrap_or(i128::MAX))
    }

    fn time(v: &Option<DateTime<Utc>>) -> Value {
        v.map_or(Value::Null, Value::Time)
    }

    fn tags<'a>(v: impl IntoIterator<Item = &'a String>) -> Value {
        Value::Tags(v.into_iter().cloned().collect())
    }
}

/// One searchable attribute of `T`.
pub struct Attribute<T> {
    pub name: &'static str,
    pub kind: AttrKind,
    pub get: fn(&T) -> Value,
}

impl<T> std::fmt::Debug for Attribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// An entity the query evaluator can run over.
pub trait Searchable: Sized + 'static {
    /// Entity name used in error messages.
    const ENTITY: &'static str;

    fn attributes() -> &'static [Attribute<Self>];

    fn attribute(name: &str) -> Option<&'static Attribute<Self>> {
        Self::attributes().iter().find(|a| a.name == name)
    }
}

macro_rules! attr {
    ($name:literal, $kind:expr, $get:expr) => {
        Attribute {
            name: $name,
            kind: $kind,
            get: $get,
        }
    };
}

static PREFIX_ATTRIBUTES: &[Attribute<Prefix>] = &[
    attr!("id", AttrKind::Integer, |p| Value::int(p.id)),
    attr!("vrf_id", AttrKind::Integer, |p| Value::int(p.vrf_id)),
    attr!("vrf_rt", AttrKind::Text, |p| Value::text(&p.vrf_rt)),
    attr!("vrf_name", AttrKind::Text, |p| Value::text(&p.vrf_name)),
    attr!("prefix", AttrKind::Cidr, |p| Value::Cidr(p.prefix)),
    attr!("display_prefix", AttrKind::Text, |p| Value::Text(p.display_prefix.clone())),
    attr!("family", AttrKind::Integer, |p| Value::int(p.prefix.family().number())),
    attr!("prefix_length", AttrKind::Integer, |p| Value::int(p.prefix.len())),
    attr!("type", AttrKind::Enum(PrefixType::ALL), |p| {
        Value::Text(p.prefix_type.as_str().to_string())
    }),
    attr!("status", AttrKind::Enum(PrefixStatus::ALL), |p| {
        Value::Text(p.status.as_str().to_string())
    }),
    attr!("description", AttrKind::Text, |p| Value::text(&p.description)),
    attr!("comment", AttrKind::Text, |p| Value::text(&p.comment)),
    attr!("node", AttrKind::Text, |p| Value::text(&p.node)),
    attr!("country", AttrKind::Text, |p| Value::text(&p.country)),
    attr!("order_id", AttrKind::Text, |p| Value::text(&p.order_id)),
    attr!("customer_id", AttrKind::Text, |p| Value::text(&p.customer_id)),
    attr!("external_key", AttrKind::Text, |p| Value::text(&p.external_key)),
    attr!("vlan", AttrKind::Integer, |p| Value::opt_int(p.vlan)),
    attr!("monitor", AttrKind::Boolean, |p| Value::Bool(p.monitor)),
    attr!("alarm_priority", AttrKind::Enum(AlarmPriority::ALL), |p| {
        p.alarm_priority
            .map_or(Value::Null, |a| Value::Text(a.as_str().to_string()))
    }),
    attr!("tags", AttrKind::TagSet, |p| Value::tags(&p.tags)),
    attr!("inherited_tags", AttrKind::TagSet, |p| Value::tags(&p.inherited_tags)),
    attr!("pool_id", AttrKind::Integer, |p| Value::opt_int(p.pool_id)),
    attr!("pool_name", AttrKind::Text, |p| Value::text(&p.pool_name)),
    attr!("expires", AttrKind::Timestamp, |p| Value::time(&p.expires)),
    attr!("added", AttrKind::Timestamp, |p| Value::Time(p.added)),
    attr!("last_modified", AttrKind::Timestamp, |p| Value::Time(p.last_modified)),
    attr!("authoritative_source", AttrKind::Text, |p| {
        Value::Text(p.authoritative_source.clone())
    }),
    attr!("authenticated_as", AttrKind::Text, |p| Value::Text(p.authenticated_as.clone())),
    attr!("indent", AttrKind::Integer, |p| Value::int(p.indent)),
    attr!("children", AttrKind::Integer, |p| Value::int(p.children)),
    attr!("total_addresses", AttrKind::Integer, |p| Value::count(p.total_addresses)),
    attr!("used_addresses", AttrKind::Integer, |p| Value::count(p.used_addresses)),
    attr!("free_addresses", AttrKind::Integer, |p| Value::count(p.free_addresses)),
];

static POOL_ATTRIBUTES: &[Attribute<Pool>] = &[
    attr!("id", AttrKind::Integer, |p| Value::int(p.id)),
    attr!("name", AttrKind::Text, |p| Value::Text(p.name.clone())),
    attr!("description", AttrKind::Text, |p| Value::text(&p.description)),
    attr!("default_type", AttrKind::Enum(PrefixType::ALL), |p| {
        p.default_type
            .map_or(Value::Null, |t| Value::Text(t.as_str().to_string()))
    }),
    attr!("ipv4_default_prefix_length", AttrKind::Integer, |p| {
        Value::opt_int(p.ipv4_default_prefix_length)
    }),
    attr!("ipv6_default_prefix_length", AttrKind::Integer, |p| {
        Value::opt_int(p.ipv6_default_prefix_length)
    }),
    attr!("tags", AttrKind::TagSet, |p| Value::tags(&p.tags)),
    attr!("vrf_id", AttrKind::Integer, |p| Value::opt_int(p.vrf_id)),
    attr!("member_prefixes_v4", AttrKind::Integer, |p| Value::int(p.member_prefixes_v4)),
    attr!("member_prefixes_v6", AttrKind::Integer, |p| Value::int(p.member_prefixes_v6)),
    attr!("total_addresses_v4", AttrKind::Integer, |p| Value::count(p.total_addresses_v4)),
    attr!("total_addresses_v6", AttrKind::Integer, |p| Value::count(p.total_addresses_v6)),
    attr!("used_addresses_v4", AttrKind::Integer, |p| Value::count(p.used_addresses_v4)),
    attr!("used_addresses_v6", AttrKind::Integer, |p| Value::count(p.used_addresses_v6)),
    attr!("free_addresses_v4", AttrKind::Integer, |p| Value::count(p.free_addresses_v4)),
    attr!("free_addresses_v6", AttrKind::Integer, |p| Value::count(p.free_addresses_v6)),
];

static VRF_ATTRIBUTES: &[Attribute<Vrf>] = &[
    attr!("id", AttrKind::Integer, |v| Value::int(v.id)),
    attr!("rt", AttrKind::Text, |v| Value::text(&v.rt)),
    attr!("name", AttrKind::Text, |v| Value::Text(v.name.clone())),
    attr!("description", AttrKind::Text, |v| Value::text(&v.description)),
    attr!("tags", AttrKind::TagSet, |v| Value::tags(&v.tags)),
    attr!("num_prefixes_v4", AttrKind::Integer, |v| Value::int(v.num_prefixes_v4)),
    attr!("num_prefixes_v6", AttrKind::Integer, |v| Value::int(v.num_prefixes_v6)),
    attr!("total_addresses_v4", AttrKind::Integer, |v| Value::count(v.total_addresses_v4)),
    attr!("total_addresses_v6", AttrKind::Integer, |v| Value::count(v.total_addresses_v6)),
    attr!("used_addresses_v4", AttrKind::Integer, |v| Value::count(v.used_addresses_v4)),
    attr!("used_addresses_v6", AttrKind::Integer, |v| Value::count(v.used_addresses_v6)),
    attr!("free_addresses_v4", AttrKind::Integer, |v| Value::count(v.free_addresses_v4)),
    attr!("free_addresses_v6", AttrKind::Integer, |v| Value::count(v.free_addresses_v6)),
];

impl Searchable for Prefix {
    const ENTITY: &'static str = "prefix";

    fn attributes() -> &'static [Attribute<Self>] {
        PREFIX_ATTRIBUTES
    }
}

impl Searchable for Pool {
    const ENTITY: &'static str = "pool";

    fn attributes() -> &'static [Attribute<Self>] {
        POOL_ATTRIBUTES
    }
}

impl Searchable for Vrf {
    const ENTITY: &'static str = "VRF";

    fn attributes() -> &'static [Attribute<Self>] {
        VRF_ATTRIBUTES
    }
}
