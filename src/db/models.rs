//! Entity and record definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cidr::{Cidr, Family};

/// Id of the always-present default VRF.
pub const DEFAULT_VRF_ID: i64 = 0;

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "'{}' is not one of {}",
                        other,
                        Self::ALL.join(", ")
                    )),
                }
            }
        }
    };
}

text_enum!(
    /// What a prefix is used for.
    PrefixType {
        Reservation => "reservation",
        Assignment => "assignment",
        Host => "host",
    }
);

text_enum!(
    PrefixStatus {
        Assigned => "assigned",
        Reserved => "reserved",
        Quarantine => "quarantine",
    }
);

text_enum!(
    AlarmPriority {
        Warning => "warning",
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

impl Default for PrefixStatus {
    fn default() -> Self {
        PrefixStatus::Assigned
    }
}

/// A routing/forwarding scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vrf {
    pub id: i64,
    pub rt: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub avps: BTreeMap<String, String>,

    // Derived on read.
    #[serde(default)]
    pub num_prefixes_v4: u64,
    #[serde(default)]
    pub num_prefixes_v6: u64,
    #[serde(default, with = "counter")]
    pub total_addresses_v4: u128,
    #[serde(default, with = "counter")]
    pub total_addresses_v6: u128,
    #[serde(default, with = "counter")]
    pub used_addresses_v4: u128,
    #[serde(default, with = "counter")]
    pub used_addresses_v6: u128,
    #[serde(default, with = "counter")]
    pub free_addresses_v4: u128,
    #[serde(default, with = "counter")]
    pub free_addresses_v6: u128,
}

impl Vrf {
    pub fn new(id: i64, name: String) -> Self {
        Self {
            id,
            rt: None,
            name,
            description: None,
            tags: BTreeSet::new(),
            avps: BTreeMap::new(),
            num_prefixes_v4: 0,
            num_prefixes_v6: 0,
            total_addresses_v4: 0,
            total_addresses_v6: 0,
            used_addresses_v4: 0,
            used_addresses_v6: 0,
            free_addresses_v4: 0,
            free_addresses_v6: 0,
        }
    }

    /// Short label for logs and error messages.
    pub fn label(&self) -> String {
        match &self.rt {
            Some(rt) => format!("{} ({})", rt, self.name),
            None => self.name.clone(),
        }
    }
}

/// An allocation template with member prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub default_type: Option<PrefixType>,
    pub ipv4_default_prefix_length: Option<u8>,
    pub ipv6_default_prefix_length: Option<u8>,
    pub tags: BTreeSet<String>,
    pub avps: BTreeMap<String, String>,

    // Derived on read.
    #[serde(default)]
    pub vrf_id: Option<i64>,
    #[serde(default)]
    pub prefixes: Vec<Cidr>,
    #[serde(default)]
    pub member_prefixes_v4: u64,
    #[serde(default)]
    pub member_prefixes_v6: u64,
    #[serde(default, with = "counter")]
    pub total_addresses_v4: u128,
    #[serde(default, with = "counter")]
    pub total_addresses_v6: u128,
    #[serde(default, with = "counter")]
    pub used_addresses_v4: u128,
    #[serde(default, with = "counter")]
    pub used_addresses_v6: u128,
    #[serde(default, with = "counter")]
    pub free_addresses_v4: u128,
    #[serde(default, with = "counter")]
    pub free_addresses_v6: u128,
}

impl Pool {
    pub fn new(id: i64, name: String) -> Self {
        Self {
            id,
            name,
            description: None,
            default_type: None,
            ipv4_default_prefix_length: None,
            ipv6_default_prefix_length: None,
            tags: BTreeSet::new(),
            avps: BTreeMap::new(),
            vrf_id: None,
            prefixes: Vec::new(),
            member_prefixes_v4: 0,
            member_prefixes_v6: 0,
            total_addresses_v4: 0,
            total_addresses_v6: 0,
            used_addresses_v4: 0,
            used_addresses_v6: 0,
            free_addresses_v4: 0,
            free_addresses_v6: 0,
        }
    }

    pub fn default_length(&self, family: Family) -> Option<u8> {
        match family {
            Family::V4 => self.ipv4_default_prefix_length,
            Family::V6 => self.ipv6_default_prefix_length,
        }
    }
}

/// A stored prefix plus the fields derived from its position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prefix {
    pub id: i64,
    pub vrf_id: i64,
    pub prefix: Cidr,
    #[serde(rename = "type")]
    pub prefix_type: PrefixType,
    pub status: PrefixStatus,
    pub description: Option<String>,
    pub comment: Option<String>,
    pub node: Option<String>,
    pub country: Option<String>,
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
    pub external_key: Option<String>,
    pub vlan: Option<i64>,
    pub monitor: bool,
    pub alarm_priority: Option<AlarmPriority>,
    pub tags: BTreeSet<String>,
    pub avps: BTreeMap<String, String>,
    pub pool_id: Option<i64>,
    pub expires: Option<DateTime<Utc>>,
    pub added: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub authoritative_source: String,
    pub authenticated_as: String,

    // Derived on read.
    pub family: Family,
    #[serde(default)]
    pub prefix_length: u8,
    #[serde(default)]
    pub display_prefix: String,
    #[serde(default)]
    pub indent: u32,
    #[serde(default)]
    pub children: u64,
    #[serde(default)]
    pub vrf_rt: Option<String>,
    #[serde(default)]
    pub vrf_name: Option<String>,
    #[serde(default)]
    pub pool_name: Option<String>,
    #[serde(default)]
    pub inherited_tags: BTreeSet<String>,
    #[serde(default, with = "counter")]
    pub total_addresses: u128,
    #[serde(default, with = "counter")]
    pub used_addresses: u128,
    #[serde(default, with = "counter")]
    pub free_addresses: u128,
}

impl Prefix {
    /// A fresh record with every optional attribute unset.
    pub fn new(id: i64, vrf_id: i64, prefix: Cidr, prefix_type: PrefixType, now: DateTime<Utc>) -> Self {
        Self {
            id,
            vrf_id,
            prefix,
            prefix_type,
            status: PrefixStatus::default(),
            description: None,
            comment: None,
            node: None,
            country: None,
            order_id: None,
            customer_id: None,
            external_key: None,
            vlan: None,
            monitor: false,
            alarm_priority: None,
            tags: BTreeSet::new(),
            avps: BTreeMap::new(),
            pool_id: None,
            expires: None,
            added: now,
            last_modified: now,
            authoritative_source: String::new(),
            authenticated_as: String::new(),
            family: prefix.family(),
            prefix_length: prefix.len(),
            display_prefix: prefix.to_string(),
            indent: 0,
            children: 0,
            vrf_rt: None,
            vrf_name: None,
            pool_name: None,
            inherited_tags: BTreeSet::new(),
            total_addresses: prefix.total_addresses(),
            used_addresses: 0,
            free_addresses: prefix.total_addresses(),
        }
    }
}

/// Deserialize a field where an explicit `null` means "clear it".
///
/// Absent stays `None`; `null` becomes `Some(None)`.
pub fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Address counters as decimal strings; IPv6 counts overflow JSON numbers.
mod counter {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(D::Error::custom),
            Repr::Number(n) => Ok(n.into()),
        }
    }
}

fn expires_field<'de, D>(deserializer: D) -> Result<Option<Option<DateTime<Utc>>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(Some(None)),
        Some(s) => parse_expires(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse an expiry: a timestamp, or `never`/`infinity` for none.
pub fn parse_expires(s: &str) -> Result<Option<DateTime<Utc>>, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "never" | "infinity" => Ok(None),
        _ => parse_timestamp(s).map(Some),
    }
}

/// Accepts RFC3339, `YYYY-MM-DD HH:MM:SS` (UTC) and `YYYY-MM-DD`.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    if let Some(dt) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(dt.and_utc());
    }
    Err(format!("'{s}' is not a recognised timestamp"))
}

/// Settable VRF attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VrfAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub rt: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avps: Option<BTreeMap<String, String>>,
}

/// Settable pool attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub default_type: Option<Option<PrefixType>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub ipv4_default_prefix_length: Option<Option<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub ipv6_default_prefix_length: Option<Option<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avps: Option<BTreeMap<String, String>>,
}

/// Settable prefix attributes. On add, `prefix` is the manual CIDR; on
/// edit it must be absent or equal to the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefixAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub prefix_type: Option<PrefixType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PrefixStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub comment: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub node: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub country: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub order_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub customer_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub external_key: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub vlan: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub alarm_priority: Option<Option<AlarmPriority>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avps: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub pool_id: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "expires_field")]
    pub expires: Option<Option<DateTime<Utc>>>,
}

impl PrefixAttrs {
    /// Copy every set attribute onto `p`. `prefix` is handled by the caller.
    pub fn apply_to(&self, p: &mut Prefix) {
        if let Some(t) = self.prefix_type {
            p.prefix_type = t;
        }
        if let Some(s) = self.status {
            p.status = s;
        }
        macro_rules! set {
            ($($field:ident),+) => {
                $(if let Some(v) = &self.$field {
                    p.$field = v.clone();
                })+
            };
        }
        set!(
            description,
            comment,
            node,
            country,
            order_id,
            customer_id,
            external_key,
            vlan,
            alarm_priority,
            pool_id,
            expires
        );
        if let Some(m) = self.monitor {
            p.monitor = m;
        }
        if let Some(t) = &self.tags {
            p.tags = t.clone();
        }
        if let Some(a) = &self.avps {
            p.avps = a.clone();
        }
    }
}

/// Selects one VRF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VrfRef {
    Id(i64),
    Rt(String),
    Name(String),
}

impl Default for VrfRef {
    fn default() -> Self {
        VrfRef::Id(DEFAULT_VRF_ID)
    }
}

impl fmt::Display for VrfRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VrfRef::Id(id) => write!(f, "id {id}"),
            VrfRef::Rt(rt) => write!(f, "rt {rt}"),
            VrfRef::Name(n) => write!(f, "name '{n}'"),
        }
    }
}

/// Selects one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRef {
    Id(i64),
    Name(String),
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRef::Id(id) => write!(f, "id {id}"),
            PoolRef::Name(n) => write!(f, "name '{n}'"),
        }
    }
}

/// Selects one prefix within a VRF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixRef {
    Id(i64),
    Prefix(String),
}

impl fmt::Display for PrefixRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixRef::Id(id) => write!(f, "id {id}"),
            PrefixRef::Prefix(p) => f.write_str(p),
        }
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub vrf_id: Option<i64>,
    pub vrf_rt: Option<String>,
    pub vrf_name: Option<String>,
    pub prefix_id: Option<i64>,
    pub prefix_prefix: Option<String>,
    pub pool_id: Option<i64>,
    pub pool_name: Option<String>,
    pub username: String,
    pub authenticated_as: String,
    pub full_name: Option<String>,
    pub authoritative_source: String,
    pub description: String,
}

/// Filter for [`AuditEntry`] listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub vrf_id: Option<i64>,
    pub prefix_id: Option<i64>,
    pub pool_id: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Vrf,
    Pool,
    Prefix,
}

text_enum!(
    ChangeAction {
        Add => "add",
        Edit => "edit",
        Remove => "remove",
    }
);

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Vrf => "vrf",
            EntityKind::Pool => "pool",
            EntityKind::Prefix => "prefix",
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vrf" => Ok(EntityKind::Vrf),
            "pool" => Ok(EntityKind::Pool),
            "prefix" => Ok(EntityKind::Prefix),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

/// A committed change, as seen by feed consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub entity: EntityKind,
    pub entity_id: i64,
    pub action: ChangeAction,
    pub username: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

/// A local user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub full_name: Option<String>,
    pub trusted: bool,
    pub readonly: bool,
    pub created_at: DateTime<Utc>,
}
