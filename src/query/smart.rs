//! Free-text search parsing.
//!
//! Turns a string like `core 10.1/16 vlan>100 #backbone` into a [`Query`]
//! plus one [`Interpretation`] per token explaining how it was read. Words
//! that fit no other grammar degrade to a case-insensitive text match, so
//! parsing only fails outright on unbalanced quotes or parentheses.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::{Compiled, Operator, Query};
use crate::cidr::{expand_ipv4, Cidr, HostBits};
use crate::db::models::{Pool, Prefix, Vrf};
use crate::error::IpamError;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(<<=|>>=|<<|>>|<=|>=|!=|!~\*?|~\*?|=|<|>)(.+)$")
        .expect("static regex")
});
static DANGLING_EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(<<=|>>=|<<|>>|<=|>=|!=|!~\*?|~\*?|=|<|>)$")
        .expect("static regex")
});
static OPERATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(<<=|>>=|<<|>>|<=|>=|!=|!~\*?|~\*?|=|<|>)").expect("static regex"));
static ROUTE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+|\d{1,3}(\.\d{1,3}){3}):\d+$").expect("static regex")
});
static IPV4_FRAGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){1,2}\.?$|^\d{1,3}\.$").expect("static regex"));

/// True for `ASN:n` and `IPv4:n` route targets.
pub fn is_route_target(s: &str) -> bool {
    ROUTE_TARGET.is_match(s)
}

/// Which entity a smart search runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Prefix,
    Pool,
    Vrf,
}

impl Target {
    /// Attributes a plain word is matched against.
    fn text_attributes(&self) -> &'static [&'static str] {
        match self {
            Target::Prefix => &["description", "comment", "node", "order_id", "customer_id"],
            Target::Pool => &["name", "description"],
            Target::Vrf => &["rt", "name", "description"],
        }
    }

    fn check(&self, query: &Query) -> Result<(), IpamError> {
        match self {
            Target::Prefix => Compiled::<Prefix>::new(query).map(|_| ()),
            Target::Pool => Compiled::<Pool>::new(query).map(|_| ()),
            Target::Vrf => Compiled::<Vrf>::new(query).map(|_| ()),
        }
    }
}

/// How one token of the search string was understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interpretation {
    pub string: String,
    pub interpretation: &'static str,
    pub attribute: String,
    pub operator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_prefix: Option<String>,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Interpretation {
    fn new(string: &str, interpretation: &'static str, attribute: &str, operator: &str) -> Self {
        Self {
            string: string.to_string(),
            interpretation,
            attribute: attribute.to_string(),
            operator: operator.to_string(),
            expanded: None,
            strict_prefix: None,
            error: false,
            error_message: None,
        }
    }
}

/// Outcome of parsing a search string.
#[derive(Debug, Clone)]
pub struct SmartQuery {
    /// `None` with no error means "match everything".
    pub query: Option<Query>,
    pub interpretation: Vec<Interpretation>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word { text: String, quoted: bool },
    Open,
    Close,
}

#[derive(Debug)]
enum Item {
    Word { text: String, quoted: bool },
    Group(Vec<Item>),
    And,
    Or,
}

pub fn parse(target: Target, input: &str) -> SmartQuery {
    let failed = |message: &str| {
        let mut interp = Interpretation::new(input, "text", "text", "");
        interp.error = true;
        interp.error_message = Some(message.to_string());
        SmartQuery {
            query: None,
            interpretation: vec![interp],
            error: Some(message.to_string()),
        }
    };

    let tokens = match tokenize(input) {
        Ok(t) => t,
        Err(msg) => return failed(msg),
    };
    let tokens = merge_expressions(tokens);
    let items = match group(&mut tokens.into_iter()) {
        Ok(items) => items,
        Err(msg) => return failed(msg),
    };

    let mut interpretation = Vec::new();
    let query = build(target, &items, &mut interpretation);
    debug!(input, tokens = interpretation.len(), "Parsed smart search");
    SmartQuery {
        query,
        interpretation,
        error: None,
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, &'static str> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted_whole = false;
    let mut chars = input.chars().peekable();

    let flush = |tokens: &mut Vec<Token>, current: &mut String, quoted: &mut bool| {
        if !current.is_empty() || *quoted {
            tokens.push(Token::Word {
                text: std::mem::take(current),
                quoted: *quoted,
            });
        }
        *quoted = false;
    };

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => flush(&mut tokens, &mut current, &mut quoted_whole),
            '(' => {
                flush(&mut tokens, &mut current, &mut quoted_whole);
                tokens.push(Token::Open);
            }
            ')' => {
                flush(&mut tokens, &mut current, &mut quoted_whole);
                tokens.push(Token::Close);
            }
            '"' | '\'' => {
                let starts_token = current.is_empty();
                let mut closed = false;
                while let Some(q) = chars.next() {
                    match q {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        q if q == c => {
                            closed = true;
                            break;
                        }
                        q => current.push(q),
                    }
                }
                if !closed {
                    return Err("unclosed quote");
                }
                // a quote in the middle of a word (`name="a b"`) stays part of it
                if starts_token && chars.peek().map_or(true, |n| n.is_whitespace() || *n == ')') {
                    quoted_whole = true;
                }
            }
            c => current.push(c),
        }
    }
    flush(&mut tokens, &mut current, &mut quoted_whole);
    Ok(tokens)
}

/// Glue `vlan > 100`, `vlan> 100` and `vlan >100` into single expression
/// words.
fn merge_expressions(tokens: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter().peekable();

    while let Some(token) = iter.next() {
        let Token::Word { text, quoted: false } = &token else {
            out.push(token);
            continue;
        };

        let is_key = |s: &str| {
            s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        let next_text = match iter.peek() {
            Some(Token::Word { text, .. }) => Some(text.clone()),
            _ => None,
        };

        // `key op value` as three tokens
        if OPERATOR.find(text).is_some_and(|m| m.end() == text.len()) {
            if let (Some(Token::Word { text: prev, quoted: false }), Some(value)) = (out.last(), &next_text) {
                if is_key(prev) {
                    let merged = format!("{prev}{text}{value}");
                    out.pop();
                    iter.next();
                    out.push(Token::Word { text: merged, quoted: false });
                    continue;
                }
            }
        }

        if let Some(value) = &next_text {
            // `key op` then `value`
            if DANGLING_EXPRESSION.is_match(text) {
                let merged = format!("{text}{value}");
                iter.next();
                out.push(Token::Word { text: merged, quoted: false });
                continue;
            }
            // `key` then `op value`
            let next_unquoted = matches!(iter.peek(), Some(Token::Word { quoted: false, .. }));
            if is_key(text) && next_unquoted && OPERATOR.find(value).is_some_and(|m| m.end() < value.len()) {
                let merged = format!("{text}{value}");
                iter.next();
                out.push(Token::Word { text: merged, quoted: false });
                continue;
            }
        }

        out.push(token);
    }
    out
}

fn group(tokens: &mut impl Iterator<Item = Token>) -> Result<Vec<Item>, &'static str> {
    let mut items = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Open => items.push(Item::Group(group_nested(tokens)?)),
            Token::Close => return Err("unclosed parentheses"),
            Token::Word { text, quoted: false } if text.eq_ignore_ascii_case("and") => items.push(Item::And),
            Token::Word { text, quoted: false } if text.eq_ignore_ascii_case("or") => items.push(Item::Or),
            Token::Word { text, quoted } => items.push(Item::Word { text, quoted }),
        }
    }
    Ok(items)
}

fn group_nested(tokens: &mut impl Iterator<Item = Token>) -> Result<Vec<Item>, &'static str> {
    let mut items = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Open => items.push(Item::Group(group_nested(tokens)?)),
            Token::Close => return Ok(items),
            Token::Word { text, quoted: false } if text.eq_ignore_ascii_case("and") => items.push(Item::And),
            Token::Word { text, quoted: false } if text.eq_ignore_ascii_case("or") => items.push(Item::Or),
            Token::Word { text, quoted } => items.push(Item::Word { text, quoted }),
        }
    }
    Err("unclosed parentheses")
}

/// Fold items left to right; adjacent terms are joined with `and`. Stray
/// boolean words (leading, trailing or doubled) are ignored.
fn build(target: Target, items: &[Item], interp: &mut Vec<Interpretation>) -> Option<Query> {
    let mut acc: Option<Query> = None;
    let mut pending: Option<Operator> = None;

    for item in items {
        let term = match item {
            Item::And => {
                pending = Some(Operator::And);
                continue;
            }
            Item::Or => {
                pending = Some(Operator::Or);
                continue;
            }
            Item::Group(inner) => build(target, inner, interp),
            Item::Word { text, quoted } => Some(classify(target, text, *quoted, interp)),
        };
        let Some(term) = term else { continue };

        acc = Some(match acc.take() {
            None => term,
            Some(left) => {
                let op = pending.unwrap_or(Operator::And);
                interp.push(Interpretation::new(op.name(), op.name(), "", op.name()));
                match op {
                    Operator::Or => left.or(term),
                    _ => left.and(term),
                }
            }
        });
        pending = None;
    }
    acc
}

fn classify(target: Target, word: &str, quoted: bool, interp: &mut Vec<Interpretation>) -> Query {
    if !quoted {
        if let Some(q) = classify_structured(target, word, interp) {
            return q;
        }
    }
    text_match(target, word, interp)
}

fn classify_structured(target: Target, word: &str, interp: &mut Vec<Interpretation>) -> Option<Query> {
    if let Some(tag) = word.strip_prefix('#').filter(|t| !t.is_empty()) {
        return Some(match target {
            Target::Prefix => {
                interp.push(Interpretation::new(word, "(inherited) tag", "tag", "equals_any"));
                Query::compare(Operator::EqualsAny, "tags", tag)
                    .or(Query::compare(Operator::EqualsAny, "inherited_tags", tag))
            }
            _ => {
                interp.push(Interpretation::new(word, "tag", "tag", "equals_any"));
                Query::compare(Operator::EqualsAny, "tags", tag)
            }
        });
    }

    if let Some(caps) = EXPRESSION.captures(word) {
        let (key, op, value) = (&caps[1], &caps[2], &caps[3]);
        if let Ok(operator) = Operator::parse(op) {
            let query = Query::compare(operator, key, value);
            let mut i = Interpretation::new(word, "expression", key, operator.name());
            match target.check(&query) {
                Ok(()) => {
                    interp.push(i);
                    return Some(query);
                }
                Err(IpamError::UnknownAttribute { .. }) => {
                    // fall through to the text match below, flagged
                    i.error = true;
                    i.error_message = Some("unknown attribute".to_string());
                    interp.push(i);
                    return None;
                }
                Err(e) => {
                    i.error = true;
                    i.error_message = Some(format!("invalid value: {e}"));
                    interp.push(i);
                    return None;
                }
            }
        }
    }

    if ROUTE_TARGET.is_match(word) {
        let attribute = match target {
            Target::Prefix => "vrf_rt",
            Target::Vrf => "rt",
            Target::Pool => return None,
        };
        interp.push(Interpretation::new(word, "vrf_rt", "VRF RT", "equals"));
        return Some(Query::equals(attribute, word));
    }

    if target == Target::Prefix {
        return classify_address(word, interp);
    }
    None
}

fn classify_address(word: &str, interp: &mut Vec<Interpretation>) -> Option<Query> {
    if let Some((addr, len)) = word.split_once('/') {
        let strict = Cidr::parse(word, HostBits::Mask).ok()?;
        let v4 = matches!(strict.network_ip(), IpAddr::V4(_));
        let kind = if v4 { "IPv4 prefix" } else { "IPv6 prefix" };
        let mut i = Interpretation::new(word, kind, "prefix", "contained_within_equals");
        if v4 && addr.parse::<IpAddr>().is_err() {
            i.expanded = expand_ipv4(addr).map(|ip| format!("{ip}/{len}"));
        }
        let strict_text = strict.to_string();
        if i.expanded.as_deref().unwrap_or(word) != strict_text {
            i.strict_prefix = Some(strict_text.clone());
        }
        interp.push(i);
        return Some(Query::compare(Operator::ContainedWithinEquals, "prefix", strict_text));
    }

    if let Ok(ip) = word.parse::<IpAddr>() {
        let kind = match ip {
            IpAddr::V4(_) => "IPv4 address",
            IpAddr::V6(_) => "IPv6 address",
        };
        interp.push(Interpretation::new(&ip.to_string(), kind, "prefix", "contains_equals"));
        return Some(Query::compare(Operator::ContainsEquals, "prefix", ip.to_string()));
    }

    // `192.168` or `10.1.2.` covers everything under that octet boundary
    if IPV4_FRAGMENT.is_match(word) {
        let octets = word.trim_end_matches('.').split('.').count();
        let ip = expand_ipv4(word)?;
        let len = u8::try_from(octets * 8).ok()?;
        let expanded = format!("{ip}/{len}");
        let mut i = Interpretation::new(word, "IPv4 prefix", "prefix", "contained_within_equals");
        i.expanded = Some(expanded.clone());
        interp.push(i);
        return Some(Query::compare(Operator::ContainedWithinEquals, "prefix", expanded));
    }
    None
}

/// Case-insensitive substring match over the target's text attributes and
/// its tags.
fn text_match(target: Target, word: &str, interp: &mut Vec<Interpretation>) -> Query {
    let attributes = target.text_attributes();
    let pattern = regex::escape(word);
    let query = attributes
        .iter()
        .chain(std::iter::once(&"tags"))
        .map(|a| Query::compare(Operator::RegexMatch, a, pattern.as_str()))
        .reduce(Query::or)
        .unwrap_or_else(|| Query::compare(Operator::RegexMatch, "description", pattern.as_str()));

    interp.push(Interpretation::new(word, "text", &attributes.join(" or "), "regex"));
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::PrefixType;
    use chrono::Utc;

    fn prefix(cidr: &str, description: &str) -> Prefix {
        let mut p = Prefix::new(1, 0, cidr.parse().unwrap(), PrefixType::Assignment, Utc::now());
        p.description = Some(description.into());
        p
    }

    fn matches(input: &str, p: &Prefix) -> bool {
        let parsed = parse(Target::Prefix, input);
        match parsed.query {
            Some(q) => Compiled::<Prefix>::new(&q).unwrap().matches(p),
            None => true,
        }
    }

    fn kinds(parsed: &SmartQuery) -> Vec<&'static str> {
        parsed.interpretation.iter().map(|i| i.interpretation).collect()
    }

    #[test]
    fn test_tokenize_quotes() {
        let tokens = tokenize(r#"core "foo bar" name="x y""#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word { text: "core".into(), quoted: false },
                Token::Word { text: "foo bar".into(), quoted: true },
                Token::Word { text: "name=x y".into(), quoted: false },
            ]
        );
        assert_eq!(tokenize(r#"core "foo"#), Err("unclosed quote"));
    }

    #[test]
    fn test_unclosed_is_an_error() {
        let parsed = parse(Target::Prefix, "'oops");
        assert!(parsed.query.is_none());
        assert_eq!(parsed.error.as_deref(), Some("unclosed quote"));
        assert!(parsed.interpretation[0].error);

        let parsed = parse(Target::Prefix, "(core or edge");
        assert_eq!(parsed.error.as_deref(), Some("unclosed parentheses"));
    }

    #[test]
    fn test_empty_matches_everything() {
        let parsed = parse(Target::Prefix, "   ");
        assert!(parsed.query.is_none());
        assert!(parsed.error.is_none());
        assert!(parsed.interpretation.is_empty());
    }

    #[test]
    fn test_ipv4_forms() {
        let parsed = parse(Target::Prefix, "10/8");
        let i = &parsed.interpretation[0];
        assert_eq!(i.interpretation, "IPv4 prefix");
        assert_eq!(i.expanded.as_deref(), Some("10.0.0.0/8"));
        assert_eq!(i.strict_prefix, None);

        let parsed = parse(Target::Prefix, "10.1.2.3/16");
        assert_eq!(parsed.interpretation[0].strict_prefix.as_deref(), Some("10.1.0.0/16"));

        let parsed = parse(Target::Prefix, "192.168.1.1");
        assert_eq!(kinds(&parsed), vec!["IPv4 address"]);

        let parsed = parse(Target::Prefix, "192.168");
        assert_eq!(parsed.interpretation[0].expanded.as_deref(), Some("192.168.0.0/16"));

        let p = prefix("192.168.1.0/24", "lan");
        assert!(matches("192.168", &p));
        assert!(matches("192.168.1.77", &p));
        assert!(!matches("10/8", &p));
    }

    #[test]
    fn test_ipv6_forms() {
        let parsed = parse(Target::Prefix, "2001:db8::/32");
        assert_eq!(kinds(&parsed), vec!["IPv6 prefix"]);
        let parsed = parse(Target::Prefix, "2001:db8::1");
        assert_eq!(kinds(&parsed), vec!["IPv6 address"]);
        assert!(matches("2001:db8::/32", &prefix("2001:db8:1::/48", "v6")));
    }

    #[test]
    fn test_route_target() {
        let parsed = parse(Target::Prefix, "65000:123");
        assert_eq!(kinds(&parsed), vec!["vrf_rt"]);
        let parsed = parse(Target::Vrf, "10.0.0.1:5");
        assert_eq!(parsed.query, Some(Query::equals("rt", "10.0.0.1:5")));
        // pools have no route target
        assert_eq!(kinds(&parse(Target::Pool, "65000:1")), vec!["text"]);
    }

    #[test]
    fn test_tags() {
        let parsed = parse(Target::Prefix, "#backbone");
        assert_eq!(kinds(&parsed), vec!["(inherited) tag"]);
        let mut p = prefix("10.0.0.0/8", "x");
        p.inherited_tags.insert("backbone".into());
        assert!(matches("#backbone", &p));
        assert_eq!(kinds(&parse(Target::Pool, "#gold")), vec!["tag"]);
    }

    #[test]
    fn test_expressions() {
        for input in ["vlan>100", "vlan > 100", "vlan> 100", "vlan >100"] {
            let parsed = parse(Target::Prefix, input);
            assert_eq!(parsed.query, Some(Query::compare(Operator::Greater, "vlan", "100")), "{input}");
            assert_eq!(kinds(&parsed), vec!["expression"]);
        }
        let mut p = prefix("10.0.0.0/8", "x");
        p.vlan = Some(200);
        assert!(matches("vlan>100", &p));
        assert!(!matches("vlan<100", &p));
        assert!(matches(r#"description="x""#, &p));
    }

    #[test]
    fn test_bad_expression_degrades_to_text() {
        let parsed = parse(Target::Prefix, "colour=blue");
        assert!(parsed.error.is_none());
        assert_eq!(kinds(&parsed), vec!["expression", "text"]);
        assert!(parsed.interpretation[0].error);
        assert_eq!(parsed.interpretation[0].error_message.as_deref(), Some("unknown attribute"));
        assert!(parsed.query.is_some());

        let parsed = parse(Target::Prefix, "type=subnet");
        assert!(parsed.interpretation[0].error_message.as_deref().unwrap().starts_with("invalid value"));
    }

    #[test]
    fn test_text_is_escaped_and_case_insensitive() {
        let p = prefix("10.0.0.0/8", "Core (DC1) uplink");
        assert!(matches("core", &p));
        assert!(matches("\"(dc1)\"", &p));
        assert!(!matches("edge", &p));
    }

    #[test]
    fn test_boolean_combination() {
        let p = prefix("10.0.0.0/8", "core uplink");
        assert!(matches("core uplink", &p));
        assert!(!matches("core edge", &p));
        assert!(matches("core or edge", &p));
        assert!(matches("edge OR (core and uplink)", &p));
        assert!(matches("and core", &p));
        assert!(matches("core or", &p));

        let parsed = parse(Target::Prefix, "core edge");
        assert_eq!(kinds(&parsed), vec!["text", "text", "and"]);
    }

    #[test]
    fn test_pool_and_vrf_text() {
        let mut pool = Pool::new(1, "customer-gold".into());
        pool.description = Some("Gold tier".into());
        let q = parse(Target::Pool, "gold").query.unwrap();
        assert!(Compiled::<Pool>::new(&q).unwrap().matches(&pool));

        let vrf = Vrf::new(3, "CUSTOMER-A".into());
        let q = parse(Target::Vrf, "customer-a").query.unwrap();
        assert!(Compiled::<Vrf>::new(&q).unwrap().matches(&vrf));
    }
}
