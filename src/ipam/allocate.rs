//! Free-space search.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::Registry;
use super::Ipam;
use crate::auth::Principal;
use crate::cidr::{Cidr, Family, HostBits};
use crate::db::models::{Pool, PoolRef, PrefixType, VrfRef};
use crate::error::{IpamError, Result};

/// Where to look for free space and what to look for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FindFree {
    /// Covering prefixes, searched in the given order. They need not be
    /// stored.
    pub from_prefix: Option<Vec<String>>,
    /// Allocate out of the pool's member prefixes.
    pub from_pool: Option<PoolRef>,
    /// Required with `from_pool`; checked against the covering prefixes
    /// otherwise.
    pub family: Option<Family>,
    /// Defaults to the pool's default length for the family.
    pub prefix_length: Option<u8>,
    /// Number of blocks wanted; defaults to 1.
    pub count: Option<usize>,
}

impl FindFree {
    pub fn from_prefixes<I, S>(prefixes: I, prefix_length: u8) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from_prefix: Some(prefixes.into_iter().map(Into::into).collect()),
            prefix_length: Some(prefix_length),
            ..Default::default()
        }
    }

    pub fn from_pool(pool: PoolRef, family: Family) -> Self {
        Self {
            from_pool: Some(pool),
            family: Some(family),
            ..Default::default()
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub(super) fn source_pool<'a>(&self, reg: &'a Registry) -> Result<Option<&'a Pool>> {
        self.from_pool.as_ref().map(|r| reg.pool(r)).transpose()
    }
}

/// A resolved search: which blocks, at what length, in which VRF.
#[derive(Debug)]
pub(super) struct Resolved {
    pub vrf_id: i64,
    pub candidates: Vec<Cidr>,
    pub length: u8,
    pub count: usize,
}

impl Ipam {
    /// Find up to `count` unused blocks, lowest address first.
    ///
    /// An empty result is not an error here; [`Ipam::add_prefix`] turns it
    /// into [`IpamError::NoFreePrefix`].
    pub async fn find_free_prefix(
        &self,
        _principal: &Principal,
        vrf: Option<VrfRef>,
        spec: &FindFree,
    ) -> Result<Vec<Cidr>> {
        let state = self.read().await;
        let config = self.config();
        let resolved = resolve(
            &state,
            vrf.as_ref(),
            spec,
            config.non_canonical,
            config.max_find_free_count,
        )?;
        Ok(find_free(&state, &resolved))
    }
}

/// The VRF a find-free request runs in: the caller's, else the pool's
/// implied VRF, else the default VRF.
pub(super) fn target_vrf(reg: &Registry, vrf: Option<&VrfRef>, spec: &FindFree) -> Result<i64> {
    if let Some(r) = vrf {
        return Ok(reg.vrf(r)?.id);
    }
    if let Some(pool) = spec.source_pool(reg)? {
        if let Some(id) = reg.pool_vrf(pool.id) {
            return Ok(id);
        }
        if !reg.pool_members(pool.id).is_empty() {
            return Err(IpamError::MissingInput(format!(
                "vrf (pool '{}' spans several VRFs)",
                pool.name
            )));
        }
    }
    Ok(reg.vrf(&VrfRef::default())?.id)
}

pub(super) fn resolve(
    reg: &Registry,
    vrf: Option<&VrfRef>,
    spec: &FindFree,
    policy: HostBits,
    max_count: usize,
) -> Result<Resolved> {
    let vrf_id = target_vrf(reg, vrf, spec)?;

    let count = spec.count.unwrap_or(1);
    if count == 0 {
        return Err(IpamError::value("count", "must be at least 1"));
    }
    if count > max_count {
        return Err(IpamError::value("count", format!("must be at most {max_count}")));
    }

    let (candidates, family, default_length) = match (&spec.from_prefix, spec.source_pool(reg)?) {
        (Some(_), Some(_)) => {
            return Err(IpamError::ExtraneousInput(
                "from_prefix and from_pool are mutually exclusive".to_string(),
            ))
        }
        (None, None) => return Err(IpamError::MissingInput("from_prefix or from_pool".to_string())),
        (Some(texts), None) => {
            if texts.is_empty() {
                return Err(IpamError::MissingInput("from_prefix".to_string()));
            }
            let candidates = texts
                .iter()
                .map(|t| Cidr::parse(t, policy))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let family = candidates[0].family();
            if candidates.iter().any(|c| c.family() != family) {
                return Err(IpamError::value(
                    "from_prefix",
                    "covering prefixes must all be of one address family",
                ));
            }
            if let Some(f) = spec.family.filter(|f| *f != family) {
                return Err(IpamError::value(
                    "family",
                    format!(
                        "IPv{} requested but covering prefixes are IPv{}",
                        f.number(),
                        family.number()
                    ),
                ));
            }
            (candidates, family, None)
        }
        (None, Some(pool)) => {
            let family = spec
                .family
                .ok_or_else(|| IpamError::MissingInput("family".to_string()))?;
            let candidates = reg
                .pool_members(pool.id)
                .into_iter()
                .filter(|p| p.vrf_id == vrf_id && p.prefix.family() == family)
                .map(|p| p.prefix)
                .collect();
            (candidates, family, pool.default_length(family))
        }
    };

    let length = spec
        .prefix_length
        .or(default_length)
        .ok_or_else(|| IpamError::MissingInput("prefix_length".to_string()))?;
    if length > family.width() {
        return Err(IpamError::value(
            "prefix_length",
            format!("must be at most {} for IPv{}", family.width(), family.number()),
        ));
    }
    if let Some(c) = candidates.iter().find(|c| c.len() > length) {
        return Err(IpamError::value(
            "prefix_length",
            format!("/{length} does not fit inside {c}"),
        ));
    }

    Ok(Resolved {
        vrf_id,
        candidates,
        length,
        count,
    })
}

/// Collect free blocks from every candidate, then keep the lowest
/// addresses. A stable sort keeps candidate order between equal blocks,
/// which only occur when candidates overlap and are then deduplicated.
pub(super) fn find_free(reg: &Registry, r: &Resolved) -> Vec<Cidr> {
    let space = reg.space(r.vrf_id);
    let mut found: Vec<Cidr> = Vec::new();

    for covering in &r.candidates {
        let edges = edge_guard(reg, r.vrf_id, covering, r.length);
        found.extend(space.free_blocks(covering, r.length, r.count, edges.as_ref()));
    }
    found.sort_by_key(|c| (c.network(), c.len()));
    found.dedup();
    found.truncate(r.count);

    debug!(
        vrf_id = r.vrf_id,
        candidates = r.candidates.len(),
        length = r.length,
        found = found.len(),
        "Searched for free prefixes"
    );
    found
}

/// Hosts carved from a stored IPv4 assignment shorter than /31 never get
/// its network or broadcast address. The assignment is the covering prefix
/// itself or the nearest stored assignment above it.
fn edge_guard(reg: &Registry, vrf_id: i64, covering: &Cidr, length: u8) -> Option<Cidr> {
    if covering.family() != Family::V4 || length != 32 {
        return None;
    }
    reg.prefix_at(vrf_id, covering)
        .into_iter()
        .chain(reg.ancestors(vrf_id, covering))
        .find(|p| p.prefix_type == PrefixType::Assignment)
        .map(|p| p.prefix)
        .filter(|a| a.len() < 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Prefix, Vrf};
    use crate::db::store::{Snapshot, Write};
    use chrono::Utc;

    fn registry(stored: &[(&str, PrefixType)]) -> Registry {
        let prefixes = stored
            .iter()
            .enumerate()
            .map(|(i, (c, t))| Prefix::new(i as i64 + 1, 0, c.parse().unwrap(), *t, Utc::now()))
            .collect();
        Registry::from_snapshot(Snapshot {
            vrfs: vec![Vrf::new(0, "default".into())],
            pools: vec![],
            prefixes,
        })
        .unwrap()
    }

    fn run(reg: &Registry, spec: FindFree) -> Result<Vec<String>> {
        let r = resolve(reg, None, &spec, HostBits::Reject, 1000)?;
        Ok(find_free(reg, &r).iter().map(|c| c.to_string()).collect())
    }

    #[test]
    fn test_lowest_first_from_unstored_covering() {
        let reg = registry(&[]);
        let got = run(&reg, FindFree::from_prefixes(["1.3.3.0/24"], 32).with_count(4)).unwrap();
        assert_eq!(got, vec!["1.3.3.0/32", "1.3.3.1/32", "1.3.3.2/32", "1.3.3.3/32"]);
    }

    #[test]
    fn test_skips_occupied_space() {
        let reg = registry(&[
            ("10.0.0.0/16", PrefixType::Reservation),
            ("10.0.0.0/24", PrefixType::Assignment),
            ("10.0.2.0/23", PrefixType::Reservation),
        ]);
        let got = run(&reg, FindFree::from_prefixes(["10.0.0.0/16"], 24).with_count(3)).unwrap();
        assert_eq!(got, vec!["10.0.1.0/24", "10.0.4.0/24", "10.0.5.0/24"]);
    }

    #[test]
    fn test_assignment_edges() {
        let reg = registry(&[("192.0.2.0/30", PrefixType::Assignment)]);
        let got = run(&reg, FindFree::from_prefixes(["192.0.2.0/30"], 32).with_count(4)).unwrap();
        assert_eq!(got, vec!["192.0.2.1/32", "192.0.2.2/32"]);

        // a /31 has no network or broadcast address to protect
        let reg = registry(&[("192.0.2.0/31", PrefixType::Assignment)]);
        let got = run(&reg, FindFree::from_prefixes(["192.0.2.0/31"], 32).with_count(4)).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_assignment_edges_from_inner_covering() {
        let reg = registry(&[("192.0.2.0/24", PrefixType::Assignment)]);
        let got = run(&reg, FindFree::from_prefixes(["192.0.2.0/25"], 32)).unwrap();
        assert_eq!(got, vec!["192.0.2.1/32"]);

        let spec = FindFree::from_prefixes(["192.0.2.252/30"], 32).with_count(4);
        assert_eq!(
            run(&reg, spec).unwrap(),
            vec!["192.0.2.252/32", "192.0.2.253/32", "192.0.2.254/32"]
        );

        // a reservation above is not an assignment
        let reg = registry(&[("192.0.2.0/24", PrefixType::Reservation)]);
        let got = run(&reg, FindFree::from_prefixes(["192.0.2.0/25"], 32)).unwrap();
        assert_eq!(got, vec!["192.0.2.0/32"]);
    }

    #[test]
    fn test_multiple_candidates_merge_by_address() {
        let reg = registry(&[("10.0.0.0/25", PrefixType::Reservation)]);
        let spec = FindFree::from_prefixes(["10.0.1.0/24", "10.0.0.0/24"], 25).with_count(3);
        assert_eq!(
            run(&reg, spec).unwrap(),
            vec!["10.0.0.128/25", "10.0.1.0/25", "10.0.1.128/25"]
        );
    }

    #[test]
    fn test_full_covering_is_empty_not_error() {
        let reg = registry(&[("10.0.0.0/24", PrefixType::Reservation)]);
        let got = run(&reg, FindFree::from_prefixes(["10.0.0.0/24"], 24)).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_validation() {
        let reg = registry(&[]);
        let cases = [
            FindFree::default(),
            FindFree::from_prefixes(["10.0.0.0/8"], 33),
            FindFree::from_prefixes(["10.0.0.0/24"], 16),
            FindFree::from_prefixes(["10.0.0.0/8", "2001:db8::/32"], 48),
            FindFree::from_prefixes(["10.0.0.0/8"], 24).with_count(0),
            FindFree::from_prefixes(["10.0.0.0/8"], 24).with_count(1001),
            FindFree::from_prefixes(["10.0.0.1/8"], 24),
            FindFree {
                family: Some(Family::V6),
                ..FindFree::from_prefixes(["10.0.0.0/8"], 24)
            },
        ];
        for spec in cases {
            assert!(run(&reg, spec.clone()).is_err(), "{spec:?}");
        }
    }

    #[test]
    fn test_pool_candidates() {
        let mut reg = registry(&[]);
        let mut pool = Pool::new(1, "p".into());
        pool.ipv4_default_prefix_length = Some(30);
        let mut member = Prefix::new(10, 0, "172.16.0.0/29".parse().unwrap(), PrefixType::Reservation, Utc::now());
        member.pool_id = Some(1);
        reg.apply(&[Write::PutPool(pool), Write::PutPrefix(member)]);

        let spec = FindFree::from_pool(PoolRef::Id(1), Family::V4).with_count(5);
        assert_eq!(run(&reg, spec).unwrap(), vec!["172.16.0.0/30", "172.16.0.4/30"]);

        let spec = FindFree {
            from_pool: Some(PoolRef::Id(1)),
            ..Default::default()
        };
        assert!(matches!(run(&reg, spec), Err(IpamError::MissingInput(_))));
        let spec = FindFree::from_pool(PoolRef::Id(1), Family::V6);
        assert!(matches!(run(&reg, spec), Err(IpamError::MissingInput(_))));
    }
}
