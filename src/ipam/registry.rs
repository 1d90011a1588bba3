//! Committed in-memory state: every VRF, pool and prefix plus one
//! containment index per VRF.
//!
//! Records are kept with their stored fields only; derived fields (indent,
//! counters, inherited tags, display form) are filled in by the `*_view`
//! methods on the way out.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{error, info};

use crate::cidr::{Cidr, Family, HostBits};
use crate::db::models::{Pool, PoolRef, Prefix, PrefixRef, PrefixType, Vrf, VrfRef};
use crate::db::store::{Snapshot, Write};
use crate::error::{IpamError, Result};
use crate::index::ContainmentIndex;

static EMPTY: ContainmentIndex = ContainmentIndex::EMPTY;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    vrfs: BTreeMap<i64, Vrf>,
    pools: BTreeMap<i64, Pool>,
    prefixes: HashMap<i64, Prefix>,
    spaces: BTreeMap<i64, ContainmentIndex>,
}

impl Registry {
    /// Rebuild from a store snapshot. Indents are recomputed here, never
    /// read back from disk.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let mut reg = Registry::default();
        for vrf in snapshot.vrfs {
            reg.spaces.entry(vrf.id).or_default();
            reg.vrfs.insert(vrf.id, vrf);
        }
        for pool in snapshot.pools {
            reg.pools.insert(pool.id, pool);
        }
        // Parents first keeps every insert a leaf insert.
        let mut prefixes = snapshot.prefixes;
        prefixes.sort_by_key(|p| (p.vrf_id, p.prefix.len(), p.prefix));
        for p in prefixes {
            let space = reg.spaces.get_mut(&p.vrf_id).ok_or_else(|| {
                IpamError::Corrupt(format!("prefix {} references missing VRF {}", p.id, p.vrf_id))
            })?;
            if space.insert(p.prefix, p.id).is_none() {
                return Err(IpamError::Corrupt(format!(
                    "prefix {} stored twice in VRF {}",
                    p.prefix, p.vrf_id
                )));
            }
            reg.prefixes.insert(p.id, p);
        }
        info!(
            vrfs = reg.vrfs.len(),
            pools = reg.pools.len(),
            prefixes = reg.prefixes.len(),
            "Rebuilt containment index"
        );
        Ok(reg)
    }

    /// Mirror a committed batch. Audit and change rows have no in-memory
    /// counterpart.
    pub fn apply(&mut self, batch: &[Write]) {
        for w in batch {
            match w {
                Write::PutVrf(v) => {
                    self.spaces.entry(v.id).or_default();
                    self.vrfs.insert(v.id, v.clone());
                }
                Write::DeleteVrf(id) => {
                    self.vrfs.remove(id);
                    self.spaces.remove(id);
                }
                Write::PutPool(p) => {
                    self.pools.insert(p.id, p.clone());
                }
                Write::DeletePool(id) => {
                    self.pools.remove(id);
                }
                Write::PutPrefix(p) => {
                    if !self.prefixes.contains_key(&p.id) {
                        let space = self.spaces.entry(p.vrf_id).or_default();
                        if space.insert(p.prefix, p.id).is_none() {
                            error!(prefix = %p.prefix, vrf_id = p.vrf_id, "Committed prefix already indexed");
                        }
                    }
                    self.prefixes.insert(p.id, p.clone());
                }
                Write::DeletePrefix(id) => {
                    if let Some(p) = self.prefixes.remove(id) {
                        if let Some(space) = self.spaces.get_mut(&p.vrf_id) {
                            space.remove(&p.prefix);
                        }
                    }
                }
                Write::Audit(_) | Write::Change(_) => {}
            }
        }
    }

    // Lookups

    pub fn vrf(&self, r: &VrfRef) -> Result<&Vrf> {
        let found = match r {
            VrfRef::Id(id) => self.vrfs.get(id),
            VrfRef::Rt(rt) => self.vrfs.values().find(|v| v.rt.as_deref() == Some(rt.as_str())),
            VrfRef::Name(name) => self.vrfs.values().find(|v| &v.name == name),
        };
        found.ok_or_else(|| IpamError::not_found("VRF", r))
    }

    pub fn vrf_by_id(&self, id: i64) -> Option<&Vrf> {
        self.vrfs.get(&id)
    }

    pub fn vrfs(&self) -> impl Iterator<Item = &Vrf> {
        self.vrfs.values()
    }

    pub fn pool(&self, r: &PoolRef) -> Result<&Pool> {
        let found = match r {
            PoolRef::Id(id) => self.pools.get(id),
            PoolRef::Name(name) => self.pools.values().find(|p| &p.name == name),
        };
        found.ok_or_else(|| IpamError::not_found("pool", r))
    }

    pub fn pool_by_id(&self, id: i64) -> Option<&Pool> {
        self.pools.get(&id)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn prefix(&self, vrf_id: i64, r: &PrefixRef, policy: HostBits) -> Result<&Prefix> {
        let found = match r {
            PrefixRef::Id(id) => self.prefixes.get(id).filter(|p| p.vrf_id == vrf_id),
            PrefixRef::Prefix(text) => {
                let cidr = Cidr::parse(text, policy)?;
                self.prefix_at(vrf_id, &cidr)
            }
        };
        found.ok_or_else(|| IpamError::not_found("prefix", r))
    }

    pub fn prefix_by_id(&self, id: i64) -> Option<&Prefix> {
        self.prefixes.get(&id)
    }

    pub fn prefix_at(&self, vrf_id: i64, cidr: &Cidr) -> Option<&Prefix> {
        let node = self.space(vrf_id).get(cidr)?;
        self.prefixes.get(&node.id)
    }

    /// The containment index of a VRF; empty for unknown VRFs.
    pub fn space(&self, vrf_id: i64) -> &ContainmentIndex {
        self.spaces.get(&vrf_id).unwrap_or(&EMPTY)
    }

    /// Stored strict ancestors of `cidr`, closest first.
    pub fn ancestors(&self, vrf_id: i64, cidr: &Cidr) -> Vec<&Prefix> {
        self.resolve(self.space(vrf_id).ancestors(cidr))
    }

    pub fn parent(&self, vrf_id: i64, cidr: &Cidr) -> Option<&Prefix> {
        let (_, node) = self.space(vrf_id).parent(cidr)?;
        self.prefixes.get(&node.id)
    }

    /// Stored strict descendants of `cidr`, see [`ContainmentIndex::descendants`].
    pub fn descendants(&self, vrf_id: i64, cidr: &Cidr, max_depth: i32) -> Vec<&Prefix> {
        self.resolve(self.space(vrf_id).descendants(cidr, max_depth))
    }

    fn resolve(&self, nodes: Vec<(Cidr, crate::index::Node)>) -> Vec<&Prefix> {
        nodes
            .into_iter()
            .filter_map(|(_, n)| self.prefixes.get(&n.id))
            .collect()
    }

    /// Every prefix ordered by VRF id, then address, then length.
    pub fn ordered_prefixes(&self) -> impl Iterator<Item = &Prefix> {
        self.spaces
            .values()
            .flat_map(|space| space.iter())
            .filter_map(|(_, n)| self.prefixes.get(&n.id))
    }

    pub fn prefix_count(&self, vrf_id: i64) -> usize {
        self.space(vrf_id).len()
    }

    /// Prefixes referencing `pool_id` with no ancestor that also references
    /// it. These are the blocks the pool allocates from.
    pub fn pool_members(&self, pool_id: i64) -> Vec<&Prefix> {
        self.ordered_prefixes()
            .filter(|p| p.pool_id == Some(pool_id))
            .filter(|p| {
                !self
                    .ancestors(p.vrf_id, &p.prefix)
                    .iter()
                    .any(|a| a.pool_id == Some(pool_id))
            })
            .collect()
    }

    /// Every prefix referencing `pool_id`, members and allocations alike.
    pub fn pool_references(&self, pool_id: i64) -> impl Iterator<Item = &Prefix> {
        self.prefixes.values().filter(move |p| p.pool_id == Some(pool_id))
    }

    /// The one VRF all members of a pool live in, if there is exactly one.
    pub fn pool_vrf(&self, pool_id: i64) -> Option<i64> {
        let vrfs: BTreeSet<i64> = self.pool_members(pool_id).iter().map(|p| p.vrf_id).collect();
        match vrfs.len() {
            1 => vrfs.into_iter().next(),
            _ => None,
        }
    }

    // Materialized views

    pub fn prefix_view(&self, p: &Prefix) -> Prefix {
        let mut v = p.clone();
        let cidr = p.prefix;
        let space = self.space(p.vrf_id);

        v.family = cidr.family();
        v.prefix_length = cidr.len();
        v.indent = space.depth_of(&cidr);

        let ancestors = self.ancestors(p.vrf_id, &cidr);
        v.inherited_tags = ancestors.iter().flat_map(|a| a.tags.iter().cloned()).collect();
        v.display_prefix = match ancestors.first() {
            Some(parent)
                if p.prefix_type == PrefixType::Host && parent.prefix_type == PrefixType::Assignment =>
            {
                cidr.display_with_len(parent.prefix.len())
            }
            _ => cidr.to_string(),
        };

        let children = space.descendants(&cidr, 1);
        v.children = children.len() as u64;
        v.total_addresses = cidr.total_addresses();
        v.used_addresses = sum_addresses(children.iter().map(|(c, _)| c));
        v.free_addresses = v.total_addresses.saturating_sub(v.used_addresses);

        match self.vrfs.get(&p.vrf_id) {
            Some(vrf) => {
                v.vrf_rt = vrf.rt.clone();
                v.vrf_name = Some(vrf.name.clone());
            }
            None => {
                v.vrf_rt = None;
                v.vrf_name = None;
            }
        }
        v.pool_name = p.pool_id.and_then(|id| self.pools.get(&id)).map(|pool| pool.name.clone());
        v
    }

    pub fn prefix_view_by_id(&self, id: i64) -> Result<Prefix> {
        self.prefixes
            .get(&id)
            .map(|p| self.prefix_view(p))
            .ok_or_else(|| IpamError::not_found("prefix", id))
    }

    pub fn vrf_view(&self, vrf: &Vrf) -> Vrf {
        let mut v = vrf.clone();
        let space = self.space(vrf.id);
        let mut stats = FamilyStats::default();

        for (cidr, node) in space.iter() {
            stats.count(cidr.family());
            if node.indent == 0 {
                let used = sum_addresses(space.descendants(cidr, 1).iter().map(|(c, _)| c));
                stats.add(cidr.family(), cidr.total_addresses(), used);
            }
        }

        v.num_prefixes_v4 = stats.v4.members;
        v.num_prefixes_v6 = stats.v6.members;
        v.total_addresses_v4 = stats.v4.total;
        v.total_addresses_v6 = stats.v6.total;
        v.used_addresses_v4 = stats.v4.used;
        v.used_addresses_v6 = stats.v6.used;
        v.free_addresses_v4 = stats.v4.free();
        v.free_addresses_v6 = stats.v6.free();
        v
    }

    pub fn vrf_view_by_id(&self, id: i64) -> Result<Vrf> {
        self.vrfs
            .get(&id)
            .map(|v| self.vrf_view(v))
            .ok_or_else(|| IpamError::not_found("VRF", id))
    }

    pub fn pool_view(&self, pool: &Pool) -> Pool {
        let mut v = pool.clone();
        let members = self.pool_members(pool.id);
        let mut stats = FamilyStats::default();

        for m in &members {
            let family = m.prefix.family();
            stats.count(family);
            let used = sum_addresses(
                self.space(m.vrf_id)
                    .descendants(&m.prefix, 1)
                    .iter()
                    .map(|(c, _)| c),
            );
            stats.add(family, m.prefix.total_addresses(), used);
        }

        let vrfs: BTreeSet<i64> = members.iter().map(|m| m.vrf_id).collect();
        v.vrf_id = if vrfs.len() == 1 { vrfs.into_iter().next() } else { None };
        v.prefixes = members.iter().map(|m| m.prefix).collect();
        v.member_prefixes_v4 = stats.v4.members;
        v.member_prefixes_v6 = stats.v6.members;
        v.total_addresses_v4 = stats.v4.total;
        v.total_addresses_v6 = stats.v6.total;
        v.used_addresses_v4 = stats.v4.used;
        v.used_addresses_v6 = stats.v6.used;
        v.free_addresses_v4 = stats.v4.free();
        v.free_addresses_v6 = stats.v6.free();
        v
    }

    pub fn pool_view_by_id(&self, id: i64) -> Result<Pool> {
        self.pools
            .get(&id)
            .map(|p| self.pool_view(p))
            .ok_or_else(|| IpamError::not_found("pool", id))
    }
}

fn sum_addresses<'a>(cidrs: impl Iterator<Item = &'a Cidr>) -> u128 {
    cidrs.fold(0u128, |acc, c| acc.saturating_add(c.total_addresses()))
}

#[derive(Debug, Default)]
struct Counters {
    members: u64,
    total: u128,
    used: u128,
}

impl Counters {
    fn free(&self) -> u128 {
        self.total.saturating_sub(self.used)
    }
}

#[derive(Debug, Default)]
struct FamilyStats {
    v4: Counters,
    v6: Counters,
}

impl FamilyStats {
    fn get(&mut self, family: Family) -> &mut Counters {
        match family {
            Family::V4 => &mut self.v4,
            Family::V6 => &mut self.v6,
        }
    }

    fn count(&mut self, family: Family) {
        self.get(family).members += 1;
    }

    fn add(&mut self, family: Family, total: u128, used: u128) {
        let c = self.get(family);
        c.total = c.total.saturating_add(total);
        c.used = c.used.saturating_add(used);
    }
}
