//! Prefix mutations and the type-containment rules.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::allocate::{self, FindFree};
use super::registry::Registry;
use super::{describe, Ipam, LockScope};
use crate::auth::Principal;
use crate::cidr::Cidr;
use crate::db::models::{ChangeAction, EntityKind, Prefix, PrefixAttrs, PrefixRef, PrefixType, VrfRef};
use crate::db::store::{AuditRecord, ChangeRecord, Write};
use crate::error::{IpamError, Result};

/// How far a removal may reach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoveOptions {
    /// Remove everything below the prefix too.
    pub recursive: bool,
    /// Allow a recursive removal to take host prefixes with it.
    pub remove_hosts: bool,
}

impl RemoveOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            remove_hosts: false,
        }
    }

    pub fn with_hosts(mut self) -> Self {
        self.remove_hosts = true;
        self
    }
}

/// Check that a prefix of type `kind` may sit at `cidr` given what is
/// stored around it. The prefix itself, if stored, is ignored.
fn check_placement(reg: &Registry, vrf_id: i64, cidr: &Cidr, kind: PrefixType) -> Result<()> {
    let parent = reg.parent(vrf_id, cidr);

    match kind {
        PrefixType::Host => {
            if !cidr.is_host() {
                return Err(IpamError::value(
                    "type",
                    format!("a host must be a single address, not {cidr}"),
                ));
            }
            if let Some(p) = parent.filter(|p| p.prefix_type != PrefixType::Assignment) {
                return Err(IpamError::constraint(
                    "prefix",
                    cidr,
                    format!("a host can only be placed inside an assignment, {} is a {}", p.prefix, p.prefix_type),
                ));
            }
        }
        PrefixType::Assignment | PrefixType::Reservation => {
            if let Some(p) = parent.filter(|p| p.prefix_type == PrefixType::Assignment) {
                return Err(IpamError::constraint(
                    "prefix",
                    cidr,
                    format!("only hosts can be placed inside assignment {}", p.prefix),
                ));
            }
        }
    }

    match kind {
        PrefixType::Assignment => {
            if let Some(d) = reg
                .descendants(vrf_id, cidr, -1)
                .into_iter()
                .find(|d| d.prefix_type != PrefixType::Host)
            {
                return Err(IpamError::constraint(
                    "prefix",
                    cidr,
                    format!("an assignment can only contain hosts, {} is a {}", d.prefix, d.prefix_type),
                ));
            }
        }
        PrefixType::Reservation => {
            if let Some(d) = reg
                .descendants(vrf_id, cidr, 1)
                .into_iter()
                .find(|d| d.prefix_type == PrefixType::Host)
            {
                return Err(IpamError::constraint(
                    "prefix",
                    cidr,
                    format!("host {} would no longer sit directly inside an assignment", d.prefix),
                ));
            }
        }
        PrefixType::Host => {}
    }
    Ok(())
}

fn require_description_or_node(attrs: &PrefixAttrs) -> Result<()> {
    let given = |v: &Option<Option<String>>| {
        v.as_ref()
            .and_then(|o| o.as_deref())
            .is_some_and(|s| !s.trim().is_empty())
    };
    if given(&attrs.description) || given(&attrs.node) {
        Ok(())
    } else {
        Err(IpamError::MissingInput("description or node".to_string()))
    }
}

impl Ipam {
    /// Add a prefix, either at an explicit `attrs.prefix` or at the first
    /// free block found by `from`.
    pub async fn add_prefix(
        &self,
        principal: &Principal,
        vrf: Option<VrfRef>,
        attrs: PrefixAttrs,
        from: Option<FindFree>,
    ) -> Result<Prefix> {
        match (&attrs.prefix, &from) {
            (Some(_), Some(_)) => {
                return Err(IpamError::ExtraneousInput(
                    "prefix cannot be combined with an allocation source".to_string(),
                ))
            }
            (None, None) => return Err(IpamError::MissingInput("prefix".to_string())),
            _ => {}
        }
        if let Some(n) = from.as_ref().and_then(|f| f.count).filter(|n| *n != 1) {
            return Err(IpamError::value("count", format!("add allocates one prefix, not {n}")));
        }
        require_description_or_node(&attrs)?;
        let policy = self.config().non_canonical;
        let manual = attrs.prefix.as_deref().map(|s| Cidr::parse(s, policy)).transpose()?;
        let max_count = self.config().max_find_free_count;

        let scope = |reg: &Registry| -> Result<LockScope> {
            let vrf_id = match &from {
                Some(spec) => allocate::target_vrf(reg, vrf.as_ref(), spec)?,
                None => reg.vrf(vrf.as_ref().unwrap_or(&VrfRef::default()))?.id,
            };
            let mut scope = LockScope::vrf(vrf_id);
            if let Some(pool) = from.as_ref().map(|f| f.source_pool(reg)).transpose()?.flatten() {
                scope = scope.with_pool(pool.id);
            }
            if let Some(Some(id)) = attrs.pool_id {
                scope = scope.with_pool(id);
            }
            Ok(scope)
        };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, i64)> {
            let now = Utc::now();
            let mut pool = None;
            let (vrf_id, cidr) = match (&from, manual) {
                (Some(spec), _) => {
                    let resolved = allocate::resolve(reg, vrf.as_ref(), spec, policy, max_count)?;
                    let cidr = allocate::find_free(reg, &resolved).into_iter().next().ok_or_else(|| {
                        IpamError::NoFreePrefix {
                            length: resolved.length,
                            source_desc: source_desc(spec),
                        }
                    })?;
                    pool = spec.source_pool(reg)?;
                    (resolved.vrf_id, cidr)
                }
                (None, Some(cidr)) => (reg.vrf(vrf.as_ref().unwrap_or(&VrfRef::default()))?.id, cidr),
                (None, None) => return Err(IpamError::MissingInput("prefix".to_string())),
            };
            let vrf = reg
                .vrf_by_id(vrf_id)
                .ok_or_else(|| IpamError::not_found("VRF", vrf_id))?;

            let kind = attrs
                .prefix_type
                .or(pool.and_then(|p| p.default_type))
                .ok_or_else(|| IpamError::MissingInput("type".to_string()))?;

            if reg.prefix_at(vrf_id, &cidr).is_some() {
                return Err(IpamError::Duplicate {
                    entity: "prefix",
                    key: format!("{cidr} in VRF {}", vrf.label()),
                });
            }
            check_placement(reg, vrf_id, &cidr, kind)?;

            let mut p = Prefix::new(self.next_prefix_id(), vrf_id, cidr, kind, now);
            attrs.apply_to(&mut p);
            p.prefix_type = kind;
            if let Some(pool) = pool {
                match p.pool_id {
                    Some(id) if id != pool.id => {
                        return Err(IpamError::value(
                            "pool_id",
                            format!("allocating from pool {} but pool_id is {id}", pool.id),
                        ))
                    }
                    _ => p.pool_id = Some(pool.id),
                }
            }
            let member_of = match p.pool_id {
                Some(id) => Some(
                    reg.pool_by_id(id)
                        .ok_or_else(|| IpamError::not_found("pool", id))?,
                ),
                None => None,
            };
            p.authoritative_source = principal.authoritative_source.clone();
            p.authenticated_as = principal.authenticated_as.clone();

            let mut recorded = attrs.clone();
            recorded.prefix = Some(cidr.to_string());
            let mut writes = vec![
                Write::PutPrefix(p.clone()),
                Write::Audit(
                    AuditRecord::new(principal, format!("Added prefix {cidr} with attr: {}", describe(&recorded)))
                        .vrf(vrf)
                        .prefix(&p),
                ),
            ];
            if let Some(pool) = member_of {
                writes.push(Write::Audit(
                    AuditRecord::new(principal, format!("Pool {} expanded with prefix {cidr}", pool.name))
                        .vrf(vrf)
                        .prefix(&p)
                        .pool(pool),
                ));
            }
            writes.push(Write::Change(ChangeRecord::new(
                principal,
                EntityKind::Prefix,
                p.id,
                ChangeAction::Add,
                None,
                Some(&p),
            )?));
            Ok((writes, p.id))
        };

        let added = self
            .mutate(principal, "add_prefix", scope, plan, |reg, id| reg.prefix_view_by_id(id))
            .await?;
        info!(
            prefix = %added.prefix,
            vrf_id = added.vrf_id,
            id = added.id,
            indent = added.indent,
            user = %principal.identity,
            "Added prefix"
        );
        Ok(added)
    }

    /// Change attributes of a stored prefix. The CIDR and VRF are fixed.
    pub async fn edit_prefix(
        &self,
        principal: &Principal,
        vrf: Option<VrfRef>,
        target: PrefixRef,
        attrs: PrefixAttrs,
    ) -> Result<Prefix> {
        let policy = self.config().non_canonical;
        let vrf_ref = vrf.unwrap_or_default();

        let scope = |reg: &Registry| -> Result<LockScope> {
            let vrf_id = reg.vrf(&vrf_ref)?.id;
            let current = reg.prefix(vrf_id, &target, policy)?;
            let mut scope = LockScope::vrf(vrf_id);
            if let Some(id) = current.pool_id {
                scope = scope.with_pool(id);
            }
            if let Some(Some(id)) = attrs.pool_id {
                scope = scope.with_pool(id);
            }
            Ok(scope)
        };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, i64)> {
            let vrf = reg.vrf(&vrf_ref)?;
            let before = reg.prefix(vrf.id, &target, policy)?;

            if let Some(text) = &attrs.prefix {
                if Cidr::parse(text, policy)? != before.prefix {
                    return Err(IpamError::input(
                        "prefix",
                        "a prefix cannot be moved; remove it and add the new one",
                    ));
                }
            }

            let mut after = before.clone();
            attrs.apply_to(&mut after);
            after.last_modified = Utc::now();

            if after.prefix_type != before.prefix_type {
                check_placement(reg, vrf.id, &after.prefix, after.prefix_type)?;
            }
            if after.description.as_deref().map_or(true, |s| s.trim().is_empty())
                && after.node.as_deref().map_or(true, |s| s.trim().is_empty())
            {
                return Err(IpamError::MissingInput("description or node".to_string()));
            }

            let mut writes = vec![
                Write::PutPrefix(after.clone()),
                Write::Audit(
                    AuditRecord::new(
                        principal,
                        format!("Edited prefix {} attr: {}", before.prefix, describe(&attrs)),
                    )
                    .vrf(vrf)
                    .prefix(&after),
                ),
            ];
            if after.pool_id != before.pool_id {
                if let Some(old) = before.pool_id.and_then(|id| reg.pool_by_id(id)) {
                    writes.push(Write::Audit(
                        AuditRecord::new(principal, format!("Prefix {} removed from pool {}", before.prefix, old.name))
                            .vrf(vrf)
                            .prefix(&after)
                            .pool(old),
                    ));
                }
                if let Some(id) = after.pool_id {
                    let new = reg.pool_by_id(id).ok_or_else(|| IpamError::not_found("pool", id))?;
                    writes.push(Write::Audit(
                        AuditRecord::new(principal, format!("Pool {} expanded with prefix {}", new.name, after.prefix))
                            .vrf(vrf)
                            .prefix(&after)
                            .pool(new),
                    ));
                }
            }
            writes.push(Write::Change(ChangeRecord::new(
                principal,
                EntityKind::Prefix,
                after.id,
                ChangeAction::Edit,
                Some(before),
                Some(&after),
            )?));
            Ok((writes, after.id))
        };

        let edited = self
            .mutate(principal, "edit_prefix", scope, plan, |reg, id| reg.prefix_view_by_id(id))
            .await?;
        info!(prefix = %edited.prefix, vrf_id = edited.vrf_id, user = %principal.identity, "Edited prefix");
        Ok(edited)
    }

    /// Remove a prefix and, if `options.recursive`, everything below it.
    /// Returns the removed prefixes, deepest first.
    pub async fn remove_prefix(
        &self,
        principal: &Principal,
        vrf: Option<VrfRef>,
        target: PrefixRef,
        options: RemoveOptions,
    ) -> Result<Vec<Prefix>> {
        let policy = self.config().non_canonical;
        let vrf_ref = vrf.unwrap_or_default();

        let scope = |reg: &Registry| -> Result<LockScope> {
            let vrf_id = reg.vrf(&vrf_ref)?.id;
            reg.prefix(vrf_id, &target, policy)?;
            Ok(LockScope::vrf(vrf_id))
        };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, Vec<Prefix>)> {
            let vrf = reg.vrf(&vrf_ref)?;
            let top = reg.prefix(vrf.id, &target, policy)?;
            let below = reg.descendants(vrf.id, &top.prefix, -1);

            if !below.is_empty() && !options.recursive {
                return Err(IpamError::constraint(
                    "prefix",
                    top.prefix,
                    format!("has {} prefixes below it, remove recursively", below.len()),
                ));
            }
            let hosts = below.iter().filter(|p| p.prefix_type == PrefixType::Host).count();
            if hosts > 0 && !options.remove_hosts {
                return Err(IpamError::constraint(
                    "prefix",
                    top.prefix,
                    format!("subtree holds {hosts} host prefixes, set remove_hosts to delete them"),
                ));
            }

            let mut doomed: Vec<Prefix> = below.iter().map(|p| reg.prefix_view(p)).collect();
            doomed.sort_by(|a, b| b.indent.cmp(&a.indent).then(b.prefix.cmp(&a.prefix)));
            doomed.push(reg.prefix_view(top));

            let mut writes = Vec::with_capacity(doomed.len() * 3);
            for p in &doomed {
                writes.push(Write::DeletePrefix(p.id));
                writes.push(Write::Audit(
                    AuditRecord::new(principal, format!("Removed prefix {}", p.prefix))
                        .vrf(vrf)
                        .prefix(p),
                ));
                if let Some(pool) = p.pool_id.and_then(|id| reg.pool_by_id(id)) {
                    writes.push(Write::Audit(
                        AuditRecord::new(principal, format!("Prefix {} removed from pool {}", p.prefix, pool.name))
                            .vrf(vrf)
                            .prefix(p)
                            .pool(pool),
                    ));
                }
                writes.push(Write::Change(ChangeRecord::new(
                    principal,
                    EntityKind::Prefix,
                    p.id,
                    ChangeAction::Remove,
                    Some(p),
                    None,
                )?));
            }
            Ok((writes, doomed))
        };

        let removed = self
            .mutate(principal, "remove_prefix", scope, plan, |_, removed| Ok(removed))
            .await?;
        if let Some(top) = removed.last() {
            info!(
                prefix = %top.prefix,
                vrf_id = top.vrf_id,
                removed = removed.len(),
                user = %principal.identity,
                "Removed prefix"
            );
        }
        Ok(removed)
    }
}

fn source_desc(spec: &FindFree) -> String {
    match (&spec.from_pool, &spec.from_prefix) {
        (Some(pool), _) => format!("pool {pool}"),
        (None, Some(prefixes)) => prefixes.join(", "),
        (None, None) => String::new(),
    }
}
