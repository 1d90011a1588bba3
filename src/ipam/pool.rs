//! Pool mutations.

use chrono::Utc;
use tracing::info;

use super::registry::Registry;
use super::{describe, non_empty, Ipam, LockScope};
use crate::auth::Principal;
use crate::cidr::Family;
use crate::db::models::{ChangeAction, EntityKind, Pool, PoolAttrs, PoolRef, Prefix};
use crate::db::store::{AuditRecord, ChangeRecord, Write};
use crate::error::{IpamError, Result};

fn apply(attrs: &PoolAttrs, pool: &mut Pool) {
    if let Some(name) = &attrs.name {
        pool.name = name.clone();
    }
    if let Some(d) = &attrs.description {
        pool.description = d.clone();
    }
    if let Some(t) = attrs.default_type {
        pool.default_type = t;
    }
    if let Some(len) = attrs.ipv4_default_prefix_length {
        pool.ipv4_default_prefix_length = len;
    }
    if let Some(len) = attrs.ipv6_default_prefix_length {
        pool.ipv6_default_prefix_length = len;
    }
    if let Some(t) = &attrs.tags {
        pool.tags = t.clone();
    }
    if let Some(a) = &attrs.avps {
        pool.avps = a.clone();
    }
}

fn validate(reg: &Registry, pool: &Pool) -> Result<()> {
    non_empty("name", &pool.name)?;
    for (family, attribute) in [
        (Family::V4, "ipv4_default_prefix_length"),
        (Family::V6, "ipv6_default_prefix_length"),
    ] {
        if let Some(len) = pool.default_length(family).filter(|len| *len > family.width()) {
            return Err(IpamError::value(
                attribute,
                format!("/{len} is longer than an IPv{} address", family.number()),
            ));
        }
    }
    if reg.pools().any(|o| o.id != pool.id && o.name == pool.name) {
        return Err(IpamError::Duplicate {
            entity: "pool",
            key: format!("'{}'", pool.name),
        });
    }
    Ok(())
}

impl Ipam {
    pub async fn add_pool(&self, principal: &Principal, attrs: PoolAttrs) -> Result<Pool> {
        if attrs.name.is_none() {
            return Err(IpamError::MissingInput("name".to_string()));
        }

        // No lock to take: concurrent adds of one name both plan, and the
        // store's UNIQUE name column rejects the second at commit.
        let scope = |_: &Registry| -> Result<LockScope> { Ok(LockScope::default()) };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, i64)> {
            let mut pool = Pool::new(self.next_pool_id(), String::new());
            apply(&attrs, &mut pool);
            validate(reg, &pool)?;

            let writes = vec![
                Write::PutPool(pool.clone()),
                Write::Audit(
                    AuditRecord::new(principal, format!("Added pool {} with attr: {}", pool.name, describe(&attrs)))
                        .pool(&pool),
                ),
                Write::Change(ChangeRecord::new(
                    principal,
                    EntityKind::Pool,
                    pool.id,
                    ChangeAction::Add,
                    None,
                    Some(&pool),
                )?),
            ];
            Ok((writes, pool.id))
        };

        let added = self
            .mutate(principal, "add_pool", scope, plan, |reg, id| reg.pool_view_by_id(id))
            .await?;
        info!(pool = %added.name, id = added.id, user = %principal.identity, "Added pool");
        Ok(added)
    }

    pub async fn edit_pool(&self, principal: &Principal, target: PoolRef, attrs: PoolAttrs) -> Result<Pool> {
        let scope = |reg: &Registry| -> Result<LockScope> { Ok(LockScope::pool(reg.pool(&target)?.id)) };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, i64)> {
            let before = reg.pool(&target)?;
            let mut after = before.clone();
            apply(&attrs, &mut after);
            validate(reg, &after)?;

            let writes = vec![
                Write::PutPool(after.clone()),
                Write::Audit(
                    AuditRecord::new(principal, format!("Edited pool {} attr: {}", before.name, describe(&attrs)))
                        .pool(&after),
                ),
                Write::Change(ChangeRecord::new(
                    principal,
                    EntityKind::Pool,
                    after.id,
                    ChangeAction::Edit,
                    Some(before),
                    Some(&after),
                )?),
            ];
            Ok((writes, after.id))
        };

        let edited = self
            .mutate(principal, "edit_pool", scope, plan, |reg, id| reg.pool_view_by_id(id))
            .await?;
        info!(pool = %edited.name, id = edited.id, user = %principal.identity, "Edited pool");
        Ok(edited)
    }

    /// Remove a pool. Prefixes referencing it stay where they are with the
    /// reference cleared.
    pub async fn remove_pool(&self, principal: &Principal, target: PoolRef) -> Result<Pool> {
        let scope = |reg: &Registry| -> Result<LockScope> {
            let pool = reg.pool(&target)?;
            Ok(reg
                .pool_references(pool.id)
                .fold(LockScope::pool(pool.id), |scope, p| scope.with_vrf(p.vrf_id)))
        };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, Pool)> {
            let pool = reg.pool(&target)?;
            let view = reg.pool_view(pool);
            let now = Utc::now();

            let mut members: Vec<&Prefix> = reg.pool_references(pool.id).collect();
            members.sort_by_key(|p| (p.vrf_id, p.prefix));

            let mut writes = Vec::with_capacity(members.len() * 3 + 3);
            for before in members {
                let mut after = before.clone();
                after.pool_id = None;
                after.last_modified = now;
                let mut audit = AuditRecord::new(
                    principal,
                    format!("Prefix {} removed from pool {}", before.prefix, pool.name),
                )
                .prefix(before)
                .pool(pool);
                if let Some(vrf) = reg.vrf_by_id(before.vrf_id) {
                    audit = audit.vrf(vrf);
                }
                writes.push(Write::PutPrefix(after.clone()));
                writes.push(Write::Audit(audit));
                writes.push(Write::Change(ChangeRecord::new(
                    principal,
                    EntityKind::Prefix,
                    after.id,
                    ChangeAction::Edit,
                    Some(before),
                    Some(&after),
                )?));
            }
            writes.push(Write::DeletePool(pool.id));
            writes.push(Write::Audit(
                AuditRecord::new(principal, format!("Removed pool {}", pool.name)).pool(pool),
            ));
            writes.push(Write::Change(ChangeRecord::new(
                principal,
                EntityKind::Pool,
                pool.id,
                ChangeAction::Remove,
                Some(pool),
                None,
            )?));
            Ok((writes, view))
        };

        let removed = self
            .mutate(principal, "remove_pool", scope, plan, |_, pool| Ok(pool))
            .await?;
        info!(pool = %removed.name, id = removed.id, user = %principal.identity, "Removed pool");
        Ok(removed)
    }
}
