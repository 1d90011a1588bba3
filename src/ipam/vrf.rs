//! VRF mutations.

use tracing::info;

use super::registry::Registry;
use super::{describe, non_empty, Ipam, LockScope};
use crate::auth::Principal;
use crate::db::models::{ChangeAction, EntityKind, Vrf, VrfAttrs, VrfRef, DEFAULT_VRF_ID};
use crate::db::store::{AuditRecord, ChangeRecord, Write};
use crate::error::{IpamError, Result};
use crate::query::smart::is_route_target;

fn check_rt(id: i64, rt: Option<&str>) -> Result<()> {
    match rt {
        None if id == DEFAULT_VRF_ID => Ok(()),
        None => Err(IpamError::MissingInput("rt".to_string())),
        Some(_) if id == DEFAULT_VRF_ID => Err(IpamError::constraint(
            "VRF",
            id,
            "the default VRF has no route target",
        )),
        Some(rt) if is_route_target(rt) => Ok(()),
        Some(rt) => Err(IpamError::value(
            "rt",
            format!("'{rt}' is not of the form ASN:n or IPv4:n"),
        )),
    }
}

/// Another VRF already holding `vrf`'s rt or name.
fn check_unique(reg: &Registry, vrf: &Vrf) -> Result<()> {
    for other in reg.vrfs().filter(|o| o.id != vrf.id) {
        if vrf.rt.is_some() && other.rt == vrf.rt {
            return Err(IpamError::Duplicate {
                entity: "VRF",
                key: format!("with rt {}", other.rt.as_deref().unwrap_or_default()),
            });
        }
        if other.name == vrf.name {
            return Err(IpamError::Duplicate {
                entity: "VRF",
                key: format!("named '{}'", vrf.name),
            });
        }
    }
    Ok(())
}

fn apply(attrs: &VrfAttrs, vrf: &mut Vrf) {
    if let Some(rt) = &attrs.rt {
        vrf.rt = rt.clone();
    }
    if let Some(name) = &attrs.name {
        vrf.name = name.clone();
    }
    if let Some(d) = &attrs.description {
        vrf.description = d.clone();
    }
    if let Some(t) = &attrs.tags {
        vrf.tags = t.clone();
    }
    if let Some(a) = &attrs.avps {
        vrf.avps = a.clone();
    }
}

impl Ipam {
    pub async fn add_vrf(&self, principal: &Principal, attrs: VrfAttrs) -> Result<Vrf> {
        let name = attrs
            .name
            .as_deref()
            .ok_or_else(|| IpamError::MissingInput("name".to_string()))?;
        non_empty("name", name)?;
        if !matches!(attrs.rt, Some(Some(_))) {
            return Err(IpamError::MissingInput("rt".to_string()));
        }

        // No lock to take: two concurrent adds with the same name or RT both
        // plan, and the store's UNIQUE columns reject the second at commit.
        let scope = |_: &Registry| -> Result<LockScope> { Ok(LockScope::default()) };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, i64)> {
            let mut vrf = Vrf::new(self.next_vrf_id(), String::new());
            apply(&attrs, &mut vrf);
            check_rt(vrf.id, vrf.rt.as_deref())?;
            check_unique(reg, &vrf)?;

            let writes = vec![
                Write::PutVrf(vrf.clone()),
                Write::Audit(
                    AuditRecord::new(principal, format!("Added VRF {} with attr: {}", vrf.label(), describe(&attrs)))
                        .vrf(&vrf),
                ),
                Write::Change(ChangeRecord::new(
                    principal,
                    EntityKind::Vrf,
                    vrf.id,
                    ChangeAction::Add,
                    None,
                    Some(&vrf),
                )?),
            ];
            Ok((writes, vrf.id))
        };

        let added = self
            .mutate(principal, "add_vrf", scope, plan, |reg, id| reg.vrf_view_by_id(id))
            .await?;
        info!(vrf = %added.label(), id = added.id, user = %principal.identity, "Added VRF");
        Ok(added)
    }

    pub async fn edit_vrf(&self, principal: &Principal, target: VrfRef, attrs: VrfAttrs) -> Result<Vrf> {
        if let Some(name) = &attrs.name {
            non_empty("name", name)?;
        }

        let scope = |reg: &Registry| -> Result<LockScope> { Ok(LockScope::vrf(reg.vrf(&target)?.id)) };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, i64)> {
            let before = reg.vrf(&target)?;
            let mut after = before.clone();
            apply(&attrs, &mut after);
            check_rt(after.id, after.rt.as_deref())?;
            check_unique(reg, &after)?;

            let writes = vec![
                Write::PutVrf(after.clone()),
                Write::Audit(
                    AuditRecord::new(principal, format!("Edited VRF {} attr: {}", before.label(), describe(&attrs)))
                        .vrf(&after),
                ),
                Write::Change(ChangeRecord::new(
                    principal,
                    EntityKind::Vrf,
                    after.id,
                    ChangeAction::Edit,
                    Some(before),
                    Some(&after),
                )?),
            ];
            Ok((writes, after.id))
        };

        let edited = self
            .mutate(principal, "edit_vrf", scope, plan, |reg, id| reg.vrf_view_by_id(id))
            .await?;
        info!(vrf = %edited.label(), id = edited.id, user = %principal.identity, "Edited VRF");
        Ok(edited)
    }

    /// Remove an empty VRF. The default VRF cannot be removed.
    pub async fn remove_vrf(&self, principal: &Principal, target: VrfRef) -> Result<Vrf> {
        let scope = |reg: &Registry| -> Result<LockScope> { Ok(LockScope::vrf(reg.vrf(&target)?.id)) };

        let plan = |reg: &Registry| -> Result<(Vec<Write>, Vrf)> {
            let vrf = reg.vrf(&target)?;
            if vrf.id == DEFAULT_VRF_ID {
                return Err(IpamError::constraint("VRF", vrf.label(), "the default VRF cannot be removed"));
            }
            let held = reg.prefix_count(vrf.id);
            if held > 0 {
                return Err(IpamError::constraint(
                    "VRF",
                    vrf.label(),
                    format!("still holds {held} prefixes"),
                ));
            }

            let writes = vec![
                Write::DeleteVrf(vrf.id),
                Write::Audit(AuditRecord::new(principal, format!("Removed VRF {}", vrf.label())).vrf(vrf)),
                Write::Change(ChangeRecord::new(
                    principal,
                    EntityKind::Vrf,
                    vrf.id,
                    ChangeAction::Remove,
                    Some(vrf),
                    None,
                )?),
            ];
            Ok((writes, reg.vrf_view(vrf)))
        };

        let removed = self
            .mutate(principal, "remove_vrf", scope, plan, |_, vrf| Ok(vrf))
            .await?;
        info!(vrf = %removed.label(), id = removed.id, user = %principal.identity, "Removed VRF");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_route_targets() {
        assert!(check_rt(1, Some("65000:1")).is_ok());
        assert!(check_rt(1, Some("192.0.2.1:100")).is_ok());
        assert!(matches!(check_rt(1, Some("65000")), Err(IpamError::InvalidValue { .. })));
        assert!(matches!(check_rt(1, None), Err(IpamError::MissingInput(_))));
        assert!(check_rt(DEFAULT_VRF_ID, None).is_ok());
        assert_eq!(
            check_rt(DEFAULT_VRF_ID, Some("65000:1")).unwrap_err().kind(),
            ErrorKind::Constraint
        );
    }

    #[test]
    fn test_apply_clears_nullable_fields() {
        let mut vrf = Vrf::new(3, "blue".into());
        vrf.description = Some("old".into());
        let attrs: VrfAttrs = serde_json::from_str(r#"{"description": null, "name": "red"}"#).unwrap();
        apply(&attrs, &mut vrf);
        assert_eq!(vrf.description, None);
        assert_eq!(vrf.name, "red");
    }
}
