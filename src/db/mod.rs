//! Persistence: entity models and the SQLite store.

pub mod models;
pub mod store;

pub use models::{
    AlarmPriority, AuditEntry, AuditFilter, Change, ChangeAction, EntityKind, Pool, PoolAttrs,
    PoolRef, Prefix, PrefixAttrs, PrefixRef, PrefixStatus, PrefixType, User, Vrf, VrfAttrs,
    VrfRef, DEFAULT_VRF_ID,
};
pub use store::{AuditRecord, ChangeRecord, Store, Write};
