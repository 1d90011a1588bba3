#![allow(dead_code)]

use prefixd::config::EngineConfig;
use prefixd::db::{PrefixAttrs, PrefixType, Store};
use prefixd::{Ipam, Principal};
use tempfile::TempDir;

pub async fn store(dir: &TempDir) -> Store {
    Store::open(&dir.path().join("prefixd.db"), 5).await.unwrap()
}

pub async fn engine(dir: &TempDir) -> Ipam {
    engine_with(dir, EngineConfig::default()).await
}

pub async fn engine_with(dir: &TempDir, config: EngineConfig) -> Ipam {
    Ipam::open(store(dir).await, config).await.unwrap()
}

pub fn admin() -> Principal {
    Principal::new("admin", "tests")
}

pub fn attrs(prefix: &str, kind: PrefixType) -> PrefixAttrs {
    PrefixAttrs {
        prefix: Some(prefix.to_string()),
        prefix_type: Some(kind),
        description: Some(Some(format!("{kind} {prefix}"))),
        ..Default::default()
    }
}

/// Attributes for an allocation; the prefix comes from the source.
pub fn allocated(kind: PrefixType, description: &str) -> PrefixAttrs {
    PrefixAttrs {
        prefix_type: Some(kind),
        description: Some(Some(description.to_string())),
        ..Default::default()
    }
}
