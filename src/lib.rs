//! prefixd: IP address management.
//!
//! Tracks IPv4/IPv6 prefixes in a per-VRF containment hierarchy, carves
//! free blocks out of reservations and pools, and records every change in
//! an audit log and an ordered change feed.

pub mod api;
pub mod auth;
pub mod cidr;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod ipam;
pub mod query;

pub use auth::Principal;
pub use cidr::{Cidr, Family, HostBits};
pub use error::{ErrorKind, IpamError, Result};
pub use ipam::Ipam;
