//! Listing and searching over the committed state.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::debug;

use super::registry::Registry;
use super::Ipam;
use crate::auth::Principal;
use crate::cidr::Cidr;
use crate::db::models::{Pool, Prefix, Vrf};
use crate::error::Result;
use crate::query::smart::{self, Target};
use crate::query::{Compiled, PrefixMatch, Query, SearchOptions, SearchResult, Searchable, SmartSearchResult};

/// Attribute/value pairs as used by the `list_*` calls.
pub type ListSpec = BTreeMap<String, serde_json::Value>;

/// An AND of equality comparisons, or `None` to match everything.
fn spec_query(spec: &ListSpec) -> Option<Query> {
    spec.iter()
        .map(|(attribute, value)| Query::equals(attribute, value.clone()))
        .reduce(Query::and)
}

fn compile<T: Searchable>(query: Option<&Query>) -> Result<Option<Compiled<T>>> {
    query.map(Compiled::new).transpose()
}

fn keep<T: Searchable>(compiled: &Option<Compiled<T>>, record: &T) -> bool {
    compiled.as_ref().map_or(true, |c| c.matches(record))
}

/// Fill in the default row cap and return the options to echo back.
fn effective(options: SearchOptions, default_max: usize) -> SearchOptions {
    SearchOptions {
        max_result: Some(options.max_result.unwrap_or(default_max)),
        ..options
    }
}

fn page<T>(rows: impl Iterator<Item = T>, options: &SearchOptions) -> Vec<T> {
    rows.skip(options.offset)
        .take(options.max_result.unwrap_or(usize::MAX))
        .collect()
}

/// Row state while assembling a prefix search result.
#[derive(Clone, Copy)]
struct Row {
    id: i64,
    matched: bool,
    display: bool,
}

fn upsert(rows: &mut BTreeMap<(i64, Cidr), Row>, p: &Prefix, matched: bool, display: bool) {
    match rows.entry((p.vrf_id, p.prefix)) {
        Entry::Vacant(e) => {
            e.insert(Row {
                id: p.id,
                matched,
                display,
            });
        }
        Entry::Occupied(mut e) => {
            let row = e.get_mut();
            row.matched |= matched;
            row.display |= display;
        }
    }
}

/// Run a prefix query and pull in the surrounding rows the options ask for.
/// Rows come out ordered by VRF, then address, then length.
fn search_prefixes(reg: &Registry, query: Option<&Query>, options: &SearchOptions) -> Result<Vec<PrefixMatch>> {
    let compiled = compile::<Prefix>(query)?;
    let mut rows: BTreeMap<(i64, Cidr), Row> = BTreeMap::new();

    let hits: Vec<&Prefix> = reg
        .ordered_prefixes()
        .filter(|p| keep(&compiled, &reg.prefix_view(p)))
        .collect();

    for hit in &hits {
        upsert(&mut rows, hit, true, true);

        let ancestors = reg.ancestors(hit.vrf_id, &hit.prefix);
        let shown = match options.parents_depth {
            d if d < 0 => ancestors.len(),
            d => (d as usize).min(ancestors.len()),
        };
        for (n, a) in ancestors.iter().enumerate() {
            if n < shown {
                upsert(&mut rows, a, false, true);
            } else if options.include_all_parents {
                upsert(&mut rows, a, false, false);
            }
        }

        for d in reg.descendants(hit.vrf_id, &hit.prefix, options.children_depth) {
            upsert(&mut rows, d, false, true);
        }
        if options.include_all_children {
            for d in reg.descendants(hit.vrf_id, &hit.prefix, -1) {
                upsert(&mut rows, d, false, false);
            }
        }
    }
    debug!(matched = hits.len(), rows = rows.len(), "Prefix search");

    Ok(page(rows.into_values(), options)
        .into_iter()
        .filter_map(|row| {
            let p = reg.prefix_by_id(row.id)?;
            Some(PrefixMatch {
                prefix: reg.prefix_view(p),
                matched: row.matched,
                display: row.display,
            })
        })
        .collect())
}

fn search_records<T: Searchable>(
    records: impl Iterator<Item = T>,
    query: Option<&Query>,
    options: &SearchOptions,
) -> Result<Vec<T>> {
    let compiled = compile::<T>(query)?;
    Ok(page(records.filter(|r| keep(&compiled, r)), options))
}

fn combine(left: Option<Query>, right: Option<Query>) -> Option<Query> {
    match (left, right) {
        (Some(l), Some(r)) => Some(l.and(r)),
        (l, r) => l.or(r),
    }
}

impl Ipam {
    // Prefixes

    /// Every prefix whose attributes equal `spec`, in address order.
    pub async fn list_prefix(&self, _principal: &Principal, spec: &ListSpec) -> Result<Vec<Prefix>> {
        let reg = self.read().await;
        let compiled = compile::<Prefix>(spec_query(spec).as_ref())?;
        Ok(reg
            .ordered_prefixes()
            .map(|p| reg.prefix_view(p))
            .filter(|p| keep(&compiled, p))
            .collect())
    }

    /// Run a structured query. `None` matches every prefix.
    pub async fn search_prefix(
        &self,
        _principal: &Principal,
        query: Option<&Query>,
        options: SearchOptions,
    ) -> Result<SearchResult<PrefixMatch>> {
        let options = effective(options, self.config().default_max_result);
        let reg = self.read().await;
        let result = search_prefixes(&reg, query, &options)?;
        Ok(SearchResult {
            search_options: options,
            result,
        })
    }

    /// Interpret free text as a prefix query. `extra`, when given, is
    /// AND-ed with whatever the text produced.
    pub async fn smart_search_prefix(
        &self,
        _principal: &Principal,
        text: &str,
        options: SearchOptions,
        extra: Option<Query>,
    ) -> Result<SmartSearchResult<PrefixMatch>> {
        let options = effective(options, self.config().default_max_result);
        let parsed = smart::parse(Target::Prefix, text);
        if parsed.error.is_some() {
            return Ok(SmartSearchResult {
                interpretation: parsed.interpretation,
                search_options: options,
                result: Vec::new(),
                error: parsed.error,
            });
        }

        let query = combine(parsed.query, extra);
        let reg = self.read().await;
        let result = search_prefixes(&reg, query.as_ref(), &options)?;
        Ok(SmartSearchResult {
            interpretation: parsed.interpretation,
            search_options: options,
            result,
            error: None,
        })
    }

    // Pools

    pub async fn list_pool(&self, _principal: &Principal, spec: &ListSpec) -> Result<Vec<Pool>> {
        let reg = self.read().await;
        search_records(
            reg.pools().map(|p| reg.pool_view(p)),
            spec_query(spec).as_ref(),
            &SearchOptions::default(),
        )
    }

    pub async fn search_pool(
        &self,
        _principal: &Principal,
        query: Option<&Query>,
        options: SearchOptions,
    ) -> Result<SearchResult<Pool>> {
        let options = effective(options, self.config().default_max_result);
        let reg = self.read().await;
        let result = search_records(reg.pools().map(|p| reg.pool_view(p)), query, &options)?;
        Ok(SearchResult {
            search_options: options,
            result,
        })
    }

    pub async fn smart_search_pool(
        &self,
        _principal: &Principal,
        text: &str,
        options: SearchOptions,
    ) -> Result<SmartSearchResult<Pool>> {
        let options = effective(options, self.config().default_max_result);
        let parsed = smart::parse(Target::Pool, text);
        let result = match parsed.error {
            Some(_) => Vec::new(),
            None => {
                let reg = self.read().await;
                search_records(reg.pools().map(|p| reg.pool_view(p)), parsed.query.as_ref(), &options)?
            }
        };
        Ok(SmartSearchResult {
            interpretation: parsed.interpretation,
            search_options: options,
            result,
            error: parsed.error,
        })
    }

    // VRFs

    pub async fn list_vrf(&self, _principal: &Principal, spec: &ListSpec) -> Result<Vec<Vrf>> {
        let reg = self.read().await;
        search_records(
            reg.vrfs().map(|v| reg.vrf_view(v)),
            spec_query(spec).as_ref(),
            &SearchOptions::default(),
        )
    }

    pub async fn search_vrf(
        &self,
        _principal: &Principal,
        query: Option<&Query>,
        options: SearchOptions,
    ) -> Result<SearchResult<Vrf>> {
        let options = effective(options, self.config().default_max_result);
        let reg = self.read().await;
        let result = search_records(reg.vrfs().map(|v| reg.vrf_view(v)), query, &options)?;
        Ok(SearchResult {
            search_options: options,
            result,
        })
    }

    pub async fn smart_search_vrf(
        &self,
        _principal: &Principal,
        text: &str,
        options: SearchOptions,
    ) -> Result<SmartSearchResult<Vrf>> {
        let options = effective(options, self.config().default_max_result);
        let parsed = smart::parse(Target::Vrf, text);
        let result = match parsed.error {
            Some(_) => Vec::new(),
            None => {
                let reg = self.read().await;
                search_records(reg.vrfs().map(|v| reg.vrf_view(v)), parsed.query.as_ref(), &options)?
            }
        };
        Ok(SmartSearchResult {
            interpretation: parsed.interpretation,
            search_options: options,
            result,
            error: parsed.error,
        })
    }
}
