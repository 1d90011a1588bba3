//! Per-VRF containment index.
//!
//! Prefixes are kept in a `BTreeMap` ordered by `(family, address, length)`.
//! In that order every descendant of `P` sorts after `P` and before the next
//! prefix that does not overlap it, so subtree queries are range scans.
//! Ancestors are found by probing each shorter length, which is bounded by
//! the address width.

use std::collections::BTreeMap;

use crate::cidr::Cidr;

/// Stored entry: the prefix id and its depth in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: i64,
    /// Number of stored strict ancestors.
    pub indent: u32,
}

#[derive(Debug, Default, Clone)]
pub struct ContainmentIndex {
    entries: BTreeMap<Cidr, Node>,
}

impl ContainmentIndex {
    pub const EMPTY: Self = Self {
        entries: BTreeMap::new(),
    };

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, cidr: &Cidr) -> Option<Node> {
        self.entries.get(cidr).copied()
    }

    /// All entries in sort order.
    pub fn iter(&self) -> impl Iterator<Item = (&Cidr, &Node)> {
        self.entries.iter()
    }

    /// Stored strict ancestors, closest first.
    pub fn ancestors(&self, cidr: &Cidr) -> Vec<(Cidr, Node)> {
        let mut out = Vec::new();
        for len in (0..cidr.len()).rev() {
            let key = cidr.truncate(len);
            if let Some(node) = self.entries.get(&key) {
                out.push((key, *node));
            }
        }
        out
    }

    /// Closest stored strict ancestor.
    pub fn parent(&self, cidr: &Cidr) -> Option<(Cidr, Node)> {
        (0..cidr.len()).rev().find_map(|len| {
            let key = cidr.truncate(len);
            self.entries.get(&key).map(|n| (key, *n))
        })
    }

    /// Indent `cidr` has, or would have if it were inserted.
    pub fn depth_of(&self, cidr: &Cidr) -> u32 {
        match self.entries.get(cidr) {
            Some(node) => node.indent,
            None => self.ancestors(cidr).len() as u32,
        }
    }

    fn subtree(&self, cidr: &Cidr) -> impl Iterator<Item = (&Cidr, &Node)> {
        let width = cidr.family().width();
        let range = (cidr.len() < width).then(|| {
            let lower = Cidr::from_parts(cidr.family(), cidr.network(), cidr.len() + 1);
            let upper = Cidr::from_parts(cidr.family(), cidr.last(), width);
            self.entries.range(lower..=upper)
        });
        range.into_iter().flatten()
    }

    /// Stored strict descendants in sort order.
    ///
    /// `max_depth` limits how far below `cidr` to go: `1` is direct
    /// children only, `0` returns nothing and any negative value is
    /// unlimited. Works whether or not `cidr` itself is stored.
    pub fn descendants(&self, cidr: &Cidr, max_depth: i32) -> Vec<(Cidr, Node)> {
        if max_depth == 0 {
            return Vec::new();
        }
        let base = self.depth_of(cidr) + u32::from(self.entries.contains_key(cidr));
        self.subtree(cidr)
            .filter(|(_, n)| max_depth < 0 || n.indent < base + max_depth as u32)
            .map(|(c, n)| (*c, *n))
            .collect()
    }

    /// Any stored descendant at all.
    pub fn has_descendants(&self, cidr: &Cidr) -> bool {
        self.subtree(cidr).next().is_some()
    }

    /// True if any stored prefix equals, contains or is contained by `cidr`.
    pub fn overlaps(&self, cidr: &Cidr) -> bool {
        self.entries.contains_key(cidr) || self.parent(cidr).is_some() || self.has_descendants(cidr)
    }

    /// Insert a prefix. Returns the new indent, or `None` if the prefix is
    /// already present (the index is left untouched).
    pub fn insert(&mut self, cidr: Cidr, id: i64) -> Option<u32> {
        if self.entries.contains_key(&cidr) {
            return None;
        }
        let indent = self.parent(&cidr).map(|(_, n)| n.indent + 1).unwrap_or(0);
        let below: Vec<Cidr> = self.subtree(&cidr).map(|(c, _)| *c).collect();
        for c in below {
            if let Some(node) = self.entries.get_mut(&c) {
                node.indent += 1;
            }
        }
        self.entries.insert(cidr, Node { id, indent });
        Some(indent)
    }

    /// Remove a prefix, lifting everything below it one level.
    pub fn remove(&mut self, cidr: &Cidr) -> Option<Node> {
        let node = self.entries.remove(cidr)?;
        let below: Vec<Cidr> = self.subtree(cidr).map(|(c, _)| *c).collect();
        for c in below {
            if let Some(n) = self.entries.get_mut(&c) {
                n.indent = n.indent.saturating_sub(1);
            }
        }
        Some(node)
    }

    /// Up to `limit` free blocks of length `len` inside `covering`, in
    /// address order.
    ///
    /// A block is free when no stored prefix overlaps it, except stored
    /// prefixes that also cover `covering` itself. Blocks holding the first
    /// or last address of `edges` are never returned, which keeps the
    /// network and broadcast of an IPv4 assignment free.
    pub fn free_blocks(
        &self,
        covering: &Cidr,
        len: u8,
        limit: usize,
        edges: Option<&Cidr>,
    ) -> Vec<Cidr> {
        let mut out = Vec::new();
        let family = covering.family();
        if limit == 0 || len < covering.len() || len > family.width() {
            return out;
        }

        let end = covering.last();
        let mut cur = covering.network();
        loop {
            let block = Cidr::from_parts(family, cur, len);
            let mut next = block.last();

            match self.blocker(covering, &block) {
                Some(Blocker::Around(x)) => next = x.last(),
                Some(Blocker::Inside) => {}
                None => {
                    let edge = edges.is_some_and(|e| {
                        block.network() == e.network() || block.last() == e.last()
                    });
                    if !edge {
                        out.push(block);
                        if out.len() >= limit {
                            break;
                        }
                    }
                }
            }

            if next >= end {
                break;
            }
            cur = next + 1;
        }
        out
    }

    fn blocker(&self, covering: &Cidr, block: &Cidr) -> Option<Blocker> {
        // Shallowest first so the scan can jump over the widest occupied range.
        for l in (covering.len() + 1)..=block.len() {
            let key = block.truncate(l);
            if self.entries.contains_key(&key) {
                return Some(Blocker::Around(key));
            }
        }
        if block.len() == covering.len() && self.entries.contains_key(block) {
            return Some(Blocker::Inside);
        }
        if self.has_descendants(block) {
            return Some(Blocker::Inside);
        }
        None
    }

    /// Check that every indent equals its parent's plus one.
    #[cfg(test)]
    pub fn check_indents(&self) -> bool {
        self.entries.iter().all(|(c, n)| {
            let expected = self.parent(c).map(|(_, p)| p.indent + 1).unwrap_or(0);
            n.indent == expected
        })
    }
}

enum Blocker {
    /// A stored prefix strictly inside the covering block contains the
    /// candidate.
    Around(Cidr),
    /// Something stored sits inside the candidate.
    Inside,
}
