//! Placement: choosing pools for new replicas and summing capacity.
//!
//! Selection is comparator-driven over a composite key and a stable sort,
//! so identical inputs always produce identical sequences.

use crate::core::pool::{PoolInfo, PoolState};

/// A pool under consideration, with the number of replicas it already hosts.
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    pub pool: PoolInfo,
    pub replicas: usize,
}

/// Choose pools able to host a replica of `required_bytes`.
///
/// Filters to accessible pools with enough free space, restricted to
/// `must_nodes` when non-empty; ranks by (online first, fewer replicas
/// first, more free bytes first, `should_nodes` membership last); then takes
/// at most one pool per node, in rank order.
pub fn select_pools(
    mut candidates: Vec<PoolCandidate>,
    required_bytes: u64,
    must_nodes: &[String],
    should_nodes: &[String],
) -> Vec<PoolInfo> {
    candidates.retain(|c| {
        c.pool.accessible()
            && c.pool.free_bytes() >= required_bytes
            && (must_nodes.is_empty() || must_nodes.contains(&c.pool.node))
    });

    // Pin the input order before ranking so the outcome does not depend on
    // map iteration order upstream.
    candidates.sort_by(|a, b| {
        a.pool
            .node
            .cmp(&b.pool.node)
            .then_with(|| a.pool.name.cmp(&b.pool.name))
    });

    candidates.sort_by(|a, b| {
        let a_online = a.pool.state == PoolState::Online;
        let b_online = b.pool.state == PoolState::Online;
        let a_preferred = should_nodes.contains(&a.pool.node);
        let b_preferred = should_nodes.contains(&b.pool.node);
        b_online
            .cmp(&a_online)
            .then_with(|| a.replicas.cmp(&b.replicas))
            .then_with(|| b.pool.free_bytes().cmp(&a.pool.free_bytes()))
            .then_with(|| b_preferred.cmp(&a_preferred))
    });

    let mut used_nodes = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| used_nodes.insert(c.pool.node.clone()))
        .map(|c| c.pool)
        .collect()
}

/// Free bytes over accessible pools, optionally scoped to one node.
pub fn free_capacity(pools: &[PoolInfo], node: Option<&str>) -> u64 {
    pools
        .iter()
        .filter(|p| p.accessible())
        .filter(|p| node.map_or(true, |n| p.node == n))
        .map(|p| p.free_bytes())
        .sum()
}
