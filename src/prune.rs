use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, instrument};

use crate::{
    consts::{OTHER, PARENT_DIVISOR, ROOT, SIBLING_DIVISOR},
    tree::{parent_of, PathTree},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Children of nodes smaller than this are not shown.
    pub min_parent_size: u64,
    /// Sibling groups whose largest member is smaller than this are not shown, and shown nodes
    /// smaller than this are folded into `(other)`.
    pub min_sibling_size: u64,
}

impl Thresholds {
    /// Thresholds relative to the total size, so the summary looks the same for a tiny test image
    /// and for a full application.
    pub fn from_total(total: u64) -> Self {
        Self {
            min_parent_size: total / PARENT_DIVISOR,
            min_sibling_size: total / SIBLING_DIVISOR,
        }
    }
}

/// Name of the bucket that collects the small children of `parent`.
fn other_bucket(parent: &str) -> String {
    format!("{parent}/{OTHER}")
}

/// Reduces a path tree to the nodes that matter for the total.
///
/// The result is flat: it only contains leaves, each of which is either a real node large enough
/// to be shown on its own, or an `(other)` bucket summing the small leaves of one parent. Nodes
/// whose parent is not part of the input are taken as they are, so pruning an already pruned map
/// changes nothing.
#[instrument(skip(tree))]
pub fn prune(tree: &PathTree, thresholds: Thresholds) -> PathTree {
    // Siblings share their maximum, so it is looked up once per parent
    let mut max_sibling: HashMap<&str, Option<u64>> = HashMap::new();
    let mut significant: BTreeMap<&str, u64> = BTreeMap::new();

    for (node, size) in tree.iter() {
        let Some(parent) = parent_of(node) else {
            // Root
            continue;
        };
        if let Some(parent_size) = tree.get(parent) {
            if parent_size < thresholds.min_parent_size {
                continue;
            }
            let max = *max_sibling
                .entry(parent)
                .or_insert_with(|| tree.max_sibling_size(node));
            if max.is_some_and(|max| max < thresholds.min_sibling_size) {
                continue;
            }
        }
        significant.insert(node, size);
    }

    let parents: HashSet<&str> = significant.keys().filter_map(|&n| parent_of(n)).collect();

    let mut pruned: BTreeMap<String, u64> = BTreeMap::new();
    for (node, size) in significant {
        if parents.contains(node) {
            continue;
        }
        let key = if size < thresholds.min_sibling_size {
            other_bucket(parent_of(node).unwrap_or(ROOT))
        } else {
            node.to_owned()
        };
        *pruned.entry(key).or_insert(0) += size;
    }

    debug!(before = tree.len(), after = pruned.len(), "Pruned path tree");
    pruned.into_iter().collect()
}
