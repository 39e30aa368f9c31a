use std::{collections::BTreeMap, ops::Bound};

use tracing::{debug, instrument, trace};

use crate::{consts::ROOT, symbols::SymbolRecord};

/// Cumulative sizes keyed by `/`-separated path prefixes.
///
/// Every inserted size is added to the root and to each prefix of its path, so a node always
/// holds the total of everything below it. Keys are kept sorted, which is also the report order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTree {
    nodes: BTreeMap<String, u64>,
}

/// Parent of a node: the path without its last segment, [`ROOT`] for top-level nodes, and nothing
/// for the root itself. Empty segments never form a node of their own.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    let parent = match path.rsplit_once('/') {
        Some((parent, _)) => parent.trim_end_matches('/'),
        None => ROOT,
    };
    Some(if parent.is_empty() { ROOT } else { parent })
}

impl PathTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_owned(), 0);
        Self { nodes }
    }

    /// Builds the tree of all records living in a section accepted by `in_section`.
    #[instrument(skip_all)]
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a SymbolRecord>,
        mut in_section: impl FnMut(&str) -> bool,
    ) -> Self {
        let mut tree = Self::new();
        for record in records {
            if record.size != 0 && in_section(&record.section) {
                trace!(symbol = %record.name, path = %record.source_path, size = record.size);
                tree.insert(&record.source_path, record.size);
            }
        }
        debug!(nodes = tree.len(), total = tree.total(), "Built path tree");
        tree
    }

    pub fn insert(&mut self, path: &str, size: u64) {
        *self.nodes.entry(ROOT.to_owned()).or_insert(0) += size;

        let mut end = 0;
        for segment in path.split('/') {
            end += segment.len();
            if !segment.is_empty() {
                *self.nodes.entry(path[..end].to_owned()).or_insert(0) += size;
            }
            // Separator
            end += 1;
        }
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        self.nodes.get(path).copied()
    }

    /// Sum of everything inserted.
    pub fn total(&self) -> u64 {
        self.get(ROOT).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.nodes.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Nodes whose parent is `node`. They all share the `node/` key prefix, so only that range of
    /// the map is looked at.
    pub fn children_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = (&'a str, u64)> + 'a {
        let prefix = if node == ROOT {
            String::new()
        } else {
            format!("{node}/")
        };
        self.nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .map(|(k, v)| (k.as_str(), *v))
            .take_while(move |(path, _)| path.starts_with(&prefix))
            .filter(move |(path, _)| parent_of(path) == Some(node))
    }

    /// Nodes sharing a parent with `node`, `node` included if it is in the tree.
    pub fn siblings_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = (&'a str, u64)> + 'a {
        parent_of(node)
            .into_iter()
            .flat_map(move |parent| self.children_of(parent))
    }

    /// Largest size among the siblings of `node`, or `None` if there are none to compare with.
    pub fn max_sibling_size(&self, node: &str) -> Option<u64> {
        self.siblings_of(node).map(|(_, size)| size).max()
    }
}

impl FromIterator<(String, u64)> for PathTree {
    /// Collects an already flattened map, no prefix accumulation is done.
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PathTree {
        let mut tree = PathTree::new();
        tree.insert("a/b/x.c/sym1", 100);
        tree.insert("a/b/y.c/sym2", 50);
        tree.insert("a/c/z.c/sym3", 10);
        tree
    }

    #[test]
    fn prefixes_accumulate() {
        let tree = sample();
        let expected = [
            ("a", 160),
            ("a/b", 150),
            ("a/b/x.c", 100),
            ("a/b/x.c/sym1", 100),
            ("a/b/y.c", 50),
            ("a/b/y.c/sym2", 50),
            ("a/c", 10),
            ("a/c/z.c", 10),
            ("a/c/z.c/sym3", 10),
            ("root", 160),
        ];
        let nodes: Vec<_> = tree.iter().collect();
        assert_eq!(nodes, expected);
        assert_eq!(tree.total(), 160);
    }

    #[test]
    fn nodes_equal_sum_of_children() {
        let mut tree = sample();
        tree.insert(":/orphan", 7);
        tree.insert("a/b/x.c/sym4", 3);

        for (node, size) in tree.iter() {
            let children: Vec<_> = tree.children_of(node).collect();
            if !children.is_empty() {
                assert_eq!(size, children.iter().map(|(_, s)| s).sum::<u64>(), "{node}");
            }
        }
        assert_eq!(tree.total(), 170);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let mut tree = PathTree::new();
        tree.insert("/abs/file.c", 4);
        assert_eq!(tree.get("/abs"), Some(4));
        assert_eq!(tree.get("/abs/file.c"), Some(4));
        assert_eq!(tree.get(""), None);
        assert_eq!(tree.total(), 4);
    }

    #[test]
    fn parents() {
        assert_eq!(parent_of("root"), None);
        assert_eq!(parent_of("a"), Some("root"));
        assert_eq!(parent_of("a/b/x.c"), Some("a/b"));
        assert_eq!(parent_of(":/sym"), Some(":"));
        assert_eq!(parent_of("/abs"), Some("root"));
        assert_eq!(parent_of("a//b"), Some("a"));
    }

    #[test]
    fn relatives() {
        let tree = sample();
        let children: Vec<_> = tree.children_of("a/b").collect();
        assert_eq!(children, [("a/b/x.c", 100), ("a/b/y.c", 50)]);

        let siblings: Vec<_> = tree.siblings_of("a/c").map(|(p, _)| p).collect();
        assert_eq!(siblings, ["a/b", "a/c"]);

        assert_eq!(tree.max_sibling_size("a/b/y.c"), Some(100));
        assert_eq!(tree.max_sibling_size("a"), Some(160));
        assert_eq!(tree.children_of("a/b/x.c/sym1").count(), 0);
        let top: Vec<_> = tree.children_of("root").collect();
        assert_eq!(top, [("a", 160)]);
    }

    #[test]
    fn max_sibling_of_lonely_nodes() {
        let tree = sample();
        assert_eq!(tree.max_sibling_size("root"), None);
        assert_eq!(tree.max_sibling_size("q/r"), None);
    }

    #[test]
    fn records_filtered_by_section() {
        let record = |name: &str, section: &str, size| SymbolRecord {
            name: name.to_owned(),
            size,
            section: section.to_owned(),
            source_path: format!("kernel/sched.c/{name}"),
        };
        let records = [
            record("a", ".text", 10),
            record("b", ".bss", 20),
            record("c", ".text", 5),
        ];

        let tree = PathTree::from_records(&records, |s| s == ".text");
        assert_eq!(tree.total(), 15);
        assert_eq!(tree.get("kernel/sched.c"), Some(15));
        assert_eq!(tree.get("kernel/sched.c/b"), None);
    }
}
