//! Classification of symbols into user-defined features.
//!
//! A feature is a set of path substrings (`folders`) minus another set (`excludes`), and may have
//! child features. Features are allowed to overlap: a symbol is counted towards every feature it
//! matches, in every tree of the forest, so feature sizes do not have to add up to the total.

use std::{borrow::Cow, path::Path, sync::OnceLock};

use color_eyre::{
    eyre::{bail, Context as _},
    Result,
};
use hifijson::{token::Lex as _, value::Value};
use regex::Regex;
use tracing::{debug, instrument};

use crate::{consts::UNCLASSIFIED_PREFIX, tree::PathTree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSpec {
    /// Pre-order position in the forest, used to index a [`FeatureTally`].
    pub id: usize,
    pub name: String,
    pub folders: Vec<String>,
    pub excludes: Vec<String>,
    pub children: Vec<FeatureSpec>,
}

impl FeatureSpec {
    /// Whether `path` belongs to this feature itself, regardless of its children.
    pub fn matches(&self, path: &str) -> bool {
        self.folders.iter().any(|f| path.contains(f.as_str()))
            && !self.excludes.iter().any(|e| path.contains(e.as_str()))
    }

    fn collect_matches(&self, path: &str, out: &mut Vec<usize>) {
        if self.matches(path) {
            out.push(self.id);
        }
        // Children are checked even if the parent did not match
        for child in &self.children {
            child.collect_matches(path, out);
        }
    }

    fn number(&mut self, next_id: &mut usize) {
        self.id = *next_id;
        *next_id += 1;
        for child in &mut self.children {
            child.number(next_id);
        }
    }

    /// This feature and all of its descendants, each with its nesting depth.
    pub fn walk(&self) -> Vec<(usize, &FeatureSpec)> {
        fn go<'a>(feature: &'a FeatureSpec, depth: usize, out: &mut Vec<(usize, &'a FeatureSpec)>) {
            out.push((depth, feature));
            for child in &feature.children {
                go(child, depth + 1, out);
            }
        }

        let mut out = Vec::new();
        go(self, 0, &mut out);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureForest {
    roots: Vec<FeatureSpec>,
    len: usize,
}

impl FeatureForest {
    pub fn new(mut roots: Vec<FeatureSpec>) -> Self {
        let mut len = 0;
        for root in &mut roots {
            root.number(&mut len);
        }
        Self { roots, len }
    }

    pub fn roots(&self) -> &[FeatureSpec] {
        &self.roots
    }

    /// Total number of features, nested ones included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of all features `path` belongs to.
    pub fn matching(&self, path: &str) -> Vec<usize> {
        let mut out = Vec::new();
        for root in &self.roots {
            root.collect_matches(path, &mut out);
        }
        out
    }

    /// Adds `size` to every feature `path` belongs to, and returns how many that were.
    pub fn classify(&self, path: &str, size: u64, tally: &mut FeatureTally) -> usize {
        let matched = self.matching(path);
        for &id in &matched {
            tally.add(id, size);
        }
        matched.len()
    }

    /// Classifies every symbol of a tree. Directory and file nodes are skipped, they only repeat
    /// the sizes of the symbols below them.
    #[instrument(skip_all)]
    pub fn classify_tree(&self, tree: &PathTree) -> Classification {
        let mut tally = FeatureTally::new(self);
        let mut uncategorized = Vec::new();

        for (path, size) in tree.iter() {
            if !is_symbol_path(path) {
                continue;
            }
            if self.classify(path, size, &mut tally) == 0 {
                uncategorized.push((path.to_owned(), size));
            }
        }

        debug!(uncategorized = uncategorized.len(), "Classified symbols");
        Classification {
            tally,
            uncategorized,
        }
    }
}

impl Extend<FeatureForest> for FeatureForest {
    fn extend<T: IntoIterator<Item = FeatureForest>>(&mut self, iter: T) {
        let mut roots = std::mem::take(&mut self.roots);
        for forest in iter {
            roots.extend(forest.roots);
        }
        *self = Self::new(roots);
    }
}

impl FromIterator<FeatureForest> for FeatureForest {
    fn from_iter<T: IntoIterator<Item = FeatureForest>>(iter: T) -> Self {
        let mut ret = Self::default();
        ret.extend(iter);
        ret
    }
}

/// Accumulated size per feature id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureTally {
    sizes: Vec<u64>,
}

impl FeatureTally {
    pub fn new(forest: &FeatureForest) -> Self {
        Self {
            sizes: vec![0; forest.len()],
        }
    }

    pub fn add(&mut self, id: usize, size: u64) {
        if id >= self.sizes.len() {
            self.sizes.resize(id + 1, 0);
        }
        self.sizes[id] += size;
    }

    pub fn get(&self, id: usize) -> u64 {
        self.sizes.get(id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub tally: FeatureTally,
    /// Symbols that no feature claimed, in path order.
    pub uncategorized: Vec<(String, u64)>,
}

/// Whether a tree node is a symbol rather than a directory or a file: either it sits below a
/// segment with a file extension (`dir/file.c/symbol`), or it has no known source at all.
pub fn is_symbol_path(path: &str) -> bool {
    static NAMED_SYMBOL: OnceLock<Regex> = OnceLock::new();
    let named_symbol = NAMED_SYMBOL.get_or_init(|| Regex::new(r"\.[a-zA-Z]+/").expect("regex"));

    named_symbol.is_match(path)
        || path
            .strip_prefix(UNCLASSIFIED_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn string_array(key: &str, value: Value<&str, Cow<str>>) -> Result<Vec<String>> {
    let Value::Array(arr) = value else {
        bail!("Expected array for key {key}");
    };

    arr.into_iter()
        .map(|v| {
            let Value::String(s) = v else {
                bail!("Expected string value in {key}, got {v}");
            };
            Ok(s.into_owned())
        })
        .collect()
}

fn parse_feature(value: Value<&str, Cow<str>>) -> Result<FeatureSpec> {
    let Value::Object(o) = value else {
        bail!("Expected feature object, got {value}");
    };

    let mut name: Option<String> = None;
    let mut folders: Option<Vec<String>> = None;
    let mut excludes: Vec<String> = Vec::new();
    let mut children: Vec<FeatureSpec> = Vec::new();

    for (k, v) in o {
        match k.as_ref() {
            "name" => {
                let Value::String(s) = v else {
                    bail!("Expected string for key name, got {v}");
                };
                name = Some(s.into_owned());
            }
            "folders" => folders = Some(string_array(&k, v)?),
            "excludes" => excludes = string_array(&k, v)?,
            "children" => {
                let Value::Array(arr) = v else {
                    bail!("Expected array for key children");
                };
                children = arr
                    .into_iter()
                    .map(parse_feature)
                    .collect::<Result<_>>()
                    .wrap_err("Failed to parse child feature")?;
            }
            _ => bail!("Unknown key {k}"),
        }
    }

    let Some(folders) = folders else {
        bail!("Missing folders field");
    };
    let name = match (name, folders.first()) {
        (Some(name), _) => name,
        (None, Some(folder)) => folder.clone(),
        (None, None) => bail!("Feature without folders needs a name"),
    };

    Ok(FeatureSpec {
        id: 0,
        name,
        folders,
        excludes,
        children,
    })
}

/// Parses a JSON array of feature definitions.
pub fn parse_features(content: &[u8]) -> Result<FeatureForest> {
    let mut lexer = hifijson::SliceLexer::new(content);

    let value = lexer
        .exactly_one(hifijson::value::parse_unbounded)
        .wrap_err("Failed to parse JSON")?;

    let Value::Array(arr) = value else {
        bail!("Expected array of features at top level");
    };

    let roots = arr
        .into_iter()
        .enumerate()
        .map(|(i, v)| parse_feature(v).wrap_err_with(|| format!("Invalid feature #{i}")))
        .collect::<Result<Vec<_>>>()?;

    Ok(FeatureForest::new(roots))
}

#[instrument]
pub fn load_features(path: &Path) -> Result<FeatureForest> {
    let content = std::fs::read(path).wrap_err("Failed to read file")?;
    let forest = parse_features(&content)?;
    debug!(features = forest.len(), "Loaded feature definitions");
    Ok(forest)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn feature(name: &str, folders: &[&str], excludes: &[&str]) -> FeatureSpec {
        FeatureSpec {
            id: 0,
            name: name.to_owned(),
            folders: folders.iter().map(|s| s.to_string()).collect(),
            excludes: excludes.iter().map(|s| s.to_string()).collect(),
            children: Vec::new(),
        }
    }

    fn sample_tree() -> PathTree {
        let mut tree = PathTree::new();
        tree.insert("a/b/x.c/sym1", 100);
        tree.insert("a/b/y.c/sym2", 50);
        tree.insert("a/c/z.c/sym3", 10);
        tree
    }

    #[test]
    fn include_and_exclude() {
        let f = feature("b", &["a/b"], &["x.c"]);
        assert!(f.matches("a/b/y.c/sym2"));
        assert!(!f.matches("a/b/x.c/sym1"));
        assert!(!f.matches("a/c/z.c/sym3"));
    }

    #[test]
    fn several_matching_folders_count_once() {
        let forest = FeatureForest::new(vec![feature("b", &["a/", "a/b", "x.c"], &[])]);
        let mut tally = FeatureTally::new(&forest);
        assert_eq!(forest.classify("a/b/x.c/sym1", 100, &mut tally), 1);
        assert_eq!(tally.get(0), 100);
    }

    #[test]
    fn children_are_checked_independently() {
        let mut parent = feature("kernel", &["kernel/"], &["kernel/sched.c"]);
        parent.children = vec![
            feature("sched", &["sched.c"], &[]),
            feature("timers", &["timeout.c", "timer.c"], &[]),
        ];
        let forest = FeatureForest::new(vec![parent, feature("all", &["/"], &[])]);
        assert_eq!(forest.len(), 4);

        let ids: Vec<_> = forest.roots()[0].walk().iter().map(|(d, f)| (*d, f.id)).collect();
        assert_eq!(ids, [(0, 0), (1, 1), (1, 2)]);

        // Excluded from the parent but claimed by a child and by the second tree
        assert_eq!(forest.matching("kernel/sched.c/z_swap"), [1, 3]);
        assert_eq!(forest.matching("kernel/timeout.c/z_add"), [0, 2, 3]);
        assert_eq!(forest.matching("nothing"), Vec::<usize>::new());
    }

    #[test]
    fn disjoint_features_sum_to_matched_total() {
        let forest = FeatureForest::new(vec![
            feature("x", &["x.c"], &[]),
            feature("z", &["z.c"], &[]),
        ]);
        let result = forest.classify_tree(&sample_tree());

        assert_eq!(result.tally.get(0), 100);
        assert_eq!(result.tally.get(1), 10);
        assert_eq!(result.uncategorized, [("a/b/y.c/sym2".to_owned(), 50)]);
    }

    #[test]
    fn overlapping_features_may_exceed_total() {
        let forest = FeatureForest::new(vec![
            feature("a", &["a/"], &[]),
            feature("b", &["a/b"], &["x.c"]),
        ]);
        let result = forest.classify_tree(&sample_tree());

        assert_eq!(result.tally.get(0), 160);
        assert_eq!(result.tally.get(1), 50);
        assert!(result.tally.get(0) + result.tally.get(1) > sample_tree().total());
        assert!(result.uncategorized.is_empty());
    }

    #[test]
    fn uncategorized_lists_symbols_only() {
        let forest = FeatureForest::new(vec![feature("b", &["a/b"], &[])]);
        let mut tree = sample_tree();
        tree.insert(":/mystery", 4);

        let result = forest.classify_tree(&tree);
        let paths: Vec<_> = result.uncategorized.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, [":/mystery", "a/c/z.c/sym3"]);
    }

    #[test]
    fn symbol_paths() {
        assert!(is_symbol_path("a/c/z.c/sym3"));
        assert!(is_symbol_path(":/sym"));
        assert!(!is_symbol_path("a/c"));
        assert!(!is_symbol_path("a/c/z.c"));
        assert!(!is_symbol_path(":"));
        assert!(!is_symbol_path("root"));
    }

    const FEATURES_JSON: &str = r#"[
        {
            "name": "Kernel",
            "folders": ["kernel/"],
            "excludes": ["kernel/userspace.c"],
            "children": [
                {"folders": ["sched.c"]}
            ]
        },
        {"name": "Drivers", "folders": ["drivers/"]}
    ]"#;

    #[test]
    fn parse_json() {
        let forest = parse_features(FEATURES_JSON.as_bytes()).unwrap();
        assert_eq!(forest.len(), 3);

        let kernel = &forest.roots()[0];
        assert_eq!(kernel.name, "Kernel");
        assert_eq!(kernel.excludes, ["kernel/userspace.c"]);
        assert_eq!(kernel.children[0].name, "sched.c");
        assert_eq!(kernel.children[0].id, 1);
        assert_eq!(forest.roots()[1].id, 2);
    }

    #[test]
    fn parse_json_errors() {
        let err = parse_features(br#"{"folders": []}"#).unwrap_err();
        assert!(format!("{err}").contains("Expected array"));

        let err = parse_features(br#"[{"name": "x"}]"#).unwrap_err();
        assert!(format!("{err:?}").contains("Missing folders"));

        let err = parse_features(br#"[{"folders": ["a"], "color": "red"}]"#).unwrap_err();
        assert!(format!("{err:?}").contains("Unknown key color"));

        let err = parse_features(br#"[{"folders": "a"}]"#).unwrap_err();
        assert!(format!("{err:?}").contains("Expected array for key folders"));

        assert!(parse_features(b"[").is_err());
    }

    #[test]
    fn forests_from_several_files_are_renumbered() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        first.write_all(FEATURES_JSON.as_bytes()).unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        second
            .write_all(br#"[{"name": "Net", "folders": ["subsys/net/"]}]"#)
            .unwrap();

        let forest: FeatureForest = [first.path(), second.path()]
            .into_iter()
            .map(|p| load_features(p).unwrap())
            .collect();

        assert_eq!(forest.len(), 4);
        assert_eq!(forest.roots()[2].name, "Net");
        assert_eq!(forest.roots()[2].id, 3);
        assert_eq!(forest.matching("subsys/net/ip.c/f"), [3]);
    }
}
