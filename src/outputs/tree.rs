use std::{io::Write, path::Path};

use color_eyre::Result;
use tracing::instrument;

use super::{percent, Style};
use crate::{
    consts::ROOT,
    tree::{parent_of, PathTree},
};

const LABEL_WIDTH: usize = 80;
const RULE_WIDTH: usize = 110;

#[derive(Debug, Clone, Copy)]
pub struct TreeOptions<'a> {
    /// Source root. Nodes that exist below it are highlighted, the others (generated code,
    /// symbols) are shown as warnings.
    pub base: Option<&'a Path>,
    /// Maximum number of path segments to show.
    pub depth: Option<usize>,
    pub style: Style,
}

/// Writes `colored` followed by enough spaces to fill `width` visible columns. Escape codes in
/// `colored` do not take up any room, so padding is computed from `visible_len`.
fn write_padded(
    mut outfile: impl Write,
    colored: &str,
    visible_len: usize,
    width: usize,
) -> Result<()> {
    write!(
        outfile,
        "{colored}{:pad$}",
        "",
        pad = width.saturating_sub(visible_len)
    )?;
    Ok(())
}

/// Lists every node of `tree` except the root, indented by depth, with its share of `total`.
///
/// Nodes are named by their last segment below their parent line. A node whose parent is not in
/// the tree, as in a pruned tree, is named by its full path instead.
#[instrument(skip_all, fields(nodes = tree.len(), total = total))]
pub fn write_tree(
    mut outfile: impl Write,
    tree: &PathTree,
    total: u64,
    opts: &TreeOptions,
) -> Result<()> {
    let style = opts.style;

    writeln!(
        outfile,
        "{}{:<LABEL_WIDTH$} {:>20} {:>9}{}",
        style.header, "Path", "Size", "%", style.reset
    )?;
    writeln!(outfile, "{}", "=".repeat(RULE_WIDTH))?;

    for (path, size) in tree.iter() {
        if path == ROOT {
            continue;
        }
        let segments: Vec<&str> = path.split('/').collect();
        if opts.depth.is_some_and(|depth| segments.len() > depth) {
            continue;
        }

        if let [_, .., name] = segments.as_slice() {
            let exists = opts.base.is_some_and(|base| base.join(path).exists());
            let marker_style = if exists {
                style.highlight
            } else {
                style.warning
            };
            // Pruned trees are flat, so the parent line may not be there to name the context
            let label = if parent_of(path).is_some_and(|parent| tree.get(parent).is_some()) {
                *name
            } else {
                path
            };
            let indent = "  ".repeat(segments.len() - 1);
            let colored = format!("{indent}{marker_style}-- {}{label}", style.reset);
            let visible_len = indent.len() + 3 + label.chars().count();
            write_padded(&mut outfile, &colored, visible_len, LABEL_WIDTH)?;
        } else {
            let colored = format!("{}{path}{}", style.highlight, style.reset);
            write_padded(&mut outfile, &colored, path.chars().count(), LABEL_WIDTH)?;
        }

        writeln!(outfile, " {size:>20} {:>8.2}%", percent(size, total))?;
    }

    writeln!(outfile, "{}", "=".repeat(RULE_WIDTH))?;
    writeln!(outfile, "{:<LABEL_WIDTH$} {total:>20}", "Total")?;

    Ok(())
}
