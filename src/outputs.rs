use std::io::Write;

use color_eyre::Result;

use crate::{
    features::{FeatureForest, FeatureTally},
    sections::Footprint,
};

mod tree;

pub use tree::{write_tree, TreeOptions};

/// Terminal escapes used by the writers. Passed around as a value so that nothing but `main`
/// decides whether output is colored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub header: &'static str,
    pub highlight: &'static str,
    pub warning: &'static str,
    pub reset: &'static str,
}

impl Style {
    pub const fn ansi() -> Self {
        Self {
            header: "\x1b[91m",
            highlight: "\x1b[94m",
            warning: "\x1b[93m",
            reset: "\x1b[0m",
        }
    }

    pub const fn plain() -> Self {
        Self {
            header: "",
            highlight: "",
            warning: "",
            reset: "",
        }
    }
}

pub(crate) fn percent(size: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * size as f64 / total as f64
    }
}

fn write_usage_line(
    mut outfile: impl Write,
    label: &str,
    used: u64,
    in_sections: u64,
    capacity: Option<u64>,
    used_percent: f64,
) -> Result<()> {
    write!(outfile, "{label:<6} {used:>10} bytes")?;
    if let Some(capacity) = capacity {
        write!(outfile, " {used_percent:>7.2}% of {capacity} bytes")?;
    }
    writeln!(outfile, " ({in_sections} bytes in sections)")?;
    Ok(())
}

/// Usage summary. The used figures are what the device sees; the section sums are printed next
/// to them since the two may diverge.
pub fn write_footprint(mut outfile: impl Write, footprint: &Footprint) -> Result<()> {
    write_usage_line(
        &mut outfile,
        "Flash:",
        footprint.flash_used,
        footprint.flash_sections,
        footprint.flash_capacity,
        footprint.flash_percent(),
    )?;
    write_usage_line(
        &mut outfile,
        "RAM:",
        footprint.ram_used,
        footprint.ram_sections,
        footprint.ram_capacity,
        footprint.ram_percent(),
    )?;
    Ok(())
}

/// One line per feature, children indented below their parent. Percentages are relative to
/// `total`; features may overlap so they need not add up to 100.
pub fn write_features(
    mut outfile: impl Write,
    forest: &FeatureForest,
    tally: &FeatureTally,
    total: u64,
    style: Style,
) -> Result<()> {
    writeln!(
        outfile,
        "{}{:<60} {:>10} {:>9}{}",
        style.header, "Feature", "Size", "%", style.reset
    )?;
    writeln!(outfile, "{}", "=".repeat(82))?;
    for root in forest.roots() {
        for (depth, feature) in root.walk() {
            let label = format!("{}{}", "  ".repeat(depth), feature.name);
            let size = tally.get(feature.id);
            writeln!(
                outfile,
                "{label:<60} {size:>10} {:>8.2}%",
                percent(size, total)
            )?;
        }
    }
    Ok(())
}

pub fn write_uncategorized(mut outfile: impl Write, uncategorized: &[(String, u64)]) -> Result<()> {
    for (path, size) in uncategorized {
        writeln!(outfile, "UNCATEGORIZED: {path} {size}")?;
    }
    Ok(())
}
