use std::{
    io::{self, BufWriter, IsTerminal as _, Write},
    path::{Path, PathBuf},
};

use clap::{Parser, ValueEnum};
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use fallible_iterator::{FallibleIterator, IteratorExt};
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter,
};

use crate::{
    features::{load_features, FeatureForest},
    outputs::{write_features, write_footprint, write_tree, write_uncategorized, Style, TreeOptions},
    prune::{prune, Thresholds},
    sections::{ram_used_from_stat, Footprint, SectionTable},
    symbols::{extract_symbols, PathMap},
    tree::PathTree,
};

mod consts;
mod features;
mod outputs;
mod prune;
mod sections;
mod symbols;
mod tools;
mod tree;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum SectionSource {
    /// Parse `objdump -h` output
    #[default]
    Objdump,
    /// Read the section headers from the ELF file directly
    Elf,
}

#[derive(Parser)]
#[command(about = "Report flash and RAM usage of a firmware image, broken down by source path")]
struct Args {
    /// Print extra debugging information
    #[arg(short, long)]
    verbose: bool,

    /// Build output directory containing the kernel ELF, binary and stat files
    #[arg(short, long)]
    outdir: PathBuf,
    /// Kernel file name without extension
    #[arg(short, long, default_value = "zephyr")]
    kernel_name: String,
    /// Source tree root. Stripped from symbol paths, and used to tell real source files from
    /// generated ones
    #[arg(short, long, env = "ZEPHYR_BASE")]
    zephyr_base: Option<PathBuf>,

    /// Print the flash usage tree
    #[arg(short = 'F', long)]
    rom: bool,
    /// Print the RAM usage tree
    #[arg(short, long)]
    ram: bool,
    /// Only print nodes up to this many path segments deep
    #[arg(short, long)]
    depth: Option<usize>,
    /// Print every node instead of a summary of the largest contributors
    #[arg(long)]
    full: bool,

    /// JSON file with feature definitions to classify symbols into. Can be specified multiple
    /// times: -f file1 -f file2 ...
    #[arg(short, long)]
    features: Vec<PathBuf>,
    /// Also list the symbols that did not match any feature
    #[arg(long, requires = "features")]
    uncategorized: bool,

    /// Flash size of the device in KiB
    #[arg(long)]
    flash_size: Option<u64>,
    /// RAM size of the device in KiB
    #[arg(long)]
    ram_size: Option<u64>,

    /// nm binary of the toolchain that built the kernel
    #[arg(short, long, env = "NM", default_value = "nm")]
    nm: PathBuf,
    /// objdump binary of the toolchain that built the kernel
    #[arg(short = 's', long, env = "OBJDUMP", default_value = "objdump")]
    objdump: PathBuf,
    /// Where to get the section headers from
    #[arg(long, value_enum, default_value_t)]
    sections: SectionSource,

    /// Do not color the output
    #[arg(long)]
    no_color: bool,
}

/// Build artifacts for one kernel.
#[derive(Debug)]
struct Artifacts {
    elf: PathBuf,
    bin: PathBuf,
    stat: PathBuf,
}

impl Artifacts {
    fn new(outdir: &Path, kernel_name: &str) -> Self {
        Self {
            elf: outdir.join(format!("{kernel_name}.elf")),
            bin: outdir.join(format!("{kernel_name}.bin")),
            stat: outdir.join(format!("{kernel_name}.stat")),
        }
    }

    /// The first required artifact that is not there.
    fn missing(&self) -> Option<&Path> {
        [&self.elf, &self.bin]
            .into_iter()
            .find(|p| !p.exists())
            .map(PathBuf::as_path)
    }
}

#[instrument(skip(args))]
fn load_sections(args: &Args, elf: &Path) -> Result<SectionTable> {
    let table = match args.sections {
        SectionSource::Objdump => {
            SectionTable::from_objdump(&tools::objdump_section_headers(&args.objdump, elf)?)
        }
        SectionSource::Elf => {
            let elf_bytes = std::fs::read(elf).wrap_err_with(|| {
                format!("Failed to read kernel image from {}", elf.to_string_lossy())
            })?;
            SectionTable::from_elf(&elf_bytes)?
        }
    };

    debug!(
        sections = table.sections().len(),
        flash = ?table.flash_names().collect::<Vec<_>>(),
        flash_total = table.flash_total(),
        ram = ?table.ram_names().collect::<Vec<_>>(),
        ram_total = table.ram_total(),
        "Classified sections"
    );
    Ok(table)
}

/// Converts a capacity given in KiB to bytes.
fn kib_to_bytes(kib: Option<u64>, flag: &str) -> Result<Option<u64>> {
    kib.map(|kib| {
        kib.checked_mul(1024)
            .ok_or_else(|| eyre!("--{flag} of {kib} KiB is too large"))
    })
    .transpose()
}

/// Prefix removed from the source paths reported by `nm`.
fn strip_prefix(base: &Path) -> String {
    format!("{}/", base.to_string_lossy().trim_end_matches('/'))
}

struct Report<'a> {
    args: &'a Args,
    forest: &'a FeatureForest,
    style: Style,
}

impl Report<'_> {
    fn write_section(
        &self,
        mut outfile: impl Write,
        title: &str,
        tree: &PathTree,
        thresholds: Thresholds,
    ) -> Result<()> {
        let total = tree.total();
        writeln!(outfile)?;
        writeln!(
            outfile,
            "{}{title}{}",
            self.style.highlight, self.style.reset
        )?;

        let opts = TreeOptions {
            base: self.args.zephyr_base.as_deref(),
            depth: self.args.depth,
            style: self.style,
        };
        if self.args.full {
            write_tree(&mut outfile, tree, total, &opts)?;
        } else {
            write_tree(&mut outfile, &prune(tree, thresholds), total, &opts)?;
        }

        if !self.forest.is_empty() {
            let classification = self.forest.classify_tree(tree);
            writeln!(outfile)?;
            write_features(
                &mut outfile,
                self.forest,
                &classification.tally,
                total,
                self.style,
            )?;
            if self.args.uncategorized {
                writeln!(outfile)?;
                write_uncategorized(&mut outfile, &classification.uncategorized)?;
            }
        }

        Ok(())
    }
}

fn run(args: &Args) -> Result<()> {
    let flash_capacity = kib_to_bytes(args.flash_size, "flash-size")?;
    let ram_capacity = kib_to_bytes(args.ram_size, "ram-size")?;

    let artifacts = Artifacts::new(&args.outdir, &args.kernel_name);
    if let Some(missing) = artifacts.missing() {
        error!("{} does not exist.", missing.to_string_lossy());
        return Ok(());
    }

    let forest: FeatureForest = args
        .features
        .iter()
        .into_fallible()
        .map_err(|e| match e {})
        .map(|feature_file| {
            load_features(feature_file).wrap_err_with(|| {
                format!(
                    "Failed to load feature file {}",
                    feature_file.to_string_lossy()
                )
            })
        })
        .collect::<FeatureForest>()?;

    let flash_used = std::fs::metadata(&artifacts.bin)
        .wrap_err_with(|| format!("Failed to stat {}", artifacts.bin.to_string_lossy()))?
        .len();

    let sections = load_sections(args, &artifacts.elf)?;

    let ram_used = if artifacts.stat.exists() {
        let stat = std::fs::read_to_string(&artifacts.stat).wrap_err_with(|| {
            format!("Failed to read {}", artifacts.stat.to_string_lossy())
        })?;
        ram_used_from_stat(&stat)
    } else {
        warn!(
            stat = %artifacts.stat.display(),
            "No stat file, using the size of RAM sections instead"
        );
        sections.ram_total()
    };

    let footprint = Footprint {
        flash_used,
        ram_used,
        flash_sections: sections.flash_total(),
        ram_sections: sections.ram_total(),
        flash_capacity,
        ram_capacity,
    };

    let stdout = io::stdout();
    let style = if args.no_color || !stdout.is_terminal() {
        Style::plain()
    } else {
        Style::ansi()
    };
    let mut outfile = BufWriter::new(stdout.lock());
    write_footprint(&mut outfile, &footprint)?;

    if args.rom || args.ram {
        let prefix = args.zephyr_base.as_deref().map(strip_prefix);
        let nm_out = tools::nm_size_sorted(&args.nm, &artifacts.elf)?;
        let paths = PathMap::from_nm_output(&nm_out, prefix.as_deref());
        let objdump_out = tools::objdump_symbols(&args.objdump, &artifacts.elf)?;
        let records = extract_symbols(&objdump_out, &paths);
        info!(
            located = paths.len(),
            symbols = records.len(),
            "Extracted symbols"
        );

        let report = Report {
            args,
            forest: &forest,
            style,
        };

        if args.rom {
            let tree = PathTree::from_records(&records, |s| sections.contains_flash(s));
            report.write_section(
                &mut outfile,
                "Flash",
                &tree,
                Thresholds::from_total(footprint.flash_used),
            )?;
        }
        if args.ram {
            let tree = PathTree::from_records(&records, |s| sections.contains_ram(s));
            let thresholds = Thresholds::from_total(tree.total());
            report.write_section(&mut outfile, "RAM", &tree, thresholds)?;
        }
    }

    outfile.flush().wrap_err("Failed to write report")?;
    Ok(())
}

pub fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    color_eyre::install()?;

    run(&args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_in_kib() {
        assert_eq!(kib_to_bytes(None, "flash-size").unwrap(), None);
        assert_eq!(kib_to_bytes(Some(64), "flash-size").unwrap(), Some(65536));

        let err = kib_to_bytes(Some(u64::MAX / 1024 + 1), "ram-size").unwrap_err();
        assert!(format!("{err}").contains("--ram-size"));
    }

    #[test]
    fn base_prefix_ends_in_one_slash() {
        assert_eq!(strip_prefix(Path::new("/work/zephyr")), "/work/zephyr/");
        assert_eq!(strip_prefix(Path::new("/work/zephyr//")), "/work/zephyr/");
    }
}
