use std::collections::HashMap;

use tracing::{debug, instrument, trace};

use crate::consts::UNCLASSIFIED_PREFIX;

/// A sized symbol placed in a section, with the source path it is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub name: String,
    pub size: u64,
    pub section: String,
    pub source_path: String,
}

/// Path under which a symbol without a usable source location is filed.
pub fn unclassified_path(name: &str) -> String {
    format!("{UNCLASSIFIED_PREFIX}/{name}")
}

/// Maps symbol names to the source path they are reported under.
///
/// Built from `nm -S -l --size-sort` output, which is the only dump that knows about source
/// locations. Sections are not part of that dump, so the map is joined with the `objdump -t`
/// listing by symbol name.
#[derive(Debug, Default)]
pub struct PathMap {
    paths: HashMap<String, String>,
}

impl PathMap {
    /// Parses lines of the form `address size type name [file:line]`.
    ///
    /// With a `strip_prefix`, paths under it are shortened and get the symbol name appended so
    /// every symbol is a leaf of its file. Paths outside of the prefix, and symbols without a
    /// location at all, are filed as unclassified.
    #[instrument(skip(text))]
    pub fn from_nm_output(text: &str, strip_prefix: Option<&str>) -> Self {
        let mut paths = HashMap::new();

        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 4 {
                trace!(line, "Skipping short nm line");
                continue;
            }

            let name = fields[3];
            let path = match fields.get(4) {
                // Line numbers follow the last colon
                Some(location) => location
                    .rsplit_once(':')
                    .map_or(*location, |(path, _line)| path),
                None => {
                    paths.insert(name.to_owned(), unclassified_path(name));
                    continue;
                }
            };

            let path = match strip_prefix.map(|prefix| path.split_once(prefix)) {
                Some(Some((_, relative))) => format!("{relative}/{name}"),
                Some(None) => unclassified_path(name),
                None => path.to_owned(),
            };

            paths.insert(name.to_owned(), path);
        }

        debug!(symbols = paths.len(), "Loaded symbol paths");
        Self { paths }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.paths.get(name).map(String::as_str)
    }

    /// Like [`PathMap::get`], but a name the map has never seen is filed as unclassified rather
    /// than dropped. This happens when the two dumps disagree about which symbols exist.
    pub fn resolve(&self, name: &str) -> String {
        match self.get(name) {
            Some(path) => path.to_owned(),
            None => {
                debug!(name, "Symbol has no known path");
                unclassified_path(name)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// A single row of the `objdump -tw` listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpedSymbol<'a> {
    pub name: &'a str,
    pub size: u64,
    pub section: &'a str,
}

/// Parses a line of `objdump -tw` output.
///
/// The flag column is fixed-width and may contain spaces, so it is blanked out before splitting.
/// Its width is 7 characters and it starts right after the address, whose width depends on the
/// word size of the target. Anything that does not then split into exactly `address flags
/// section size name` is not a symbol line. Zero-sized symbols are skipped.
pub fn parse_objdump_symbol(line: &str) -> Option<DumpedSymbol<'_>> {
    let addr_width = line.find(' ')?;
    let head = line.get(..=addr_width)?;
    let tail = line.get(addr_width + 8..)?;

    let normalized = format!("{head}.......{tail}").replace('\t', " ");
    let fields: Vec<&str> = normalized.split(' ').collect();
    let [_addr, ".......", section, size, name] = fields.as_slice() else {
        return None;
    };
    let size = u64::from_str_radix(size, 16).ok()?;
    if size == 0 {
        return None;
    }

    // Normalizing keeps byte offsets intact, so borrow from the original line
    let name_start = line.len() - name.len();
    let section_start = addr_width + 9;
    Some(DumpedSymbol {
        name: &line[name_start..],
        size,
        section: &line[section_start..section_start + section.len()],
    })
}

/// Joins the `objdump -tw` listing with the path map.
#[instrument(skip_all)]
pub fn extract_symbols(objdump_text: &str, paths: &PathMap) -> Vec<SymbolRecord> {
    let records: Vec<_> = objdump_text
        .lines()
        .filter_map(parse_objdump_symbol)
        .map(|sym| SymbolRecord {
            name: sym.name.to_owned(),
            size: sym.size,
            section: sym.section.to_owned(),
            source_path: paths.resolve(sym.name),
        })
        .collect();

    debug!(symbols = records.len(), "Extracted sized symbols");
    records
}
