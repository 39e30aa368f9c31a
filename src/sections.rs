use color_eyre::{
    eyre::{bail, Context as _},
    Result,
};
use object::{Object as _, ObjectSection as _, SectionKind};
use regex::Regex;
use tracing::{debug, instrument, trace};

use crate::consts::RAM_SECTIONS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionFlags {
    pub load: bool,
    pub alloc: bool,
    pub readonly: bool,
    pub code: bool,
}

impl SectionFlags {
    /// Parses the comma-separated flag column of `objdump -h`, ignoring flags that do not matter
    /// for size accounting.
    fn from_objdump(flags: &str) -> Self {
        let mut ret = Self::default();
        for flag in flags.split(',').map(str::trim) {
            match flag {
                "LOAD" => ret.load = true,
                "ALLOC" => ret.alloc = true,
                "READONLY" => ret.readonly = true,
                "CODE" => ret.code = true,
                _ => {}
            }
        }
        ret
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub name: String,
    pub size: u64,
    pub flags: SectionFlags,
}

impl SectionInfo {
    /// Sections that are part of the flash image.
    pub fn is_flash(&self) -> bool {
        self.flags.load
    }

    /// Sections that occupy RAM at runtime. Read-only data is sometimes placed in a writable
    /// section, the name is the only hint left in that case.
    pub fn is_ram(&self) -> bool {
        self.flags.alloc && !self.flags.readonly && !self.flags.code && !self.name.contains("rodata")
    }
}

#[derive(Debug, Default)]
pub struct SectionTable {
    sections: Vec<SectionInfo>,
}

impl SectionTable {
    /// Parses `objdump -hw` output.
    ///
    /// Section rows look like `idx name size vma lma offset align flags...`; every other line
    /// (file header, column titles) is skipped.
    #[instrument(skip_all)]
    pub fn from_objdump(text: &str) -> Self {
        let mut sections = Vec::new();

        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(idx), Some(name), Some(size)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if idx.parse::<usize>().is_err() {
                continue;
            }
            let Ok(size) = u64::from_str_radix(size, 16) else {
                trace!(line, "Skipping section with unparsable size");
                continue;
            };
            // vma, lma, file offset, alignment
            let flags: Vec<&str> = fields.skip(4).collect();

            sections.push(SectionInfo {
                name: name.to_owned(),
                size,
                flags: SectionFlags::from_objdump(&flags.join(" ")),
            });
        }

        debug!(sections = sections.len(), "Parsed section headers");
        Self { sections }
    }

    /// Reads the section headers straight from the ELF file, mapping the ELF section flags to
    /// what `objdump` would report for them.
    #[instrument(skip_all)]
    pub fn from_elf(data: &[u8]) -> Result<Self> {
        let elf = object::File::parse(data).wrap_err("Failed to parse kernel ELF")?;

        let mut sections = Vec::new();
        for section in elf.sections() {
            let name = section.name().wrap_err("Failed to read section name")?;
            if name.is_empty() {
                continue;
            }

            let object::SectionFlags::Elf { sh_flags } = section.flags() else {
                bail!("Section {name} does not have ELF flags, is this an ELF file?");
            };
            let alloc = sh_flags & u64::from(object::elf::SHF_ALLOC) != 0;
            let has_contents = !matches!(
                section.kind(),
                SectionKind::UninitializedData | SectionKind::UninitializedTls
            );

            sections.push(SectionInfo {
                name: name.to_owned(),
                size: section.size(),
                flags: SectionFlags {
                    load: alloc && has_contents,
                    alloc,
                    readonly: sh_flags & u64::from(object::elf::SHF_WRITE) == 0,
                    code: sh_flags & u64::from(object::elf::SHF_EXECINSTR) != 0,
                },
            });
        }

        debug!(sections = sections.len(), "Read section headers from ELF");
        Ok(Self { sections })
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    pub fn flash_names(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .filter(|s| s.is_flash())
            .map(|s| s.name.as_str())
    }

    pub fn ram_names(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .filter(|s| s.is_ram())
            .map(|s| s.name.as_str())
    }

    pub fn contains_flash(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.is_flash() && s.name == name)
    }

    pub fn contains_ram(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.is_ram() && s.name == name)
    }

    /// Sum of flash section sizes. This usually differs from the size of the flash image, which
    /// also contains padding.
    pub fn flash_total(&self) -> u64 {
        self.sections
            .iter()
            .filter(|s| s.is_flash())
            .map(|s| s.size)
            .sum()
    }

    pub fn ram_total(&self) -> u64 {
        self.sections
            .iter()
            .filter(|s| s.is_ram())
            .map(|s| s.size)
            .sum()
    }
}

/// Size of a named section in a `readelf -S` style listing, or 0 if it is not listed.
///
/// The first row whose name starts with `section` wins. Its size is the fifth column after the
/// `[idx]` field.
pub fn stat_section_size(stat: &str, section: &str) -> u64 {
    let Ok(re) = Regex::new(&format!(r"(?m)\] ({}.*)$", regex::escape(section))) else {
        return 0;
    };
    let Some(row) = re.captures(stat).and_then(|c| c.get(1)) else {
        return 0;
    };

    let Some(size) = row.as_str().split_whitespace().nth(4) else {
        trace!(section, "Section row is too short");
        return 0;
    };
    u64::from_str_radix(size, 16).unwrap_or_else(|_e| {
        debug!(section, size, "Unparsable section size");
        0
    })
}

/// RAM in use according to the `.stat` file.
#[instrument(skip_all)]
pub fn ram_used_from_stat(stat: &str) -> u64 {
    RAM_SECTIONS
        .iter()
        .map(|section| {
            let size = stat_section_size(stat, section);
            trace!(section, size);
            size
        })
        .sum()
}

/// Total flash and RAM use of a build, with the device capacities if they are known.
///
/// The used figures and the section sums are kept apart: padding and fill bytes make the flash
/// image larger than its sections, and the `.stat` file may list sections the header dump does
/// not classify as RAM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footprint {
    /// Size of the flash image, which is what actually ends up on the device.
    pub flash_used: u64,
    pub ram_used: u64,
    /// Summed size of the flash sections.
    pub flash_sections: u64,
    /// Summed size of the RAM sections.
    pub ram_sections: u64,
    pub flash_capacity: Option<u64>,
    pub ram_capacity: Option<u64>,
}

fn percent_of(used: u64, capacity: Option<u64>) -> f64 {
    match capacity {
        Some(capacity) if capacity > 0 => used as f64 / capacity as f64 * 100.0,
        _ => 0.0,
    }
}

impl Footprint {
    pub fn flash_percent(&self) -> f64 {
        percent_of(self.flash_used, self.flash_capacity)
    }

    pub fn ram_percent(&self) -> f64 {
        percent_of(self.ram_used, self.ram_capacity)
    }
}
