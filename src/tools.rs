use std::{
    ffi::OsStr,
    path::Path,
    process::{Command, Output},
};

use color_eyre::{
    eyre::{eyre, Context as _},
    Result, Section as _, SectionExt as _,
};
use tracing::{debug, instrument};

/// Runs a toolchain utility to completion and returns its stdout.
///
/// A utility that cannot be spawned or that exits unsuccessfully fails the whole run, the report
/// cannot be produced without its output.
#[instrument(skip_all, fields(program = ?program.as_ref()))]
pub fn run_tool<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program.as_ref());
    cmd.args(args);
    let cmdline = format!("{cmd:?}");
    debug!(%cmdline, "Running tool");

    let Output {
        status,
        stdout,
        stderr,
    } = cmd
        .output()
        .wrap_err_with(|| format!("Failed to run {cmdline}"))?;

    if !status.success() {
        return Err(eyre!("{cmdline} exited with {status}")
            .with_section(|| String::from_utf8_lossy(&stderr).into_owned().header("Stderr:")));
    }

    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Size-sorted symbol listing annotated with `file:line`.
pub fn nm_size_sorted(nm: &Path, elf: &Path) -> Result<String> {
    run_tool(
        nm,
        [
            elf.as_os_str(),
            OsStr::new("-S"),
            OsStr::new("-l"),
            OsStr::new("--size-sort"),
        ],
    )
}

pub fn objdump_section_headers(objdump: &Path, elf: &Path) -> Result<String> {
    run_tool(objdump, [OsStr::new("-hw"), elf.as_os_str()])
}

pub fn objdump_symbols(objdump: &Path, elf: &Path) -> Result<String> {
    run_tool(objdump, [OsStr::new("-tw"), elf.as_os_str()])
}
