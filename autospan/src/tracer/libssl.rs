//! Locating the OpenSSL library a process has mapped
//!
//! User-space hooks are attached by file path, so we read `/proc/<pid>/maps`
//! and pick the `libssl` mapping. The path in `maps` is relative to the
//! process's own mount namespace; it is resolved through `/proc/<pid>/root`
//! so containers work from the host.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::domain::Pid;

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub path: String,
}

/// Parse a maps line: "start-end perms offset dev inode pathname"
///
/// Anonymous mappings (no path) yield `None`.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    // perms, offset, dev, inode
    let path = parts.nth(4)?;

    let (start, end) = range.split_once('-')?;
    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        path: path.to_string(),
    })
}

/// Path of the first mapping whose file name starts with `prefix`
#[must_use]
pub fn find_library(maps: &str, prefix: &str) -> Option<String> {
    maps.lines().filter_map(parse_maps_line).map(|m| m.path).find(|path| {
        Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(prefix))
    })
}

/// Host-visible path of the `libssl` mapped into `pid`, if any
///
/// # Errors
///
/// Returns an error if `/proc/<pid>/maps` cannot be read
pub fn find_libssl(proc_root: &Path, pid: Pid) -> Result<Option<PathBuf>> {
    let maps_path = proc_root.join(pid.0.to_string()).join("maps");
    let maps = fs::read_to_string(&maps_path)
        .with_context(|| format!("Failed to read {}", maps_path.display()))?;

    let Some(lib) = find_library(&maps, "libssl.so") else {
        debug!("{pid}: no libssl mapping");
        return Ok(None);
    };

    let resolved = proc_root
        .join(pid.0.to_string())
        .join("root")
        .join(lib.trim_start_matches('/'));
    info!("{pid}: found {lib}");
    Ok(Some(resolved))
}
