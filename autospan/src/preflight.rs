//! Pre-flight checks for autospan
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Minimum kernel version required for the ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
pub fn run_preflight_checks(bpf_object: &Path, proc_root: &Path) -> Result<()> {
    check_privileges()?;
    check_kernel_version(proc_root)?;
    check_object_exists(bpf_object)?;
    check_proc_root(proc_root)?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: autospan requires root privileges to load eBPF programs.\n\n\
         Run with: sudo autospan ..."
    );
}

/// Parse "major.minor" out of a kernel release string like "6.1.0-arch1-1"
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version(proc_root: &Path) -> Result<()> {
    let path = proc_root.join("version");
    let version_str = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read kernel version from {}", path.display()))?;

    // "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             autospan requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {}",
            major,
            minor,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    Ok(())
}

/// Check that the compiled kernel-side object is present
fn check_object_exists(bpf_object: &Path) -> Result<()> {
    if !bpf_object.exists() {
        bail!(
            "BPF object not found: {}\n\n\
             Build it or point --bpf-object at the installed file.",
            bpf_object.display()
        );
    }
    if !bpf_object.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --bpf-object must point to a compiled object file, not a directory.",
            bpf_object.display()
        );
    }
    Ok(())
}

/// Check that the proc filesystem can be listed
fn check_proc_root(proc_root: &Path) -> Result<()> {
    std::fs::read_dir(proc_root).with_context(|| {
        format!(
            "Cannot read {}\n\n\
             This usually means:\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted",
            proc_root.display()
        )
    })?;
    Ok(())
}
