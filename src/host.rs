//! Host-side commands for the rootfs bootstrap.
//!
//! Everything a recipe runs goes through the container; the host itself
//! only fetches and unpacks the bootstrap tarball (local source trees are
//! copied by `fsutil`). These two commands are the whole host surface.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;

/// Download `url` to `dest` with curl. Progress goes straight to the
/// terminal; a failed download removes the partial file so a re-run
/// starts clean.
pub fn download(url: &str, dest: &Path) -> Result<()> {
    let status = Command::new("curl")
        .args(["-L", "--progress-bar", "-o"])
        .arg(dest)
        .arg(url)
        .status()
        .context("Failed to run curl. Is it installed?")?;

    if !status.success() {
        fs::remove_file(dest).ok();
        bail!(
            "curl failed downloading {url} (exit code {})",
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}

/// Unpack `archive` into `dest`, dropping the tarball's single top-level
/// directory. tar picks the decompressor from the file itself.
pub fn extract_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .args(["--strip-components", "1"])
        .output()
        .context("Failed to run tar. Is it installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "tar failed extracting {} (exit code {}):\n{}",
            archive.display(),
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(())
}
