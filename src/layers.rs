//! Image-set layer cache and rootfs bootstrap.
//!
//! The container rootfs for a recipe is determined by its effective set of
//! image (distribution-package) dependencies. Layers form a tree under
//! `<cache>/sets/`: the bootstrapped base rootfs is the root, and each
//! child directory adds exactly one package, hardlink-cloned from its
//! parent so sibling layers share file content. The path from the root,
//! concatenating package names in sort order, uniquely identifies a
//! layer's installed set.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};

use crate::container::Container;
use crate::context::Context;
use crate::fsutil;
use crate::host;

/// Version tag of the pinned base rootfs. Bumping it invalidates the base
/// layer (and with it the whole set tree) on the next run.
pub const ROOTFS_VERSION: &str = "2025.07.01";

const ROOTFS_URL: &str =
    "https://geo.mirror.pkgbuild.com/iso/2025.07.01/archlinux-bootstrap-2025.07.01-x86_64.tar.zst";

const MIRROR: &str = "Server = https://geo.mirror.pkgbuild.com/$repo/os/$arch\n";

/// Fixed package manifest installed into the base layer. Everything a
/// source fetch or an autotools build expects to find without declaring
/// image dependencies of its own.
const ROOTFS_PACKAGES: &[&str] = &[
    "bison",
    "curl",
    "diffutils",
    "gettext",
    "git",
    "libtool",
    "m4",
    "make",
    "patch",
    "perl",
    "python",
    "texinfo",
    "wget",
    "which",
];

/// Stamp file marking a fully bootstrapped base layer.
const STAMP: &str = ".chariot-rootfs";

/// Rootfs path of the layer holding exactly `packages` (sorted, deduped).
/// An empty set is the base layer itself.
pub fn layer_rootfs(sets_dir: &Path, packages: &[String]) -> PathBuf {
    let canonical = canonical_packages(packages);
    if canonical.is_empty() {
        return sets_dir.join("rootfs");
    }
    let mut dir = sets_dir.to_path_buf();
    for pkg in canonical {
        dir = dir.join(pkg);
    }
    dir.join("rootfs")
}

/// Sort lexicographically and drop duplicates, canonicalising the set.
fn canonical_packages(packages: &[String]) -> Vec<&str> {
    let mut canonical: Vec<&str> = packages.iter().map(String::as_str).collect();
    canonical.sort_unstable();
    canonical.dedup();
    canonical
}

/// Walk the layer tree for `packages`, creating missing layers on the way
/// down, and return the final layer's rootfs.
pub fn materialise(ctx: &Context, packages: &[String]) -> Result<PathBuf> {
    let sets = ctx.cache.sets_dir();
    let mut parent_rootfs = ctx.cache.base_rootfs();
    if !parent_rootfs.exists() {
        bail!("base rootfs missing; bootstrap did not run");
    }

    let mut dir = sets.clone();
    for pkg in canonical_packages(packages) {
        dir = dir.join(pkg);
        let rootfs = dir.join("rootfs");
        if !rootfs.exists() {
            if let Err(e) = create_layer(ctx, &parent_rootfs, &rootfs, pkg) {
                // Delete the partial layer so a re-run sees a clean miss.
                fsutil::remove_dir_best_effort(&dir);
                return Err(e);
            }
        }
        parent_rootfs = rootfs;
    }
    Ok(parent_rootfs)
}

fn create_layer(ctx: &Context, parent: &Path, rootfs: &Path, pkg: &str) -> Result<()> {
    println!("Creating image layer for {pkg}...");
    fsutil::hardlink_tree(parent, rootfs)?;

    let code = Container::new(rootfs)
        .quiet(ctx.quiet)
        .run(&[
            "pacman".to_string(),
            "--noconfirm".to_string(),
            "-S".to_string(),
            pkg.to_string(),
        ])
        .with_context(|| format!("Failed to install image package {pkg}"))?;
    if code != 0 {
        bail!("pacman failed to install {pkg} (exit code {code})");
    }
    Ok(())
}

/// Remove the whole layer tree (`--wipe-container`). The next run
/// bootstraps from scratch.
pub fn wipe(ctx: &Context) -> Result<()> {
    let sets = ctx.cache.sets_dir();
    if sets.exists() {
        println!("Wiping container layers...");
        fs::remove_dir_all(&sets)
            .with_context(|| format!("Failed to remove {}", sets.display()))?;
    }
    Ok(())
}

/// Make sure the base rootfs exists and matches [`ROOTFS_VERSION`]. A
/// missing or stale stamp wipes the set tree and bootstraps again.
pub fn ensure_rootfs(ctx: &Context) -> Result<()> {
    let base = ctx.cache.base_rootfs();
    let stamp = base.join(STAMP);
    if let Ok(tag) = fs::read_to_string(&stamp) {
        if tag.trim() == ROOTFS_VERSION {
            return Ok(());
        }
        println!("Base rootfs is {} (want {}), rebuilding...", tag.trim(), ROOTFS_VERSION);
    }
    bootstrap(ctx)
}

fn bootstrap(ctx: &Context) -> Result<()> {
    preflight()?;

    // Anything under sets/ derives from the base layer; a stale or partial
    // base invalidates all of it.
    let sets = ctx.cache.sets_dir();
    if sets.exists() {
        fs::remove_dir_all(&sets)
            .with_context(|| format!("Failed to remove {}", sets.display()))?;
    }
    let base = ctx.cache.base_rootfs();
    fsutil::ensure_dir(&base)?;

    println!("Downloading bootstrap rootfs {ROOTFS_VERSION}...");
    let tarball = sets.join("bootstrap.tar.zst");
    host::download(ROOTFS_URL, &tarball).context("Failed to download bootstrap rootfs")?;

    println!("Extracting bootstrap rootfs...");
    host::extract_tarball(&tarball, &base).context("Failed to extract bootstrap rootfs")?;
    fs::remove_file(&tarball).ok();

    fsutil::write_file_with_dirs(base.join("etc/pacman.d/mirrorlist"), MIRROR)?;
    fsutil::write_file_with_dirs(base.join("etc/locale.gen"), "en_US.UTF-8 UTF-8\n")?;

    println!("Installing base packages...");
    let container = Container::new(&base).quiet(ctx.quiet);
    let script = format!(
        "pacman-key --init && pacman-key --populate archlinux && \
         pacman -Syu --noconfirm {} && locale-gen",
        ROOTFS_PACKAGES.join(" ")
    );
    let code = container
        .run_shell(&script)
        .context("Failed to run base package installation")?;
    if code != 0 {
        bail!("base package installation failed (exit code {code})");
    }

    fs::write(base.join(STAMP), ROOTFS_VERSION)
        .context("Failed to write rootfs stamp")?;
    println!("Base rootfs ready.");
    Ok(())
}

/// The bootstrap runs curl and tar on the host; recipes themselves only
/// need tools inside the container.
fn preflight() -> Result<()> {
    for tool in ["curl", "tar"] {
        if which::which(tool).is_err() {
            bail!("host tool `{tool}` not found; install it and re-run");
        }
    }
    Ok(())
}
