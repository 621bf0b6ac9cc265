//! Filesystem utilities: directory cleaning, recursive copies with overlap
//! warnings, and hardlink-tree cloning for the layer cache.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Remove `path` if it exists and recreate it empty.
pub fn clean_dir(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to clean {}", path.display()))?;
    }
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(())
}

/// Create `path` and any missing parents.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(())
}

/// Remove a directory tree, warning instead of failing. Used for failure
/// cleanup where the cache may already be half-gone.
pub fn remove_dir_best_effort(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(path) {
        eprintln!("  [WARN] failed to remove {}: {}", path.display(), e);
    }
}

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Recursively copy `src` into `dst`, overlaying onto whatever is already
/// there. Regular files that already exist at the destination are reported
/// as conflicts (when `warn_conflicts`) and then overwritten; `fs::copy`
/// carries permissions, symlinks are recreated.
pub fn copy_tree(src: &Path, dst: &Path, warn_conflicts: bool) -> Result<()> {
    ensure_dir(dst)?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir entry outside its root");
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            ensure_dir(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
            if target.symlink_metadata().is_ok() {
                if warn_conflicts {
                    eprintln!("  [WARN] overlapping path {}", rel.display());
                }
                fs::remove_file(&target)?;
            }
            symlink(&link, &target)
                .with_context(|| format!("Failed to create symlink {}", target.display()))?;
        } else {
            if target.symlink_metadata().is_ok() {
                if warn_conflicts {
                    eprintln!("  [WARN] overlapping path {}", rel.display());
                }
                fs::remove_file(&target)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Clone `src` into `dst` sharing file content via hardlinks. Directories
/// are recreated with their permissions, regular files are `link(2)`ed,
/// symlinks recreated. Used for image-set layers, where a child layer is a
/// superset of its parent by a handful of files.
pub fn hardlink_tree(src: &Path, dst: &Path) -> Result<()> {
    ensure_dir(dst)?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir entry outside its root");
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            ensure_dir(&target)?;
            let perms = entry.metadata()?.permissions();
            fs::set_permissions(&target, perms)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)
                .with_context(|| format!("Failed to create symlink {}", target.display()))?;
        } else {
            fs::hard_link(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to hardlink {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn clean_dir_wipes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().join("x");
        fs::create_dir(&d).unwrap();
        fs::write(d.join("stale"), "old").unwrap();
        clean_dir(&d).unwrap();
        assert!(d.exists());
        assert!(!d.join("stale").exists());
    }

    #[test]
    fn copy_tree_preserves_structure_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/file"), "data").unwrap();
        symlink("sub/file", src.join("link")).unwrap();

        copy_tree(&src, &dst, false).unwrap();
        assert_eq!(fs::read_to_string(dst.join("sub/file")).unwrap(), "data");
        assert_eq!(
            fs::read_link(dst.join("link")).unwrap(),
            Path::new("sub/file")
        );
    }

    #[test]
    fn copy_tree_overlays_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("shared"), "from-a").unwrap();
        fs::write(a.join("only-a"), "a").unwrap();
        fs::write(b.join("shared"), "from-b").unwrap();

        copy_tree(&a, &dst, false).unwrap();
        copy_tree(&b, &dst, false).unwrap();
        assert_eq!(fs::read_to_string(dst.join("shared")).unwrap(), "from-b");
        assert_eq!(fs::read_to_string(dst.join("only-a")).unwrap(), "a");
    }

    #[test]
    fn hardlink_tree_shares_inodes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool"), "#!/bin/sh\n").unwrap();

        hardlink_tree(&src, &dst).unwrap();
        let a = fs::metadata(src.join("bin/tool")).unwrap();
        let b = fs::metadata(dst.join("bin/tool")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn remove_best_effort_tolerates_missing() {
        remove_dir_best_effort(Path::new("/nonexistent/chariot/dir"));
    }
}
