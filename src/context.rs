//! Shared run context.
//!
//! One explicit value carries everything a pipeline stage needs: the cache
//! directory layout, user variables, verbosity and cache flags. No
//! module-level state.

use std::path::{Path, PathBuf};

use crate::interp::{Vars, RESERVED_NAMES};
use crate::recipe::Namespace;

/// The on-disk cache layout under a single root (default `.chariot-cache`).
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<cache>/<ns>/<name>` - a recipe's artifact directory.
    pub fn recipe_dir(&self, namespace: Namespace, name: &str) -> PathBuf {
        self.root.join(namespace.dir_name()).join(name)
    }

    /// `<cache>/deps/<ns>` - per-recipe scratch staging, wiped each pipeline.
    pub fn deps_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join("deps").join(namespace.dir_name())
    }

    /// `<cache>/sets` - root of the image-set layer tree.
    pub fn sets_dir(&self) -> PathBuf {
        self.root.join("sets")
    }

    /// `<cache>/sets/rootfs` - the bootstrapped base layer.
    pub fn base_rootfs(&self) -> PathBuf {
        self.sets_dir().join("rootfs")
    }

    /// `<cache>/patches` - user-supplied patch files.
    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }

    /// `<cache>/chariot.lock` - the advisory cache lock.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("chariot.lock")
    }
}

/// Everything one engine run carries around.
#[derive(Debug)]
pub struct Context {
    pub cache: CacheLayout,
    /// Directory containing the root config file; `.chariot-overrides` and
    /// relative local source paths resolve against it.
    pub config_dir: PathBuf,
    pub user_vars: Vars,
    pub quiet: bool,
    pub hide_conflicts: bool,
    pub clean_cache: bool,
    pub thread_count: usize,
}

impl Context {
    /// Default `thread_count`: host CPU count, capped at 8. Build scripts
    /// receive it via `@(thread_count)`; the engine itself stays serial.
    pub fn default_thread_count() -> usize {
        num_cpus::get().clamp(1, 8)
    }
}

/// Parse `-o KEY=VAL` definitions into a user variable table. Reserved
/// names are refused with a warning, matching the engine-owned tables.
pub fn parse_user_vars(specs: &[String]) -> Vars {
    let mut vars = Vars::new();
    for spec in specs {
        let Some((key, value)) = spec.split_once('=') else {
            eprintln!("  [WARN] ignoring malformed -o `{spec}` (expected KEY=VAL)");
            continue;
        };
        if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(key)) {
            eprintln!("  [WARN] `{key}` is a reserved variable, -o definition ignored");
            continue;
        }
        vars.set(key, value);
    }
    vars
}
