//! Shared helpers for integration tests.
//!
//! Each test gets its own temp directory holding a config file, any local
//! source trees, and a cache root.

use std::fs;
use std::path::{Path, PathBuf};

use chariot::context::{CacheLayout, Context};
use chariot::executor::Engine;
use chariot::interp::Vars;
use chariot::parser::{load_overrides, parse_config};
use chariot::recipe::Config;
use chariot::resolve::resolve;

pub struct TestEnv {
    pub dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap() }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn cache(&self) -> PathBuf {
        self.path().join(".chariot-cache")
    }

    /// Write the root config file and return its path.
    pub fn write_config(&self, text: &str) -> PathBuf {
        let path = self.path().join("chariot.conf");
        fs::write(&path, text).unwrap();
        path
    }

    /// Create a local source tree with the given files.
    pub fn write_tree(&self, name: &str, files: &[(&str, &str)]) {
        for (rel, content) in files {
            let path = self.path().join(name).join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    /// Parse + resolve the config, applying any `.chariot-overrides`.
    pub fn load(&self) -> Config {
        let mut config = parse_config(&self.path().join("chariot.conf")).unwrap();
        let overrides = load_overrides(self.path()).unwrap();
        resolve(&mut config, &overrides).unwrap();
        config
    }

    pub fn context(&self) -> Context {
        Context {
            cache: CacheLayout::new(self.cache()),
            config_dir: self.path().to_path_buf(),
            user_vars: Vars::new(),
            quiet: true,
            hide_conflicts: true,
            clean_cache: false,
            thread_count: 2,
        }
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.load(), self.context())
    }
}
