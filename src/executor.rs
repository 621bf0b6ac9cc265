//! The stage executor.
//!
//! Drives forced recipes through their pipelines in post-order: a recipe's
//! source reference first, then its dependencies in declaration order, then
//! the recipe itself. Each pipeline stages dependency artifacts into
//! scratch directories, materialises the image-set layer, composes the
//! container mounts and runs the scripted stages. Sequential by design;
//! build scripts get their parallelism through `@(thread_count)`.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};

use crate::container::Container;
use crate::context::Context;
use crate::fsutil;
use crate::interp::{interpolate, Vars};
use crate::layers;
use crate::recipe::{
    Config, Namespace, Payload, Recipe, RecipeId, SourceKind, SourcePayload, Status,
};

/// In-container mount points. Fixed so recipe scripts can rely on them.
const SOURCES_DIR: &str = "/chariot/sources";
const SYSROOT_DIR: &str = "/chariot/sysroot";
const SOURCE_DIR: &str = "/chariot/source";
const BUILD_DIR: &str = "/chariot/build";
const CACHE_DIR: &str = "/chariot/cache";
const INSTALL_DIR: &str = "/chariot/install";
const PATCHES_DIR: &str = "/chariot/patches";

/// Parse a `<namespace>/<name>` recipe label as given on the command line.
pub fn parse_label(label: &str) -> Option<(Namespace, &str)> {
    let (ns, name) = label.split_once('/')?;
    let namespace = Namespace::parse(ns)?;
    if name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

/// A recipe's effective image-package set. The layer directory is only
/// materialised when a stage actually enters the container, so pipelines
/// that stay host-side (local sources) touch no layers at all.
struct LayerSet<'a> {
    ctx: &'a Context,
    packages: Vec<String>,
}

impl LayerSet<'_> {
    fn rootfs(&self) -> Result<PathBuf> {
        layers::materialise(self.ctx, &self.packages)
    }
}

/// One engine run over a resolved configuration.
pub struct Engine {
    config: Config,
    status: Vec<Status>,
    ctx: Context,
}

impl Engine {
    pub fn new(config: Config, ctx: Context) -> Self {
        let status = vec![Status::default(); config.len()];
        Self { config, status, ctx }
    }

    pub fn status(&self, id: RecipeId) -> Status {
        self.status[id]
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Force a rebuild of `id` this run, ignoring its cached directory.
    pub fn invalidate(&mut self, id: RecipeId) {
        self.status[id].invalidated = true;
    }

    /// Process the forced recipe labels. Returns true if every one of them
    /// succeeded; failures are reported and do not stop the others.
    pub fn run(&mut self, forced: &[String]) -> Result<bool> {
        layers::ensure_rootfs(&self.ctx)?;

        let mut ids = Vec::new();
        for label in forced {
            let resolved = parse_label(label)
                .and_then(|(ns, name)| self.config.lookup(ns, name));
            match resolved {
                Some(id) => ids.push(id),
                None => eprintln!("  [WARN] unknown recipe `{label}`, skipping"),
            }
        }

        for &id in &ids {
            self.invalidate(id);
        }

        let mut all_ok = true;
        for id in ids {
            let label = self.config.get(id).label();
            if let Err(e) = self.process(id) {
                eprintln!("Build of {label} failed: {e:#}");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Run a shell command in the base rootfs layer (`--exec`).
    pub fn exec(&self, command: &str) -> Result<i32> {
        layers::ensure_rootfs(&self.ctx)?;
        let code = Container::new(self.ctx.cache.base_rootfs())
            .interactive(true)
            .run_shell(command)
            .context("Failed to execute command in container")?;
        Ok(code)
    }

    /// Process one recipe, dependencies first.
    pub fn process(&mut self, id: RecipeId) -> Result<()> {
        let recipe = self.config.get(id);
        let label = recipe.label();

        if self.status[id].built {
            return Ok(());
        }
        if self.status[id].failed {
            bail!("{label} failed earlier in this run");
        }

        // Skip rule: an existing directory is a successful prior build
        // unless this recipe was forced. Its dependencies need no visit.
        let recipe_dir = self.ctx.cache.recipe_dir(recipe.namespace, &recipe.name);
        if recipe_dir.exists() && !self.status[id].invalidated {
            tracing::debug!("{label} already built, skipping");
            self.status[id].built = true;
            return Ok(());
        }

        // Post-order: source reference first, then edges in declaration
        // order. All edges are built regardless of the runtime flag; the
        // flag only controls staging.
        let mut prereqs: Vec<RecipeId> = Vec::new();
        if let Payload::Build(payload) = &recipe.payload {
            if let Some(sref) = &payload.source {
                prereqs.extend(sref.target);
            }
        }
        for dep in &recipe.dependencies {
            let Some(target) = dep.target else {
                bail!("{label}: unresolved dependency edge {}/{}", dep.namespace, dep.name);
            };
            prereqs.push(target);
        }
        for prereq in prereqs {
            self.process(prereq)?;
        }

        println!("Building {label}...");
        match self.build_recipe(id) {
            Ok(()) => {
                self.status[id].built = true;
                Ok(())
            }
            Err(e) => {
                self.status[id].failed = true;
                fsutil::remove_dir_best_effort(&recipe_dir);
                Err(e).with_context(|| format!("while building {label}"))
            }
        }
    }

    fn build_recipe(&self, id: RecipeId) -> Result<()> {
        let recipe = self.config.get(id).clone();

        // Scratch staging directories are per-recipe, never shared.
        for ns in [Namespace::Source, Namespace::Host, Namespace::Target] {
            fsutil::clean_dir(&self.ctx.cache.deps_dir(ns))?;
        }

        let mut installed = HashSet::new();
        let mut images = BTreeSet::new();
        self.stage_deps(&recipe, false, &mut installed, &mut images)?;
        let layer = LayerSet {
            ctx: &self.ctx,
            packages: images.into_iter().collect(),
        };

        match &recipe.payload {
            Payload::Source(payload) => self.fetch_source(&recipe, payload, &layer),
            Payload::Build(payload) => {
                let has_source = match &payload.source {
                    Some(sref) => {
                        let Some(target) = sref.target else {
                            bail!("unresolved source reference `{}`", sref.name);
                        };
                        Some(self.config.get(target).name.clone())
                    }
                    None => None,
                };
                self.build_stages(&recipe, has_source.as_deref(), &layer)
            }
        }
    }

    /// Stage build-time dependency artifacts and accumulate image packages.
    ///
    /// At the recipe itself only non-runtime edges are followed; once
    /// inside a dependency's subtree only runtime edges are, giving the
    /// runtime closure of each build-time dependency. The `installed` set
    /// makes re-visits idempotent.
    fn stage_deps(
        &self,
        recipe: &Recipe,
        runtime_only: bool,
        installed: &mut HashSet<RecipeId>,
        images: &mut BTreeSet<String>,
    ) -> Result<()> {
        for image in &recipe.image_dependencies {
            if image.runtime == runtime_only {
                images.insert(image.package.clone());
            }
        }
        for dep in &recipe.dependencies {
            if dep.runtime != runtime_only {
                continue;
            }
            let Some(target) = dep.target else {
                bail!("unresolved dependency edge {}/{}", dep.namespace, dep.name);
            };
            if !installed.insert(target) {
                continue;
            }
            let dep_recipe = self.config.get(target);
            self.install_artifact(dep_recipe)?;
            self.stage_deps(dep_recipe, true, installed, images)?;
        }
        Ok(())
    }

    /// Copy one dependency's published artifact into the scratch area.
    fn install_artifact(&self, dep: &Recipe) -> Result<()> {
        let warn = !self.ctx.hide_conflicts;
        let cache = &self.ctx.cache;
        match dep.namespace {
            Namespace::Source => {
                let src = cache.recipe_dir(Namespace::Source, &dep.name).join("src");
                let dst = cache.deps_dir(Namespace::Source).join(&dep.name);
                fsutil::copy_tree(&src, &dst, warn)
            }
            Namespace::Host => {
                let src = cache
                    .recipe_dir(Namespace::Host, &dep.name)
                    .join("install/usr/local");
                if !src.exists() {
                    return Ok(());
                }
                fsutil::copy_tree(&src, &cache.deps_dir(Namespace::Host), warn)
            }
            Namespace::Target => {
                let src = cache.recipe_dir(Namespace::Target, &dep.name).join("install");
                if !src.exists() {
                    return Ok(());
                }
                fsutil::copy_tree(&src, &cache.deps_dir(Namespace::Target), warn)
            }
        }
        .with_context(|| format!("Failed to stage {}", dep.label()))
    }

    /// Base container for a stage: dependency mounts, user options, quiet.
    fn stage_container(&self, rootfs: &PathBuf, reserved: &Vars) -> Container {
        let cache = &self.ctx.cache;
        let mut container = Container::new(rootfs)
            .quiet(self.ctx.quiet)
            .mount(cache.deps_dir(Namespace::Source), SOURCES_DIR)
            .mount(cache.deps_dir(Namespace::Host), "/usr/local")
            .mount(cache.deps_dir(Namespace::Target), SYSROOT_DIR);
        for (key, value) in reserved.iter() {
            container = container.env(key, value);
        }
        for (key, value) in self.ctx.user_vars.iter() {
            container = container.env(format!("OPTION_{key}"), value);
        }
        container
    }

    fn run_stage(&self, container: &Container, script: &str, what: &str) -> Result<()> {
        let code = container
            .run_shell(script)
            .with_context(|| format!("Failed to run {what}"))?;
        if code != 0 {
            bail!("{what} failed (exit code {code})");
        }
        Ok(())
    }

    fn run_argv(&self, container: &Container, argv: &[&str], what: &str) -> Result<()> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let code = container
            .run(&argv)
            .with_context(|| format!("Failed to run {what}"))?;
        if code != 0 {
            bail!("{what} failed (exit code {code})");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Source pipeline: fetch, verify, extract, patch, strap.
    // ------------------------------------------------------------------

    fn fetch_source(&self, recipe: &Recipe, payload: &SourcePayload, layer: &LayerSet) -> Result<()> {
        let dir = self.ctx.cache.recipe_dir(Namespace::Source, &recipe.name);
        fsutil::clean_dir(&dir)?;
        let src_dir = dir.join("src");

        match payload.kind {
            SourceKind::TarGz | SourceKind::TarXz => {
                let b2sum = payload.b2sum.as_deref().unwrap_or_default();
                fsutil::write_file_with_dirs(
                    dir.join("b2sums.txt"),
                    format!("{b2sum}  {SOURCE_DIR}/archive\n"),
                )?;
                fsutil::ensure_dir(&src_dir)?;

                // During fetch /chariot/source is the whole recipe
                // directory: archive, b2sums.txt and src/ live side by side.
                let container = self
                    .stage_container(&layer.rootfs()?, &Vars::new())
                    .mount(&dir, SOURCE_DIR)
                    .workdir(SOURCE_DIR);
                self.run_argv(
                    &container,
                    &["wget", "-O", "/chariot/source/archive", payload.url.as_str()],
                    "download",
                )?;
                self.run_argv(&container, &["b2sum", "--check", "b2sums.txt"], "checksum verification")?;
                self.run_argv(
                    &container,
                    &[
                        "tar",
                        "-xf",
                        "/chariot/source/archive",
                        "-C",
                        "/chariot/source/src",
                        "--strip-components",
                        "1",
                    ],
                    "extraction",
                )?;
            }
            SourceKind::Git => {
                let commit = payload.commit.as_deref().unwrap_or_default();
                fsutil::ensure_dir(&src_dir)?;
                let container = self
                    .stage_container(&layer.rootfs()?, &Vars::new())
                    .mount(&dir, SOURCE_DIR)
                    .workdir(SOURCE_DIR);
                self.run_argv(
                    &container,
                    &["git", "clone", "--depth=1", payload.url.as_str(), "/chariot/source/src"],
                    "clone",
                )?;
                // Fetch then check out by explicit hash, so both branch
                // names and commits pin correctly.
                self.run_argv(
                    &container,
                    &["git", "-C", "/chariot/source/src", "fetch", "--depth=1", "origin", commit],
                    "fetch",
                )?;
                self.run_argv(
                    &container,
                    &["git", "-C", "/chariot/source/src", "checkout", commit],
                    "checkout",
                )?;
            }
            SourceKind::Local => {
                let mut path = PathBuf::from(&payload.url);
                if path.is_relative() {
                    path = self.ctx.config_dir.join(path);
                }
                if !path.exists() {
                    bail!("local source {} does not exist", path.display());
                }
                fsutil::copy_tree(&path, &src_dir, false)?;
            }
        }

        // From here on /chariot/source is the unpacked tree itself.
        if let Some(patch) = &payload.patch {
            let container = Container::new(layer.rootfs()?)
                .quiet(self.ctx.quiet)
                .mount(&src_dir, SOURCE_DIR)
                .mount_ro(self.ctx.cache.patches_dir(), PATCHES_DIR)
                .workdir(SOURCE_DIR);
            let patch_path = format!("{PATCHES_DIR}/{patch}");
            self.run_argv(&container, &["patch", "-p1", "-i", patch_path.as_str()], "patch")?;
        }

        if let Some(strap) = &payload.strap {
            let mut reserved = Vars::new();
            reserved.set("sources_dir", SOURCES_DIR);
            let script = interpolate(strap, &reserved, &self.ctx.user_vars)?;
            let container = self
                .stage_container(&layer.rootfs()?, &reserved)
                .mount(&src_dir, SOURCE_DIR)
                .workdir(SOURCE_DIR);
            self.run_stage(&container, &script, "strap stage")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host/target pipeline: configure, build, install.
    // ------------------------------------------------------------------

    fn build_stages(&self, recipe: &Recipe, source: Option<&str>, layer: &LayerSet) -> Result<()> {
        let dir = self.ctx.cache.recipe_dir(recipe.namespace, &recipe.name);
        let build_dir = dir.join("build");
        let cache_dir = dir.join("cache");
        let install_dir = dir.join("install");

        fsutil::clean_dir(&build_dir)?;
        fsutil::clean_dir(&install_dir)?;
        // cache/ is the inner build system's incremental tree; it survives
        // rebuilds unless --clean-cache.
        if self.ctx.clean_cache {
            fsutil::clean_dir(&cache_dir)?;
        } else {
            fsutil::ensure_dir(&cache_dir)?;
        }

        let prefix = match recipe.namespace {
            Namespace::Host => "/usr/local",
            _ => "/usr",
        };

        let payload = recipe
            .build_payload()
            .context("host/target recipe without build payload")?;
        let stages: [(&str, Option<&String>); 3] = [
            ("configure", payload.configure.as_ref()),
            ("build", payload.build.as_ref()),
            ("install", payload.install.as_ref()),
        ];

        for (stage, body) in stages {
            let Some(body) = body else { continue };

            let mut reserved = Vars::new();
            reserved.set("prefix", prefix);
            reserved.set("sysroot_dir", SYSROOT_DIR);
            reserved.set("sources_dir", SOURCES_DIR);
            reserved.set("cache_dir", CACHE_DIR);
            reserved.set("build_dir", BUILD_DIR);
            if stage == "build" {
                reserved.set("thread_count", self.ctx.thread_count.to_string());
            }
            if stage == "install" {
                reserved.set("install_dir", INSTALL_DIR);
            }
            if source.is_some() {
                reserved.set("source_dir", SOURCE_DIR);
            }

            let script = interpolate(body, &reserved, &self.ctx.user_vars)?;
            tracing::debug!("{} {stage}: {script}", recipe.label());

            let mut container = self
                .stage_container(&layer.rootfs()?, &reserved)
                .mount(&build_dir, BUILD_DIR)
                .mount(&cache_dir, CACHE_DIR)
                .mount(&install_dir, INSTALL_DIR)
                .workdir(BUILD_DIR);
            if let Some(source_name) = source {
                let src = self
                    .ctx
                    .cache
                    .recipe_dir(Namespace::Source, source_name)
                    .join("src");
                container = container.mount(src, SOURCE_DIR);
            }
            self.run_stage(&container, &script, &format!("{stage} stage"))?;
        }
        Ok(())
    }
}
