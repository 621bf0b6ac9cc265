//! Recipe data model.
//!
//! A recipe describes how to produce one artifact: a fetched source tree,
//! a host-side tool, or a target package installed into the sysroot. The
//! parser creates recipes, the resolver fills in edge indices, and the
//! executor mutates per-run status.

use std::collections::HashMap;
use std::fmt;

/// Index of a recipe inside [`Config::recipes`].
pub type RecipeId = usize;

/// The three recipe flavours. Determines the payload and the cache
/// subdirectory the recipe's artifacts live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Source,
    Host,
    Target,
}

impl Namespace {
    /// Parse a namespace keyword as it appears in the DSL.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" => Some(Namespace::Source),
            "host" => Some(Namespace::Host),
            "target" => Some(Namespace::Target),
            _ => None,
        }
    }

    /// Directory name under the cache root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Namespace::Source => "source",
            Namespace::Host => "host",
            Namespace::Target => "target",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// How a source recipe obtains its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    TarGz,
    TarXz,
    Git,
    Local,
}

impl SourceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tar.gz" => Some(SourceKind::TarGz),
            "tar.xz" => Some(SourceKind::TarXz),
            "git" => Some(SourceKind::Git),
            "local" => Some(SourceKind::Local),
            _ => None,
        }
    }

    /// True for the tarball kinds, which require a `b2sum` field.
    pub fn is_tar(&self) -> bool {
        matches!(self, SourceKind::TarGz | SourceKind::TarXz)
    }
}

/// A dependency edge on another recipe. `target` is filled in by the
/// resolver; until then it is `None`.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub namespace: Namespace,
    pub name: String,
    /// Marked with `*` in the DSL: followed when computing the runtime
    /// closure of a build-time dependency.
    pub runtime: bool,
    pub target: Option<RecipeId>,
}

/// A distribution package installed into the container rootfs. Never
/// resolved; the name goes verbatim to the package manager.
#[derive(Debug, Clone)]
pub struct ImageDependency {
    pub package: String,
    pub runtime: bool,
}

/// Reference from a host/target recipe to a source recipe, by name.
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub name: String,
    pub target: Option<RecipeId>,
}

/// Payload of a `source` recipe.
#[derive(Debug, Clone)]
pub struct SourcePayload {
    pub kind: SourceKind,
    pub url: String,
    pub patch: Option<String>,
    pub b2sum: Option<String>,
    pub commit: Option<String>,
    pub strap: Option<String>,
}

/// Payload of a `host` or `target` recipe. A recipe with no script bodies
/// is legal and amounts to a no-op install.
#[derive(Debug, Clone, Default)]
pub struct BuildPayload {
    pub source: Option<SourceRef>,
    pub configure: Option<String>,
    pub build: Option<String>,
    pub install: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Source(SourcePayload),
    Build(BuildPayload),
}

/// One declarative build unit.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub namespace: Namespace,
    pub name: String,
    pub dependencies: Vec<Dependency>,
    pub image_dependencies: Vec<ImageDependency>,
    pub payload: Payload,
}

impl Recipe {
    /// `namespace/name`, as written in the DSL and on the command line.
    pub fn label(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn source_payload(&self) -> Option<&SourcePayload> {
        match &self.payload {
            Payload::Source(p) => Some(p),
            Payload::Build(_) => None,
        }
    }

    pub fn build_payload(&self) -> Option<&BuildPayload> {
        match &self.payload {
            Payload::Build(p) => Some(p),
            Payload::Source(_) => None,
        }
    }
}

/// Per-run mutable state of one recipe. Kept in a table beside the graph
/// (indexed by [`RecipeId`]) so the engine is the single owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    /// The user forced a rebuild of this recipe this run.
    pub invalidated: bool,
    /// Stage pipeline completed successfully this run.
    pub built: bool,
    /// Stage pipeline failed this run; poisons later traversals.
    pub failed: bool,
}

/// The parsed configuration: a flat recipe list plus the lookup table from
/// `(namespace, name)` to index.
#[derive(Debug, Default)]
pub struct Config {
    pub recipes: Vec<Recipe>,
    index: HashMap<(Namespace, String), RecipeId>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a recipe. Fails on a duplicate `(namespace, name)` pair;
    /// cross-namespace collisions are fine.
    pub fn push(&mut self, recipe: Recipe) -> Result<RecipeId, String> {
        let key = (recipe.namespace, recipe.name.clone());
        if self.index.contains_key(&key) {
            return Err(format!("duplicate recipe {}", recipe.label()));
        }
        let id = self.recipes.len();
        self.index.insert(key, id);
        self.recipes.push(recipe);
        Ok(id)
    }

    pub fn lookup(&self, namespace: Namespace, name: &str) -> Option<RecipeId> {
        self.index.get(&(namespace, name.to_string())).copied()
    }

    pub fn get(&self, id: RecipeId) -> &Recipe {
        &self.recipes[id]
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(namespace: Namespace, name: &str) -> Recipe {
        Recipe {
            namespace,
            name: name.to_string(),
            dependencies: Vec::new(),
            image_dependencies: Vec::new(),
            payload: Payload::Build(BuildPayload::default()),
        }
    }

    #[test]
    fn duplicate_names_rejected_within_namespace() {
        let mut cfg = Config::new();
        cfg.push(dummy(Namespace::Host, "gcc")).unwrap();
        assert!(cfg.push(dummy(Namespace::Host, "gcc")).is_err());
    }

    #[test]
    fn same_name_across_namespaces_is_fine() {
        let mut cfg = Config::new();
        cfg.push(dummy(Namespace::Host, "gcc")).unwrap();
        cfg.push(dummy(Namespace::Target, "gcc")).unwrap();
        assert_eq!(cfg.len(), 2);
        assert_ne!(
            cfg.lookup(Namespace::Host, "gcc"),
            cfg.lookup(Namespace::Target, "gcc")
        );
    }

    #[test]
    fn source_kind_field_rules() {
        assert!(SourceKind::parse("tar.gz").unwrap().is_tar());
        assert!(SourceKind::parse("tar.xz").unwrap().is_tar());
        assert!(!SourceKind::parse("git").unwrap().is_tar());
        assert!(SourceKind::parse("zip").is_none());
    }
}
