//! Reference resolution over the parsed recipe graph.
//!
//! Turns symbolic `(namespace, name)` dependency edges and host/target
//! `source:` references into recipe indices, applies `.chariot-overrides`
//! substitutions, and rejects dependency cycles. All failures here are
//! configuration errors and abort before any side effect.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::recipe::{Config, Namespace, Payload, RecipeId, SourceKind};

/// Substitute local trees for matching `source` recipes, then resolve every
/// edge, then reject cycles.
pub fn resolve(config: &mut Config, overrides: &[(String, PathBuf)]) -> Result<()> {
    apply_overrides(config, overrides);
    resolve_edges(config)?;
    check_cycles(config)
}

/// Rewrite each overridden `source` recipe to a `local` source rooted at
/// the override path. The recipe keeps its name, patch and strap script;
/// checksum and commit pins no longer apply to a local tree.
fn apply_overrides(config: &mut Config, overrides: &[(String, PathBuf)]) {
    for (name, path) in overrides {
        let Some(id) = config.lookup(Namespace::Source, name) else {
            eprintln!("  [WARN] override for unknown source recipe `{name}` ignored");
            continue;
        };
        let recipe = &mut config.recipes[id];
        if let Payload::Source(src) = &mut recipe.payload {
            tracing::debug!(
                "overriding source/{} with local tree {}",
                name,
                path.display()
            );
            src.kind = SourceKind::Local;
            src.url = path.to_string_lossy().into_owned();
            src.b2sum = None;
            src.commit = None;
        }
    }
}

fn resolve_edges(config: &mut Config) -> Result<()> {
    // Two passes because lookup borrows the config immutably.
    let mut edge_targets: Vec<Vec<RecipeId>> = Vec::with_capacity(config.len());
    let mut source_targets: Vec<Option<RecipeId>> = Vec::with_capacity(config.len());

    for recipe in &config.recipes {
        let mut targets = Vec::with_capacity(recipe.dependencies.len());
        for dep in &recipe.dependencies {
            match config.lookup(dep.namespace, &dep.name) {
                Some(id) => targets.push(id),
                None => bail!(
                    "{}: dependency {}/{} does not exist",
                    recipe.label(),
                    dep.namespace,
                    dep.name
                ),
            }
        }
        edge_targets.push(targets);

        let source_target = match &recipe.payload {
            Payload::Build(payload) => match &payload.source {
                Some(sref) => match config.lookup(Namespace::Source, &sref.name) {
                    Some(id) => Some(id),
                    None => bail!(
                        "{}: source reference `{}` does not exist",
                        recipe.label(),
                        sref.name
                    ),
                },
                None => None,
            },
            Payload::Source(_) => None,
        };
        source_targets.push(source_target);
    }

    for (recipe, targets) in config.recipes.iter_mut().zip(edge_targets) {
        for (dep, target) in recipe.dependencies.iter_mut().zip(targets) {
            dep.target = Some(target);
        }
    }
    for (recipe, target) in config.recipes.iter_mut().zip(source_targets) {
        if let Payload::Build(payload) = &mut recipe.payload {
            if let Some(sref) = &mut payload.source {
                sref.target = target;
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Depth-first colouring over dependency edges and source references. A
/// grey-to-grey edge closes a cycle; without this check the executor would
/// recurse until stack exhaustion.
fn check_cycles(config: &Config) -> Result<()> {
    let mut colours = vec![Colour::White; config.len()];
    for id in 0..config.len() {
        if colours[id] == Colour::White {
            visit(config, id, &mut colours)?;
        }
    }
    Ok(())
}

fn visit(config: &Config, id: RecipeId, colours: &mut [Colour]) -> Result<()> {
    colours[id] = Colour::Grey;
    let recipe = config.get(id);

    let mut edges: Vec<RecipeId> = Vec::new();
    if let Payload::Build(payload) = &recipe.payload {
        if let Some(sref) = &payload.source {
            edges.extend(sref.target);
        }
    }
    edges.extend(recipe.dependencies.iter().filter_map(|d| d.target));

    for next in edges {
        match colours[next] {
            Colour::Grey => bail!(
                "dependency cycle: {} -> {}",
                recipe.label(),
                config.get(next).label()
            ),
            Colour::White => visit(config, next, colours)?,
            Colour::Black => {}
        }
    }
    colours[id] = Colour::Black;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{BuildPayload, Dependency, Recipe, SourcePayload, SourceRef};

    fn source(name: &str) -> Recipe {
        Recipe {
            namespace: Namespace::Source,
            name: name.to_string(),
            dependencies: Vec::new(),
            image_dependencies: Vec::new(),
            payload: Payload::Source(SourcePayload {
                kind: SourceKind::Local,
                url: name.to_string(),
                patch: None,
                b2sum: None,
                commit: None,
                strap: None,
            }),
        }
    }

    fn tool(namespace: Namespace, name: &str, deps: &[(Namespace, &str)]) -> Recipe {
        Recipe {
            namespace,
            name: name.to_string(),
            dependencies: deps
                .iter()
                .map(|(ns, n)| Dependency {
                    namespace: *ns,
                    name: n.to_string(),
                    runtime: false,
                    target: None,
                })
                .collect(),
            image_dependencies: Vec::new(),
            payload: Payload::Build(BuildPayload::default()),
        }
    }

    #[test]
    fn resolves_edges_to_indices() {
        let mut cfg = Config::new();
        cfg.push(source("src")).unwrap();
        cfg.push(tool(Namespace::Host, "a", &[])).unwrap();
        cfg.push(tool(Namespace::Target, "b", &[(Namespace::Host, "a")]))
            .unwrap();
        resolve(&mut cfg, &[]).unwrap();
        let b = cfg.lookup(Namespace::Target, "b").unwrap();
        let a = cfg.lookup(Namespace::Host, "a").unwrap();
        assert_eq!(cfg.get(b).dependencies[0].target, Some(a));
    }

    #[test]
    fn unresolved_edge_names_the_reference() {
        let mut cfg = Config::new();
        cfg.push(tool(Namespace::Host, "a", &[(Namespace::Host, "ghost")]))
            .unwrap();
        let err = resolve(&mut cfg, &[]).unwrap_err();
        assert!(err.to_string().contains("host/ghost"), "{err}");
    }

    #[test]
    fn source_ref_resolves_into_source_namespace_only() {
        let mut cfg = Config::new();
        cfg.push(source("common")).unwrap();
        let mut t = tool(Namespace::Host, "common", &[]);
        // host/common exists, but the ref must land on source/common.
        t.payload = Payload::Build(BuildPayload {
            source: Some(SourceRef { name: "common".into(), target: None }),
            ..Default::default()
        });
        cfg.push(t).unwrap();
        resolve(&mut cfg, &[]).unwrap();
        let host = cfg.lookup(Namespace::Host, "common").unwrap();
        let src = cfg.lookup(Namespace::Source, "common").unwrap();
        let payload = cfg.get(host).build_payload().unwrap();
        assert_eq!(payload.source.as_ref().unwrap().target, Some(src));
    }

    #[test]
    fn missing_source_ref_is_fatal() {
        let mut cfg = Config::new();
        let mut t = tool(Namespace::Host, "a", &[]);
        t.payload = Payload::Build(BuildPayload {
            source: Some(SourceRef { name: "ghost".into(), target: None }),
            ..Default::default()
        });
        cfg.push(t).unwrap();
        let err = resolve(&mut cfg, &[]).unwrap_err();
        assert!(err.to_string().contains("ghost"), "{err}");
    }

    #[test]
    fn cycle_is_fatal_and_names_an_edge() {
        let mut cfg = Config::new();
        cfg.push(tool(Namespace::Host, "a", &[(Namespace::Host, "b")]))
            .unwrap();
        cfg.push(tool(Namespace::Host, "b", &[(Namespace::Host, "a")]))
            .unwrap();
        let err = resolve(&mut cfg, &[]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("dependency cycle"), "{msg}");
        assert!(msg.contains("host/a") && msg.contains("host/b"), "{msg}");
    }

    #[test]
    fn self_cycle_is_fatal() {
        let mut cfg = Config::new();
        cfg.push(tool(Namespace::Host, "a", &[(Namespace::Host, "a")]))
            .unwrap();
        assert!(resolve(&mut cfg, &[]).is_err());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut cfg = Config::new();
        cfg.push(tool(Namespace::Host, "base", &[])).unwrap();
        cfg.push(tool(Namespace::Host, "left", &[(Namespace::Host, "base")]))
            .unwrap();
        cfg.push(tool(Namespace::Host, "right", &[(Namespace::Host, "base")]))
            .unwrap();
        cfg.push(tool(
            Namespace::Host,
            "top",
            &[(Namespace::Host, "left"), (Namespace::Host, "right")],
        ))
        .unwrap();
        resolve(&mut cfg, &[]).unwrap();
    }

    #[test]
    fn override_rewrites_source_to_local() {
        let mut cfg = Config::new();
        let mut s = source("mlibc");
        if let Payload::Source(p) = &mut s.payload {
            p.kind = SourceKind::Git;
            p.url = "https://example.org/mlibc.git".into();
            p.commit = Some("deadbeef".into());
        }
        cfg.push(s).unwrap();
        resolve(&mut cfg, &[("mlibc".to_string(), PathBuf::from("/src/mlibc"))]).unwrap();
        let id = cfg.lookup(Namespace::Source, "mlibc").unwrap();
        let p = cfg.get(id).source_payload().unwrap();
        assert_eq!(p.kind, SourceKind::Local);
        assert_eq!(p.url, "/src/mlibc");
        assert!(p.commit.is_none());
    }
}
