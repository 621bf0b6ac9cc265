//! Engine integration tests over local source pipelines.
//!
//! These exercise the parse -> resolve -> process path end to end with
//! real cache directories. Stages that need the container (wget, pacman,
//! build scripts) are covered at the unit level instead; local sources
//! run entirely host-side.

mod helpers;

use helpers::TestEnv;

use chariot::recipe::Namespace;

#[test]
fn local_source_happy_path() {
    let env = TestEnv::new();
    env.write_tree("fx", &[("hello.txt", "hello\n"), ("sub/nested.txt", "deep\n")]);
    env.write_config("source/foo { type: local\n url: fx }");

    let mut engine = env.engine();
    let id = engine.config().lookup(Namespace::Source, "foo").unwrap();
    engine.invalidate(id);
    engine.process(id).unwrap();

    let src = env.cache().join("source/foo/src");
    assert_eq!(std::fs::read_to_string(src.join("hello.txt")).unwrap(), "hello\n");
    assert_eq!(std::fs::read_to_string(src.join("sub/nested.txt")).unwrap(), "deep\n");
}

#[test]
fn second_run_skips_built_recipes() {
    let env = TestEnv::new();
    env.write_tree("fx", &[("hello.txt", "hello\n")]);
    env.write_config("source/foo { type: local\n url: fx }");

    let mut first = env.engine();
    let id = first.config().lookup(Namespace::Source, "foo").unwrap();
    first.invalidate(id);
    first.process(id).unwrap();

    // Remove the origin tree: a second run must not need it, because the
    // recipe directory already exists and is not invalidated.
    std::fs::remove_dir_all(env.path().join("fx")).unwrap();

    let mut second = env.engine();
    let id = second.config().lookup(Namespace::Source, "foo").unwrap();
    second.process(id).unwrap();
    assert!(second.status(id).built);
    assert!(env.cache().join("source/foo/src/hello.txt").exists());
}

#[test]
fn failed_fetch_leaves_no_recipe_directory() {
    let env = TestEnv::new();
    env.write_config("source/bar { type: local\n url: does-not-exist }");

    let mut engine = env.engine();
    let id = engine.config().lookup(Namespace::Source, "bar").unwrap();
    engine.invalidate(id);
    assert!(engine.process(id).is_err());
    assert!(!env.cache().join("source/bar").exists());
}

#[test]
fn dependencies_are_processed_before_dependents() {
    let env = TestEnv::new();
    env.write_tree("lib-tree", &[("lib.c", "int x;\n")]);
    env.write_tree("app-tree", &[("app.c", "int main;\n")]);
    env.write_config(
        r#"
        source/lib { type: local
            url: lib-tree }
        source/app { type: local
            url: app-tree
            dependencies: [ source/lib ] }
        "#,
    );

    let mut engine = env.engine();
    let app = engine.config().lookup(Namespace::Source, "app").unwrap();
    let lib = engine.config().lookup(Namespace::Source, "lib").unwrap();
    engine.invalidate(app);
    engine.process(app).unwrap();

    assert!(engine.status(lib).built, "dependency must be visited first");
    assert!(engine.status(app).built);
    assert!(env.cache().join("source/lib/src/lib.c").exists());
    assert!(env.cache().join("source/app/src/app.c").exists());
}

#[test]
fn overridden_source_fetches_from_local_tree() {
    let env = TestEnv::new();
    env.write_tree("work", &[("README", "local checkout\n")]);
    env.write_config(
        r#"
        source/upstream {
            type: git
            url: https://example.org/upstream.git
            commit: abc123
        }
        "#,
    );
    std::fs::write(env.path().join(".chariot-overrides"), "upstream: work\n").unwrap();

    let mut engine = env.engine();
    let id = engine.config().lookup(Namespace::Source, "upstream").unwrap();
    engine.invalidate(id);
    // A git fetch would need the container; the override makes this a
    // host-side copy of the local tree.
    engine.process(id).unwrap();
    assert_eq!(
        std::fs::read_to_string(env.cache().join("source/upstream/src/README")).unwrap(),
        "local checkout\n"
    );
}
