//! Chariot CLI.
//!
//! Builds the forced recipes named on the command line, or runs a shell
//! command in the base rootfs with `--exec`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;

use chariot::context::{parse_user_vars, CacheLayout, Context};
use chariot::executor::Engine;
use chariot::layers;
use chariot::lock::CacheLock;
use chariot::parser::{load_overrides, parse_config};
use chariot::resolve::resolve;

#[derive(Parser)]
#[command(name = "chariot")]
#[command(about = "Build orchestrator for bootstrapping an operating system from source")]
#[command(after_help = "RECIPES:\n  Named as <source|host|target>/<name>, e.g. `chariot host/gcc target/mlibc`.\n  Forced recipes rebuild even when cached.")]
struct Cli {
    /// Root configuration file
    #[arg(long, default_value = "chariot.conf")]
    config: PathBuf,

    /// Cache directory
    #[arg(long, default_value = ".chariot-cache")]
    cache: PathBuf,

    /// Enable debug diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Suppress container output and most progress
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,

    /// Hide dependency staging overlap warnings
    #[arg(long)]
    hide_conflicts: bool,

    /// User variable, available to scripts as @(KEY) and $OPTION_KEY
    #[arg(short = 'o', long = "var", value_name = "KEY=VAL")]
    var: Vec<String>,

    /// Wipe each built recipe's persistent cache/ tree
    #[arg(long)]
    clean_cache: bool,

    /// Delete the image-set layer tree before the run
    #[arg(long)]
    wipe_container: bool,

    /// Value of @(thread_count) for build scripts
    #[arg(long, value_name = "N")]
    thread_count: Option<usize>,

    /// Skip the cache lockfile
    #[arg(long)]
    no_lockfile: bool,

    /// Run a shell command in the base rootfs and exit
    #[arg(long, value_name = "CMD", conflicts_with = "recipes")]
    exec: Option<String>,

    /// Recipes to build
    recipes: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config_dir = match cli.config.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };

    let ctx = Context {
        cache: CacheLayout::new(&cli.cache),
        config_dir: config_dir.clone(),
        user_vars: parse_user_vars(&cli.var),
        quiet: cli.quiet,
        hide_conflicts: cli.hide_conflicts,
        clean_cache: cli.clean_cache,
        thread_count: cli.thread_count.unwrap_or_else(Context::default_thread_count),
    };

    // One engine instance per cache; held until exit.
    let _lock = if cli.no_lockfile {
        CacheLock::disabled()
    } else {
        CacheLock::acquire(&ctx.cache.lock_path())?
    };

    if cli.wipe_container {
        layers::wipe(&ctx)?;
    }

    let mut config = parse_config(&cli.config)?;
    let overrides = load_overrides(&config_dir)?;
    resolve(&mut config, &overrides).context("configuration error")?;

    let mut engine = Engine::new(config, ctx);

    if let Some(command) = &cli.exec {
        let code = engine.exec(command)?;
        return Ok(ExitCode::from(code.clamp(0, 255) as u8));
    }

    if cli.recipes.is_empty() {
        eprintln!("  [WARN] nothing to do (no recipes given)");
        return Ok(ExitCode::SUCCESS);
    }

    if engine.run(&cli.recipes)? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "chariot=debug"
    } else if cli.quiet {
        "chariot=warn"
    } else {
        "chariot=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_target(false)
        .init();
}
