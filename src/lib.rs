//! Chariot - build orchestrator for bootstrapping an operating system from
//! source.
//!
//! The engine resolves a declarative recipe configuration into a typed
//! dependency graph and drives each recipe through fetch/configure/build/
//! install inside an unprivileged Linux container assembled from a pinned,
//! layered rootfs.

pub mod container;
pub mod context;
pub mod executor;
pub mod fsutil;
pub mod host;
pub mod interp;
pub mod layers;
pub mod lock;
pub mod parser;
pub mod recipe;
pub mod resolve;
