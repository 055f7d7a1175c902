//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (`core-remote`, `core-runtime`). Host applications can
//! depend on `relay-workspace` and enable `desktop-shims` to get a node
//! coordinator wired to the reqwest-backed transport without depending on each
//! crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_remote as remote;

#[cfg(feature = "desktop-shims")]
pub use core_runtime as runtime;
