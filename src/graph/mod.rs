//! Dependency graph over declared units.

pub mod analysis;
pub mod builder;
pub mod layers;

pub use builder::{DependencyGraph, EdgeKind, build};
