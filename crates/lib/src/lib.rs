//! girder: a general-purpose build orchestrator.
//!
//! Given a set of declared output targets, each produced from source files by
//! a named builder, girder determines which outputs are stale, builds them in
//! dependency order, and persists enough state to avoid redundant work on the
//! next invocation, including across parallel execution.
//!
//! The core pieces:
//! - [`varset::VarSet`]: construction variables and `${name}` expansion
//! - [`cache::Cache`]: the persisted record of what built each target
//! - [`env::Env`]: the target registry and sequential build driver
//! - [`scheduler`]: the bounded parallel job scheduler
//! - [`builder::Builder`]: the contract every build-step type implements

pub mod builder;
pub mod builders;
pub mod cache;
pub mod consts;
pub mod env;
pub mod error;
pub mod hash;
pub mod jobs;
pub mod scheduler;
pub mod varset;

/// Returns true if a target name denotes a phony (non-file) target.
///
/// Phony target names begin with `:` and never correspond to a filesystem
/// artifact; the cache stores an empty checksum for them.
pub fn phony_target(name: &str) -> bool {
  name.starts_with(':')
}
