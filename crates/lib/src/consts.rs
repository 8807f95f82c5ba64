//! Crate-wide constants.

/// Default name of the on-disk cache file within a build directory.
pub const CACHE_FILE_NAME: &str = ".girder-cache";

/// Prefix applied to phony target names when forming on-disk cache keys,
/// so that a phony entry can never collide with a real file path.
pub const PHONY_PREFIX: &str = ":PHONY:";

/// Cache format/tool version recorded in the cache file.
pub const CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");
