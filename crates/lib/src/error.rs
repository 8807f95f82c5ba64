//! Crate-level error taxonomy.
//!
//! Cache corruption is deliberately absent here: an unreadable cache store
//! is recovered locally by treating it as empty (see [`crate::cache::Cache::load`]),
//! with the consequence of a full rebuild rather than a failed run.

use thiserror::Error;

use crate::varset::ExpandError;

/// Errors surfaced by the resolver, the scheduler, and the builder protocol.
#[derive(Debug, Error)]
pub enum BuildError {
  /// One or more targets' build actions failed.
  #[error("failed to build {}", targets.join(", "))]
  BuildFailure {
    /// Every target whose build action failed, not just the first.
    targets: Vec<String>,
  },

  /// The target graph is self- or mutually-referential.
  #[error("circular dependency detected at target {0}")]
  CircularDependency(String),

  /// A builder violated the outcome contract.
  #[error("builder {builder} returned an invalid result for {target}: {detail}")]
  InvalidBuilderResult {
    builder: String,
    target: String,
    detail: String,
  },

  /// A variable expansion hit a non-expandable value. Programmer error in
  /// variable setup, not a recoverable build condition.
  #[error(transparent)]
  Unexpandable(#[from] ExpandError),

  /// A target registration referenced a builder id that is not registered.
  #[error("no builder named {0} is registered")]
  UnknownBuilder(String),

  /// No registered builder can produce a needed intermediate target.
  #[error("no builder produces {target} from {src}")]
  NoProducer { target: String, src: String },

  /// I/O error (cache persistence, target preparation).
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
