use crate::builder::{BuildOperation, Builder, BuilderOutcome};
use crate::cache::Cache;
use crate::env::Env;
use crate::error::BuildError;

/// A synchronization point with no build action.
///
/// A barrier target succeeds immediately once its sources are done; its
/// purpose is purely to order scheduling, so it never touches the cache.
pub struct Barrier;

impl Builder for Barrier {
  fn name(&self) -> &str {
    "Barrier"
  }

  fn run(
    &self,
    operation: &BuildOperation,
    _env: &Env,
    _cache: &Cache,
  ) -> Result<BuilderOutcome, BuildError> {
    Ok(BuilderOutcome::Success(operation.target.clone()))
  }
}
