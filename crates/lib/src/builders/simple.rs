use crate::builder::{BuildOperation, Builder, BuilderOutcome};
use crate::cache::Cache;
use crate::env::Env;
use crate::error::BuildError;

type Action = Box<
  dyn Fn(&BuildOperation, &Env, &Cache) -> Result<BuilderOutcome, BuildError> + Send + Sync,
>;

/// A builder defined inline by a closure.
///
/// Useful for one-off build steps that do not justify a dedicated type.
/// The closure receives the full operation and is responsible for its own
/// cache interaction.
pub struct SimpleBuilder {
  name: String,
  action: Action,
}

impl SimpleBuilder {
  pub fn new<F>(name: impl Into<String>, action: F) -> Self
  where
    F: Fn(&BuildOperation, &Env, &Cache) -> Result<BuilderOutcome, BuildError>
      + Send
      + Sync
      + 'static,
  {
    Self {
      name: name.into(),
      action: Box::new(action),
    }
  }
}

impl Builder for SimpleBuilder {
  fn name(&self) -> &str {
    &self.name
  }

  fn run(
    &self,
    operation: &BuildOperation,
    env: &Env,
    cache: &Cache,
  ) -> Result<BuilderOutcome, BuildError> {
    (self.action)(operation, env, cache)
  }
}
