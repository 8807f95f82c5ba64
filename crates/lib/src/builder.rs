//! The builder protocol.
//!
//! A [`Builder`] is a named, reusable description of one kind of build
//! step. Registered builders are looked up by name when targets are
//! declared; at build time each target's builder is invoked through
//! [`Builder::run`] and reports a [`BuilderOutcome`].

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use tracing::info;

use crate::cache::{Cache, RegisterOptions, UpToDateOptions};
use crate::env::Env;
use crate::error::BuildError;
use crate::phony_target;
use crate::varset::VarSet;

/// Everything a builder needs to produce one target.
#[derive(Clone)]
pub struct BuildOperation {
  pub builder: Arc<dyn Builder>,
  pub target: String,
  pub sources: Vec<String>,
  pub vars: VarSet,
}

impl fmt::Debug for BuildOperation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BuildOperation")
      .field("builder", &self.builder.name())
      .field("target", &self.target)
      .field("sources", &self.sources)
      .finish_non_exhaustive()
  }
}

/// A handle to a build command still running on its own thread.
#[derive(Debug)]
pub struct PendingHandle {
  handle: thread::JoinHandle<bool>,
}

impl PendingHandle {
  pub fn new(handle: thread::JoinHandle<bool>) -> Self {
    Self { handle }
  }

  /// Wait for the command to finish; a panicked thread counts as failure.
  pub fn join(self) -> bool {
    self.handle.join().unwrap_or(false)
  }
}

/// What a builder invocation produced.
#[derive(Debug)]
pub enum BuilderOutcome {
  /// The target was produced (or found current); carries the target name.
  Success(String),
  /// The build action ran and failed.
  Failure,
  /// A command was launched in the background; the driver joins the handle
  /// and then calls [`Builder::finalize`].
  Pending(PendingHandle),
  /// This builder delegated to another operation to run in its place.
  Chain(Box<BuildOperation>),
}

/// One kind of build step.
///
/// `run` may be called again for a target that already succeeded in a past
/// invocation, so implementations consult the cache and skip work that is
/// already done.
pub trait Builder: Send + Sync {
  /// The name targets are registered under.
  fn name(&self) -> &str;

  /// Construction variables to contribute when the builder is registered.
  /// Existing variables are not overwritten.
  fn default_variables(&self, _env: &Env) -> VarSet {
    VarSet::new()
  }

  /// Map a requested target name to the actual output path.
  fn target_name(&self, requested: &str, _env: &Env) -> String {
    requested.to_owned()
  }

  /// Whether this builder can produce `target` from `source`. Used to
  /// locate producers for intermediate files.
  fn produces(&self, _target: &str, _source: &str) -> bool {
    false
  }

  /// Inspect and transform the source list at registration time. The
  /// returned list becomes the operation's effective sources; additional
  /// intermediate targets may be registered on `env`.
  fn setup(&self, operation: &BuildOperation, _env: &mut Env) -> Result<Vec<String>, BuildError> {
    Ok(operation.sources.clone())
  }

  /// Produce the operation's target.
  fn run(
    &self,
    operation: &BuildOperation,
    env: &Env,
    cache: &Cache,
  ) -> Result<BuilderOutcome, BuildError>;

  /// Complete a build whose command ran in the background. `command_ok` is
  /// the joined command result. Must resolve to success or failure.
  fn finalize(
    &self,
    operation: &BuildOperation,
    _env: &Env,
    _cache: &Cache,
    _command_ok: bool,
  ) -> Result<BuilderOutcome, BuildError> {
    Err(BuildError::InvalidBuilderResult {
      builder: self.name().to_owned(),
      target: operation.target.clone(),
      detail: "builder returned a pending handle but does not implement finalize".to_owned(),
    })
  }
}

/// Run a command to completion, logging a short description first.
///
/// Returns true if the command ran and exited successfully. A command that
/// cannot be spawned is a failure, not an error.
pub fn execute(short_desc: &str, command: &[String]) -> bool {
  info!("{short_desc}");
  let Some((program, args)) = command.split_first() else {
    return false;
  };
  match Command::new(program).args(args).status() {
    Ok(status) => status.success(),
    Err(err) => {
      tracing::error!(command = %program, error = %err, "failed to run command");
      false
    }
  }
}

/// Prepare the filesystem for writing `target`: create its parent
/// directory and remove any stale copy. No-op for phony targets.
pub fn prepare_target(target: &str, cache: &Cache) -> Result<(), BuildError> {
  if phony_target(target) {
    return Ok(());
  }
  if let Some(parent) = Path::new(target).parent()
    && !parent.as_os_str().is_empty()
  {
    cache.mkdir_tracked(parent, false)?;
  }
  match fs::remove_file(target) {
    Ok(()) => Ok(()),
    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(err) => Err(err.into()),
  }
}

/// The common synchronous build shape: skip if the cache says the target
/// is current, otherwise prepare, run the command, and register the build.
pub fn standard_build(
  short_desc: &str,
  target: &str,
  command: &[String],
  sources: &[String],
  env: &Env,
  cache: &Cache,
) -> Result<BuilderOutcome, BuildError> {
  let up_to_date_opts = UpToDateOptions::default();
  if !cache.is_up_to_date(&[target], &command, sources, env, up_to_date_opts) {
    prepare_target(target, cache)?;
    if !execute(short_desc, command) {
      return Ok(BuilderOutcome::Failure);
    }
    cache.register_build(&[target], &command, sources, env, RegisterOptions::default());
  }
  Ok(BuilderOutcome::Success(target.to_owned()))
}
