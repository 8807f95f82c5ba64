//! A builder driven by a command template.
//!
//! The template is expanded with `_TARGET` and `_SOURCES` bound to the
//! operation's target and effective sources, so one [`CommandBuilder`]
//! instance can serve any number of targets.

use std::thread;

use crate::builder::{
  BuildOperation, Builder, BuilderOutcome, PendingHandle, execute, prepare_target, standard_build,
};
use crate::cache::{Cache, RegisterOptions, UpToDateOptions};
use crate::env::Env;
use crate::error::BuildError;
use crate::varset::{Value, VarSet};

/// Automatic conversion of sources a command cannot consume directly.
///
/// Sources whose suffix is not accepted are routed through whichever
/// registered builder produces the intermediate suffix from them, and the
/// intermediate becomes the effective source.
#[derive(Clone, Debug)]
pub struct SourceConversion {
  /// Suffixes the command consumes as-is, leading dot included.
  pub accepted_suffixes: Vec<String>,
  /// Suffix of the intermediate file to convert other sources into.
  pub intermediate_suffix: String,
}

/// A reusable builder that expands a command template and runs it.
pub struct CommandBuilder {
  name: String,
  template: Value,
  defaults: VarSet,
  background: bool,
  conversion: Option<SourceConversion>,
  produces_rule: Option<(String, Vec<String>)>,
}

impl CommandBuilder {
  /// Create a builder running the given argv template. Each element may
  /// contain `${name}` references, including `${_TARGET}` and
  /// `${_SOURCES}`.
  pub fn new(name: impl Into<String>, template: &[&str]) -> Self {
    Self {
      name: name.into(),
      template: Value::from(template),
      defaults: VarSet::new(),
      background: false,
      conversion: None,
      produces_rule: None,
    }
  }

  /// Run the command on its own thread and report
  /// [`BuilderOutcome::Pending`], letting the driver overlap other work.
  pub fn with_background(mut self) -> Self {
    self.background = true;
    self
  }

  /// Convert sources that the command cannot consume directly.
  pub fn with_conversion(mut self, conversion: SourceConversion) -> Self {
    self.conversion = Some(conversion);
    self
  }

  /// Advertise that this builder produces `target_suffix` files from any
  /// of `source_suffixes`, making it discoverable for source conversion.
  pub fn with_produces(mut self, target_suffix: &str, source_suffixes: &[&str]) -> Self {
    self.produces_rule = Some((
      target_suffix.to_owned(),
      source_suffixes.iter().map(|s| (*s).to_owned()).collect(),
    ));
    self
  }

  /// Construction variables contributed at registration time.
  pub fn with_default_variables(mut self, defaults: VarSet) -> Self {
    self.defaults = defaults;
    self
  }

  /// Expand the command template for one operation. Expansion is a pure
  /// function of the operation's variables, so it yields the same command
  /// before launch and at finalize time.
  fn command_for(&self, operation: &BuildOperation) -> Result<Vec<String>, BuildError> {
    let mut vars = operation.vars.clone();
    vars.set("_TARGET", operation.target.as_str());
    vars.set("_SOURCES", operation.sources.clone());
    Ok(vars.expand(&self.template)?)
  }

  fn short_desc(&self, operation: &BuildOperation) -> String {
    format!("{} {}", self.name, operation.target)
  }
}

impl Builder for CommandBuilder {
  fn name(&self) -> &str {
    &self.name
  }

  fn default_variables(&self, _env: &Env) -> VarSet {
    self.defaults.clone()
  }

  fn produces(&self, target: &str, source: &str) -> bool {
    let Some((target_suffix, source_suffixes)) = &self.produces_rule else {
      return false;
    };
    target.ends_with(target_suffix.as_str())
      && source_suffixes.iter().any(|s| source.ends_with(s.as_str()))
  }

  fn setup(&self, operation: &BuildOperation, env: &mut Env) -> Result<Vec<String>, BuildError> {
    let Some(conversion) = &self.conversion else {
      return Ok(operation.sources.clone());
    };
    let mut effective = Vec::with_capacity(operation.sources.len());
    for source in &operation.sources {
      if conversion
        .accepted_suffixes
        .iter()
        .any(|s| source.ends_with(s.as_str()))
      {
        effective.push(source.clone());
        continue;
      }
      let intermediate = env.get_build_fname(source, &conversion.intermediate_suffix);
      let producer =
        env
          .find_producer(&intermediate, source)
          .ok_or_else(|| BuildError::NoProducer {
            target: intermediate.clone(),
            src: source.clone(),
          })?;
      let registered = env.register_with_builder(
        producer,
        &intermediate,
        std::slice::from_ref(source),
        operation.vars.clone(),
      )?;
      effective.push(registered);
    }
    Ok(effective)
  }

  fn run(
    &self,
    operation: &BuildOperation,
    env: &Env,
    cache: &Cache,
  ) -> Result<BuilderOutcome, BuildError> {
    let command = self.command_for(operation)?;
    if !self.background {
      return standard_build(
        &self.short_desc(operation),
        &operation.target,
        &command,
        &operation.sources,
        env,
        cache,
      );
    }

    if cache.is_up_to_date(
      &[&operation.target],
      &command,
      &operation.sources,
      env,
      UpToDateOptions::default(),
    ) {
      return Ok(BuilderOutcome::Success(operation.target.clone()));
    }
    prepare_target(&operation.target, cache)?;
    let desc = self.short_desc(operation);
    let handle = thread::spawn(move || execute(&desc, &command));
    Ok(BuilderOutcome::Pending(PendingHandle::new(handle)))
  }

  fn finalize(
    &self,
    operation: &BuildOperation,
    env: &Env,
    cache: &Cache,
    command_ok: bool,
  ) -> Result<BuilderOutcome, BuildError> {
    if !command_ok {
      return Ok(BuilderOutcome::Failure);
    }
    let command = self.command_for(operation)?;
    cache.register_build(
      &[&operation.target],
      &command,
      &operation.sources,
      env,
      RegisterOptions::default(),
    );
    Ok(BuilderOutcome::Success(operation.target.clone()))
  }
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::sync::Arc;

  use tempfile::TempDir;

  use super::*;

  fn test_cache(temp: &TempDir) -> Cache {
    Cache::load(temp.path().join(".girder-cache"))
  }

  #[cfg(unix)]
  #[test]
  fn command_builds_and_skips_when_current() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let source = temp.path().join("in.txt");
    let target = temp.path().join("out.txt");
    fs::write(&source, "contents").unwrap();

    let mut env = Env::new();
    env.add_builder(Arc::new(CommandBuilder::new(
      "Copy",
      &["cp", "${_SOURCES}", "${_TARGET}"],
    )));
    let target_str = target.to_string_lossy().into_owned();
    let source_str = source.to_string_lossy().into_owned();
    env
      .register_target(&target_str, "Copy", &[&source_str], VarSet::new())
      .unwrap();
    env.process(&cache).unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), "contents");

    // A second pass finds the target current and leaves it alone.
    let before = fs::metadata(&target).unwrap().modified().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    cache.clear_checksum_cache();
    env
      .register_target(&target_str, "Copy", &[&source_str], VarSet::new())
      .unwrap();
    env.process(&cache).unwrap();
    assert_eq!(fs::metadata(&target).unwrap().modified().unwrap(), before);
  }

  #[cfg(unix)]
  #[test]
  fn background_command_resolves_through_finalize() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let source = temp.path().join("in.txt");
    let target = temp.path().join("out.txt");
    fs::write(&source, "contents").unwrap();

    let mut env = Env::new();
    env.add_builder(Arc::new(
      CommandBuilder::new("Copy", &["cp", "${_SOURCES}", "${_TARGET}"]).with_background(),
    ));
    let target_str = target.to_string_lossy().into_owned();
    let source_str = source.to_string_lossy().into_owned();
    env
      .register_target(&target_str, "Copy", &[&source_str], VarSet::new())
      .unwrap();
    env.process(&cache).unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), "contents");

    // The finalize path registered the build.
    assert!(cache.is_up_to_date(
      &[&target_str],
      &vec![
        "cp".to_owned(),
        source_str.clone(),
        target_str.clone()
      ],
      &[source_str],
      &env,
      UpToDateOptions::default()
    ));
  }

  #[cfg(unix)]
  #[test]
  fn failing_background_command_is_a_build_failure() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);

    let mut env = Env::new();
    env.add_builder(Arc::new(
      CommandBuilder::new("False", &["false"]).with_background(),
    ));
    let target = temp.path().join("never").to_string_lossy().into_owned();
    env.register_target(&target, "False", &[], VarSet::new()).unwrap();
    let err = env.process(&cache).unwrap_err();
    assert!(matches!(err, BuildError::BuildFailure { targets } if targets == vec![target]));
  }

  #[cfg(unix)]
  #[test]
  fn sources_are_converted_through_a_producer() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let source = temp.path().join("page.src");
    fs::write(&source, "raw").unwrap();

    let mut env = Env::new();
    env.set_build_root(temp.path().join("build").to_string_lossy().into_owned());
    env.add_builder(Arc::new(
      CommandBuilder::new("Stage", &["cp", "${_SOURCES}", "${_TARGET}"])
        .with_produces(".mid", &[".src"]),
    ));
    env.add_builder(Arc::new(
      CommandBuilder::new("Publish", &["cp", "${_SOURCES}", "${_TARGET}"]).with_conversion(
        SourceConversion {
          accepted_suffixes: vec![".mid".to_owned()],
          intermediate_suffix: ".mid".to_owned(),
        },
      ),
    ));

    let out = temp.path().join("page.out").to_string_lossy().into_owned();
    let source_str = source.to_string_lossy().into_owned();
    env
      .register_target(&out, "Publish", &[&source_str], VarSet::new())
      .unwrap();

    // The intermediate target was registered automatically.
    assert_eq!(env.target_names().len(), 2);

    env.process(&cache).unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "raw");
  }

  #[test]
  fn conversion_without_a_producer_is_an_error() {
    let mut env = Env::new();
    env.add_builder(Arc::new(
      CommandBuilder::new("Link", &["ld", "${_SOURCES}"]).with_conversion(SourceConversion {
        accepted_suffixes: vec![".o".to_owned()],
        intermediate_suffix: ".o".to_owned(),
      }),
    ));
    let err = env
      .register_target("app", "Link", &["app.c"], VarSet::new())
      .unwrap_err();
    assert!(matches!(err, BuildError::NoProducer { src, .. } if src == "app.c"));
  }

  #[test]
  fn produces_matches_suffix_pairs() {
    let builder = CommandBuilder::new("Compile", &["cc"]).with_produces(".o", &[".c", ".cc"]);
    assert!(builder.produces("main.o", "main.c"));
    assert!(builder.produces("main.o", "main.cc"));
    assert!(!builder.produces("main.o", "main.rs"));
    assert!(!builder.produces("main.a", "main.c"));
  }
}
