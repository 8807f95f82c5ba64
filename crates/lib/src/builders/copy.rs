//! Copying files and directory trees, with install semantics layered on
//! top of the same implementation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::builder::{BuildOperation, Builder, BuilderOutcome};
use crate::cache::{Cache, RegisterOptions, UpToDateOptions};
use crate::env::Env;
use crate::error::BuildError;

/// Copies sources to a target path or into a target directory.
///
/// With multiple sources, or when the target or a source is a directory,
/// the target is treated as a directory and sources are copied into it;
/// directory sources are walked recursively. Each copied file gets its
/// own cache record, so unchanged files are skipped on later runs.
///
/// The same type implements the install operation: install records carry
/// a distinguishing flag in the cache, and an install builder can be
/// disabled wholesale, turning its targets into no-ops.
pub struct CopyBuilder {
  name: String,
  install: bool,
  enabled: bool,
}

impl CopyBuilder {
  /// A plain copy builder, always enabled.
  pub fn new() -> Self {
    Self {
      name: "Copy".to_owned(),
      install: false,
      enabled: true,
    }
  }

  /// An install builder. When `enabled` is false, registered install
  /// targets succeed without copying anything, so a build phase can
  /// declare installs that only a dedicated install phase performs.
  pub fn install(enabled: bool) -> Self {
    Self {
      name: "Install".to_owned(),
      install: true,
      enabled,
    }
  }

  fn copy_one(&self, src: &str, dest: &Path, env: &Env, cache: &Cache) -> Result<(), BuildError> {
    let dest_str = dest.to_string_lossy().into_owned();
    let command = (self.name.as_str(), src, dest_str.as_str());
    let deps = vec![src.to_owned()];
    if cache.is_up_to_date(&[&dest_str], &command, &deps, env, UpToDateOptions::default()) {
      return Ok(());
    }
    info!("{} {} => {}", self.name, src, dest_str);
    if let Some(parent) = dest.parent()
      && !parent.as_os_str().is_empty()
    {
      cache.mkdir_tracked(parent, self.install)?;
    }
    match fs::remove_file(dest) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::NotFound => {}
      Err(err) => return Err(err.into()),
    }
    fs::copy(src, dest)?;
    cache.register_build(
      &[&dest_str],
      &command,
      &deps,
      env,
      RegisterOptions {
        install: self.install,
        ..Default::default()
      },
    );
    Ok(())
  }
}

impl Default for CopyBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl Builder for CopyBuilder {
  fn name(&self) -> &str {
    &self.name
  }

  fn run(
    &self,
    operation: &BuildOperation,
    env: &Env,
    cache: &Cache,
  ) -> Result<BuilderOutcome, BuildError> {
    if !self.enabled {
      return Ok(BuilderOutcome::Success(operation.target.clone()));
    }

    let target = Path::new(&operation.target);
    let dir_mode = operation.sources.len() > 1
      || target.is_dir()
      || operation
        .sources
        .first()
        .is_some_and(|s| Path::new(s).is_dir());

    for source in &operation.sources {
      let source_path = Path::new(source);
      if source_path.is_dir() {
        let base = source_path
          .file_name()
          .map_or_else(PathBuf::new, PathBuf::from);
        for entry in WalkDir::new(source_path) {
          let entry = entry.map_err(io::Error::from)?;
          if !entry.file_type().is_file() {
            continue;
          }
          let rel = entry
            .path()
            .strip_prefix(source_path)
            .map_err(|_| io::Error::other("walked path escaped its root"))?;
          let dest = target.join(&base).join(rel);
          self.copy_one(&entry.path().to_string_lossy(), &dest, env, cache)?;
        }
      } else if dir_mode {
        let file_name = source_path
          .file_name()
          .ok_or_else(|| io::Error::other(format!("source has no file name: {source}")))?;
        self.copy_one(source, &target.join(file_name), env, cache)?;
      } else {
        self.copy_one(source, target, env, cache)?;
      }
    }

    if target.exists() {
      Ok(BuilderOutcome::Success(operation.target.clone()))
    } else {
      Ok(BuilderOutcome::Failure)
    }
  }
}
