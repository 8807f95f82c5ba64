//! The persisted build cache.
//!
//! For every target ever built, the cache records the target's content
//! checksum, the fingerprint of the command that built it, and the name
//! and checksum of every dependency consumed. [`Cache::is_up_to_date`]
//! replays those records against the current filesystem to decide whether
//! a rebuild is needed; [`Cache::register_build`] records a fresh build.
//!
//! The cache also tracks directories it created, so produced trees can be
//! enumerated and removed later.
//!
//! All interior state is mutex-guarded so a single handle can be shared by
//! concurrent build jobs.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::consts::{CACHE_VERSION, PHONY_PREFIX};
use crate::hash::{command_fingerprint, file_checksum};
use crate::phony_target;

/// Source of user-declared extra dependencies for a target.
///
/// These are dependencies the build command does not name but that should
/// still trigger a rebuild when changed, such as a linker script.
pub trait UserDepSource {
  fn user_deps(&self, target: &str) -> Option<Vec<String>>;
}

impl UserDepSource for HashMap<String, Vec<String>> {
  fn user_deps(&self, target: &str) -> Option<Vec<String>> {
    self.get(target).cloned()
  }
}

/// No user dependencies for any target.
impl UserDepSource for () {
  fn user_deps(&self, _target: &str) -> Option<Vec<String>> {
    None
  }
}

/// One recorded dependency of a cached target.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DepRecord {
  pub fname: String,
  pub checksum: String,
}

/// The cached record of one built target.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CacheEntry {
  /// Content checksum of the target at registration time. Empty for phony
  /// and side-effect targets.
  pub checksum: String,
  /// Fingerprint of the command that produced the target.
  pub command: String,
  /// Dependencies consumed by the build, in command order.
  #[serde(default)]
  pub deps: Vec<DepRecord>,
  /// User-declared extra dependencies at registration time.
  #[serde(default)]
  pub user_deps: Vec<DepRecord>,
  /// Whether the target was produced by an install operation.
  #[serde(default)]
  pub install: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CacheData {
  version: String,
  #[serde(default)]
  targets: BTreeMap<String, CacheEntry>,
  /// Directories created during builds, keyed by path, true if created by
  /// an install operation.
  #[serde(default)]
  directories: BTreeMap<String, bool>,
  /// Opaque configuration state persisted alongside build records.
  #[serde(default)]
  configuration_data: serde_json::Map<String, serde_json::Value>,
}

/// Options for an up-to-date check.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpToDateOptions {
  /// Require the current dependency list to exactly equal the cached one,
  /// in order, instead of allowing the cached list to be a superset.
  pub strict_deps: bool,
}

/// Options for registering a build.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegisterOptions {
  /// The target was produced by an install operation.
  pub install: bool,
  /// The target is a side effect whose content should not be checksummed.
  pub side_effect: bool,
}

/// The build cache: staleness decisions and build registration.
#[derive(Debug)]
pub struct Cache {
  path: PathBuf,
  data: Mutex<CacheData>,
  checksums: Mutex<HashMap<PathBuf, String>>,
}

fn cache_key(target: &str) -> String {
  if phony_target(target) {
    format!("{PHONY_PREFIX}{target}")
  } else {
    target.to_owned()
  }
}

impl Cache {
  /// Load the cache from `path`, or start empty if the file is missing.
  ///
  /// A present but unreadable or unparsable file is treated as empty with
  /// a warning; everything rebuilds and the file is rewritten on save.
  pub fn load(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let data = match fs::read_to_string(&path) {
      Ok(contents) => match serde_json::from_str::<CacheData>(&contents) {
        Ok(data) => data,
        Err(err) => {
          warn!(path = %path.display(), error = %err, "cache file is corrupt, starting fresh");
          CacheData::default()
        }
      },
      Err(err) if err.kind() == io::ErrorKind::NotFound => CacheData::default(),
      Err(err) => {
        warn!(path = %path.display(), error = %err, "cache file is unreadable, starting fresh");
        CacheData::default()
      }
    };
    Self {
      path,
      data: Mutex::new(data),
      checksums: Mutex::new(HashMap::new()),
    }
  }

  /// Decide whether `targets` are up to date with respect to `command` and
  /// `deps`.
  ///
  /// Every target must exist (phony targets excepted), have a cache entry,
  /// match its recorded checksum, have been built by a command with the
  /// same fingerprint, from the same dependency list (exact or superset
  /// per `options.strict_deps`), with the same user dependencies, and
  /// every recorded dependency must still match its recorded checksum.
  pub fn is_up_to_date<C: Serialize>(
    &self,
    targets: &[&str],
    command: &C,
    deps: &[String],
    user_dep_source: &dyn UserDepSource,
    options: UpToDateOptions,
  ) -> bool {
    let fingerprint = command_fingerprint(command);
    targets
      .iter()
      .all(|target| self.target_up_to_date(target, &fingerprint, deps, user_dep_source, options))
  }

  fn target_up_to_date(
    &self,
    target: &str,
    fingerprint: &str,
    deps: &[String],
    user_dep_source: &dyn UserDepSource,
    options: UpToDateOptions,
  ) -> bool {
    if !phony_target(target) && !Path::new(target).exists() {
      debug!(target, "rebuilding: target does not exist on disk");
      return false;
    }

    let entry = {
      let data = self.data.lock().unwrap();
      match data.targets.get(&cache_key(target)) {
        Some(entry) => entry.clone(),
        None => {
          debug!(target, "rebuilding: target has no cache entry");
          return false;
        }
      }
    };

    // An empty recorded checksum marks a side-effect target whose contents
    // are not tracked.
    if !phony_target(target)
      && !entry.checksum.is_empty()
      && self.lookup_checksum(Path::new(target)) != entry.checksum
    {
      debug!(target, "rebuilding: target contents have changed");
      return false;
    }

    if fingerprint != entry.command {
      debug!(target, "rebuilding: build command has changed");
      return false;
    }

    let cached_deps: Vec<&str> = entry.deps.iter().map(|d| d.fname.as_str()).collect();
    if options.strict_deps {
      if deps.len() != cached_deps.len() || !deps.iter().map(String::as_str).eq(cached_deps.iter().copied()) {
        debug!(target, "rebuilding: dependency list has changed");
        return false;
      }
    } else {
      let new_deps: Vec<&String> = deps
        .iter()
        .filter(|d| !cached_deps.contains(&d.as_str()))
        .collect();
      if !new_deps.is_empty() {
        debug!(target, ?new_deps, "rebuilding: there are new dependencies");
        return false;
      }
    }

    let current_user_deps = user_dep_source.user_deps(target).unwrap_or_default();
    let cached_user_deps: Vec<&str> = entry.user_deps.iter().map(|d| d.fname.as_str()).collect();
    if current_user_deps.len() != cached_user_deps.len()
      || !current_user_deps
        .iter()
        .map(String::as_str)
        .eq(cached_user_deps.iter().copied())
    {
      debug!(target, "rebuilding: user dependencies have changed");
      return false;
    }

    for dep in entry.deps.iter().chain(entry.user_deps.iter()) {
      if self.lookup_checksum(Path::new(&dep.fname)) != dep.checksum {
        debug!(target, dep = %dep.fname, "rebuilding: dependency file has changed");
        return false;
      }
    }

    true
  }

  /// Record a successful build of `targets` by `command` from `deps`.
  pub fn register_build<C: Serialize>(
    &self,
    targets: &[&str],
    command: &C,
    deps: &[String],
    user_dep_source: &dyn UserDepSource,
    options: RegisterOptions,
  ) {
    let fingerprint = command_fingerprint(command);
    for target in targets {
      let checksum = if options.side_effect || phony_target(target) {
        String::new()
      } else {
        self.calculate_checksum(Path::new(target))
      };
      let entry = CacheEntry {
        checksum,
        command: fingerprint.clone(),
        deps: deps
          .iter()
          .map(|dep| DepRecord {
            fname: dep.clone(),
            checksum: self.lookup_checksum(Path::new(dep)),
          })
          .collect(),
        user_deps: user_dep_source
          .user_deps(target)
          .unwrap_or_default()
          .iter()
          .map(|dep| DepRecord {
            fname: dep.clone(),
            checksum: self.lookup_checksum(Path::new(dep)),
          })
          .collect(),
        install: options.install,
      };
      let mut data = self.data.lock().unwrap();
      data.targets.insert(cache_key(target), entry);
    }
  }

  /// Create `path` and any missing parents, recording each directory this
  /// call actually created.
  pub fn mkdir_tracked(&self, path: &Path, install: bool) -> io::Result<()> {
    let mut partial = PathBuf::new();
    for component in path.components() {
      partial.push(component);
      if partial.as_os_str().is_empty() || partial.is_dir() {
        continue;
      }
      match fs::create_dir(&partial) {
        Ok(()) => {
          let mut data = self.data.lock().unwrap();
          data
            .directories
            .insert(partial.to_string_lossy().into_owned(), install);
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
      }
    }
    Ok(())
  }

  /// Every cached target whose install flag matches `install`.
  pub fn targets_with_install_flag(&self, install: bool) -> Vec<String> {
    let data = self.data.lock().unwrap();
    data
      .targets
      .iter()
      .filter(|(_, entry)| entry.install == install)
      .map(|(name, _)| name.clone())
      .collect()
  }

  /// Every tracked directory whose install flag matches `install`, deepest
  /// first so they can be removed in order.
  pub fn directories_with_install_flag(&self, install: bool) -> Vec<String> {
    let data = self.data.lock().unwrap();
    let mut dirs: Vec<String> = data
      .directories
      .iter()
      .filter(|(_, dir_install)| **dir_install == install)
      .map(|(name, _)| name.clone())
      .collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.len()));
    dirs
  }

  /// Forget a target's cache entry. Returns true if one existed.
  pub fn remove_target(&self, target: &str) -> bool {
    let mut data = self.data.lock().unwrap();
    data.targets.remove(&cache_key(target)).is_some()
  }

  /// Forget a tracked directory. Returns true if one existed.
  pub fn remove_directory(&self, directory: &str) -> bool {
    let mut data = self.data.lock().unwrap();
    data.directories.remove(directory).is_some()
  }

  /// Access the persisted configuration value stored under `key`.
  pub fn configuration_value(&self, key: &str) -> Option<serde_json::Value> {
    let data = self.data.lock().unwrap();
    data.configuration_data.get(key).cloned()
  }

  /// Store a configuration value to persist alongside build records.
  pub fn set_configuration_value(&self, key: impl Into<String>, value: serde_json::Value) {
    let mut data = self.data.lock().unwrap();
    data.configuration_data.insert(key.into(), value);
  }

  /// Persist the cache to disk.
  pub fn write(&self) -> io::Result<()> {
    let serialized = {
      let mut data = self.data.lock().unwrap();
      data.version = CACHE_VERSION.to_owned();
      serde_json::to_string_pretty(&*data)?
    };
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      fs::create_dir_all(parent)?;
    }
    fs::write(&self.path, serialized)
  }

  /// Erase all cached state and remove the cache file.
  pub fn clear(&self) -> io::Result<()> {
    match fs::remove_file(&self.path) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::NotFound => {}
      Err(err) => return Err(err),
    }
    *self.data.lock().unwrap() = CacheData::default();
    self.checksums.lock().unwrap().clear();
    Ok(())
  }

  /// Drop memoized file checksums so later checks re-read the filesystem.
  ///
  /// Needed when files are modified mid-run outside of registered builds.
  pub fn clear_checksum_cache(&self) {
    self.checksums.lock().unwrap().clear();
  }

  fn lookup_checksum(&self, path: &Path) -> String {
    if let Some(checksum) = self.checksums.lock().unwrap().get(path) {
      return checksum.clone();
    }
    self.calculate_checksum(path)
  }

  fn calculate_checksum(&self, path: &Path) -> String {
    let checksum = file_checksum(path);
    self
      .checksums
      .lock()
      .unwrap()
      .insert(path.to_owned(), checksum.clone());
    checksum
  }
}
