//! The build environment: builder registry, target registry, and the
//! sequential build driver.
//!
//! An [`Env`] holds construction variables, the set of registered
//! builders, and the declared targets. Building is a two-phase affair:
//! registration mutates the environment, then [`Env::process`] (or
//! [`Env::process_parallel`]) drains the declared targets into a
//! [`JobSet`] and executes them against an immutable view of the
//! environment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::{debug, warn};

use crate::builder::{BuildOperation, Builder, BuilderOutcome};
use crate::builders::Barrier;
use crate::cache::{Cache, UserDepSource};
use crate::error::BuildError;
use crate::jobs::{Job, JobSet};
use crate::scheduler::{self, SchedulerConfig};
use crate::varset::{Value, VarSet};

/// A declared target awaiting processing.
#[derive(Clone)]
pub(crate) struct TargetSpec {
  pub builder: Arc<dyn Builder>,
  pub sources: Vec<String>,
  pub vars: VarSet,
  pub order_deps: Vec<String>,
}

/// A hook invoked on every build operation just before it runs.
pub type BuildHook = Arc<dyn Fn(&mut BuildOperation) + Send + Sync>;

/// The build environment.
///
/// Cloning produces a fully independent environment: variables, builders,
/// declared targets, and hooks are all carried over, and later mutations
/// of either copy are invisible to the other.
#[derive(Clone, Default)]
pub struct Env {
  varset: VarSet,
  builders: HashMap<String, Arc<dyn Builder>>,
  targets: IndexMap<String, TargetSpec>,
  user_deps: HashMap<String, Vec<String>>,
  hooks: Vec<BuildHook>,
  build_root: Option<String>,
  last_barrier: Option<String>,
  barrier_count: usize,
}

impl Env {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn var(&self, name: &str) -> Option<&Value> {
    self.varset.get(name)
  }

  pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self.varset.set(name, value);
  }

  pub fn append_vars(&mut self, other: &VarSet) {
    self.varset.append(other);
  }

  pub fn vars(&self) -> &VarSet {
    &self.varset
  }

  /// Directory under which generated intermediate files are placed.
  pub fn set_build_root(&mut self, root: impl Into<String>) {
    self.build_root = Some(root.into());
  }

  /// Expand a string against this environment's variables.
  pub fn expand(&self, s: &str) -> Result<Vec<String>, BuildError> {
    Ok(self.varset.expand_str(s)?)
  }

  /// Register a builder under its name, contributing its default
  /// variables without overwriting existing ones.
  pub fn add_builder(&mut self, builder: Arc<dyn Builder>) {
    let defaults = builder.default_variables(self);
    for (name, value) in defaults.iter() {
      self.varset.set_default(name.clone(), value.clone());
    }
    self.builders.insert(builder.name().to_owned(), builder);
  }

  pub fn builder(&self, name: &str) -> Option<Arc<dyn Builder>> {
    self.builders.get(name).cloned()
  }

  /// Register a hook to observe and adjust every build operation before it
  /// runs.
  pub fn add_build_hook(&mut self, hook: BuildHook) {
    self.hooks.push(hook);
  }

  /// Declare extra dependencies for a target beyond its build command's
  /// inputs.
  pub fn depends(&mut self, target: &str, deps: &[&str]) {
    let entry = self.user_deps.entry(target.to_owned()).or_default();
    for dep in deps {
      if !entry.iter().any(|d| d == dep) {
        entry.push((*dep).to_owned());
      }
    }
  }

  pub fn get_user_deps(&self, target: &str) -> Option<&Vec<String>> {
    self.user_deps.get(target)
  }

  /// Compute the conventional output path for `source` with its extension
  /// replaced by `suffix`, placed under the build root if one is set.
  pub fn get_build_fname(&self, source: &str, suffix: &str) -> String {
    let renamed = set_suffix(source, suffix);
    match &self.build_root {
      Some(root) if !renamed.starts_with('/') && !renamed.starts_with(root.as_str()) => {
        format!("{root}/{renamed}")
      }
      _ => renamed,
    }
  }

  /// Declare that `target` is produced from `sources` by the builder
  /// registered under `builder_id`. Returns the actual target name, which
  /// the builder may adjust.
  pub fn register_target(
    &mut self,
    target: &str,
    builder_id: &str,
    sources: &[&str],
    vars: VarSet,
  ) -> Result<String, BuildError> {
    let builder = self
      .builders
      .get(builder_id)
      .cloned()
      .ok_or_else(|| BuildError::UnknownBuilder(builder_id.to_owned()))?;
    let sources: Vec<String> = sources.iter().map(|s| (*s).to_owned()).collect();
    self.register_with_builder(builder, target, &sources, vars)
  }

  pub(crate) fn register_with_builder(
    &mut self,
    builder: Arc<dyn Builder>,
    target: &str,
    sources: &[String],
    vars: VarSet,
  ) -> Result<String, BuildError> {
    let target = builder.target_name(target, self);
    let operation = BuildOperation {
      builder: builder.clone(),
      target: target.clone(),
      sources: sources.to_vec(),
      vars: vars.clone(),
    };
    let sources = builder.setup(&operation, self)?;
    let order_deps = self.last_barrier.iter().cloned().collect();
    self.targets.insert(
      target.clone(),
      TargetSpec {
        builder,
        sources,
        vars,
        order_deps,
      },
    );
    Ok(target)
  }

  /// Find a registered builder able to produce `target` from `source`.
  pub fn find_producer(&self, target: &str, source: &str) -> Option<Arc<dyn Builder>> {
    self
      .builders
      .values()
      .find(|b| b.produces(target, source))
      .cloned()
  }

  /// Insert a barrier: every target registered after this call waits for
  /// every target registered before it. Returns the barrier's name.
  pub fn barrier(&mut self) -> String {
    self.barrier_count += 1;
    let name = format!(":barrier-{}", self.barrier_count);
    let sources: Vec<String> = self.targets.keys().cloned().collect();
    let spec = TargetSpec {
      builder: Arc::new(Barrier),
      sources,
      vars: VarSet::new(),
      order_deps: self.last_barrier.iter().cloned().collect(),
    };
    self.targets.insert(name.clone(), spec);
    self.last_barrier = Some(name.clone());
    name
  }

  /// Names of all currently declared targets, in registration order.
  pub fn target_names(&self) -> Vec<String> {
    self.targets.keys().cloned().collect()
  }

  /// Drop all declared targets without building them.
  pub fn clear_targets(&mut self) {
    self.targets.clear();
    self.last_barrier = None;
  }

  /// Reject target graphs with circular dependencies, naming a target on
  /// the cycle.
  fn verify_acyclic(&self) -> Result<(), BuildError> {
    let mut graph = DiGraph::<String, ()>::new();
    let mut nodes = HashMap::new();
    for name in self.targets.keys() {
      nodes.insert(name.clone(), graph.add_node(name.clone()));
    }
    for (name, spec) in &self.targets {
      for dep in spec.sources.iter().chain(spec.order_deps.iter()) {
        if let Some(&dep_node) = nodes.get(dep) {
          graph.add_edge(dep_node, nodes[name], ());
        }
      }
    }
    toposort(&graph, None)
      .map(|_| ())
      .map_err(|cycle| BuildError::CircularDependency(graph[cycle.node_id()].clone()))
  }

  pub(crate) fn take_jobs(&mut self) -> JobSet {
    let mut jobs = JobSet::new();
    for (target, spec) in self.targets.drain(..) {
      jobs.add_job(Job {
        target,
        builder: spec.builder,
        sources: spec.sources,
        vars: spec.vars,
        order_deps: spec.order_deps,
      });
    }
    self.last_barrier = None;
    jobs
  }

  /// Run one job's builder, returning `Ok(Some(target))` on success,
  /// `Ok(None)` on a failed build action, and `Err` on protocol errors.
  pub(crate) fn execute_job(&self, job: &Job, cache: &Cache) -> Result<Option<String>, BuildError> {
    let mut operation = BuildOperation {
      builder: job.builder.clone(),
      target: job.target.clone(),
      sources: job.sources.clone(),
      vars: self.varset.merge(&job.vars),
    };
    for hook in &self.hooks {
      hook(&mut operation);
    }
    debug!(target = %operation.target, builder = %operation.builder.name(), "running builder");
    let outcome = operation.builder.run(&operation, self, cache)?;
    self.resolve_outcome(operation, outcome, cache, false)
  }

  fn resolve_outcome(
    &self,
    operation: BuildOperation,
    outcome: BuilderOutcome,
    cache: &Cache,
    finalized: bool,
  ) -> Result<Option<String>, BuildError> {
    match outcome {
      BuilderOutcome::Success(target) => Ok(Some(target)),
      BuilderOutcome::Failure => Ok(None),
      BuilderOutcome::Pending(handle) if !finalized => {
        let command_ok = handle.join();
        let outcome = operation
          .builder
          .finalize(&operation, self, cache, command_ok)?;
        self.resolve_outcome(operation, outcome, cache, true)
      }
      BuilderOutcome::Chain(chained) if !finalized => {
        let chained = *chained;
        let outcome = chained.builder.run(&chained, self, cache)?;
        self.resolve_outcome(chained, outcome, cache, true)
      }
      BuilderOutcome::Pending(_) | BuilderOutcome::Chain(_) => {
        Err(BuildError::InvalidBuilderResult {
          builder: operation.builder.name().to_owned(),
          target: operation.target,
          detail: "finalize must resolve to success or failure".to_owned(),
        })
      }
    }
  }

  /// Build every declared target sequentially, dependencies first.
  ///
  /// The cache is written back whether the run succeeds or fails, so
  /// completed work is never repeated.
  pub fn process(&mut self, cache: &Cache) -> Result<(), BuildError> {
    self.verify_acyclic()?;
    let mut jobs = self.take_jobs();
    let mut processed = HashSet::new();
    let result = (|| {
      for target in jobs.target_names() {
        self.process_one(&target, &mut jobs, &mut processed, cache)?;
      }
      Ok(())
    })();
    match cache.write() {
      Ok(()) => result,
      Err(err) => {
        if result.is_ok() {
          Err(err.into())
        } else {
          warn!(error = %err, "failed to write cache");
          result
        }
      }
    }
  }

  fn process_one(
    &self,
    target: &str,
    jobs: &mut JobSet,
    processed: &mut HashSet<String>,
    cache: &Cache,
  ) -> Result<(), BuildError> {
    if processed.contains(target) {
      return Ok(());
    }
    let Some(job) = jobs.remove(target) else {
      return Ok(());
    };
    processed.insert(target.to_owned());
    for dep in job.sources.iter().chain(job.order_deps.iter()) {
      if jobs.contains(dep) {
        self.process_one(dep, jobs, processed, cache)?;
      }
    }
    match self.execute_job(&job, cache)? {
      Some(_) => Ok(()),
      None => Err(BuildError::BuildFailure {
        targets: vec![job.target],
      }),
    }
  }

  /// Build every declared target with a bounded pool of parallel workers.
  ///
  /// On failure, already-running jobs are drained and the error names
  /// every target that failed.
  pub async fn process_parallel(
    &mut self,
    cache: Arc<Cache>,
    config: &SchedulerConfig,
  ) -> Result<(), BuildError> {
    self.verify_acyclic()?;
    let jobs = self.take_jobs();
    let env = Arc::new(self.clone());
    scheduler::run(env, jobs, cache, config).await
  }
}

impl UserDepSource for Env {
  fn user_deps(&self, target: &str) -> Option<Vec<String>> {
    self.user_deps.get(target).cloned()
  }
}

/// Replace the extension of the final path component with `suffix`, or
/// append the suffix if there is none. `suffix` includes its leading dot.
pub(crate) fn set_suffix(path: &str, suffix: &str) -> String {
  let name_start = path.rfind('/').map_or(0, |i| i + 1);
  match path[name_start..].rfind('.') {
    Some(dot) => format!("{}{}", &path[..name_start + dot], suffix),
    None => format!("{path}{suffix}"),
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use tempfile::TempDir;

  use super::*;
  use crate::builders::SimpleBuilder;

  /// A builder that appends its target to a shared log and succeeds.
  fn logging_builder(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Builder> {
    Arc::new(SimpleBuilder::new(name, move |op, _env, _cache| {
      log.lock().unwrap().push(op.target.clone());
      Ok(BuilderOutcome::Success(op.target.clone()))
    }))
  }

  fn test_cache(temp: &TempDir) -> Cache {
    Cache::load(temp.path().join(".girder-cache"))
  }

  #[test]
  fn unknown_builder_is_rejected() {
    let mut env = Env::new();
    let err = env
      .register_target("out", "Nope", &[], VarSet::new())
      .unwrap_err();
    assert!(matches!(err, BuildError::UnknownBuilder(name) if name == "Nope"));
  }

  #[test]
  fn dependencies_build_before_dependents() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut env = Env::new();
    env.add_builder(logging_builder("Log", log.clone()));
    env.register_target("app", "Log", &["app.o"], VarSet::new()).unwrap();
    env.register_target("app.o", "Log", &[], VarSet::new()).unwrap();
    env.process(&cache).unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["app.o", "app"]);
  }

  #[test]
  fn shared_dependency_builds_once() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();

    let mut env = Env::new();
    env.add_builder(Arc::new(SimpleBuilder::new("Count", move |op, _env, _cache| {
      count_clone.fetch_add(1, Ordering::SeqCst);
      Ok(BuilderOutcome::Success(op.target.clone()))
    })));
    env.register_target("common", "Count", &[], VarSet::new()).unwrap();
    env.register_target("left", "Count", &["common"], VarSet::new()).unwrap();
    env.register_target("right", "Count", &["common"], VarSet::new()).unwrap();
    env.process(&cache).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn cycle_is_reported_before_any_job_runs() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut env = Env::new();
    env.add_builder(logging_builder("Log", log.clone()));
    env.register_target("a", "Log", &["b"], VarSet::new()).unwrap();
    env.register_target("b", "Log", &["a"], VarSet::new()).unwrap();

    let err = env.process(&cache).unwrap_err();
    match err {
      BuildError::CircularDependency(name) => assert!(name == "a" || name == "b"),
      other => panic!("unexpected error: {other}"),
    }
    assert!(log.lock().unwrap().is_empty());
  }

  #[test]
  fn self_dependency_is_a_cycle() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let mut env = Env::new();
    env.add_builder(logging_builder("Log", Arc::new(Mutex::new(Vec::new()))));
    env.register_target("a", "Log", &["a"], VarSet::new()).unwrap();
    let err = env.process(&cache).unwrap_err();
    assert!(matches!(err, BuildError::CircularDependency(name) if name == "a"));
  }

  #[test]
  fn failed_build_names_the_target() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let mut env = Env::new();
    env.add_builder(Arc::new(SimpleBuilder::new("Fail", |_op, _env, _cache| {
      Ok(BuilderOutcome::Failure)
    })));
    env.register_target("doomed", "Fail", &[], VarSet::new()).unwrap();
    let err = env.process(&cache).unwrap_err();
    assert!(matches!(err, BuildError::BuildFailure { targets } if targets == vec!["doomed"]));
  }

  #[test]
  fn hooks_can_adjust_operations() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();

    let mut env = Env::new();
    env.add_builder(Arc::new(SimpleBuilder::new("Check", move |op, _env, _cache| {
      let flags = op.vars.expand_str("${FLAGS}").unwrap();
      seen_clone.lock().unwrap().extend(flags);
      Ok(BuilderOutcome::Success(op.target.clone()))
    })));
    env.add_build_hook(Arc::new(|op: &mut BuildOperation| {
      op.vars.set("FLAGS", "-injected");
    }));
    env.register_target("out", "Check", &[], VarSet::new()).unwrap();
    env.process(&cache).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["-injected"]);
  }

  #[test]
  fn builder_defaults_do_not_overwrite_existing_vars() {
    struct Defaulted;
    impl Builder for Defaulted {
      fn name(&self) -> &str {
        "Defaulted"
      }
      fn default_variables(&self, _env: &Env) -> VarSet {
        let mut vars = VarSet::new();
        vars.set("CC", "gcc");
        vars.set("LD", "ld");
        vars
      }
      fn run(
        &self,
        op: &BuildOperation,
        _env: &Env,
        _cache: &Cache,
      ) -> Result<BuilderOutcome, BuildError> {
        Ok(BuilderOutcome::Success(op.target.clone()))
      }
    }

    let mut env = Env::new();
    env.set_var("CC", "clang");
    env.add_builder(Arc::new(Defaulted));
    assert_eq!(env.expand("${CC} ${LD}").unwrap(), vec!["clang ld"]);
  }

  #[test]
  fn cloned_env_is_independent() {
    let mut env = Env::new();
    env.set_var("A", "1");
    let mut copy = env.clone();
    copy.set_var("A", "2");
    copy.add_builder(Arc::new(Barrier));

    assert_eq!(env.expand("${A}").unwrap(), vec!["1"]);
    assert!(env.builder("Barrier").is_none());
    assert!(copy.builder("Barrier").is_some());
  }

  #[test]
  fn build_fname_respects_build_root() {
    let mut env = Env::new();
    assert_eq!(env.get_build_fname("src/main.c", ".o"), "src/main.o");
    env.set_build_root("build");
    assert_eq!(env.get_build_fname("src/main.c", ".o"), "build/src/main.o");
    assert_eq!(env.get_build_fname("/abs/main.c", ".o"), "/abs/main.o");
    assert_eq!(env.get_build_fname("build/gen.c", ".o"), "build/gen.o");
  }

  #[test]
  fn set_suffix_replaces_only_final_extension() {
    assert_eq!(set_suffix("a/b.x/c.txt", ".o"), "a/b.x/c.o");
    assert_eq!(set_suffix("noext", ".o"), "noext.o");
    assert_eq!(set_suffix("dir.v/noext", ".o"), "dir.v/noext.o");
  }

  #[test]
  fn chained_outcome_runs_the_delegate() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);
    let log = Arc::new(Mutex::new(Vec::new()));
    let delegate = logging_builder("Delegate", log.clone());

    let mut env = Env::new();
    env.add_builder(Arc::new(SimpleBuilder::new("Outer", move |op, _env, _cache| {
      Ok(BuilderOutcome::Chain(Box::new(BuildOperation {
        builder: delegate.clone(),
        target: op.target.clone(),
        sources: op.sources.clone(),
        vars: op.vars.clone(),
      })))
    })));
    env.register_target("out", "Outer", &[], VarSet::new()).unwrap();
    env.process(&cache).unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["out"]);
  }

  #[test]
  fn pending_without_finalize_is_a_protocol_violation() {
    let temp = TempDir::new().unwrap();
    let cache = test_cache(&temp);

    let mut env = Env::new();
    env.add_builder(Arc::new(SimpleBuilder::new("Rogue", |_op, _env, _cache| {
      let handle = std::thread::spawn(|| true);
      Ok(BuilderOutcome::Pending(crate::builder::PendingHandle::new(handle)))
    })));
    env.register_target("out", "Rogue", &[], VarSet::new()).unwrap();

    let err = env.process(&cache).unwrap_err();
    assert!(matches!(err, BuildError::InvalidBuilderResult { builder, .. } if builder == "Rogue"));
  }

  #[test]
  fn depends_deduplicates() {
    let mut env = Env::new();
    env.depends("out", &["a", "b"]);
    env.depends("out", &["b", "c"]);
    assert_eq!(
      env.get_user_deps("out").unwrap(),
      &vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]
    );
  }
}
