//! The pending-job set consumed by the parallel scheduler.
//!
//! Jobs are held in registration order. [`JobSet::next_ready`] performs a
//! depth-first walk from each pending root to find the first job whose
//! dependencies are all satisfied, so dependency chains are honored while
//! independent jobs can run side by side.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::builder::Builder;
use crate::varset::VarSet;

/// One registered target awaiting execution.
#[derive(Clone)]
pub struct Job {
  pub target: String,
  pub builder: Arc<dyn Builder>,
  pub sources: Vec<String>,
  pub vars: VarSet,
  /// Targets that must complete before this job starts but are not inputs
  /// to its build command.
  pub order_deps: Vec<String>,
}

/// The set of jobs not yet dispatched, in registration order.
#[derive(Default)]
pub struct JobSet {
  jobs: IndexMap<String, Job>,
  /// Names of all targets ever added, including dispatched ones. Used to
  /// distinguish source files from targets that failed or never ran.
  known_targets: HashSet<String>,
}

impl JobSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_job(&mut self, job: Job) {
    self.known_targets.insert(job.target.clone());
    self.jobs.insert(job.target.clone(), job);
  }

  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }

  pub fn contains(&self, target: &str) -> bool {
    self.jobs.contains_key(target)
  }

  pub fn remove(&mut self, target: &str) -> Option<Job> {
    self.jobs.shift_remove(target)
  }

  pub fn target_names(&self) -> Vec<String> {
    self.jobs.keys().cloned().collect()
  }

  /// An arbitrary still-pending target name, for diagnostics.
  pub fn first_pending(&self) -> Option<&str> {
    self.jobs.keys().next().map(String::as_str)
  }

  /// Remove and return the next job whose dependencies are all in
  /// `completed` and none are in `active`. Returns None when nothing can
  /// run right now (all ready work is active, blocked, or failed).
  pub fn next_ready(
    &mut self,
    completed: &HashSet<String>,
    active: &HashSet<String>,
  ) -> Option<Job> {
    let roots: Vec<String> = self.jobs.keys().cloned().collect();
    for root in roots {
      let mut visited = HashSet::new();
      if let Some(ready) = self.find_ready(&root, completed, active, &mut visited) {
        return self.jobs.shift_remove(&ready);
      }
    }
    None
  }

  /// Depth-first search for a runnable job at or below `target`.
  ///
  /// A blocked subtree yields None rather than an error; every pending job
  /// is also tried as its own root, so runnable work is never missed.
  fn find_ready(
    &self,
    target: &str,
    completed: &HashSet<String>,
    active: &HashSet<String>,
    visited: &mut HashSet<String>,
  ) -> Option<String> {
    visited.insert(target.to_owned());
    let job = self.jobs.get(target)?;
    let deps = job.sources.iter().chain(job.order_deps.iter());
    for dep in deps {
      if self.jobs.contains_key(dep) {
        if visited.contains(dep) {
          // Cycle; reported by the caller once nothing can make progress.
          return None;
        }
        return self.find_ready(dep, completed, active, visited);
      }
      if active.contains(dep) {
        return None;
      }
      if self.known_targets.contains(dep) && !completed.contains(dep) {
        // A target that was dispatched and did not complete (failed).
        return None;
      }
    }
    Some(target.to_owned())
  }
}
