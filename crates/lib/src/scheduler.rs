//! Bounded parallel execution of a [`JobSet`].
//!
//! The scheduler keeps up to `jobs` builder invocations in flight on the
//! blocking thread pool. Jobs are dispatched lazily: a job is pulled from
//! the set only when a worker slot is free and its dependencies have
//! completed. When a job fails, no new jobs are dispatched, but jobs
//! already in flight are drained to completion so the cache stays
//! coherent, and the resulting error names every failed target.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::env::Env;
use crate::error::BuildError;
use crate::jobs::JobSet;

/// Scheduler tuning.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
  /// Maximum number of builder invocations in flight at once.
  pub jobs: usize,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    let jobs = std::thread::available_parallelism().map_or(4, |n| n.get());
    Self { jobs }
  }
}

/// Execute every job in `jobs` with at most `config.jobs` running at once.
pub async fn run(
  env: Arc<Env>,
  mut jobs: JobSet,
  cache: Arc<Cache>,
  config: &SchedulerConfig,
) -> Result<(), BuildError> {
  let slots = config.jobs.max(1);
  let total = jobs.len();
  let mut running: JoinSet<(String, Result<Option<String>, BuildError>)> = JoinSet::new();
  let mut active: HashSet<String> = HashSet::new();
  let mut completed: HashSet<String> = HashSet::new();
  let mut failed: Vec<String> = Vec::new();
  let mut fatal: Option<BuildError> = None;

  loop {
    while failed.is_empty() && fatal.is_none() && active.len() < slots {
      let Some(job) = jobs.next_ready(&completed, &active) else {
        break;
      };
      active.insert(job.target.clone());
      let env = env.clone();
      let cache = cache.clone();
      running.spawn_blocking(move || {
        let target = job.target.clone();
        // A panicking builder is a failed build of its target, not a lost
        // task; catching here keeps the target name attached.
        let result =
          match std::panic::catch_unwind(AssertUnwindSafe(|| env.execute_job(&job, &cache))) {
            Ok(result) => result,
            Err(_) => {
              error!(%target, "build job panicked");
              Ok(None)
            }
          };
        (target, result)
      });
    }

    if active.is_empty() {
      break;
    }

    match running.join_next().await {
      Some(Ok((target, Ok(Some(_))))) => {
        active.remove(&target);
        completed.insert(target);
      }
      Some(Ok((target, Ok(None)))) => {
        active.remove(&target);
        error!(%target, "build failed");
        failed.push(target);
      }
      Some(Ok((target, Err(err)))) => {
        active.remove(&target);
        if fatal.is_none() {
          fatal = Some(err);
        } else {
          error!(%target, error = %err, "additional build error");
        }
      }
      Some(Err(join_err)) => {
        // Builder panics are caught inside the task; this is a lost task
        // (cancellation), which the scheduler never requests.
        error!(error = %join_err, "build task was lost");
      }
      None => break,
    }
  }

  let write_result = cache.write();

  if let Some(err) = fatal {
    if let Err(write_err) = write_result {
      warn!(error = %write_err, "failed to write cache");
    }
    return Err(err);
  }
  if !failed.is_empty() {
    if let Err(write_err) = write_result {
      warn!(error = %write_err, "failed to write cache");
    }
    failed.sort();
    return Err(BuildError::BuildFailure { targets: failed });
  }
  write_result?;

  if !jobs.is_empty() {
    let target = jobs.first_pending().unwrap_or("<unknown>").to_owned();
    return Err(BuildError::CircularDependency(target));
  }

  info!(total, "all targets up to date");
  Ok(())
}
