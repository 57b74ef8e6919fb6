use std::{
    mem,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{OrchestratorError, Result, RoleError},
    unit::UnitReport,
};

/// The work of one execution unit.
pub type UnitJob = Box<dyn FnOnce() -> std::result::Result<UnitReport, RoleError> + Send>;

/// The outcome of one execution unit.
pub type UnitOutcome = Result<UnitReport>;

/// Runs execution units in parallel.
pub trait ProcessPool: Send + Sync {
    /// Schedules `job` as execution unit `unit`.
    fn exec(&self, unit: usize, job: UnitJob) -> Result<()>;

    /// Waits for every scheduled unit to finish.
    ///
    /// # Returns
    /// `false` if `timeout` elapsed first, `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> bool;

    /// Joins every unit scheduled so far and takes their outcomes, ordered by unit.
    fn stop(&self) -> Vec<UnitOutcome>;
}

#[derive(Default)]
struct Running {
    count: Mutex<usize>,
    done: Condvar,
}

/// Decrements the running count when a unit's thread ends, even by panicking.
struct RunningGuard(Arc<Running>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;

        if *count == 0 {
            self.0.done.notify_all();
        }
    }
}

/// A `ProcessPool` running each unit on its own OS thread.
#[derive(Default)]
pub struct ThreadPool {
    handles: Mutex<Vec<(usize, JoinHandle<std::result::Result<UnitReport, RoleError>>)>>,
    running: Arc<Running>,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessPool for ThreadPool {
    fn exec(&self, unit: usize, job: UnitJob) -> Result<()> {
        *self.running.count.lock() += 1;
        let guard = RunningGuard(Arc::clone(&self.running));

        let handle = thread::Builder::new()
            .name(format!("unit-{unit}"))
            .spawn(move || {
                let _guard = guard;
                job()
            })?;

        debug!(unit = unit; "execution unit started");
        self.handles.lock().push((unit, handle));
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut count = self.running.count.lock();

        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.running.done.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                None => self.running.done.wait(&mut count),
            }
        }

        true
    }

    fn stop(&self) -> Vec<UnitOutcome> {
        let mut handles = mem::take(&mut *self.handles.lock());
        handles.sort_by_key(|(unit, _)| *unit);

        handles
            .into_iter()
            .map(|(unit, handle)| {
                let outcome = match handle.join() {
                    Ok(res) => res.map_err(|source| OrchestratorError::UnitFailed { unit, source }),
                    Err(_) => Err(OrchestratorError::UnitPanicked { unit }),
                };

                match &outcome {
                    Ok(_) => debug!(unit = unit; "execution unit stopped"),
                    Err(e) => warn!(unit = unit; "execution unit failed: {e}"),
                }

                outcome
            })
            .collect()
    }
}
