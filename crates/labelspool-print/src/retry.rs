// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry engine: exponential backoff, error classification and the delay queue
// that runs deferred requeues outside the worker pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use labelspool_core::error::SpoolError;
use labelspool_core::types::JobId;

/// Upper bound on any single backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Whether waiting could make a failure go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity, device state, storage hiccups.
    Transient,
    /// Bad template or variables, missing wiring.  Retrying cannot help.
    Permanent,
}

pub fn classify_error(err: &SpoolError) -> ErrorClass {
    match err {
        SpoolError::Template(_)
        | SpoolError::TemplateNotFound(_)
        | SpoolError::NotConfigured(_) => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

/// Delay before retry attempt `attempt` (0-indexed):
/// `min(base * 2^attempt, MAX_BACKOFF)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Deferred per-job tasks that each wait out a delay and then run.
///
/// Each job has at most one timer.  Timers are independent of the worker
/// pool; `cancel` drops a single job's timer and `shutdown` drops them all,
/// so nothing fires for a job that has been parked or after the scheduler
/// has stopped.
pub struct RetryQueue {
    timers: Mutex<Timers>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Timers {
    tasks: JoinSet<()>,
    by_job: HashMap<JobId, AbortHandle>,
}

impl Timers {
    /// Reap finished timers so only live ones are tracked.
    fn reap(&mut self) {
        while self.tasks.try_join_next().is_some() {}
        self.by_job.retain(|_, handle| !handle.is_finished());
    }
}

impl RetryQueue {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            timers: Mutex::new(Timers::default()),
            cancel,
        }
    }

    /// Run `task` for `job` after `delay` unless the timer is cancelled
    /// first.  Replaces any timer the job already has.  Must be called from
    /// within a tokio runtime.
    pub fn schedule<F>(&self, job: JobId, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let Ok(mut timers) = self.timers.lock() else {
            warn!(job_id = %job, "retry queue lock poisoned, dropping deferred task");
            return;
        };
        timers.reap();

        let handle = timers.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
        if let Some(previous) = timers.by_job.insert(job, handle) {
            previous.abort();
        }
        debug!(job_id = %job, delay_ms = delay.as_millis() as u64, "retry scheduled");
    }

    /// Drop `job`'s timer.  Returns whether one was still waiting.
    pub fn cancel(&self, job: JobId) -> bool {
        let Ok(mut timers) = self.timers.lock() else {
            return false;
        };
        timers.reap();
        match timers.by_job.remove(&job) {
            Some(handle) => {
                handle.abort();
                debug!(job_id = %job, "retry cancelled");
                true
            }
            None => false,
        }
    }

    /// Timers that have not fired yet.
    pub fn pending(&self) -> usize {
        match self.timers.lock() {
            Ok(mut timers) => {
                timers.reap();
                timers.by_job.len()
            }
            Err(_) => 0,
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut timers) = self.timers.lock() {
            // Dropping the set aborts every task still in it.
            drop(std::mem::take(&mut *timers));
        }
    }
}
