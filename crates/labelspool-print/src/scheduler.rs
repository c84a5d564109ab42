// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job scheduler.
//
// Jobs are persisted `pending` and their ids are offered to one bounded
// dispatch channel shared by a fixed pool of workers.  Offers never block: a
// full channel drops the offer and the periodic dispatch sweep, which reads
// pending jobs straight from the store in (priority DESC, created_at ASC)
// order, picks the job up later.  The sweep is the dispatcher of record.
//
// A worker claims a job (`pending -> processing`) before doing any work, so a
// job offered twice is only ever run once.  Failures go through a single
// handler that either schedules a delayed requeue on the retry queue or fails
// the job for good once its retry budget is spent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use labelspool_core::config::QueueConfig;
use labelspool_core::error::{Result, SpoolError};
use labelspool_core::types::{
    JobFilter, JobId, JobRequest, JobStatus, PrintJob, PrinterId, PrinterState, QueueStats,
};

use crate::codec::LabelCodec;
use crate::device::PrinterDevice;
use crate::notify::{EventKind, Notifier};
use crate::retry::{ErrorClass, RetryQueue, backoff_delay, classify_error};
use crate::store::SpoolStore;

/// Cloneable handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<SpoolStore>,
    device: Option<Arc<dyn PrinterDevice>>,
    codec: Option<Arc<dyn LabelCodec>>,
    notifier: Notifier,
    config: QueueConfig,
    tx: mpsc::Sender<JobId>,
    rx: tokio::sync::Mutex<mpsc::Receiver<JobId>>,
    /// Printers whose jobs are held back from dispatch.
    paused_printers: RwLock<HashSet<PrinterId>>,
    retries: RetryQueue,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// A missing device or codec is tolerated; jobs that need it fail
    /// through the normal failure path with `NotConfigured`.
    pub fn new(
        store: Arc<SpoolStore>,
        device: Option<Arc<dyn PrinterDevice>>,
        codec: Option<Arc<dyn LabelCodec>>,
        notifier: Notifier,
        config: QueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                store,
                device,
                codec,
                notifier,
                retries: RetryQueue::new(cancel.child_token()),
                config,
                tx,
                rx: tokio::sync::Mutex::new(rx),
                paused_printers: RwLock::new(HashSet::new()),
                cancel,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Restore printer holds, recover interrupted jobs, then start the
    /// dispatch sweep and workers.
    pub fn start(&self) -> Result<()> {
        let held = self.restore_paused_printers()?;
        let recovered = self.recover()?;
        let workers = self.inner.config.worker_count.max(1);

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(self.clone().dispatch_loop()));
        for worker in 0..workers {
            tasks.push(tokio::spawn(self.clone().worker_loop(worker)));
        }
        info!(workers, recovered, held, "scheduler started");
        Ok(())
    }

    /// Stop the sweep, the workers and every pending retry, then wait for
    /// the tasks to finish.  A transmission already in flight completes.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.retries.shutdown();
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Hold back every printer persisted as `paused`, so an operator pause
    /// outlives a restart on the dispatch side as well as the device side.
    pub fn restore_paused_printers(&self) -> Result<usize> {
        let paused: Vec<PrinterId> = self
            .inner
            .store
            .list_printers()?
            .into_iter()
            .filter(|printer| printer.status == PrinterState::Paused)
            .map(|printer| printer.id)
            .collect();
        let mut held = self
            .inner
            .paused_printers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for id in &paused {
            if held.insert(*id) {
                info!(printer_id = %id, "printer still paused, holding its jobs");
            }
        }
        Ok(paused.len())
    }

    /// Return every job left `processing` by an earlier run to `pending`.
    pub fn recover(&self) -> Result<usize> {
        let recovered = self.inner.store.recover_processing_jobs()?;
        if recovered > 0 {
            warn!(recovered, "reset interrupted jobs to pending");
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Persist a new `pending` job and offer it for dispatch.
    pub async fn enqueue(&self, request: JobRequest) -> Result<JobId> {
        if let Some(device) = &self.inner.device {
            if device.printer(request.printer_id).await.is_none() {
                return Err(SpoolError::PrinterNotFound(request.printer_id));
            }
        }

        let job = PrintJob {
            id: JobId(0),
            printer_id: request.printer_id,
            template_id: request.template_id,
            variables: request.variables,
            content: request.content.filter(|c| !c.is_empty()),
            status: JobStatus::Pending,
            priority: request.priority,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(self.inner.config.max_retries),
            copies: request.copies.max(1),
            error_message: None,
            submitted_by: request.submitted_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = self.inner.store.insert_job(&job)?;
        info!(job_id = %id, printer_id = %job.printer_id, priority = job.priority, copies = job.copies, "job enqueued");

        self.inner.offer(id);
        Ok(id)
    }

    /// Offer up to one batch of pending jobs, highest priority first.
    /// Stops early when the channel is full.  Returns the number offered.
    pub fn sweep(&self) -> Result<usize> {
        let ids = self.inner.store.pending_job_ids(self.inner.config.dispatch_batch)?;
        let mut offered = 0;
        for id in ids {
            match self.inner.tx.try_send(id) {
                Ok(()) => offered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(offered, "dispatch channel full, sweep stopped early");
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        Ok(offered)
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    pub fn cancel(&self, id: JobId) -> Result<()> {
        let job = self.job(id)?;
        if !self.inner.store.cancel_job(id, Utc::now())? {
            return Err(SpoolError::InvalidState(format!(
                "job {id} is {} and cannot be cancelled",
                job.status
            )));
        }
        self.inner.retries.cancel(id);
        info!(job_id = %id, "job cancelled");
        Ok(())
    }

    /// Give a failed job a fresh retry budget and dispatch it again.
    pub fn retry(&self, id: JobId) -> Result<()> {
        let job = self.job(id)?;
        if !self.inner.store.reset_failed_job(id)? {
            return Err(SpoolError::InvalidState(format!(
                "only failed jobs can be retried, job {id} is {}",
                job.status
            )));
        }
        info!(job_id = %id, "job retried");
        self.inner.offer(id);
        Ok(())
    }

    /// Submit a copy of an existing job as a brand-new job.
    pub async fn reprint(&self, id: JobId) -> Result<JobId> {
        let original = self.job(id)?;
        let new_id = self
            .enqueue(JobRequest {
                printer_id: original.printer_id,
                template_id: original.template_id,
                variables: original.variables,
                content: None,
                priority: original.priority,
                copies: original.copies,
                max_retries: Some(original.max_retries),
                submitted_by: original.submitted_by,
            })
            .await?;
        info!(job_id = %id, reprint_id = %new_id, "job reprinted");
        Ok(new_id)
    }

    /// Hold back a printer's jobs.  Its pending jobs are parked now; jobs
    /// submitted later are parked by the worker that picks them up.
    pub async fn pause_printer(&self, printer: PrinterId) -> Result<usize> {
        self.ensure_printer(printer).await?;
        self.inner
            .paused_printers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(printer);
        let parked = self.inner.store.pause_printer_jobs(printer)?;
        info!(printer_id = %printer, parked, "printer paused for dispatch");
        Ok(parked)
    }

    /// Release a printer and re-offer all of its paused jobs.
    pub async fn resume_printer(&self, printer: PrinterId) -> Result<usize> {
        self.ensure_printer(printer).await?;
        self.inner
            .paused_printers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&printer);
        let released = self.inner.store.resume_printer_jobs(printer)?;
        for id in &released {
            self.inner.retries.cancel(*id);
            self.inner.offer(*id);
        }
        info!(printer_id = %printer, released = released.len(), "printer resumed for dispatch");
        Ok(released.len())
    }

    pub fn is_printer_paused(&self, printer: PrinterId) -> bool {
        self.inner.is_printer_paused(printer)
    }

    pub fn pause_job(&self, id: JobId) -> Result<()> {
        let job = self.job(id)?;
        if !self.inner.store.pause_job(id)? {
            return Err(SpoolError::InvalidState(format!(
                "job {id} is {} and cannot be paused",
                job.status
            )));
        }
        // A job paused during backoff must not be requeued by its old timer
        // once it has been resumed and claimed again.
        if self.inner.retries.cancel(id) {
            debug!(job_id = %id, "dropped pending retry of paused job");
        }
        info!(job_id = %id, "job paused");
        Ok(())
    }

    pub fn resume_job(&self, id: JobId) -> Result<()> {
        let job = self.job(id)?;
        if self.inner.is_printer_paused(job.printer_id) {
            return Err(SpoolError::PrinterPaused(job.printer_id));
        }
        if !self.inner.store.resume_job(id)? {
            return Err(SpoolError::InvalidState(format!(
                "job {id} is {} and cannot be resumed",
                job.status
            )));
        }
        self.inner.retries.cancel(id);
        info!(job_id = %id, "job resumed");
        self.inner.offer(id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Result<QueueStats> {
        self.inner.store.count_by_status()
    }

    pub fn job(&self, id: JobId) -> Result<PrintJob> {
        self.inner.store.get_job(id)?.ok_or(SpoolError::JobNotFound(id))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<PrintJob>> {
        self.inner.store.list_jobs(filter)
    }

    /// Retries waiting out their backoff.
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.pending()
    }

    async fn ensure_printer(&self, printer: PrinterId) -> Result<()> {
        match &self.inner.device {
            Some(device) if device.printer(printer).await.is_none() => {
                Err(SpoolError::PrinterNotFound(printer))
            }
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn dispatch_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.dispatch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        warn!(error = %e, "dispatch sweep failed");
                    }
                }
            }
        }
        debug!("dispatch loop stopped");
    }

    async fn worker_loop(self, worker: usize) {
        loop {
            let next = tokio::select! {
                _ = self.inner.cancel.cancelled() => None,
                id = async { self.inner.rx.lock().await.recv().await } => id,
            };
            let Some(id) = next else { break };
            if let Err(e) = self.process(id).await {
                error!(worker, job_id = %id, error = %e, "job processing aborted");
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Run one dispatched job.  Errors returned here are store failures;
    /// job failures are handled inside.
    async fn process(&self, id: JobId) -> Result<()> {
        let Some(job) = self.inner.store.get_job(id)? else {
            debug!(job_id = %id, "dispatched job no longer exists");
            return Ok(());
        };
        if job.status != JobStatus::Pending {
            debug!(job_id = %id, status = %job.status, "skipping job that is no longer pending");
            return Ok(());
        }
        if self.inner.is_printer_paused(job.printer_id) {
            if self.inner.store.pause_job(id)? {
                info!(job_id = %id, printer_id = %job.printer_id, "job parked, printer paused");
            }
            return Ok(());
        }
        if !self.inner.store.claim_job(id, Utc::now())? {
            debug!(job_id = %id, "job claimed elsewhere");
            return Ok(());
        }
        self.inner.notifier.emit(EventKind::JobStarted {
            job_id: id,
            printer_id: job.printer_id,
        });

        match self.transmit(&job).await {
            Ok(()) => self.on_success(&job),
            Err(e) => self.on_failure(&job, e),
        }
    }

    async fn transmit(&self, job: &PrintJob) -> Result<()> {
        let content = match &job.content {
            Some(content) => content.clone(),
            None => {
                let codec = self
                    .inner
                    .codec
                    .as_ref()
                    .ok_or(SpoolError::NotConfigured("label codec"))?;
                let content = codec.generate(job.template_id, &job.variables)?;
                self.inner.store.set_job_content(job.id, &content)?;
                content
            }
        };
        let device = self
            .inner
            .device
            .as_ref()
            .ok_or(SpoolError::NotConfigured("device manager"))?;
        device.print(job.printer_id, &content, job.copies).await
    }

    fn on_success(&self, job: &PrintJob) -> Result<()> {
        if !self.inner.store.complete_job(job.id, Utc::now())? {
            warn!(job_id = %job.id, "job changed state during transmission, not marked completed");
            return Ok(());
        }
        let today = Utc::now().date_naive();
        if let Err(e) = self.inner.store.increment_daily_count(job.printer_id, today, job.copies) {
            warn!(job_id = %job.id, error = %e, "failed to update daily print counter");
        }
        info!(job_id = %job.id, printer_id = %job.printer_id, copies = job.copies, "job completed");
        self.inner.notifier.emit(EventKind::JobCompleted {
            job_id: job.id,
            printer_id: job.printer_id,
            copies: job.copies,
        });
        Ok(())
    }

    fn on_failure(&self, job: &PrintJob, err: SpoolError) -> Result<()> {
        let message = err.to_string();
        let fast_fail =
            self.inner.config.fast_fail_permanent && classify_error(&err) == ErrorClass::Permanent;

        if !fast_fail && job.retry_count < job.max_retries {
            self.inner.store.record_retry(job.id, &message)?;
            let delay = backoff_delay(self.inner.config.retry_delay(), job.retry_count);
            warn!(
                job_id = %job.id,
                attempt = job.retry_count + 1,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "job failed, retry scheduled"
            );

            let inner = Arc::clone(&self.inner);
            let id = job.id;
            self.inner.retries.schedule(id, delay, async move {
                match inner.store.requeue_job(id) {
                    Ok(true) => inner.offer(id),
                    Ok(false) => debug!(job_id = %id, "job left processing during backoff"),
                    Err(e) => warn!(job_id = %id, error = %e, "failed to requeue job"),
                }
            });
            return Ok(());
        }

        if !self.inner.store.fail_job(job.id, &message, Utc::now())? {
            warn!(job_id = %job.id, error = %message, "job changed state during transmission, not marked failed");
            return Ok(());
        }
        error!(job_id = %job.id, retries = job.retry_count, error = %message, "job failed");
        self.inner.notifier.emit(EventKind::JobFailed {
            job_id: job.id,
            printer_id: job.printer_id,
            error: message,
        });
        Ok(())
    }
}

impl Inner {
    /// Non-blocking offer; a dropped offer is recovered by the next sweep.
    fn offer(&self, id: JobId) {
        match self.tx.try_send(id) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(job_id = %id, "dispatch channel full, leaving job to the sweep");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(job_id = %id, "dispatch channel closed");
            }
        }
    }

    fn is_printer_paused(&self, printer: PrinterId) -> bool {
        self.paused_printers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&printer)
    }
}
