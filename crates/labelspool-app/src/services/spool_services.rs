// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer: opens the spool store, builds the notifier, device
// manager, label codec and scheduler, and exposes one operator-facing API
// over all of them.
//
// Every backend component is shared through `Arc`, so handing clones of the
// store or device manager to the scheduler and notifier sinks is cheap and
// needs no global state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use labelspool_core::config::SpoolConfig;
use labelspool_core::error::{Result, SpoolError};
use labelspool_core::status::DeviceStatus;
use labelspool_core::types::{
    JobFilter, JobId, JobRequest, LabelTemplate, PrintJob, Printer, PrinterId, QueueStats,
    TemplateId,
};
use labelspool_label::Tspl2Generator;
use labelspool_print::{
    AuditEntry, AuditSink, DeviceManager, EventSink, LabelCodec, LogSink, Notifier,
    PrinterDevice, Scheduler, SpoolStore, TemplateCodec,
};

use super::data_dir;

/// How long shutdown waits for queued notifications to be delivered.
const NOTIFIER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns every running backend service.  Only the daemon lifecycle methods
/// are called from `main`; the rest is the operator API.
pub struct SpoolServices {
    store: Arc<SpoolStore>,
    devices: Arc<DeviceManager>,
    codec: Arc<TemplateCodec>,
    scheduler: Scheduler,
    generator: Tspl2Generator,
    health_task: Option<JoinHandle<()>>,
    notifier_task: JoinHandle<()>,
}

#[allow(dead_code)]
impl SpoolServices {
    /// Open the database named by the config (or the default location) and
    /// build every service.  Nothing runs until `start`.
    pub fn init(config: &SpoolConfig) -> Result<Self> {
        let path = config
            .database
            .path
            .clone()
            .unwrap_or_else(data_dir::default_database_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening spool database");
        Self::with_store(Arc::new(SpoolStore::open(&path)?), config)
    }

    /// Services over a throwaway in-memory database.
    pub fn in_memory(config: &SpoolConfig) -> Result<Self> {
        Self::with_store(Arc::new(SpoolStore::open_in_memory()?), config)
    }

    fn with_store(store: Arc<SpoolStore>, config: &SpoolConfig) -> Result<Self> {
        let sink: Arc<dyn EventSink> = if config.notifications.audit_enabled {
            Arc::new(AuditSink::new(store.clone()))
        } else {
            Arc::new(LogSink)
        };
        let (notifier, notifier_task) = Notifier::spawn(sink, config.notifications.capacity);

        let devices = Arc::new(DeviceManager::new(
            store.clone(),
            notifier.clone(),
            &config.printers,
        )?);
        let codec = Arc::new(TemplateCodec::new(store.clone()));
        let scheduler = Scheduler::new(
            store.clone(),
            Some(devices.clone() as Arc<dyn PrinterDevice>),
            Some(codec.clone() as Arc<dyn LabelCodec>),
            notifier,
            config.queue.clone(),
        );

        info!("spool services initialised");
        Ok(Self {
            store,
            devices,
            codec,
            scheduler,
            generator: Tspl2Generator::new(),
            health_task: None,
            notifier_task,
        })
    }

    /// Start health checks, then recover interrupted jobs and start the
    /// dispatcher and workers.
    pub fn start(&mut self) -> Result<()> {
        if self.health_task.is_none() {
            self.health_task = Some(self.devices.start());
        }
        self.scheduler.start()
    }

    /// Stop the scheduler, then the device manager, then let the notifier
    /// drain whatever events are still buffered.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.devices.shutdown().await;
        if let Some(task) = self.health_task {
            if let Err(e) = task.await {
                warn!(error = %e, "health-check task ended abnormally");
            }
        }

        // The notifier task ends once every producer handle is gone.
        drop(self.scheduler);
        drop(self.devices);
        match tokio::time::timeout(NOTIFIER_DRAIN_TIMEOUT, self.notifier_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "notifier task ended abnormally"),
            Err(_) => warn!("notifier did not drain before shutdown timeout"),
        }
        info!("spool services stopped");
    }

    // -- Jobs ----------------------------------------------------------------

    /// Submit a job.  Template jobs have their variables checked up front so
    /// a bad submission is rejected instead of failing in the queue.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        if request.content.as_deref().is_none_or(str::is_empty) {
            self.codec
                .validate_variables(request.template_id, &request.variables)?;
        }
        self.scheduler.enqueue(request).await
    }

    pub fn job(&self, id: JobId) -> Result<PrintJob> {
        self.scheduler.job(id)
    }

    pub fn jobs(&self, filter: &JobFilter) -> Result<Vec<PrintJob>> {
        self.scheduler.list_jobs(filter)
    }

    pub fn cancel_job(&self, id: JobId) -> Result<()> {
        self.scheduler.cancel(id)
    }

    pub fn retry_job(&self, id: JobId) -> Result<()> {
        self.scheduler.retry(id)
    }

    pub async fn reprint_job(&self, id: JobId) -> Result<JobId> {
        self.scheduler.reprint(id).await
    }

    pub fn pause_job(&self, id: JobId) -> Result<()> {
        self.scheduler.pause_job(id)
    }

    pub fn resume_job(&self, id: JobId) -> Result<()> {
        self.scheduler.resume_job(id)
    }

    /// Remove a job record.  Only jobs that have reached a terminal status
    /// can be deleted.
    pub fn delete_job(&self, id: JobId) -> Result<()> {
        let job = self.scheduler.job(id)?;
        if !job.status.is_terminal() {
            return Err(SpoolError::InvalidState(format!(
                "job {id} is {} and cannot be deleted",
                job.status
            )));
        }
        self.store.delete_job(id)?;
        Ok(())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.scheduler.stats()
    }

    // -- Printers ------------------------------------------------------------

    pub async fn add_printer(&self, printer: Printer) -> Result<PrinterId> {
        let id = self.devices.add_printer(printer).await?;
        self.audit("printer_added", "printer", id.to_string());
        Ok(id)
    }

    pub async fn update_printer(&self, printer: Printer) -> Result<()> {
        let id = printer.id;
        self.devices.update_printer(printer).await?;
        self.audit("printer_updated", "printer", id.to_string());
        Ok(())
    }

    pub async fn remove_printer(&self, id: PrinterId) -> Result<()> {
        self.devices.remove_printer(id).await?;
        self.audit("printer_removed", "printer", id.to_string());
        Ok(())
    }

    pub async fn printer(&self, id: PrinterId) -> Result<Printer> {
        self.devices
            .get_printer(id)
            .await
            .ok_or(SpoolError::PrinterNotFound(id))
    }

    pub async fn printers(&self) -> Vec<Printer> {
        self.devices.list_printers().await
    }

    /// Poll a printer now instead of waiting for the next health sweep.
    pub async fn check_printer(&self, id: PrinterId) -> Result<DeviceStatus> {
        self.devices.check_status(id).await
    }

    pub async fn send_command(&self, id: PrinterId, command: &str) -> Result<()> {
        self.devices.send_command(id, command).await
    }

    /// Hold a printer: its jobs stop dispatching and its reported status
    /// stays `paused` until resumed.  Returns the number of jobs parked.
    pub async fn pause_printer(&self, id: PrinterId) -> Result<usize> {
        self.devices.pause_printer(id).await?;
        self.scheduler.pause_printer(id).await
    }

    /// Release a printer and its parked jobs.  Returns the number released.
    pub async fn resume_printer(&self, id: PrinterId) -> Result<usize> {
        self.devices.resume_printer(id).await?;
        self.scheduler.resume_printer(id).await
    }

    // -- Templates -----------------------------------------------------------

    /// Validate a label schema and store it as a template.
    pub fn register_template(
        &self,
        name: &str,
        description: &str,
        schema_json: &str,
    ) -> Result<TemplateId> {
        let schema = self.generator.parse_schema(schema_json)?;
        let id = self.store.insert_template(&LabelTemplate {
            id: TemplateId(0),
            name: name.to_string(),
            description: description.to_string(),
            schema_json: schema_json.to_string(),
            width_mm: schema.width_mm,
            height_mm: schema.height_mm,
            created_at: Utc::now(),
        })?;
        info!(template_id = %id, name, "template registered");
        self.audit("template_registered", "template", id.to_string());
        Ok(id)
    }

    pub fn template(&self, id: TemplateId) -> Result<LabelTemplate> {
        self.store
            .get_template(id)?
            .ok_or(SpoolError::TemplateNotFound(id))
    }

    pub fn templates(&self) -> Result<Vec<LabelTemplate>> {
        self.store.list_templates()
    }

    pub fn delete_template(&self, id: TemplateId) -> Result<()> {
        if !self.store.delete_template(id)? {
            return Err(SpoolError::TemplateNotFound(id));
        }
        self.audit("template_deleted", "template", id.to_string());
        Ok(())
    }

    /// Render a template with sample values for every variable.
    pub fn preview_template(&self, id: TemplateId) -> Result<String> {
        let template = self.template(id)?;
        let schema = self.generator.parse_schema(&template.schema_json)?;
        self.generator.preview(&schema)
    }

    // -- Audit ---------------------------------------------------------------

    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        self.store.recent_audit(limit)
    }

    /// Record an operator action.  Failures are logged, never propagated.
    fn audit(&self, action: &str, entity_type: &str, entity_id: String) {
        let details = serde_json::json!({ "at": Utc::now().to_rfc3339() });
        if let Err(e) = self
            .store
            .append_audit(action, entity_type, &entity_id, &details)
        {
            warn!(action, error = %e, "failed to write audit entry");
        }
    }
}
