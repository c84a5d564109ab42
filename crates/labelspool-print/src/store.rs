// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent spool store backed by SQLite.
//
// The store is the system of record for printers, label templates, print jobs,
// daily print counters and the audit trail.  It never reorders jobs on its own:
// the scheduler decides what runs next.  Every job transition is a single
// conditional UPDATE so a stale caller cannot overwrite a newer state.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info, instrument};

use labelspool_core::error::{Result, SpoolError};
use labelspool_core::types::{
    JobFilter, JobId, JobStatus, LabelTemplate, PrintJob, Printer, PrinterId, PrinterState,
    QueueStats, TemplateId,
};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS printers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        port INTEGER NOT NULL DEFAULT 9100,
        dpi INTEGER NOT NULL DEFAULT 203,
        label_width_mm REAL NOT NULL DEFAULT 100,
        label_height_mm REAL NOT NULL DEFAULT 50,
        gap_mm REAL NOT NULL DEFAULT 2,
        status TEXT NOT NULL DEFAULT 'unknown',
        last_seen_at TEXT,
        total_prints INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS label_templates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        schema_json TEXT NOT NULL,
        width_mm REAL NOT NULL,
        height_mm REAL NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS print_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        printer_id INTEGER NOT NULL,
        template_id INTEGER NOT NULL,
        variables TEXT NOT NULL DEFAULT '{}',
        content TEXT,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        copies INTEGER NOT NULL DEFAULT 1,
        error_message TEXT,
        submitted_by TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_dispatch
        ON print_jobs (status, priority DESC, created_at ASC);
    CREATE INDEX IF NOT EXISTS idx_jobs_printer ON print_jobs (printer_id, status);

    CREATE TABLE IF NOT EXISTS print_counters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        printer_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0,
        UNIQUE (printer_id, date)
    );

    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );
"#;

const JOB_COLUMNS: &str = "id, printer_id, template_id, variables, content, status, priority, \
     retry_count, max_retries, copies, error_message, submitted_by, created_at, started_at, \
     completed_at";

const PRINTER_COLUMNS: &str = "id, name, address, port, dpi, label_width_mm, label_height_mm, \
     gap_mm, status, last_seen_at, total_prints";

/// One row of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed spool store.
///
/// Methods are synchronous and hold the connection lock only for the duration
/// of one statement (or one short transaction).
pub struct SpoolStore {
    conn: Mutex<Connection>,
}

impl SpoolStore {
    /// Open (or create) the spool database at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SpoolError::Database(format!("open: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SpoolError::Database(format!("WAL pragma: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| SpoolError::Database(format!("create schema: {e}")))?;

        info!("spool database opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SpoolError::Database(format!("open in-memory: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| SpoolError::Database(format!("create schema: {e}")))?;

        debug!("in-memory spool database opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SpoolError::Database("connection lock poisoned".into()))
    }

    // -----------------------------------------------------------------------
    // Printers
    // -----------------------------------------------------------------------

    /// Insert a printer.  `PrinterId(0)` lets the store assign the id; any
    /// other id is used as given and rejected if already taken.
    #[instrument(skip(self, printer), fields(name = %printer.name))]
    pub fn insert_printer(&self, printer: &Printer) -> Result<PrinterId> {
        let conn = self.conn()?;
        let explicit = (printer.id.0 != 0).then_some(printer.id.0);
        if let Some(id) = explicit {
            let exists: bool = conn
                .query_row("SELECT EXISTS(SELECT 1 FROM printers WHERE id = ?1)", [id], |r| {
                    r.get(0)
                })
                .map_err(|e| SpoolError::Database(format!("check printer: {e}")))?;
            if exists {
                return Err(SpoolError::PrinterExists(printer.id));
            }
        }

        conn.execute(
            "INSERT INTO printers (id, name, address, port, dpi, label_width_mm,
             label_height_mm, gap_mm, status, last_seen_at, total_prints)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                explicit,
                printer.name,
                printer.address,
                printer.port,
                printer.dpi,
                printer.label_width_mm,
                printer.label_height_mm,
                printer.gap_mm,
                printer.status.as_str(),
                printer.last_seen_at.map(ts),
                printer.total_prints as i64,
            ],
        )
        .map_err(|e| SpoolError::Database(format!("insert printer: {e}")))?;

        let id = PrinterId(conn.last_insert_rowid());
        info!(printer_id = %id, "printer inserted");
        Ok(id)
    }

    pub fn get_printer(&self, id: PrinterId) -> Result<Option<Printer>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {PRINTER_COLUMNS} FROM printers WHERE id = ?1"),
            [id.0],
            row_to_printer,
        )
        .optional()
        .map_err(|e| SpoolError::Database(format!("get printer: {e}")))
    }

    pub fn list_printers(&self) -> Result<Vec<Printer>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {PRINTER_COLUMNS} FROM printers ORDER BY name, id"))
            .map_err(|e| SpoolError::Database(format!("prepare list_printers: {e}")))?;
        stmt.query_map([], row_to_printer)
            .map_err(|e| SpoolError::Database(format!("query list_printers: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpoolError::Database(format!("collect printers: {e}")))
    }

    /// Update a printer's connection parameters and label geometry.
    /// Status and counters are left untouched.
    #[instrument(skip(self, printer), fields(printer_id = %printer.id))]
    pub fn update_printer(&self, printer: &Printer) -> Result<()> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE printers SET name = ?1, address = ?2, port = ?3, dpi = ?4,
                 label_width_mm = ?5, label_height_mm = ?6, gap_mm = ?7 WHERE id = ?8",
                params![
                    printer.name,
                    printer.address,
                    printer.port,
                    printer.dpi,
                    printer.label_width_mm,
                    printer.label_height_mm,
                    printer.gap_mm,
                    printer.id.0,
                ],
            )
            .map_err(|e| SpoolError::Database(format!("update printer: {e}")))?;
        if rows == 0 {
            return Err(SpoolError::PrinterNotFound(printer.id));
        }
        Ok(())
    }

    /// Returns `false` if the printer did not exist.
    pub fn delete_printer(&self, id: PrinterId) -> Result<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM printers WHERE id = ?1", [id.0])
            .map_err(|e| SpoolError::Database(format!("delete printer: {e}")))?;
        Ok(rows > 0)
    }

    /// Record a printer status.  `last_seen_at` is only overwritten when given.
    pub fn update_printer_status(
        &self,
        id: PrinterId,
        status: PrinterState,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE printers SET status = ?1, last_seen_at = COALESCE(?2, last_seen_at)
                 WHERE id = ?3",
                params![status.as_str(), last_seen_at.map(ts), id.0],
            )
            .map_err(|e| SpoolError::Database(format!("update printer status: {e}")))?;
        Ok(())
    }

    pub fn increment_print_count(&self, id: PrinterId, copies: u32) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE printers SET total_prints = total_prints + ?1 WHERE id = ?2",
                params![copies, id.0],
            )
            .map_err(|e| SpoolError::Database(format!("increment print count: {e}")))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub fn insert_template(&self, template: &LabelTemplate) -> Result<TemplateId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO label_templates (id, name, description, schema_json, width_mm,
             height_mm, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                (template.id.0 != 0).then_some(template.id.0),
                template.name,
                template.description,
                template.schema_json,
                template.width_mm,
                template.height_mm,
                ts(template.created_at),
            ],
        )
        .map_err(|e| SpoolError::Database(format!("insert template: {e}")))?;
        Ok(TemplateId(conn.last_insert_rowid()))
    }

    pub fn get_template(&self, id: TemplateId) -> Result<Option<LabelTemplate>> {
        self.conn()?
            .query_row(
                "SELECT id, name, description, schema_json, width_mm, height_mm, created_at
                 FROM label_templates WHERE id = ?1",
                [id.0],
                row_to_template,
            )
            .optional()
            .map_err(|e| SpoolError::Database(format!("get template: {e}")))
    }

    pub fn list_templates(&self) -> Result<Vec<LabelTemplate>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, description, schema_json, width_mm, height_mm, created_at
                 FROM label_templates ORDER BY name, id",
            )
            .map_err(|e| SpoolError::Database(format!("prepare list_templates: {e}")))?;
        stmt.query_map([], row_to_template)
            .map_err(|e| SpoolError::Database(format!("query list_templates: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpoolError::Database(format!("collect templates: {e}")))
    }

    pub fn delete_template(&self, id: TemplateId) -> Result<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM label_templates WHERE id = ?1", [id.0])
            .map_err(|e| SpoolError::Database(format!("delete template: {e}")))?;
        Ok(rows > 0)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Persist a new job and return its store-assigned id.  `job.id` is ignored.
    #[instrument(skip(self, job), fields(printer_id = %job.printer_id, priority = job.priority))]
    pub fn insert_job(&self, job: &PrintJob) -> Result<JobId> {
        let variables = serde_json::to_string(&job.variables)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO print_jobs (printer_id, template_id, variables, content, status,
             priority, retry_count, max_retries, copies, error_message, submitted_by,
             created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.printer_id.0,
                job.template_id.0,
                variables,
                job.content,
                job.status.as_str(),
                job.priority,
                job.retry_count,
                job.max_retries,
                job.copies,
                job.error_message,
                job.submitted_by,
                ts(job.created_at),
                job.started_at.map(ts),
                job.completed_at.map(ts),
            ],
        )
        .map_err(|e| SpoolError::Database(format!("insert job: {e}")))?;

        let id = JobId(conn.last_insert_rowid());
        debug!(job_id = %id, "job inserted");
        Ok(id)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<PrintJob>> {
        self.conn()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM print_jobs WHERE id = ?1"),
                [id.0],
                row_to_job,
            )
            .optional()
            .map_err(|e| SpoolError::Database(format!("get job: {e}")))
    }

    /// List jobs matching `filter`, highest priority then newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<PrintJob>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().into()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(printer) = filter.printer_id {
            values.push(Value::Integer(printer.0));
            clauses.push(format!("printer_id = ?{}", values.len()));
        }
        if let Some(from) = filter.created_from {
            values.push(Value::Text(ts(from)));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(to) = filter.created_to {
            values.push(Value::Text(ts(to)));
            clauses.push(format!("created_at <= ?{}", values.len()));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM print_jobs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY priority DESC, created_at DESC, id DESC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", filter.limit, filter.offset));
        }

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SpoolError::Database(format!("prepare list_jobs: {e}")))?;
        stmt.query_map(params_from_iter(values.iter()), row_to_job)
            .map_err(|e| SpoolError::Database(format!("query list_jobs: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpoolError::Database(format!("collect jobs: {e}")))
    }

    /// Pending job ids in dispatch order: priority DESC, created_at ASC, id ASC.
    pub fn pending_job_ids(&self, limit: u32) -> Result<Vec<JobId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM print_jobs WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?1",
            )
            .map_err(|e| SpoolError::Database(format!("prepare pending_job_ids: {e}")))?;
        stmt.query_map([limit], |row| row.get(0).map(JobId))
            .map_err(|e| SpoolError::Database(format!("query pending_job_ids: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpoolError::Database(format!("collect pending ids: {e}")))
    }

    pub fn set_job_content(&self, id: JobId, content: &str) -> Result<()> {
        self.conn()?
            .execute("UPDATE print_jobs SET content = ?1 WHERE id = ?2", params![content, id.0])
            .map_err(|e| SpoolError::Database(format!("set job content: {e}")))?;
        Ok(())
    }

    /// `pending → processing`, stamping `started_at`.  Returns `false` if the
    /// job was no longer pending.
    pub fn claim_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'processing', started_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![ts(now), id.0],
            "claim job",
        )
    }

    /// Mark a transmitted job completed.  A job paused while its transmission
    /// was in flight is completed as well.
    pub fn complete_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'completed', completed_at = ?1, error_message = NULL
             WHERE id = ?2 AND status IN ('processing', 'paused')",
            params![ts(now), id.0],
            "complete job",
        )
    }

    /// Count one more failed attempt and remember its error.
    pub fn record_retry(&self, id: JobId, error: &str) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET retry_count = retry_count + 1, error_message = ?1
             WHERE id = ?2",
            params![error, id.0],
            "record retry",
        )
    }

    /// `processing → pending` once a backoff has elapsed.
    pub fn requeue_job(&self, id: JobId) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'pending' WHERE id = ?1 AND status = 'processing'",
            params![id.0],
            "requeue job",
        )
    }

    /// A job paused mid-transmission still fails when its last attempt
    /// does, so resuming it cannot buy attempts beyond its budget.
    pub fn fail_job(&self, id: JobId, error: &str, now: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE id = ?3 AND status IN ('processing', 'paused')",
            params![error, ts(now), id.0],
            "fail job",
        )
    }

    pub fn cancel_job(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'cancelled', completed_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'paused')",
            params![ts(now), id.0],
            "cancel job",
        )
    }

    /// `failed → pending` with a fresh retry budget.
    pub fn reset_failed_job(&self, id: JobId) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'pending', retry_count = 0, error_message = NULL,
             started_at = NULL, completed_at = NULL WHERE id = ?1 AND status = 'failed'",
            params![id.0],
            "reset failed job",
        )
    }

    pub fn pause_job(&self, id: JobId) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'paused'
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![id.0],
            "pause job",
        )
    }

    pub fn resume_job(&self, id: JobId) -> Result<bool> {
        self.transition(
            "UPDATE print_jobs SET status = 'pending' WHERE id = ?1 AND status = 'paused'",
            params![id.0],
            "resume job",
        )
    }

    /// Park every pending job of a printer.  Returns the number parked.
    pub fn pause_printer_jobs(&self, printer: PrinterId) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE print_jobs SET status = 'paused'
                 WHERE printer_id = ?1 AND status = 'pending'",
                [printer.0],
            )
            .map_err(|e| SpoolError::Database(format!("pause printer jobs: {e}")))
    }

    /// Release every paused job of a printer and return their ids in
    /// dispatch order.
    pub fn resume_printer_jobs(&self, printer: PrinterId) -> Result<Vec<JobId>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| SpoolError::Database(format!("begin resume: {e}")))?;

        let ids = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM print_jobs WHERE printer_id = ?1 AND status = 'paused'
                     ORDER BY priority DESC, created_at ASC, id ASC",
                )
                .map_err(|e| SpoolError::Database(format!("prepare resume: {e}")))?;
            stmt.query_map([printer.0], |row| row.get(0).map(JobId))
                .map_err(|e| SpoolError::Database(format!("query resume: {e}")))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| SpoolError::Database(format!("collect resume ids: {e}")))?
        };
        tx.execute(
            "UPDATE print_jobs SET status = 'pending' WHERE printer_id = ?1 AND status = 'paused'",
            [printer.0],
        )
        .map_err(|e| SpoolError::Database(format!("resume printer jobs: {e}")))?;
        tx.commit()
            .map_err(|e| SpoolError::Database(format!("commit resume: {e}")))?;
        Ok(ids)
    }

    /// Return jobs left `processing` by an earlier run to `pending`.
    pub fn recover_processing_jobs(&self) -> Result<usize> {
        self.conn()?
            .execute("UPDATE print_jobs SET status = 'pending' WHERE status = 'processing'", [])
            .map_err(|e| SpoolError::Database(format!("recover jobs: {e}")))
    }

    pub fn count_by_status(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM print_jobs GROUP BY status")
            .map_err(|e| SpoolError::Database(format!("prepare stats: {e}")))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| SpoolError::Database(format!("query stats: {e}")))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row.map_err(|e| SpoolError::Database(format!("stats row: {e}")))?;
            if let Some(status) = JobStatus::parse(&status) {
                stats.add(status, count as u64);
            }
        }
        Ok(stats)
    }

    pub fn delete_job(&self, id: JobId) -> Result<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM print_jobs WHERE id = ?1", [id.0])
            .map_err(|e| SpoolError::Database(format!("delete job: {e}")))?;
        Ok(rows > 0)
    }

    fn transition(&self, sql: &str, params: impl rusqlite::Params, op: &str) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(sql, params)
            .map_err(|e| SpoolError::Database(format!("{op}: {e}")))?;
        Ok(rows > 0)
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    pub fn increment_daily_count(&self, printer: PrinterId, date: NaiveDate, n: u32) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO print_counters (printer_id, date, count) VALUES (?1, ?2, ?3)
                 ON CONFLICT (printer_id, date) DO UPDATE SET count = count + excluded.count",
                params![printer.0, date.to_string(), n],
            )
            .map_err(|e| SpoolError::Database(format!("increment daily count: {e}")))?;
        Ok(())
    }

    pub fn daily_count(&self, printer: PrinterId, date: NaiveDate) -> Result<u64> {
        let count: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT count FROM print_counters WHERE printer_id = ?1 AND date = ?2",
                params![printer.0, date.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SpoolError::Database(format!("daily count: {e}")))?;
        Ok(count.unwrap_or(0) as u64)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub fn append_audit(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO audit_log (action, entity_type, entity_id, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![action, entity_type, entity_id, details.to_string(), ts(Utc::now())],
            )
            .map_err(|e| SpoolError::Database(format!("append audit: {e}")))?;
        Ok(())
    }

    /// Most recent audit entries first.
    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, action, entity_type, entity_id, details, created_at
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| SpoolError::Database(format!("prepare audit: {e}")))?;
        stmt.query_map([limit], |row| {
            let details: String = row.get(4)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                action: row.get(1)?,
                entity_type: row.get(2)?,
                entity_id: row.get(3)?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
            })
        })
        .map_err(|e| SpoolError::Database(format!("query audit: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SpoolError::Database(format!("collect audit: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamps so lexical order equals chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, msg.into())
}

fn parse_ts(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(col, format!("timestamp {s:?}: {e}")))
}

fn parse_opt_ts(col: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(col, &s)).transpose()
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintJob> {
    let variables: String = row.get(3)?;
    let status: String = row.get(5)?;

    Ok(PrintJob {
        id: JobId(row.get(0)?),
        printer_id: PrinterId(row.get(1)?),
        template_id: TemplateId(row.get(2)?),
        variables: serde_json::from_str(&variables)
            .map_err(|e| conversion_error(3, format!("variables: {e}")))?,
        content: row.get(4)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| conversion_error(5, format!("unknown job status {status:?}")))?,
        priority: row.get(6)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        copies: row.get(9)?,
        error_message: row.get(10)?,
        submitted_by: row.get(11)?,
        created_at: parse_ts(12, &row.get::<_, String>(12)?)?,
        started_at: parse_opt_ts(13, row.get(13)?)?,
        completed_at: parse_opt_ts(14, row.get(14)?)?,
    })
}

fn row_to_printer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Printer> {
    let status: String = row.get(8)?;
    Ok(Printer {
        id: PrinterId(row.get(0)?),
        name: row.get(1)?,
        address: row.get(2)?,
        port: row.get(3)?,
        dpi: row.get(4)?,
        label_width_mm: row.get(5)?,
        label_height_mm: row.get(6)?,
        gap_mm: row.get(7)?,
        status: PrinterState::parse(&status).unwrap_or(PrinterState::Unknown),
        last_seen_at: parse_opt_ts(9, row.get(9)?)?,
        total_prints: row.get::<_, i64>(10)? as u64,
    })
}

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<LabelTemplate> {
    Ok(LabelTemplate {
        id: TemplateId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        schema_json: row.get(3)?,
        width_mm: row.get(4)?,
        height_mm: row.get(5)?,
        created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn store() -> SpoolStore {
        SpoolStore::open_in_memory().expect("open in-memory db")
    }

    fn job(printer: i64, priority: i32, created_at: DateTime<Utc>) -> PrintJob {
        PrintJob {
            id: JobId(0),
            printer_id: PrinterId(printer),
            template_id: TemplateId(1),
            variables: BTreeMap::from([("sku".to_string(), "A-1".to_string())]),
            content: None,
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries: 3,
            copies: 1,
            error_message: None,
            submitted_by: "test".into(),
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn insert_and_get_job() {
        let store = store();
        let id = store.insert_job(&job(1, 5, Utc::now())).expect("insert");

        let stored = store.get_job(id).expect("get").expect("found");
        assert_eq!(stored.id, id);
        assert_eq!(stored.priority, 5);
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.variables.get("sku").map(String::as_str), Some("A-1"));
        assert!(stored.started_at.is_none());
    }

    #[test]
    fn get_missing_job_returns_none() {
        assert!(store().get_job(JobId(404)).expect("get").is_none());
    }

    #[test]
    fn pending_order_is_priority_then_age() {
        let store = store();
        let t0 = Utc::now();
        let old_low = store.insert_job(&job(1, 0, t0)).unwrap();
        let new_high = store.insert_job(&job(1, 9, t0 + Duration::seconds(2))).unwrap();
        let old_high = store.insert_job(&job(1, 9, t0 + Duration::seconds(1))).unwrap();
        let done = store.insert_job(&job(1, 99, t0)).unwrap();
        store.claim_job(done, t0).unwrap();

        let ids = store.pending_job_ids(100).expect("pending");
        assert_eq!(ids, vec![old_high, new_high, old_low]);
        assert_eq!(store.pending_job_ids(1).unwrap(), vec![old_high]);
    }

    #[test]
    fn claim_is_conditional() {
        let store = store();
        let id = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        assert!(store.claim_job(id, Utc::now()).unwrap());
        assert!(!store.claim_job(id, Utc::now()).unwrap());

        let claimed = store.get_job(id).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn cancel_only_from_pending_or_paused() {
        let store = store();
        let pending = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        let processing = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        store.claim_job(processing, Utc::now()).unwrap();

        assert!(store.cancel_job(pending, Utc::now()).unwrap());
        assert!(!store.cancel_job(processing, Utc::now()).unwrap());

        let cancelled = store.get_job(pending).unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(
            store.get_job(processing).unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[test]
    fn retry_then_fail_then_reset() {
        let store = store();
        let id = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        store.claim_job(id, Utc::now()).unwrap();
        store.record_retry(id, "offline").unwrap();
        assert!(store.requeue_job(id).unwrap());
        store.claim_job(id, Utc::now()).unwrap();
        assert!(store.fail_job(id, "still offline", Utc::now()).unwrap());

        let failed = store.get_job(id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("still offline"));

        assert!(store.reset_failed_job(id).unwrap());
        let reset = store.get_job(id).unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.retry_count, 0);
        assert!(reset.error_message.is_none());
        assert!(reset.completed_at.is_none());
        assert!(!store.reset_failed_job(id).unwrap());
    }

    #[test]
    fn fail_reaches_jobs_paused_in_flight_only() {
        let store = store();
        let paused = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        store.claim_job(paused, Utc::now()).unwrap();
        assert!(store.pause_job(paused).unwrap());
        assert!(store.fail_job(paused, "offline", Utc::now()).unwrap());
        let failed = store.get_job(paused).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.completed_at.is_some());

        let pending = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        assert!(!store.fail_job(pending, "offline", Utc::now()).unwrap());
        store.cancel_job(pending, Utc::now()).unwrap();
        assert!(!store.fail_job(pending, "offline", Utc::now()).unwrap());
        assert_eq!(store.get_job(pending).unwrap().unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn printer_bulk_pause_and_resume() {
        let store = store();
        let a = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        let b = store.insert_job(&job(1, 3, Utc::now())).unwrap();
        let other = store.insert_job(&job(2, 0, Utc::now())).unwrap();

        assert_eq!(store.pause_printer_jobs(PrinterId(1)).unwrap(), 2);
        assert_eq!(store.get_job(other).unwrap().unwrap().status, JobStatus::Pending);

        let resumed = store.resume_printer_jobs(PrinterId(1)).unwrap();
        assert_eq!(resumed, vec![b, a]);
        assert_eq!(store.get_job(a).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn recover_resets_processing() {
        let store = store();
        let id = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        store.claim_job(id, Utc::now()).unwrap();
        assert_eq!(store.recover_processing_jobs().unwrap(), 1);
        assert_eq!(store.get_job(id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn stats_aggregate_per_status() {
        let store = store();
        for _ in 0..3 {
            store.insert_job(&job(1, 0, Utc::now())).unwrap();
        }
        let id = store.insert_job(&job(1, 0, Utc::now())).unwrap();
        store.claim_job(id, Utc::now()).unwrap();
        store.complete_job(id, Utc::now()).unwrap();

        let stats = store.count_by_status().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total, 4);
    }

    #[test]
    fn list_jobs_filters() {
        let store = store();
        let t0 = Utc::now();
        store.insert_job(&job(1, 0, t0)).unwrap();
        let late = store.insert_job(&job(2, 0, t0 + Duration::hours(1))).unwrap();

        let by_printer = store
            .list_jobs(&JobFilter { printer_id: Some(PrinterId(2)), ..Default::default() })
            .unwrap();
        assert_eq!(by_printer.len(), 1);
        assert_eq!(by_printer[0].id, late);

        let since = store
            .list_jobs(&JobFilter {
                created_from: Some(t0 + Duration::minutes(30)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(since.len(), 1);

        let limited = store.list_jobs(&JobFilter { limit: 1, ..Default::default() }).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn duplicate_printer_id_rejected() {
        let store = store();
        let mut printer = Printer::new("dock", "10.0.0.2");
        printer.id = PrinterId(7);
        assert_eq!(store.insert_printer(&printer).unwrap(), PrinterId(7));
        assert!(matches!(
            store.insert_printer(&printer),
            Err(SpoolError::PrinterExists(PrinterId(7)))
        ));
    }

    #[test]
    fn printer_status_and_counter() {
        let store = store();
        let id = store.insert_printer(&Printer::new("dock", "10.0.0.2")).unwrap();
        let seen = Utc::now();
        store.update_printer_status(id, PrinterState::Online, Some(seen)).unwrap();
        store.update_printer_status(id, PrinterState::Paused, None).unwrap();
        store.increment_print_count(id, 2).unwrap();
        store.increment_print_count(id, 3).unwrap();

        let printer = store.get_printer(id).unwrap().unwrap();
        assert_eq!(printer.status, PrinterState::Paused);
        assert!(printer.last_seen_at.is_some());
        assert_eq!(printer.total_prints, 5);
    }

    #[test]
    fn daily_counter_upserts() {
        let store = store();
        let day = Utc::now().date_naive();
        store.increment_daily_count(PrinterId(1), day, 2).unwrap();
        store.increment_daily_count(PrinterId(1), day, 1).unwrap();
        assert_eq!(store.daily_count(PrinterId(1), day).unwrap(), 3);
        assert_eq!(store.daily_count(PrinterId(2), day).unwrap(), 0);
    }

    #[test]
    fn audit_entries_round_trip() {
        let store = store();
        store
            .append_audit("job_failed", "job", "12", &serde_json::json!({"error": "offline"}))
            .unwrap();
        let entries = store.recent_audit(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details["error"], "offline");
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spool.db");
        let id = {
            let store = SpoolStore::open(&path).expect("open");
            store.insert_job(&job(1, 2, Utc::now())).unwrap()
        };
        let store = SpoolStore::open(&path).expect("reopen");
        assert_eq!(store.get_job(id).unwrap().unwrap().priority, 2);
    }
}
