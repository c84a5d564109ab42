// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the labelspool print spool.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default raw TCP port for label printers (JetDirect-style).
pub const DEFAULT_PRINTER_PORT: u16 = 9100;

/// Default printhead resolution in dots per inch.
pub const DEFAULT_DPI: u32 = 203;

macro_rules! store_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

store_id!(
    /// Store-assigned identifier of a print job.
    JobId
);
store_id!(
    /// Identifier of a managed printer.
    PrinterId
);
store_id!(
    /// Identifier of a label template.
    TemplateId
);

/// Lifecycle states of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be dispatched to a worker.
    Pending,
    /// Claimed by a worker (or waiting out a retry backoff).
    Processing,
    /// Transmitted to the printer.
    Completed,
    /// Retries exhausted, see the job's error message.
    Failed,
    /// Parked, either explicitly or because its printer is paused.
    Paused,
    /// Cancelled by an operator before it was printed.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Paused,
        Self::Cancelled,
    ];

    /// Storage / wire keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal statuses always carry a completion timestamp.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing printer status, derived from live polling or an explicit
/// pause/resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterState {
    Unknown,
    Online,
    Busy,
    Paused,
    Error,
    Offline,
}

impl PrinterState {
    pub const ALL: [PrinterState; 6] = [
        Self::Unknown,
        Self::Online,
        Self::Busy,
        Self::Paused,
        Self::Error,
        Self::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }
}

impl std::fmt::Display for PrinterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed label printer endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
    /// `PrinterId(0)` asks the store to assign an identifier on insert.
    pub id: PrinterId,
    pub name: String,
    /// Hostname or IP address.
    pub address: String,
    pub port: u16,
    pub dpi: u32,
    pub label_width_mm: f64,
    pub label_height_mm: f64,
    pub gap_mm: f64,
    pub status: PrinterState,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Lifetime label counter. Only ever increases.
    pub total_prints: u64,
}

impl Printer {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: PrinterId(0),
            name: name.into(),
            address: address.into(),
            port: DEFAULT_PRINTER_PORT,
            dpi: DEFAULT_DPI,
            label_width_mm: 100.0,
            label_height_mm: 50.0,
            gap_mm: 2.0,
            status: PrinterState::Unknown,
            last_seen_at: None,
            total_prints: 0,
        }
    }

    /// `address:port` pair used to dial the printer.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A stored label template (JSON label schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelTemplate {
    /// `TemplateId(0)` asks the store to assign an identifier on insert.
    pub id: TemplateId,
    pub name: String,
    pub description: String,
    pub schema_json: String,
    pub width_mm: f64,
    pub height_mm: f64,
    pub created_at: DateTime<Utc>,
}

/// A submission: everything the caller supplies for a new job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub printer_id: PrinterId,
    pub template_id: TemplateId,
    pub variables: BTreeMap<String, String>,
    /// Pre-rendered command stream. Materialized from the template when absent.
    pub content: Option<String>,
    pub priority: i32,
    /// Zero is treated as one copy.
    pub copies: u32,
    /// Falls back to the queue default when `None`.
    pub max_retries: Option<u32>,
    pub submitted_by: String,
}

/// A persisted print job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub printer_id: PrinterId,
    pub template_id: TemplateId,
    pub variables: BTreeMap<String, String>,
    pub content: Option<String>,
    pub status: JobStatus,
    /// Higher dispatches first.
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub copies: u32,
    pub error_message: Option<String>,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Job counts per status, aggregated from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl QueueStats {
    /// Add `count` jobs in `status` to the tally.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Paused => self.paused += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
        self.total += count;
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Paused => self.paused,
            JobStatus::Cancelled => self.cancelled,
        }
    }
}

/// Filter for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub printer_id: Option<PrinterId>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    /// Zero means no limit.
    pub limit: u32,
    pub offset: u32,
}
