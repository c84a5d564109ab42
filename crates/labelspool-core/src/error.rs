// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for labelspool.

use thiserror::Error;

use crate::types::{JobId, PrinterId, TemplateId};

/// Top-level error type for all labelspool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    // -- Lookup errors --
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("printer {0} not found")]
    PrinterNotFound(PrinterId),

    #[error("label template {0} not found")]
    TemplateNotFound(TemplateId),

    // -- State conflicts --
    #[error("printer {0} already exists")]
    PrinterExists(PrinterId),

    #[error("{0}")]
    InvalidState(String),

    #[error("printer {0} is paused, resume the printer first")]
    PrinterPaused(PrinterId),

    // -- Device errors --
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid status response: {0}")]
    InvalidStatus(String),

    #[error("printer {0} is offline")]
    PrinterOffline(PrinterId),

    #[error("printer {printer} cannot print in current state ({state})")]
    CannotPrint { printer: PrinterId, state: String },

    // -- Content errors --
    #[error("label generation failed: {0}")]
    Template(String),

    // -- Wiring / configuration --
    #[error("{0} not configured")]
    NotConfigured(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpoolError>;
