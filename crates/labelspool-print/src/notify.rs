// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Lifecycle notifications.
//
// Producers hand events to a `Notifier`, which buffers them in a bounded
// channel drained by one background task.  Delivery is best-effort: a full
// buffer drops the event and producers never wait on a sink.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use labelspool_core::error::Result;
use labelspool_core::types::{JobId, PrinterId, PrinterState};

use crate::store::SpoolStore;

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpoolEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    JobStarted {
        job_id: JobId,
        printer_id: PrinterId,
    },
    JobCompleted {
        job_id: JobId,
        printer_id: PrinterId,
        copies: u32,
    },
    JobFailed {
        job_id: JobId,
        printer_id: PrinterId,
        error: String,
    },
    PrinterStatusChanged {
        printer_id: PrinterId,
        previous: PrinterState,
        current: PrinterState,
        details: Option<String>,
    },
}

impl EventKind {
    /// Short action name, e.g. `job_failed`.
    pub fn action(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job_started",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::PrinterStatusChanged { .. } => "printer_status_changed",
        }
    }

    /// The entity the event is about, as `(type, id)`.
    pub fn entity(&self) -> (&'static str, String) {
        match self {
            Self::JobStarted { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. } => ("job", job_id.to_string()),
            Self::PrinterStatusChanged { printer_id, .. } => ("printer", printer_id.to_string()),
        }
    }
}

impl SpoolEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            kind,
        }
    }
}

/// Receives events from the notifier's background task.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &SpoolEvent) -> Result<()>;
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<SpoolEvent>>,
}

impl Notifier {
    /// Start the delivery task.  It runs until every `Notifier` clone has
    /// been dropped and the buffer is drained.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SpoolEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(event = event.kind.action(), error = %e, "event delivery failed");
                }
            }
            debug!("notifier drained");
        });
        (Self { tx: Some(tx) }, handle)
    }

    /// A notifier that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: EventKind) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(SpoolEvent::new(kind)) {
            let action = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => {
                    ev.kind.action()
                }
            };
            warn!(event = action, "notification dropped: {e}");
        }
    }
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, event: &SpoolEvent) -> Result<()> {
        let (entity_type, entity_id) = event.kind.entity();
        info!(
            event_id = %event.id,
            event = event.kind.action(),
            entity_type,
            entity_id = %entity_id,
            "spool event"
        );
        Ok(())
    }
}

/// Persists every event in the audit log, then logs it.
pub struct AuditSink {
    store: Arc<SpoolStore>,
}

impl AuditSink {
    pub fn new(store: Arc<SpoolStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSink for AuditSink {
    async fn deliver(&self, event: &SpoolEvent) -> Result<()> {
        let (entity_type, entity_id) = event.kind.entity();
        let details = serde_json::to_value(event)?;
        self.store
            .append_audit(event.kind.action(), entity_type, &entity_id, &details)?;
        LogSink.deliver(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Sink that records everything it receives.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SpoolEvent>>,
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn deliver(&self, event: &SpoolEvent) -> Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_reach_the_sink_in_order() {
        let sink = Arc::new(Recorder::default());
        let (notifier, handle) = Notifier::spawn(sink.clone(), 8);
        notifier.emit(EventKind::JobStarted { job_id: JobId(1), printer_id: PrinterId(2) });
        notifier.emit(EventKind::JobFailed {
            job_id: JobId(1),
            printer_id: PrinterId(2),
            error: "offline".into(),
        });
        drop(notifier);
        handle.await.expect("notifier task");

        let events = sink.events.lock().await;
        let actions: Vec<_> = events.iter().map(|e| e.kind.action()).collect();
        assert_eq!(actions, vec!["job_started", "job_failed"]);
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let notifier = Notifier { tx: Some(tx) };
        for n in 0..5 {
            notifier.emit(EventKind::JobStarted { job_id: JobId(n), printer_id: PrinterId(1) });
        }

        let first = rx.try_recv().expect("one buffered event");
        assert_eq!(
            first.kind,
            EventKind::JobStarted { job_id: JobId(0), printer_id: PrinterId(1) }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_notifier_is_silent() {
        Notifier::disabled().emit(EventKind::JobStarted {
            job_id: JobId(1),
            printer_id: PrinterId(1),
        });
    }

    #[tokio::test]
    async fn audit_sink_persists_events() {
        let store = Arc::new(SpoolStore::open_in_memory().expect("store"));
        let sink = AuditSink::new(store.clone());
        let event = SpoolEvent::new(EventKind::PrinterStatusChanged {
            printer_id: PrinterId(4),
            previous: PrinterState::Online,
            current: PrinterState::Offline,
            details: Some("connection refused".into()),
        });
        sink.deliver(&event).await.expect("deliver");

        let entries = store.recent_audit(5).expect("audit");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "printer_status_changed");
        assert_eq!(entries[0].entity_id, "4");
        assert_eq!(entries[0].details["kind"]["current"], "offline");
    }
}
