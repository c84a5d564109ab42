// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// labelspool-print: persistent job queue, printer session manager and
// lifecycle notifications.  This crate connects the domain types defined in
// `labelspool-core` to the label printers on the network.

pub mod codec;
pub mod device;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use codec::{LabelCodec, TemplateCodec};
pub use device::{DeviceManager, PrinterDevice};
pub use notify::{AuditSink, EventKind, EventSink, LogSink, Notifier, SpoolEvent};
pub use scheduler::Scheduler;
pub use store::{AuditEntry, SpoolStore};
