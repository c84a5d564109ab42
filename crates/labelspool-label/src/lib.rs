// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// labelspool-label: label templates for the labelspool print spool.
//
// Parses JSON label schemas and compiles them, together with a set of named
// values, into TSPL2 command streams.  Pure: no I/O and no shared state.

pub mod schema;
pub mod tspl;

pub use schema::{LabelElement, LabelSchema, VariableDef};
pub use tspl::{Tspl2Generator, Variables};
