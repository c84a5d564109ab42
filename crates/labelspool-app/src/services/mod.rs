// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: wires the labelspool backend crates together for the
// daemon and exposes the operator surface in one place.

pub mod data_dir;
pub mod spool_services;
