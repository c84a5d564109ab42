// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// labelspool: core types, device status decoding, configuration and error
// definitions shared across all crates.

pub mod config;
pub mod error;
pub mod status;
pub mod types;

pub use config::SpoolConfig;
pub use error::SpoolError;
pub use status::DeviceStatus;
pub use types::*;
