// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Platform-aware data directory resolution.

use std::path::PathBuf;

/// Database file name inside the data directory.
const DATABASE_FILE: &str = "spool.db";

/// Return the application data directory.  Not created here; the store
/// creates it when it opens the database.
pub fn data_dir() -> PathBuf {
    resolve(|key| std::env::var(key).ok())
}

/// Default location of the spool database.
pub fn default_database_path() -> PathBuf {
    data_dir().join(DATABASE_FILE)
}

fn resolve(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    base_dir(lookup).join("labelspool")
}

fn base_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    // XDG data dir, then ~/.local/share
    if let Some(xdg) = lookup("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg);
    }
    if let Some(home) = lookup("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local").join("share");
    }
    // Last resort
    std::env::temp_dir()
}
