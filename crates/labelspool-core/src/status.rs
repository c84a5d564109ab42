// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Decoding of the 4-byte status response returned by TSPL2 label printers.
//
// The printer answers the `ESC ! ?` poll with exactly four bytes.  Each byte is
// looked up independently in a fixed table:
//
//   byte 0  printer state    (normal, feeding, paused, error, ...)
//   byte 1  warning          (paper / ribbon low)
//   byte 2  error            (head / motor overheat, cutter, RTC)
//   byte 3  media error      (paper / ribbon empty, take-up reel full)
//
// Bytes that do not appear in a table decode to `Unknown` instead of failing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::PrinterState;

/// The status poll command (`ESC ! ?`).
pub const STATUS_COMMAND: &[u8; 3] = b"\x1b!?";

/// Length of a complete status response.
pub const STATUS_RESPONSE_LEN: usize = 4;

/// Byte 0 of the status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterCondition {
    Normal,
    Feeding,
    Paused,
    Error,
    HeadOpen,
    Standby,
    LabelWaiting,
    Idle,
    Unknown,
}

impl PrinterCondition {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'@' => Self::Normal,
            b'F' => Self::Feeding,
            b'P' => Self::Paused,
            b'E' => Self::Error,
            b'H' => Self::HeadOpen,
            b'S' => Self::Standby,
            b'L' => Self::LabelWaiting,
            b'I' => Self::Idle,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Feeding => "feeding",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::HeadOpen => "head_open",
            Self::Standby => "standby",
            Self::LabelWaiting => "label_waiting",
            Self::Idle => "idle",
            Self::Unknown => "unknown",
        }
    }

    /// Ready states: the printer will accept a job right now.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Normal | Self::Standby | Self::Idle)
    }
}

/// Byte 1 of the status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCondition {
    None,
    PaperLow,
    RibbonLow,
    PaperAndRibbonLow,
    Unknown,
}

impl WarningCondition {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'@' => Self::None,
            b'A' => Self::PaperLow,
            b'B' => Self::RibbonLow,
            b'C' => Self::PaperAndRibbonLow,
            _ => Self::Unknown,
        }
    }
}

/// Byte 2 of the status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCondition {
    None,
    HeadOverheat,
    MotorOverheat,
    HeadAndMotorOverheat,
    HeadError,
    CutterError,
    RtcError,
    Unknown,
}

impl ErrorCondition {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'@' => Self::None,
            b'A' => Self::HeadOverheat,
            b'B' => Self::MotorOverheat,
            b'C' => Self::HeadAndMotorOverheat,
            b'D' => Self::HeadError,
            b'E' => Self::CutterError,
            b'F' => Self::RtcError,
            _ => Self::Unknown,
        }
    }
}

/// Byte 3 of the status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCondition {
    None,
    PaperEmpty,
    RibbonEmpty,
    PaperAndRibbonEmpty,
    TakeupReelFull,
    HeadOpen,
    Unknown,
}

impl MediaCondition {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'@' => Self::None,
            b'A' => Self::PaperEmpty,
            b'B' => Self::RibbonEmpty,
            b'C' => Self::PaperAndRibbonEmpty,
            b'D' => Self::TakeupReelFull,
            b'`' => Self::HeadOpen,
            _ => Self::Unknown,
        }
    }
}

/// A decoded status snapshot.  Built fresh on every poll and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub raw: [u8; STATUS_RESPONSE_LEN],
    pub printer: PrinterCondition,
    pub warning: WarningCondition,
    pub error: ErrorCondition,
    pub media: MediaCondition,
    pub is_online: bool,
    pub can_print: bool,
    pub checked_at: DateTime<Utc>,
}

impl DeviceStatus {
    /// Decode a complete response read at `checked_at`.
    pub fn decode(raw: [u8; STATUS_RESPONSE_LEN], checked_at: DateTime<Utc>) -> Self {
        let printer = PrinterCondition::from_byte(raw[0]);
        Self {
            raw,
            printer,
            warning: WarningCondition::from_byte(raw[1]),
            error: ErrorCondition::from_byte(raw[2]),
            media: MediaCondition::from_byte(raw[3]),
            is_online: true,
            can_print: printer.is_ready(),
            checked_at,
        }
    }

    /// Snapshot for a printer that could not be reached or answered short.
    pub fn unreachable(checked_at: DateTime<Utc>) -> Self {
        Self {
            raw: [0; STATUS_RESPONSE_LEN],
            printer: PrinterCondition::Unknown,
            warning: WarningCondition::Unknown,
            error: ErrorCondition::Unknown,
            media: MediaCondition::Unknown,
            is_online: false,
            can_print: false,
            checked_at,
        }
    }

    /// Collapse the snapshot into the single operator-facing status.
    ///
    /// Precedence: offline, error state, paused state, error byte, media
    /// error, feeding (busy), otherwise online.
    pub fn composite(&self) -> PrinterState {
        if !self.is_online {
            return PrinterState::Offline;
        }
        if self.printer == PrinterCondition::Error {
            return PrinterState::Error;
        }
        if self.printer == PrinterCondition::Paused {
            return PrinterState::Paused;
        }
        if self.error != ErrorCondition::None {
            return PrinterState::Error;
        }
        if self.media != MediaCondition::None {
            return PrinterState::Error;
        }
        if self.printer == PrinterCondition::Feeding {
            return PrinterState::Busy;
        }
        PrinterState::Online
    }
}
