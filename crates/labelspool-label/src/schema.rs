// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// JSON label schema model.
//
// A schema describes label geometry in millimetres, a list of drawable
// elements positioned in printer dots, and the named variables that element
// content may reference through `{{name}}` placeholders.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use labelspool_core::error::{Result, SpoolError};
use labelspool_core::types::DEFAULT_DPI;

/// A parsed label template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSchema {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub width_mm: f64,
    #[serde(default)]
    pub height_mm: f64,
    #[serde(default)]
    pub gap_mm: f64,
    /// Zero in the source JSON is normalised to the 203 dpi default.
    #[serde(default)]
    pub dpi: u32,
    #[serde(default)]
    pub elements: Vec<LabelElement>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDef>,
}

impl LabelSchema {
    /// Parse a schema from its JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut schema: LabelSchema = serde_json::from_str(json)
            .map_err(|e| SpoolError::Template(format!("failed to parse schema JSON: {e}")))?;
        if schema.dpi == 0 {
            schema.dpi = DEFAULT_DPI;
        }
        Ok(schema)
    }

    /// Names of variables flagged `required`, in name order.
    pub fn required_variables(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|(_, def)| def.required)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Declaration of a template variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDef {
    /// `string`, `number` or `barcode`.  Only used to pick preview samples.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    /// Substituted when the caller omits the variable or leaves it empty.
    #[serde(default)]
    pub default: String,
}

impl VariableDef {
    /// Stand-in value used when rendering a preview without real data.
    pub fn sample_value(&self) -> &str {
        if !self.default.is_empty() {
            return &self.default;
        }
        match self.kind.as_str() {
            "number" => "123",
            "barcode" => "12345678",
            _ => "SAMPLE",
        }
    }
}

/// One drawable element.  Which fields matter depends on `kind`; numeric
/// fields left at zero fall back to per-kind defaults during generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelElement {
    #[serde(rename = "type")]
    pub kind: String,
    pub x: i32,
    pub y: i32,

    // text / block / barcodes
    pub content: String,
    pub font: String,
    pub rotation: i32,
    pub x_scale: i32,
    pub y_scale: i32,

    // barcode
    pub symbology: String,
    pub height: i32,
    pub narrow: i32,
    pub wide: i32,

    // qrcode
    pub level: String,
    pub cell_width: i32,

    // box
    pub x_end: i32,
    pub y_end: i32,
    pub thickness: i32,

    // line
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,

    // circle / ellipse
    pub radius: i32,
    pub x_radius: i32,
    pub y_radius: i32,

    // pdf417 / datamatrix
    pub columns: i32,
    pub rows: i32,
    pub security: i32,
    pub module_size: i32,
    pub encoding: String,

    // image
    pub image_path: String,

    // block
    pub width: i32,
}
