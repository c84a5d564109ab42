// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TSPL2 command generation.
//
// A label is rendered as a header (SIZE, GAP, DIRECTION, CLS), one command per
// element, and a trailing PRINT.  Every line is newline-terminated.  String
// arguments are quoted and escaped; numeric arguments are printer dots.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::debug;

use labelspool_core::error::{Result, SpoolError};
use labelspool_core::types::DEFAULT_DPI;

use crate::schema::{LabelElement, LabelSchema};

/// Resolutions the generator accepts for templates.
pub const SUPPORTED_DPI: [u32; 3] = [203, 300, 600];

/// Variable values keyed by name.
pub type Variables = BTreeMap<String, String>;

/// Stateless TSPL2 generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tspl2Generator;

impl Tspl2Generator {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_schema(&self, json: &str) -> Result<LabelSchema> {
        LabelSchema::from_json(json)
    }

    /// Fail if a required variable is missing or empty and has no default.
    pub fn validate_variables(&self, schema: &LabelSchema, variables: &Variables) -> Result<()> {
        for (name, def) in &schema.variables {
            let provided = variables.get(name).is_some_and(|v| !v.is_empty());
            if !provided && def.required && def.default.is_empty() {
                return Err(SpoolError::Template(format!(
                    "required variable '{name}' is missing"
                )));
            }
        }
        Ok(())
    }

    /// Render one label.
    pub fn generate(&self, schema: &LabelSchema, variables: &Variables) -> Result<String> {
        self.validate_variables(schema, variables)?;

        let mut out = String::new();
        write_mm_header(&mut out, schema);
        out.push_str("CLS\n");
        write_elements(&mut out, schema, variables)?;
        out.push_str("PRINT 1\n");

        debug!(label = %schema.name, bytes = out.len(), "generated TSPL2 label");
        Ok(out)
    }

    /// Render one label with the header geometry expressed in printer dots
    /// instead of millimetres.
    pub fn generate_in_dots(&self, schema: &LabelSchema, variables: &Variables) -> Result<String> {
        self.validate_variables(schema, variables)?;

        let dpi = if schema.dpi == 0 { DEFAULT_DPI } else { schema.dpi };
        let mut out = String::new();
        let _ = writeln!(
            out,
            "SIZE {} dot,{} dot",
            mm_to_dots(schema.width_mm, dpi),
            mm_to_dots(schema.height_mm, dpi)
        );
        let _ = writeln!(out, "GAP {} dot,0 dot", mm_to_dots(schema.gap_mm, dpi));
        out.push_str("DIRECTION 0\nCLS\n");
        write_elements(&mut out, schema, variables)?;
        out.push_str("PRINT 1\n");
        Ok(out)
    }

    /// Render the label using each variable's default or a type-appropriate
    /// sample value.
    pub fn preview(&self, schema: &LabelSchema) -> Result<String> {
        let samples: Variables = schema
            .variables
            .iter()
            .map(|(name, def)| (name.clone(), def.sample_value().to_string()))
            .collect();
        self.generate(schema, &samples)
    }

    /// Render one label per data set in a single stream, each printed
    /// `copies` times (zero is treated as one).
    pub fn generate_multi(
        &self,
        schema: &LabelSchema,
        data: &[Variables],
        copies: u32,
    ) -> Result<String> {
        let copies = copies.max(1);
        let mut out = String::new();
        write_mm_header(&mut out, schema);

        for variables in data {
            self.validate_variables(schema, variables)?;
            out.push_str("CLS\n");
            write_elements(&mut out, schema, variables)?;
            let _ = writeln!(out, "PRINT {copies}");
        }
        Ok(out)
    }

    /// Defaults overlaid with the caller's values.
    pub fn merge_with_defaults(&self, schema: &LabelSchema, variables: &Variables) -> Variables {
        let mut merged: Variables = schema
            .variables
            .iter()
            .filter(|(_, def)| !def.default.is_empty())
            .map(|(name, def)| (name.clone(), def.default.clone()))
            .collect();
        merged.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Convert millimetres to printer dots at `dpi`, truncating.
pub fn mm_to_dots(mm: f64, dpi: u32) -> u32 {
    (mm * f64::from(dpi) / 25.4) as u32
}

/// Parse a resolution string, accepting only 203, 300 or 600.
pub fn parse_dpi(s: &str) -> Result<u32> {
    let dpi: u32 = s
        .trim()
        .parse()
        .map_err(|_| SpoolError::Template(format!("invalid DPI value: {s}")))?;
    if !SUPPORTED_DPI.contains(&dpi) {
        return Err(SpoolError::Template(format!(
            "unsupported DPI: {dpi} (supported: 203, 300, 600)"
        )));
    }
    Ok(dpi)
}

/// Nominal dots per millimetre for the common printhead resolutions.
pub fn dots_per_mm(dpi: u32) -> f64 {
    match dpi {
        203 => 8.0,
        300 => 12.0,
        600 => 24.0,
        other => f64::from(other) / 25.4,
    }
}

/// Escape a value for use inside a quoted TSPL2 string argument.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Replace every `{{name}}` placeholder (name = word characters) with the
/// provided value, else the variable's default, else nothing.
pub fn substitute(template: &str, variables: &Variables, schema: &LabelSchema) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let name_len = after
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(after.len());

        if name_len > 0 && after[name_len..].starts_with("}}") {
            let name = &after[..name_len];
            out.push_str(&resolve(name, variables, schema));
            rest = &after[name_len + 2..];
        } else {
            out.push_str("{{");
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn resolve(name: &str, variables: &Variables, schema: &LabelSchema) -> String {
    match variables.get(name) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => schema
            .variables
            .get(name)
            .map(|def| def.default.clone())
            .unwrap_or_default(),
    }
}

fn write_mm_header(out: &mut String, schema: &LabelSchema) {
    let _ = writeln!(out, "SIZE {:.0} mm, {:.0} mm", schema.width_mm, schema.height_mm);
    let _ = writeln!(out, "GAP {:.0} mm, 0 mm", schema.gap_mm);
    out.push_str("DIRECTION 0\n");
}

fn write_elements(out: &mut String, schema: &LabelSchema, variables: &Variables) -> Result<()> {
    for element in &schema.elements {
        let line = element_command(element, variables, schema).map_err(|e| {
            SpoolError::Template(format!("error generating {} element: {e}", element.kind))
        })?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(())
}

fn or_default(value: i32, default: i32) -> i32 {
    if value == 0 { default } else { value }
}

fn or_default_str<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

fn element_command(
    e: &LabelElement,
    variables: &Variables,
    schema: &LabelSchema,
) -> std::result::Result<String, String> {
    let content = || escape(&substitute(&e.content, variables, schema));
    let thickness = or_default(e.thickness, 1);

    let line = match e.kind.as_str() {
        "text" => format!(
            r#"TEXT {},{},"{}",{},{},{},"{}""#,
            e.x,
            e.y,
            or_default_str(&e.font, "3"),
            e.rotation,
            or_default(e.x_scale, 1),
            or_default(e.y_scale, 1),
            content()
        ),
        "barcode" => {
            let narrow = or_default(e.narrow, 2);
            format!(
                r#"BARCODE {},{},"{}",{},{},{},{},{},"{}""#,
                e.x,
                e.y,
                or_default_str(&e.symbology, "128"),
                or_default(e.height, 80),
                e.rotation,
                narrow,
                or_default(e.wide, 2),
                narrow,
                content()
            )
        }
        "qrcode" => format!(
            r#"QRCODE {},{},{},{},{},A,"{}""#,
            e.x,
            e.y,
            or_default_str(&e.level, "M"),
            or_default(e.cell_width, 4),
            e.rotation,
            content()
        ),
        "pdf417" => format!(
            r#"PDF417 {},{},{},{},{},{},{},"{}""#,
            e.x,
            e.y,
            or_default(e.columns, 3),
            e.rows,
            e.security,
            or_default(e.module_size, 2),
            e.rotation,
            content()
        ),
        "datamatrix" => format!(
            r#"DMATRIX {},{},{},{},{},"{}""#,
            e.x,
            e.y,
            or_default(e.module_size, 2),
            e.rotation,
            or_default_str(&e.encoding, "A"),
            content()
        ),
        "box" => format!("BOX {},{},{},{},{}", e.x, e.y, e.x_end, e.y_end, thickness),
        "line" => format!("BAR {},{},{},{},{}", e.x1, e.y1, e.x2, e.y2, thickness),
        "circle" => format!("CIRCLE {},{},{},{}", e.x, e.y, e.radius, thickness),
        "ellipse" => format!(
            "ELLIPSE {},{},{},{},{}",
            e.x, e.y, e.x_radius, e.y_radius, thickness
        ),
        "block" => format!(
            r#"BLOCK {},{},{},{},"{}",{},{},{},"{}""#,
            e.x,
            e.y,
            e.width,
            e.height,
            or_default_str(&e.font, "3"),
            e.rotation,
            or_default(e.x_scale, 1),
            or_default(e.y_scale, 1),
            content()
        ),
        "image" => format!(r#"PUTBMP {},{},"{}""#, e.x, e.y, e.image_path),
        other => return Err(format!("unsupported element type: {other}")),
    };
    Ok(line)
}
