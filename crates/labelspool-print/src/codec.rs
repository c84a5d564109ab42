// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Label codec seam between the scheduler and the TSPL2 generator.

use std::sync::Arc;

use labelspool_core::error::{Result, SpoolError};
use labelspool_core::types::TemplateId;
use labelspool_label::{LabelSchema, Tspl2Generator, Variables};

use crate::store::SpoolStore;

/// Compiles a stored template plus variable values into a command stream.
pub trait LabelCodec: Send + Sync {
    fn generate(&self, template: TemplateId, variables: &Variables) -> Result<String>;

    /// Fail if a required variable is missing and has no default.
    fn validate_variables(&self, template: TemplateId, variables: &Variables) -> Result<()>;
}

/// `LabelCodec` that loads template schemas from the spool store.
pub struct TemplateCodec {
    store: Arc<SpoolStore>,
    generator: Tspl2Generator,
}

impl TemplateCodec {
    pub fn new(store: Arc<SpoolStore>) -> Self {
        Self {
            store,
            generator: Tspl2Generator::new(),
        }
    }

    fn schema(&self, id: TemplateId) -> Result<LabelSchema> {
        let template = self
            .store
            .get_template(id)?
            .ok_or(SpoolError::TemplateNotFound(id))?;
        self.generator.parse_schema(&template.schema_json)
    }
}

impl LabelCodec for TemplateCodec {
    fn generate(&self, template: TemplateId, variables: &Variables) -> Result<String> {
        let schema = self.schema(template)?;
        self.generator.generate(&schema, variables)
    }

    fn validate_variables(&self, template: TemplateId, variables: &Variables) -> Result<()> {
        let schema = self.schema(template)?;
        self.generator.validate_variables(&schema, variables)
    }
}
