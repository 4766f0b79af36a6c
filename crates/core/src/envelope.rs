//! Generation request envelope.
//!
//! The envelope is produced by an external enqueuer (batch) or controller
//! (interactive) and consumed verbatim by the engine. Validation here is
//! structural only; referential checks (does the template exist) happen in
//! the pipeline where they can be classified properly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, GenerationResult};
use crate::id::{RecordId, TemplateId};

/// Requested output format of the rendered document.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputFormat {
    Pdf,
    Docx,
}

impl OutputFormat {
    /// Templates are DOCX; only PDF output needs the conversion pool.
    pub fn requires_conversion(&self) -> bool {
        matches!(self, OutputFormat::Pdf)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Docx => "docx",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "PDF",
            OutputFormat::Docx => "DOCX",
        }
    }
}

impl core::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a multi-template envelope resolves to one output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateStrategy {
    /// One template receives the entire multi-namespace data tree.
    OwnTemplate,
    /// Each template renders its namespace slice; outputs are joined in
    /// ascending sequence order.
    ConcatenateTemplates,
}

/// One template reference inside a composite envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    #[serde(rename = "templateId")]
    pub template_id: TemplateId,
    /// Which slice of the data tree this template is merged against.
    pub namespace: String,
    /// Concatenation order; ties resolve by position in the list.
    pub sequence: i32,
}

/// Per-request rendering options.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderOptions {
    /// Upload the merged (pre-conversion) document alongside the output.
    pub store_merged_intermediate: bool,
    /// Return the merged document bytes to the interactive caller.
    pub return_intermediate_to_caller: bool,
}

/// The full input of one generation request.
///
/// `parents` maps relation keys to business-record ids the stored output is
/// linked to; `None` values are silently skipped. A `BTreeMap` keeps link
/// iteration order deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    #[serde(rename = "templateId", skip_serializing_if = "Option::is_none", default)]
    pub template_id: Option<TemplateId>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub templates: Vec<TemplateRef>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub template_strategy: Option<TemplateStrategy>,
    pub output_format: OutputFormat,
    pub locale: String,
    pub timezone: String,
    #[serde(default)]
    pub options: RenderOptions,
    /// Namespace-keyed data tree handed to the merge function.
    pub data: serde_json::Value,
    #[serde(default)]
    pub parents: BTreeMap<String, Option<RecordId>>,
    /// Caller-computed idempotency hash. Validated against the engine's own
    /// computation when present; the engine's value is authoritative.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_hash: Option<String>,
}

impl GenerationRequest {
    /// Structural validation: cheap, deterministic, and performed before any
    /// remote call.
    pub fn validate(&self) -> GenerationResult<()> {
        if self.template_id.is_none() && self.templates.is_empty() {
            return Err(GenerationError::validation(
                "envelope references no template",
            ));
        }
        if self.template_id.is_some() && !self.templates.is_empty() {
            return Err(GenerationError::validation(
                "envelope sets both templateId and templates[]",
            ));
        }
        if matches!(self.template_strategy, Some(TemplateStrategy::ConcatenateTemplates))
            && self.templates.len() < 2
        {
            return Err(GenerationError::validation(
                "ConcatenateTemplates requires at least two templates[]",
            ));
        }
        if !self.data.is_object() {
            return Err(GenerationError::validation(
                "data must be a namespace-keyed object",
            ));
        }
        for tref in &self.templates {
            if tref.namespace.is_empty() {
                return Err(GenerationError::validation(format!(
                    "template {} has an empty namespace",
                    tref.template_id
                )));
            }
            if self.data.get(&tref.namespace).is_none() {
                return Err(GenerationError::validation(format!(
                    "data is missing namespace '{}'",
                    tref.namespace
                )));
            }
        }
        Ok(())
    }

    /// All template ids the request references, primary first.
    pub fn template_ids(&self) -> Vec<&TemplateId> {
        match &self.template_id {
            Some(id) => vec![id],
            None => self.templates.iter().map(|t| &t.template_id).collect(),
        }
    }

    /// Record ids to link the output to, with null entries dropped.
    pub fn link_targets(&self) -> impl Iterator<Item = (&str, &RecordId)> {
        self.parents
            .iter()
            .filter_map(|(key, id)| id.as_ref().map(|id| (key.as_str(), id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_template_request() -> GenerationRequest {
        GenerationRequest {
            template_id: Some(TemplateId::from("tpl-invoice")),
            templates: Vec::new(),
            template_strategy: None,
            output_format: OutputFormat::Pdf,
            locale: "en-US".to_string(),
            timezone: "Europe/Berlin".to_string(),
            options: RenderOptions::default(),
            data: serde_json::json!({"invoice": {"number": "INV-1"}}),
            parents: BTreeMap::new(),
            request_hash: None,
        }
    }

    #[test]
    fn valid_single_template_envelope() {
        assert!(single_template_request().validate().is_ok());
    }

    #[test]
    fn rejects_envelope_without_templates() {
        let mut req = single_template_request();
        req.template_id = None;
        assert!(matches!(
            req.validate(),
            Err(GenerationError::Validation(_))
        ));
    }

    #[test]
    fn rejects_concatenate_with_single_template() {
        let mut req = single_template_request();
        req.template_id = None;
        req.template_strategy = Some(TemplateStrategy::ConcatenateTemplates);
        req.templates = vec![TemplateRef {
            template_id: TemplateId::from("tpl-a"),
            namespace: "invoice".to_string(),
            sequence: 10,
        }];
        assert!(matches!(
            req.validate(),
            Err(GenerationError::Validation(_))
        ));
    }

    #[test]
    fn rejects_missing_namespace_slice() {
        let mut req = single_template_request();
        req.template_id = None;
        req.templates = vec![
            TemplateRef {
                template_id: TemplateId::from("tpl-a"),
                namespace: "invoice".to_string(),
                sequence: 10,
            },
            TemplateRef {
                template_id: TemplateId::from("tpl-b"),
                namespace: "terms".to_string(),
                sequence: 20,
            },
        ];
        // data only carries "invoice"
        assert!(matches!(
            req.validate(),
            Err(GenerationError::Validation(_))
        ));
    }

    #[test]
    fn link_targets_skip_null_parents() {
        let mut req = single_template_request();
        req.parents
            .insert("invoice".to_string(), Some(RecordId::from("rec-1")));
        req.parents.insert("order".to_string(), None);

        let targets: Vec<_> = req.link_targets().collect();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "invoice");
    }

    #[test]
    fn docx_output_skips_conversion() {
        assert!(!OutputFormat::Docx.requires_conversion());
        assert!(OutputFormat::Pdf.requires_conversion());
    }
}
