//! Placeholder-substitution seam.
//!
//! Merging a template's tags against a data tree is the job of an external
//! library; the engine treats it as a pure function behind [`TemplateMerger`].
//! [`TextTemplateMerger`] is the built-in implementation for plain-text
//! templates, used in development and tests; office-document deployments
//! inject their own.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("merge failed: {0}")]
    Failed(String),
}

/// Rendering context forwarded from the envelope.
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub locale: String,
    pub timezone: String,
}

/// Pure merge function: template bytes + data tree -> merged document bytes.
pub trait TemplateMerger: Send + Sync {
    fn merge(
        &self,
        template: &[u8],
        data: &serde_json::Value,
        ctx: &MergeContext,
    ) -> Result<Vec<u8>, MergeError>;
}

/// Minimal `{{path.to.value}}` substitution over UTF-8 templates.
///
/// Unknown paths are left verbatim so a missing tag is visible in the output
/// rather than silently blanked.
#[derive(Debug, Default)]
pub struct TextTemplateMerger;

impl TextTemplateMerger {
    fn lookup<'a>(data: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
        let mut current = data;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    fn render_value(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl TemplateMerger for TextTemplateMerger {
    fn merge(
        &self,
        template: &[u8],
        data: &serde_json::Value,
        _ctx: &MergeContext,
    ) -> Result<Vec<u8>, MergeError> {
        let text = std::str::from_utf8(template)
            .map_err(|e| MergeError::Failed(format!("template is not UTF-8: {e}")))?;

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let tag = after[..end].trim();
                    match Self::lookup(data, tag) {
                        Some(value) => out.push_str(&Self::render_value(value)),
                        None => {
                            out.push_str("{{");
                            out.push_str(&after[..end]);
                            out.push_str("}}");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MergeContext {
        MergeContext {
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
        }
    }

    #[test]
    fn substitutes_nested_paths() {
        let merger = TextTemplateMerger;
        let data = serde_json::json!({"invoice": {"number": "INV-7", "total": 99.5}});
        let out = merger
            .merge(
                b"No {{invoice.number}}, total {{invoice.total}}",
                &data,
                &ctx(),
            )
            .unwrap();
        assert_eq!(out, b"No INV-7, total 99.5");
    }

    #[test]
    fn unknown_tags_stay_visible() {
        let merger = TextTemplateMerger;
        let data = serde_json::json!({});
        let out = merger.merge(b"Hello {{missing.tag}}", &data, &ctx()).unwrap();
        assert_eq!(out, b"Hello {{missing.tag}}");
    }

    #[test]
    fn rejects_non_utf8_templates() {
        let merger = TextTemplateMerger;
        let data = serde_json::json!({});
        assert!(merger.merge(&[0xff, 0xfe], &data, &ctx()).is_err());
    }
}
