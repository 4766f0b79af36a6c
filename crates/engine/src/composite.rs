//! Composite assembly: resolving a multi-template envelope into a render
//! plan.
//!
//! This is a coordination layer only: every part still flows through the
//! same template cache and conversion pool.

use docforge_core::{
    GenerationError, GenerationRequest, GenerationResult, TemplateId, TemplateStrategy,
};

/// One independently-rendered slice of a composite job.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanPart {
    pub template_id: TemplateId,
    /// The part's namespace slice, re-wrapped under its namespace key so the
    /// merger sees the same shape as a single-template render.
    pub data: serde_json::Value,
    pub sequence: i32,
}

/// How a job renders.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderPlan {
    /// One template, one merge, the whole data tree.
    Single {
        template_id: TemplateId,
        data: serde_json::Value,
    },
    /// Independent renders joined in part order.
    Concatenate { parts: Vec<PlanPart> },
}

/// Resolve an envelope into a render plan.
///
/// With `templates[]` and no explicit strategy, `OwnTemplate` applies: the
/// lowest-sequence template owns the entire data tree.
pub fn resolve(envelope: &GenerationRequest) -> GenerationResult<RenderPlan> {
    if let Some(template_id) = &envelope.template_id {
        return Ok(RenderPlan::Single {
            template_id: template_id.clone(),
            data: envelope.data.clone(),
        });
    }

    let mut ordered: Vec<(usize, &docforge_core::TemplateRef)> =
        envelope.templates.iter().enumerate().collect();
    // Stable sort: equal sequences keep insertion order.
    ordered.sort_by_key(|(_, t)| t.sequence);

    if ordered.is_empty() {
        return Err(GenerationError::validation(
            "envelope references no template",
        ));
    }

    match envelope.template_strategy {
        Some(TemplateStrategy::ConcatenateTemplates) => {
            let parts = ordered
                .into_iter()
                .map(|(_, tref)| {
                    let slice = envelope
                        .data
                        .get(&tref.namespace)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    let mut scoped = serde_json::Map::new();
                    scoped.insert(tref.namespace.clone(), slice);
                    PlanPart {
                        template_id: tref.template_id.clone(),
                        data: serde_json::Value::Object(scoped),
                        sequence: tref.sequence,
                    }
                })
                .collect();
            Ok(RenderPlan::Concatenate { parts })
        }
        Some(TemplateStrategy::OwnTemplate) | None => {
            let (_, owner) = ordered[0];
            Ok(RenderPlan::Single {
                template_id: owner.template_id.clone(),
                data: envelope.data.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use docforge_core::{OutputFormat, RenderOptions, TemplateRef};

    use super::*;

    fn composite_envelope(
        strategy: Option<TemplateStrategy>,
        sequences: &[(&str, &str, i32)],
    ) -> GenerationRequest {
        let templates = sequences
            .iter()
            .map(|(id, ns, seq)| TemplateRef {
                template_id: TemplateId::from(*id),
                namespace: ns.to_string(),
                sequence: *seq,
            })
            .collect();
        let mut data = serde_json::Map::new();
        for (_, ns, _) in sequences {
            data.insert(ns.to_string(), serde_json::json!({"name": ns}));
        }
        GenerationRequest {
            template_id: None,
            templates,
            template_strategy: strategy,
            output_format: OutputFormat::Pdf,
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
            options: RenderOptions::default(),
            data: serde_json::Value::Object(data),
            parents: BTreeMap::new(),
            request_hash: None,
        }
    }

    #[test]
    fn single_template_keeps_the_whole_tree() {
        let mut envelope = composite_envelope(None, &[("tpl-a", "cover", 10)]);
        envelope.templates.clear();
        envelope.template_id = Some(TemplateId::from("tpl-solo"));

        match resolve(&envelope).unwrap() {
            RenderPlan::Single { template_id, data } => {
                assert_eq!(template_id, TemplateId::from("tpl-solo"));
                assert_eq!(data, envelope.data);
            }
            other => panic!("expected single plan, got {other:?}"),
        }
    }

    #[test]
    fn own_template_strategy_gives_the_owner_everything() {
        let envelope = composite_envelope(
            Some(TemplateStrategy::OwnTemplate),
            &[("tpl-b", "body", 20), ("tpl-a", "cover", 10)],
        );

        match resolve(&envelope).unwrap() {
            RenderPlan::Single { template_id, data } => {
                // Lowest sequence owns the render.
                assert_eq!(template_id, TemplateId::from("tpl-a"));
                assert!(data.get("cover").is_some());
                assert!(data.get("body").is_some());
            }
            other => panic!("expected single plan, got {other:?}"),
        }
    }

    #[test]
    fn concatenate_orders_parts_by_sequence() {
        let envelope = composite_envelope(
            Some(TemplateStrategy::ConcatenateTemplates),
            &[("tpl-c", "annex", 30), ("tpl-a", "cover", 10), ("tpl-b", "body", 20)],
        );

        match resolve(&envelope).unwrap() {
            RenderPlan::Concatenate { parts } => {
                let sequences: Vec<i32> = parts.iter().map(|p| p.sequence).collect();
                assert_eq!(sequences, vec![10, 20, 30]);
                assert_eq!(parts[0].template_id, TemplateId::from("tpl-a"));
                // Each part sees only its namespace slice.
                assert!(parts[0].data.get("cover").is_some());
                assert!(parts[0].data.get("body").is_none());
            }
            other => panic!("expected concatenate plan, got {other:?}"),
        }
    }

    #[test]
    fn sequence_ties_keep_insertion_order() {
        let envelope = composite_envelope(
            Some(TemplateStrategy::ConcatenateTemplates),
            &[("tpl-x", "first", 10), ("tpl-y", "second", 10)],
        );

        match resolve(&envelope).unwrap() {
            RenderPlan::Concatenate { parts } => {
                assert_eq!(parts[0].template_id, TemplateId::from("tpl-x"));
                assert_eq!(parts[1].template_id, TemplateId::from("tpl-y"));
            }
            other => panic!("expected concatenate plan, got {other:?}"),
        }
    }
}
