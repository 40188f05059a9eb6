//! Field mapping between operator-authored form labels and generated,
//! provider-safe field identifiers.
//!
//! Mappings are generated once per published flow version and never change
//! afterwards: in-flight form replies are translated with the mapping of the
//! version their session is pinned to.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::flow::model::{FlowGraph, NodeKind};

/// Longest label-derived stem kept in a generated field name.
const MAX_STEM_LEN: usize = 40;
/// Hex characters of the component-id hash appended as a suffix.
const SUFFIX_LEN: usize = 6;

/// One (component id, label, generated name) triple for a flow version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub flow_id: Uuid,
    pub version: i64,
    pub node_id: String,
    pub component_id: String,
    pub label: String,
    pub field_name: String,
}

/// Normalize an operator label into an identifier-safe stem.
///
/// Lower-cases, collapses runs of non-alphanumerics to `_`, trims underscores,
/// prefixes a leading digit with `f_` and truncates. Empty input yields `field`.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_sep = false;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if out.is_empty() {
        return "field".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "f_");
    }
    out.truncate(MAX_STEM_LEN);
    out.trim_end_matches('_').to_string()
}

fn component_suffix(component_id: &str) -> String {
    let digest = Sha256::digest(component_id.as_bytes());
    hex::encode(digest)[..SUFFIX_LEN].to_string()
}

/// Generate mappings for every form field in a graph about to be published.
///
/// Names are `<stem>_<suffix>`; if two fields still collide (same label and
/// hash prefix) a numeric counter is appended.
pub fn generate_mappings(flow_id: Uuid, version: i64, graph: &FlowGraph) -> Vec<FieldMapping> {
    let mut used: HashSet<String> = HashSet::new();
    let mut mappings = Vec::new();

    for node in &graph.nodes {
        let NodeKind::SendMessage(props) = &node.kind else {
            continue;
        };
        for field in props.message.form_fields() {
            let base = format!(
                "{}_{}",
                normalize_label(&field.label),
                component_suffix(&field.component_id)
            );
            let mut name = base.clone();
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{base}_{n}");
                n += 1;
            }
            mappings.push(FieldMapping {
                flow_id,
                version,
                node_id: node.id.clone(),
                component_id: field.component_id.clone(),
                label: field.label.clone(),
                field_name: name,
            });
        }
    }

    mappings
}

/// Result of translating a form reply back to operator labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedForm {
    /// Label (or untranslated field name) → value.
    pub values: BTreeMap<String, String>,
    /// Field names that had no mapping and were kept as-is.
    pub unmapped: Vec<String>,
}

/// Read-only view over the mappings of one flow version.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapper<'a> {
    mappings: &'a [FieldMapping],
}

impl<'a> FieldMapper<'a> {
    pub fn new(mappings: &'a [FieldMapping]) -> Self {
        Self { mappings }
    }

    pub fn field_name_for(&self, node_id: &str, component_id: &str) -> Option<&'a str> {
        self.mappings
            .iter()
            .find(|m| m.node_id == node_id && m.component_id == component_id)
            .map(|m| m.field_name.as_str())
    }

    pub fn label_for(&self, field_name: &str) -> Option<&'a str> {
        self.mappings
            .iter()
            .find(|m| m.field_name == field_name)
            .map(|m| m.label.as_str())
    }

    /// Translate generated names to labels. Unknown names are kept verbatim and
    /// reported in `unmapped`; no value is ever dropped.
    pub fn translate(
        &self,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> TranslatedForm {
        let mut out = TranslatedForm::default();
        for (name, value) in fields {
            let value = value_to_string(value);
            match self.label_for(name) {
                Some(label) => {
                    out.values.insert(label.to_string(), value);
                }
                None => {
                    out.unmapped.push(name.clone());
                    out.values.insert(name.clone(), value);
                }
            }
        }
        out
    }
}

/// Flatten a JSON form value to the string form stored in session variables.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::{FormField, MessageContent, Node, SendMessageProps};

    fn form_graph(fields: Vec<(&str, &str)>) -> FlowGraph {
        FlowGraph {
            nodes: vec![Node::new(
                "form",
                NodeKind::SendMessage(SendMessageProps {
                    message: MessageContent::Form {
                        body: "Tell us about you".into(),
                        cta: "Open".into(),
                        fields: fields
                            .into_iter()
                            .map(|(component_id, label)| FormField {
                                component_id: component_id.into(),
                                label: label.into(),
                                required: false,
                            })
                            .collect(),
                    },
                }),
            )],
            edges: vec![],
        }
    }

    #[test]
    fn normalizes_labels() {
        assert_eq!(normalize_label("Full Name"), "full_name");
        assert_eq!(normalize_label("  E-mail address?! "), "e_mail_address");
        assert_eq!(normalize_label("2nd phone"), "f_2nd_phone");
        assert_eq!(normalize_label("¿¿??"), "field");
        assert_eq!(normalize_label(&"x".repeat(100)).len(), MAX_STEM_LEN);
    }

    #[test]
    fn full_name_round_trip() {
        let flow_id = Uuid::new_v4();
        let mappings = generate_mappings(flow_id, 1, &form_graph(vec![("c_name", "Full Name")]));
        assert_eq!(mappings.len(), 1);
        let generated = mappings[0].field_name.clone();
        assert!(generated.starts_with("full_name_"));

        let mapper = FieldMapper::new(&mappings);
        let mut reply = serde_json::Map::new();
        reply.insert(generated, serde_json::json!("John Doe"));

        let translated = mapper.translate(&reply);
        assert_eq!(
            translated.values.get("Full Name").map(String::as_str),
            Some("John Doe")
        );
        assert!(translated.unmapped.is_empty());
    }

    #[test]
    fn same_label_different_components_get_distinct_names() {
        let mappings = generate_mappings(
            Uuid::new_v4(),
            1,
            &form_graph(vec![("a", "Name"), ("b", "Name")]),
        );
        assert_ne!(mappings[0].field_name, mappings[1].field_name);
    }

    #[test]
    fn identical_inputs_collide_into_counter_suffix() {
        let mut graph = form_graph(vec![("dup", "Name")]);
        let second = graph.nodes[0].clone();
        graph.nodes.push(Node {
            id: "form2".into(),
            ..second
        });
        let mappings = generate_mappings(Uuid::new_v4(), 1, &graph);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].field_name, format!("{}_2", mappings[0].field_name));
    }

    #[test]
    fn generation_is_deterministic() {
        let graph = form_graph(vec![("c1", "City"), ("c2", "Zip code")]);
        let id = Uuid::new_v4();
        assert_eq!(generate_mappings(id, 1, &graph), generate_mappings(id, 1, &graph));
    }

    #[test]
    fn unmapped_fields_are_kept_and_flagged() {
        let mappings = generate_mappings(Uuid::new_v4(), 1, &form_graph(vec![("c1", "City")]));
        let mapper = FieldMapper::new(&mappings);
        let mut reply = serde_json::Map::new();
        reply.insert("mystery_abc123".into(), serde_json::json!(42));
        reply.insert(mappings[0].field_name.clone(), serde_json::json!("Lisbon"));

        let translated = mapper.translate(&reply);
        assert_eq!(translated.unmapped, vec!["mystery_abc123".to_string()]);
        assert_eq!(translated.values["mystery_abc123"], "42");
        assert_eq!(translated.values["City"], "Lisbon");
    }

    #[test]
    fn value_flattening() {
        assert_eq!(value_to_string(&serde_json::json!(["a", "b"])), "a, b");
        assert_eq!(value_to_string(&serde_json::json!(true)), "true");
        assert_eq!(value_to_string(&serde_json::Value::Null), "");
    }
}
