//! Publish-time structural validation of a draft graph.
//!
//! Everything the interpreter would otherwise have to trip over at runtime is
//! rejected here. All violations are collected so the builder can show them
//! at once.

use std::collections::{HashMap, HashSet, VecDeque};

use regex::Regex;

use crate::error::{GraphViolation, ValidationError};
use crate::flow::model::{
    ConditionProps, FALSE_BRANCH, FlowGraph, MAX_SCHEDULE_SECS, MessageContent, Node, NodeKind,
    TIMEOUT_BRANCH, TRUE_BRANCH,
};

/// Provider limit on reply buttons per message.
pub const MAX_BUTTONS: usize = 3;
/// Provider limit on rows across all sections of a list message.
pub const MAX_LIST_ROWS: usize = 10;

/// Validate a draft graph. Returns every violation found.
pub fn validate_graph(graph: &FlowGraph) -> Result<(), ValidationError> {
    let mut v = Violations::default();

    let mut node_ids: HashSet<&str> = HashSet::new();
    for node in &graph.nodes {
        if node.id.trim().is_empty() {
            v.global("node id must not be empty");
        } else if !node_ids.insert(node.id.as_str()) {
            v.at(&node.id, "duplicate node id");
        }
    }

    // Edges must reference nodes in this graph.
    let mut discriminators: HashSet<(&str, &str)> = HashSet::new();
    let mut inbound: HashMap<&str, usize> = HashMap::new();
    for edge in &graph.edges {
        let label = format!("edge #{}", edge.sequence);
        if !node_ids.contains(edge.source.as_str()) {
            v.at(&label, format!("source '{}' does not exist", edge.source));
        }
        if !node_ids.contains(edge.target.as_str()) {
            v.at(&label, format!("target '{}' does not exist", edge.target));
        }
        if let Some(d) = edge.discriminator.as_deref()
            && !discriminators.insert((edge.source.as_str(), d))
        {
            v.at(
                &edge.source,
                format!("more than one outgoing edge labelled '{d}'"),
            );
        }
        *inbound.entry(edge.target.as_str()).or_default() += 1;
    }

    // Exactly one trigger, no inbound edges, at least one outgoing edge.
    let triggers: Vec<&Node> = graph
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Trigger(_)))
        .collect();
    match triggers.as_slice() {
        [] => v.global("flow has no trigger node"),
        [trigger] => {
            if inbound.get(trigger.id.as_str()).copied().unwrap_or(0) > 0 {
                v.at(&trigger.id, "trigger node must not have inbound edges");
            }
            if graph.outgoing(&trigger.id).is_empty() {
                v.at(&trigger.id, "trigger node needs an outgoing edge");
            }
        }
        many => {
            let ids: Vec<&str> = many.iter().map(|n| n.id.as_str()).collect();
            v.global(format!(
                "flow has {} trigger nodes ({})",
                many.len(),
                ids.join(", ")
            ));
        }
    }

    // Every non-terminal node must be reachable from the trigger.
    if let [trigger] = triggers.as_slice() {
        let reachable = reachable_from(graph, &trigger.id);
        for node in &graph.nodes {
            let terminal = graph.outgoing(&node.id).is_empty();
            if !terminal && !reachable.contains(node.id.as_str()) {
                v.at(&node.id, "node is not reachable from the trigger");
            }
        }
    }

    for node in &graph.nodes {
        validate_node(graph, node, &mut v);
    }

    v.finish()
}

fn validate_node(graph: &FlowGraph, node: &Node, v: &mut Violations) {
    let outgoing = graph.outgoing(&node.id);
    let has_timeout_edge = outgoing
        .iter()
        .any(|e| e.discriminator.as_deref() == Some(TIMEOUT_BRANCH));

    match &node.kind {
        NodeKind::Trigger(props) => {
            if props.keywords.iter().any(|k| k.trim().is_empty()) {
                v.at(&node.id, "trigger keywords must not be blank");
            }
        }
        NodeKind::SendMessage(props) => validate_message(&node.id, &props.message, v),
        NodeKind::WaitForReply(props) => {
            if has_timeout_edge && props.timeout_secs.is_none() {
                v.at(
                    &node.id,
                    "timeout edge can never fire on a wait without timeout_secs",
                );
            }
            if let Some(secs) = props.timeout_secs
                && secs > MAX_SCHEDULE_SECS
            {
                v.at(
                    &node.id,
                    format!("timeout_secs {secs} exceeds the maximum of {MAX_SCHEDULE_SECS}"),
                );
            }
            if let Some(var) = &props.variable
                && var.trim().is_empty()
            {
                v.at(&node.id, "variable name must not be blank");
            }
        }
        NodeKind::Condition(props) => {
            if outgoing.is_empty() {
                v.at(&node.id, "condition node needs at least one outgoing edge");
            }
            for edge in &outgoing {
                match edge.discriminator.as_deref() {
                    Some(TRUE_BRANCH) | Some(FALSE_BRANCH) => {}
                    other => v.at(
                        &node.id,
                        format!(
                            "condition edges must be labelled 'true' or 'false', found {:?}",
                            other
                        ),
                    ),
                }
            }
            validate_condition(&node.id, props, v);
        }
        NodeKind::Delay(props) => {
            if props.duration_secs > MAX_SCHEDULE_SECS {
                v.at(
                    &node.id,
                    format!(
                        "duration_secs {} exceeds the maximum of {MAX_SCHEDULE_SECS}",
                        props.duration_secs
                    ),
                );
            }
            if has_timeout_edge {
                v.at(&node.id, "delay nodes resume along a plain edge, not 'timeout'");
            }
        }
    }

    if has_timeout_edge && !matches!(node.kind, NodeKind::WaitForReply(_) | NodeKind::Delay(_)) {
        v.at(&node.id, "only waitForReply nodes may have a 'timeout' edge");
    }
}

fn validate_condition(node_id: &str, props: &ConditionProps, v: &mut Violations) {
    use crate::flow::model::ConditionOperator;

    match props.operator {
        ConditionOperator::Regex => {
            if let Err(e) = Regex::new(&props.compare_value) {
                v.at(node_id, format!("invalid regex: {e}"));
            }
        }
        op if op.is_numeric() => {
            if props.compare_value.trim().parse::<f64>().is_err() {
                v.at(
                    node_id,
                    format!("compare value '{}' is not a number", props.compare_value),
                );
            }
        }
        _ => {}
    }
}

fn validate_message(node_id: &str, message: &MessageContent, v: &mut Violations) {
    match message {
        MessageContent::Text { body } => {
            if body.trim().is_empty() {
                v.at(node_id, "text message body is empty");
            }
        }
        MessageContent::Media { url, .. } => {
            if url.trim().is_empty() {
                v.at(node_id, "media message needs a url");
            }
        }
        MessageContent::Buttons { buttons, .. } => {
            if buttons.is_empty() || buttons.len() > MAX_BUTTONS {
                v.at(
                    node_id,
                    format!("button messages need 1 to {MAX_BUTTONS} buttons"),
                );
            }
            check_unique_ids(node_id, "button", buttons.iter().map(|b| b.id.as_str()), v);
        }
        MessageContent::List { sections, .. } => {
            let rows: Vec<&str> = sections
                .iter()
                .flat_map(|s| s.rows.iter().map(|r| r.id.as_str()))
                .collect();
            if rows.is_empty() || rows.len() > MAX_LIST_ROWS {
                v.at(
                    node_id,
                    format!("list messages need 1 to {MAX_LIST_ROWS} rows"),
                );
            }
            check_unique_ids(node_id, "list row", rows.into_iter(), v);
        }
        MessageContent::Form { fields, .. } => {
            if fields.is_empty() {
                v.at(node_id, "form needs at least one field");
            }
            if fields.iter().any(|f| f.label.trim().is_empty()) {
                v.at(node_id, "form field labels must not be empty");
            }
            check_unique_ids(
                node_id,
                "form component",
                fields.iter().map(|f| f.component_id.as_str()),
                v,
            );
        }
    }
}

fn check_unique_ids<'a>(
    node_id: &str,
    what: &str,
    ids: impl Iterator<Item = &'a str>,
    v: &mut Violations,
) {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            v.at(node_id, format!("{what} id must not be empty"));
        } else if !seen.insert(id) {
            v.at(node_id, format!("duplicate {what} id '{id}'"));
        }
    }
}

fn reachable_from<'a>(graph: &'a FlowGraph, start: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for edge in graph.edges.iter().filter(|e| e.source == id) {
            if seen.insert(edge.target.as_str()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }
    seen
}

#[derive(Default)]
struct Violations(Vec<GraphViolation>);

impl Violations {
    fn at(&mut self, subject: &str, message: impl Into<String>) {
        self.0.push(GraphViolation {
            subject: Some(subject.to_string()),
            message: message.into(),
        });
    }

    fn global(&mut self, message: impl Into<String>) {
        self.0.push(GraphViolation {
            subject: None,
            message: message.into(),
        });
    }

    fn finish(self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations: self.0 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::*;

    fn send(id: &str, body: &str) -> Node {
        Node::new(
            id,
            NodeKind::SendMessage(SendMessageProps {
                message: MessageContent::text(body),
            }),
        )
    }

    fn trigger(id: &str) -> Node {
        Node::new(id, NodeKind::Trigger(TriggerProps::default()))
    }

    fn edge(source: &str, target: &str, discriminator: Option<&str>, sequence: i64) -> Edge {
        Edge {
            source: source.into(),
            target: target.into(),
            discriminator: discriminator.map(String::from),
            sequence,
        }
    }

    fn messages(err: ValidationError) -> Vec<String> {
        err.violations.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn accepts_minimal_flow() {
        let graph = FlowGraph {
            nodes: vec![trigger("t"), send("hi", "Hi")],
            edges: vec![edge("t", "hi", None, 1)],
        };
        assert!(validate_graph(&graph).is_ok());
    }

    #[test]
    fn rejects_dangling_edge_target() {
        let graph = FlowGraph {
            nodes: vec![trigger("t"), send("hi", "Hi")],
            edges: vec![edge("t", "hi", None, 1), edge("hi", "ghost", None, 2)],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.contains("target 'ghost' does not exist")));
    }

    #[test]
    fn rejects_missing_and_duplicate_triggers() {
        let none = FlowGraph {
            nodes: vec![send("hi", "Hi")],
            edges: vec![],
        };
        assert!(
            messages(validate_graph(&none).unwrap_err())
                .iter()
                .any(|e| e.contains("no trigger"))
        );

        let two = FlowGraph {
            nodes: vec![trigger("t1"), trigger("t2"), send("hi", "Hi")],
            edges: vec![edge("t1", "hi", None, 1), edge("t2", "hi", None, 2)],
        };
        assert!(
            messages(validate_graph(&two).unwrap_err())
                .iter()
                .any(|e| e.contains("2 trigger nodes"))
        );
    }

    #[test]
    fn rejects_trigger_without_outgoing_edge() {
        let graph = FlowGraph {
            nodes: vec![trigger("t")],
            edges: vec![],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.contains("needs an outgoing edge")));
    }

    #[test]
    fn rejects_inbound_edge_to_trigger() {
        let graph = FlowGraph {
            nodes: vec![trigger("t"), send("hi", "Hi")],
            edges: vec![edge("t", "hi", None, 1), edge("hi", "t", None, 2)],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.contains("must not have inbound edges")));
    }

    #[test]
    fn rejects_unreachable_non_terminal_node() {
        let graph = FlowGraph {
            nodes: vec![trigger("t"), send("a", "A"), send("island", "I"), send("b", "B")],
            edges: vec![edge("t", "a", None, 1), edge("island", "b", None, 2)],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.starts_with("island: node is not reachable")));
        // `b` is terminal; unreachable terminal nodes are tolerated.
        assert!(!errs.iter().any(|e| e.starts_with("b:")));
    }

    #[test]
    fn rejects_waits_and_delays_beyond_a_year() {
        let wait = Node::new(
            "ask",
            NodeKind::WaitForReply(WaitForReplyProps {
                reply_type: None,
                timeout_secs: Some(u64::MAX),
                variable: None,
            }),
        );
        let delay = Node::new(
            "pause",
            NodeKind::Delay(DelayProps {
                duration_secs: 400_000_000_000,
            }),
        );
        let graph = FlowGraph {
            nodes: vec![trigger("t"), wait, delay, send("done", "Done")],
            edges: vec![
                edge("t", "ask", None, 1),
                edge("ask", "pause", None, 2),
                edge("pause", "done", None, 3),
            ],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.starts_with("ask: timeout_secs")));
        assert!(errs.iter().any(|e| e.starts_with("pause: duration_secs")));

        let year = FlowGraph {
            nodes: vec![
                trigger("t"),
                Node::new(
                    "pause",
                    NodeKind::Delay(DelayProps {
                        duration_secs: MAX_SCHEDULE_SECS,
                    }),
                ),
                send("done", "Done"),
            ],
            edges: vec![edge("t", "pause", None, 1), edge("pause", "done", None, 2)],
        };
        assert!(validate_graph(&year).is_ok());
    }

    #[test]
    fn condition_needs_edges_and_valid_labels() {
        let cond = Node::new(
            "c",
            NodeKind::Condition(ConditionProps {
                subject: ConditionSubject::LastReply,
                operator: ConditionOperator::Regex,
                compare_value: "([unclosed".into(),
            }),
        );
        let graph = FlowGraph {
            nodes: vec![trigger("t"), cond, send("x", "X")],
            edges: vec![edge("t", "c", None, 1), edge("c", "x", Some("maybe"), 2)],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.contains("invalid regex")));
        assert!(errs.iter().any(|e| e.contains("'true' or 'false'")));
    }

    #[test]
    fn condition_with_only_true_edge_is_publishable() {
        let cond = Node::new(
            "c",
            NodeKind::Condition(ConditionProps {
                subject: ConditionSubject::LastReply,
                operator: ConditionOperator::Equals,
                compare_value: "yes".into(),
            }),
        );
        let graph = FlowGraph {
            nodes: vec![trigger("t"), cond, send("x", "X")],
            edges: vec![edge("t", "c", None, 1), edge("c", "x", Some(TRUE_BRANCH), 2)],
        };
        assert!(validate_graph(&graph).is_ok());
    }

    #[test]
    fn numeric_operator_needs_numeric_compare_value() {
        let cond = Node::new(
            "c",
            NodeKind::Condition(ConditionProps {
                subject: ConditionSubject::Variable("age".into()),
                operator: ConditionOperator::GreaterThan,
                compare_value: "eighteen".into(),
            }),
        );
        let graph = FlowGraph {
            nodes: vec![trigger("t"), cond, send("x", "X")],
            edges: vec![edge("t", "c", None, 1), edge("c", "x", Some(TRUE_BRANCH), 2)],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.contains("is not a number")));
    }

    #[test]
    fn timeout_edge_requires_timed_wait() {
        let wait = Node::new("w", NodeKind::WaitForReply(WaitForReplyProps::default()));
        let graph = FlowGraph {
            nodes: vec![trigger("t"), wait, send("late", "Too late")],
            edges: vec![
                edge("t", "w", None, 1),
                edge("w", "late", Some(TIMEOUT_BRANCH), 2),
            ],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.contains("can never fire")));
    }

    #[test]
    fn button_and_form_limits() {
        let buttons = Node::new(
            "b",
            NodeKind::SendMessage(SendMessageProps {
                message: MessageContent::Buttons {
                    body: "Pick".into(),
                    buttons: (0..4)
                        .map(|i| Button {
                            id: format!("b{i}"),
                            title: format!("B{i}"),
                        })
                        .collect(),
                },
            }),
        );
        let form = Node::new(
            "f",
            NodeKind::SendMessage(SendMessageProps {
                message: MessageContent::Form {
                    body: "Tell us".into(),
                    cta: "Open".into(),
                    fields: vec![
                        FormField {
                            component_id: "c1".into(),
                            label: "Name".into(),
                            required: true,
                        },
                        FormField {
                            component_id: "c1".into(),
                            label: "Other".into(),
                            required: false,
                        },
                    ],
                },
            }),
        );
        let graph = FlowGraph {
            nodes: vec![trigger("t"), buttons, form],
            edges: vec![edge("t", "b", None, 1), edge("b", "f", None, 2)],
        };
        let errs = messages(validate_graph(&graph).unwrap_err());
        assert!(errs.iter().any(|e| e.contains("1 to 3 buttons")));
        assert!(errs.iter().any(|e| e.contains("duplicate form component id 'c1'")));
    }

    #[test]
    fn reports_all_violations_at_once() {
        let graph = FlowGraph {
            nodes: vec![send("a", ""), send("a", "dup")],
            edges: vec![edge("a", "ghost", None, 1)],
        };
        let err = validate_graph(&graph).unwrap_err();
        assert!(err.violations.len() >= 3);
    }
}
