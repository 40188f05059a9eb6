//! Flow graph types: flows, versions, nodes and edges.
//!
//! Node behaviour is a tagged union (`NodeKind`) with one payload struct per
//! node type, so malformed properties are caught by serde and by publish-time
//! validation rather than at execution time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fields::FieldMapping;

/// Discriminator for the true branch of a condition node.
pub const TRUE_BRANCH: &str = "true";
/// Discriminator for the false branch of a condition node.
pub const FALSE_BRANCH: &str = "false";
/// Discriminator for the edge followed when a wait expires.
pub const TIMEOUT_BRANCH: &str = "timeout";
/// Longest wait timeout or delay a published flow may schedule (366 days).
pub const MAX_SCHEDULE_SECS: u64 = 366 * 24 * 60 * 60;

/// A flow record: identity, enable flag, working draft and publish pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub account_id: String,
    pub name: String,
    /// Disabled flows never start new sessions; running sessions continue.
    pub enabled: bool,
    /// Latest published version, if any.
    pub published_version: Option<i64>,
    /// The editable draft. Only builder operations touch it.
    pub draft: FlowGraph,
    /// Next edge creation sequence number.
    pub next_edge_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(account_id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            enabled: true,
            published_version: None,
            draft: FlowGraph::default(),
            next_edge_seq: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle status of a published flow version. Drafts live on [`Flow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Published,
    Deprecated,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Published => "published",
            Self::Deprecated => "deprecated",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "published" => Ok(Self::Published),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(format!("unknown flow status: {other}")),
        }
    }
}

/// An immutable published snapshot of a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowVersion {
    pub flow_id: Uuid,
    pub version: i64,
    pub status: FlowStatus,
    pub graph: FlowGraph,
    pub published_at: DateTime<Utc>,
}

/// Everything the interpreter needs about one pinned flow version.
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub flow_id: Uuid,
    pub version: i64,
    pub graph: FlowGraph,
    pub mappings: Vec<FieldMapping>,
}

/// Nodes plus typed edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The first trigger node. Published graphs have exactly one.
    pub fn trigger(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Trigger(_)))
    }

    /// Outgoing edges of `node_id`, ordered by creation sequence.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.edges.iter().filter(|e| e.source == node_id).collect();
        edges.sort_by_key(|e| e.sequence);
        edges
    }

    /// The outgoing edge carrying exactly this discriminator.
    pub fn branch(&self, node_id: &str, discriminator: &str) -> Option<&Edge> {
        self.outgoing(node_id)
            .into_iter()
            .find(|e| e.discriminator.as_deref() == Some(discriminator))
    }

    /// Pick the edge to follow after a non-timeout event.
    ///
    /// An edge whose discriminator matches the event wins; otherwise the
    /// lowest-sequence edge that is not the timeout branch.
    pub fn next_edge(&self, node_id: &str, discriminator: Option<&str>) -> Option<&Edge> {
        let candidates: Vec<&Edge> = self
            .outgoing(node_id)
            .into_iter()
            .filter(|e| e.discriminator.as_deref() != Some(TIMEOUT_BRANCH))
            .collect();

        if let Some(d) = discriminator
            && let Some(edge) = candidates
                .iter()
                .find(|e| e.discriminator.as_deref() == Some(d))
        {
            return Some(edge);
        }

        candidates.into_iter().next()
    }
}

/// A graph vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Free text attached to the node. For `waitForReply` this is the re-prompt
    /// sent when a reply fails validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: &str, kind: NodeKind) -> Self {
        Self {
            id: id.to_string(),
            content: None,
            kind,
        }
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind.type_tag()
    }
}

/// Node behaviour and its type-specific properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    Trigger(TriggerProps),
    SendMessage(SendMessageProps),
    WaitForReply(WaitForReplyProps),
    Condition(ConditionProps),
    Delay(DelayProps),
}

impl NodeKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Trigger(_) => "trigger",
            Self::SendMessage(_) => "sendMessage",
            Self::WaitForReply(_) => "waitForReply",
            Self::Condition(_) => "condition",
            Self::Delay(_) => "delay",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerProps {
    /// Whole-message keywords (case-insensitive) that start this flow.
    /// Empty means the flow only starts through the API.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl TriggerProps {
    pub fn matches(&self, text: &str) -> bool {
        let text = text.trim();
        !text.is_empty() && self.keywords.iter().any(|k| k.trim().eq_ignore_ascii_case(text))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageProps {
    pub message: MessageContent,
}

/// What a `sendMessage` node renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        media_type: MediaType,
        url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Buttons {
        body: String,
        buttons: Vec<Button>,
    },
    List {
        body: String,
        button_text: String,
        sections: Vec<ListSection>,
    },
    /// The only form-capable content: fields get generated identifiers at publish.
    Form {
        body: String,
        cta: String,
        fields: Vec<FormField>,
    },
}

impl MessageContent {
    pub fn text(body: &str) -> Self {
        Self::Text {
            body: body.to_string(),
        }
    }

    pub fn form_fields(&self) -> &[FormField] {
        match self {
            Self::Form { fields, .. } => fields,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSection {
    #[serde(default)]
    pub title: Option<String>,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub component_id: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitForReplyProps {
    #[serde(default)]
    pub reply_type: Option<ReplyType>,
    /// Seconds until the wait expires. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Session variable that receives the accepted reply.
    #[serde(default)]
    pub variable: Option<String>,
}

/// Validation constraint for a waited-for reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyType {
    Text,
    Number,
    Email,
}

impl fmt::Display for ReplyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Email => "email",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ReplyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "number" => Ok(Self::Number),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown reply type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionProps {
    #[serde(default)]
    pub subject: ConditionSubject,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub compare_value: String,
}

/// Where a condition node reads its subject value from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSubject {
    /// The most recent accepted waitForReply value.
    #[default]
    LastReply,
    /// A named session variable, form label or generated form field name.
    Variable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    #[serde(alias = "startsWith")]
    StartsWith,
    Regex,
    #[serde(alias = "greaterThan")]
    GreaterThan,
    #[serde(alias = "lessThan")]
    LessThan,
    #[serde(alias = "isEmpty")]
    IsEmpty,
    #[serde(alias = "isNotEmpty")]
    IsNotEmpty,
}

impl ConditionOperator {
    /// Whether the operator compares against `compare_value` numerically.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::GreaterThan | Self::LessThan)
    }

    /// Whether `compare_value` is ignored.
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsEmpty | Self::IsNotEmpty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayProps {
    pub duration_secs: u64,
}

/// A directed connection, optionally discriminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    /// Creation order within the flow; lowest wins tie-breaks.
    pub sequence: i64,
}
