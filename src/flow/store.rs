//! Flow Graph Store: draft editing, publishing and versioned reads.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, FlowError};
use crate::fields::{self, FieldMapping};
use crate::flow::model::{Edge, Flow, FlowSnapshot, FlowStatus, FlowVersion, Node};
use crate::flow::validate::validate_graph;
use crate::store::Database;

/// Builder and read access to flows.
///
/// Draft mutations are read-modify-write on a JSON column, so they are
/// serialized through `edit_lock`.
pub struct FlowStore {
    db: Arc<dyn Database>,
    edit_lock: Mutex<()>,
}

impl FlowStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            edit_lock: Mutex::new(()),
        }
    }

    pub async fn create_flow(&self, account_id: &str, name: &str) -> Result<Flow, Error> {
        let flow = Flow::new(account_id, name);
        self.db.insert_flow(&flow).await?;
        info!(flow_id = %flow.id, account_id, name, "Flow created");
        Ok(flow)
    }

    /// The flow record including its editable draft.
    pub async fn get_draft(&self, flow_id: Uuid) -> Result<Flow, Error> {
        self.db
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| FlowError::NotFound { id: flow_id }.into())
    }

    pub async fn list_flows(&self, account_id: Option<&str>) -> Result<Vec<Flow>, Error> {
        Ok(self.db.list_flows(account_id).await?)
    }

    // ── Draft editing ───────────────────────────────────────────────

    pub async fn add_node(&self, flow_id: Uuid, node: Node) -> Result<Flow, Error> {
        let _guard = self.edit_lock.lock().await;
        let mut flow = self.get_draft(flow_id).await?;

        if flow.draft.node(&node.id).is_some() {
            return Err(FlowError::DuplicateNode {
                flow_id,
                node_id: node.id,
            }
            .into());
        }
        flow.draft.nodes.push(node);
        self.save_draft(&flow).await?;
        Ok(flow)
    }

    /// Replace a node's content and type-specific properties. The id is kept.
    pub async fn update_node(
        &self,
        flow_id: Uuid,
        node_id: &str,
        node: Node,
    ) -> Result<Flow, Error> {
        let _guard = self.edit_lock.lock().await;
        let mut flow = self.get_draft(flow_id).await?;

        let existing = flow
            .draft
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| FlowError::NodeNotFound {
                flow_id,
                node_id: node_id.to_string(),
            })?;
        existing.content = node.content;
        existing.kind = node.kind;

        self.save_draft(&flow).await?;
        Ok(flow)
    }

    /// Remove a node and every edge touching it.
    pub async fn delete_node(&self, flow_id: Uuid, node_id: &str) -> Result<Flow, Error> {
        let _guard = self.edit_lock.lock().await;
        let mut flow = self.get_draft(flow_id).await?;

        let before = flow.draft.nodes.len();
        flow.draft.nodes.retain(|n| n.id != node_id);
        if flow.draft.nodes.len() == before {
            return Err(FlowError::NodeNotFound {
                flow_id,
                node_id: node_id.to_string(),
            }
            .into());
        }
        flow.draft
            .edges
            .retain(|e| e.source != node_id && e.target != node_id);

        self.save_draft(&flow).await?;
        Ok(flow)
    }

    /// Connect two existing draft nodes. The store assigns the edge sequence.
    pub async fn add_edge(
        &self,
        flow_id: Uuid,
        source: &str,
        target: &str,
        discriminator: Option<&str>,
    ) -> Result<Edge, Error> {
        let _guard = self.edit_lock.lock().await;
        let mut flow = self.get_draft(flow_id).await?;

        for node_id in [source, target] {
            if flow.draft.node(node_id).is_none() {
                return Err(FlowError::NodeNotFound {
                    flow_id,
                    node_id: node_id.to_string(),
                }
                .into());
            }
        }

        let edge = Edge {
            source: source.to_string(),
            target: target.to_string(),
            discriminator: discriminator.map(String::from),
            sequence: flow.next_edge_seq,
        };
        flow.next_edge_seq += 1;
        flow.draft.edges.push(edge.clone());

        self.save_draft(&flow).await?;
        Ok(edge)
    }

    pub async fn delete_edge(&self, flow_id: Uuid, sequence: i64) -> Result<Flow, Error> {
        let _guard = self.edit_lock.lock().await;
        let mut flow = self.get_draft(flow_id).await?;

        let before = flow.draft.edges.len();
        flow.draft.edges.retain(|e| e.sequence != sequence);
        if flow.draft.edges.len() == before {
            return Err(FlowError::EdgeNotFound { flow_id, sequence }.into());
        }

        self.save_draft(&flow).await?;
        Ok(flow)
    }

    async fn save_draft(&self, flow: &Flow) -> Result<(), Error> {
        self.db
            .update_flow_draft(flow.id, &flow.draft, flow.next_edge_seq)
            .await?;
        Ok(())
    }

    // ── Publishing ──────────────────────────────────────────────────

    /// Validate the draft and freeze it as the next version.
    ///
    /// Field mappings are generated and persisted together with the version;
    /// the previous version becomes deprecated.
    pub async fn publish(&self, flow_id: Uuid) -> Result<FlowVersion, Error> {
        let _guard = self.edit_lock.lock().await;
        let flow = self.get_draft(flow_id).await?;

        validate_graph(&flow.draft)?;

        let number = self.db.max_flow_version(flow_id).await? + 1;
        let version = FlowVersion {
            flow_id,
            version: number,
            status: FlowStatus::Published,
            graph: flow.draft.clone(),
            published_at: Utc::now(),
        };
        let mappings = fields::generate_mappings(flow_id, number, &version.graph);

        self.db.publish_flow_version(&version, &mappings).await?;
        info!(
            flow_id = %flow_id,
            version = number,
            nodes = version.graph.nodes.len(),
            fields = mappings.len(),
            "Flow published"
        );
        Ok(version)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Fetch a published version with its field mappings. `None` means the
    /// current published version.
    pub async fn get_flow(
        &self,
        flow_id: Uuid,
        version: Option<i64>,
    ) -> Result<FlowSnapshot, Error> {
        let version = match version {
            Some(v) => v,
            None => self
                .get_draft(flow_id)
                .await?
                .published_version
                .ok_or(FlowError::NotPublished { id: flow_id })?,
        };

        let published = self
            .db
            .get_flow_version(flow_id, version)
            .await?
            .ok_or(FlowError::VersionNotFound { id: flow_id, version })?;
        let mappings = self.db.get_field_mappings(flow_id, version).await?;

        Ok(FlowSnapshot {
            flow_id,
            version,
            graph: published.graph,
            mappings,
        })
    }

    pub async fn field_mappings(
        &self,
        flow_id: Uuid,
        version: i64,
    ) -> Result<Vec<FieldMapping>, Error> {
        Ok(self.db.get_field_mappings(flow_id, version).await?)
    }

    /// Deactivation blocks new sessions only; running sessions continue.
    pub async fn set_enabled(&self, flow_id: Uuid, enabled: bool) -> Result<(), Error> {
        if !self.db.set_flow_enabled(flow_id, enabled).await? {
            return Err(FlowError::NotFound { id: flow_id }.into());
        }
        info!(flow_id = %flow_id, enabled, "Flow activation changed");
        Ok(())
    }

    /// Current versions of enabled, published flows, ordered by flow id.
    pub async fn trigger_candidates(&self) -> Result<Vec<FlowVersion>, Error> {
        Ok(self.db.list_trigger_candidates().await?)
    }
}
