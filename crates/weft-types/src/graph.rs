//! Workspace graph types for Weft.
//!
//! A workspace is a canvas of nodes joined by directed connections. Operation
//! nodes (generators, actions, queries) do work and are materialized as task
//! steps; source nodes (text, files) feed inputs into downstream operations;
//! boundary nodes (triggers, app entries, end markers) delimit the runnable
//! subgraph and are recorded as plan metadata.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single node on the workspace canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// UUIDv7 node id.
    pub id: Uuid,
    /// Human-readable node name.
    pub name: String,
    /// The node's content payload, keyed by content type.
    pub content: NodeContent,
}

/// The closed set of node content types.
///
/// Every consumer of this union matches exhaustively -- adding a variant must
/// fail compilation at each dispatch site rather than at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeContent {
    /// Static text, inlined into downstream prompts.
    Text { text: String },
    /// A binary attachment (image or file) referenced by blob path.
    File { blob_path: String, mime_type: String },
    /// LLM text/content generation.
    TextGenerator {
        instructions: String,
        model: ModelConfig,
    },
    /// Image generation.
    ImageGenerator {
        instructions: String,
        model: ModelConfig,
    },
    /// Tool/action execution, optionally authenticated via an encrypted credential.
    Action {
        action_name: String,
        #[serde(default)]
        parameters: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<EncryptedCredential>,
    },
    /// Query execution against the workspace.
    Query { query: String },
    /// Query execution against an external data source.
    DataQuery { source: String, query: String },
    /// Workflow trigger; resolves to its configured payload when run.
    Trigger {
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Externally-parameterized entry marker.
    AppEntry {
        #[serde(default)]
        parameters: Vec<EntryParameter>,
    },
    /// Terminal marker; at most one per runnable subgraph.
    End,
}

impl NodeContent {
    /// Whether this node does work and is materialized as a task step.
    pub fn is_operation(&self) -> bool {
        matches!(
            self,
            NodeContent::TextGenerator { .. }
                | NodeContent::ImageGenerator { .. }
                | NodeContent::Action { .. }
                | NodeContent::Query { .. }
                | NodeContent::DataQuery { .. }
        )
    }

    /// Whether this node delimits the runnable subgraph (plan metadata,
    /// never a step).
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            NodeContent::Trigger { .. } | NodeContent::AppEntry { .. } | NodeContent::End
        )
    }

    /// Whether this node only feeds inputs into downstream operations.
    pub fn is_source(&self) -> bool {
        matches!(self, NodeContent::Text { .. } | NodeContent::File { .. })
    }

    /// Short content-type label for logging and display.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeContent::Text { .. } => "text",
            NodeContent::File { .. } => "file",
            NodeContent::TextGenerator { .. } => "textGenerator",
            NodeContent::ImageGenerator { .. } => "imageGenerator",
            NodeContent::Action { .. } => "action",
            NodeContent::Query { .. } => "query",
            NodeContent::DataQuery { .. } => "dataQuery",
            NodeContent::Trigger { .. } => "trigger",
            NodeContent::AppEntry { .. } => "appEntry",
            NodeContent::End => "end",
        }
    }
}

/// Model selection for generator nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Provider name (e.g. "anthropic").
    pub provider: String,
    /// Model identifier.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// An encrypted tool credential, decryptable only through the secret capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCredential {
    /// Opaque ciphertext bytes (`nonce || ciphertext` for the vault format).
    pub ciphertext: Vec<u8>,
}

/// A declared parameter on an app-entry node, supplied externally at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryParameter {
    pub key: String,
    #[serde(default)]
    pub required: bool,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A directed edge from one node's output to another node's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// UUIDv7 connection id.
    pub id: Uuid,
    /// The upstream node.
    pub source_node_id: Uuid,
    /// Which output of the upstream node feeds this edge.
    pub source_output_id: String,
    /// The downstream node.
    pub target_node_id: Uuid,
}

// ---------------------------------------------------------------------------
// WorkspaceGraph
// ---------------------------------------------------------------------------

/// The full node/connection graph of one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceGraph {
    pub workspace_id: Uuid,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
}

impl WorkspaceGraph {
    /// Look up a node by id.
    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a connection by id.
    pub fn connection(&self, id: Uuid) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// All connections whose target is the given node.
    pub fn connections_into(&self, node_id: Uuid) -> impl Iterator<Item = &Connection> {
        self.connections
            .iter()
            .filter(move |c| c.target_node_id == node_id)
    }

    /// All connections whose source is the given node.
    pub fn connections_out_of(&self, node_id: Uuid) -> impl Iterator<Item = &Connection> {
        self.connections
            .iter()
            .filter(move |c| c.source_node_id == node_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
