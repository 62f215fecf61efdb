//! Task planner: reachable-subgraph leveling and skeleton materialization.
//!
//! Uses `petgraph` to model operation-node dependencies as a directed graph.
//! Topological sort rejects cycles, and depth-based grouping produces
//! dependency levels where every node's upstream operations sit in strictly
//! earlier levels. Each level becomes a `Sequence`; each operation node in it
//! becomes a `Step` + `Generation` pair seeded at status created.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use petgraph::Direction;
use uuid::Uuid;

use weft_types::generation::{ExternalInput, Generation, GenerationContext, RunOrigin};
use weft_types::graph::{Connection, Node, WorkspaceGraph};
use weft_types::task::{
    Sequence, SequenceStatus, Step, StepCounts, StepStatus, Task, TaskStarter, TaskStatus,
    TokenUsage,
};

// ---------------------------------------------------------------------------
// Plan input / output
// ---------------------------------------------------------------------------

/// What to run: an explicit connection set, or everything reachable from a
/// starting node.
#[derive(Debug, Clone)]
pub enum PlanTarget {
    Connections(HashSet<Uuid>),
    Node(Uuid),
}

/// A materialized plan: the task skeleton, its generations, and the boundary
/// nodes recorded as metadata rather than steps.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub task: Task,
    pub generations: Vec<Generation>,
    /// The trigger or app-entry node the subgraph enters through, if any.
    pub entry_node_id: Option<Uuid>,
    /// The end marker of the subgraph, if any.
    pub end_node_id: Option<Uuid>,
}

/// Errors raised while planning. All of these fail fast, before any task is
/// persisted.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("connection not found: {0}")]
    ConnectionNotFound(Uuid),

    #[error("node {0} belongs to no connection group and is not runnable")]
    NodeNotRunnable(Uuid),

    #[error("selection contains no connections")]
    EmptySelection,

    #[error("subgraph contains more than one end node")]
    MultipleEndNodes,

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Plan a task from a workspace graph.
///
/// Computes the reachable subgraph for the target, stratifies its operation
/// nodes into dependency levels, and materializes the Task/Sequence/Step/
/// Generation skeleton, all seeded at status created.
pub fn plan_task(
    graph: &WorkspaceGraph,
    target: &PlanTarget,
    starter: TaskStarter,
    inputs: Vec<ExternalInput>,
) -> Result<PlannedTask, PlanError> {
    let selected = select_connections(graph, target)?;

    // The reachable node set: endpoints of every selected connection, plus
    // the seed node itself for node targets.
    let mut node_ids: HashSet<Uuid> = HashSet::new();
    for connection in &selected {
        node_ids.insert(connection.source_node_id);
        node_ids.insert(connection.target_node_id);
    }
    if let PlanTarget::Node(id) = target {
        node_ids.insert(*id);
    }

    let nodes: Vec<&Node> = node_ids
        .iter()
        .map(|id| graph.node(*id).ok_or(PlanError::NodeNotFound(*id)))
        .collect::<Result<_, _>>()?;

    // Boundary metadata: a single end marker at most, and the entry node.
    let end_nodes: Vec<&Node> = nodes
        .iter()
        .copied()
        .filter(|n| matches!(n.content, weft_types::graph::NodeContent::End))
        .collect();
    if end_nodes.len() > 1 {
        return Err(PlanError::MultipleEndNodes);
    }
    let end_node_id = end_nodes.first().map(|n| n.id);
    let entry_node_id = starter.entry_node_id.or_else(|| {
        nodes
            .iter()
            .find(|n| {
                matches!(
                    n.content,
                    weft_types::graph::NodeContent::Trigger { .. }
                        | weft_types::graph::NodeContent::AppEntry { .. }
                )
            })
            .map(|n| n.id)
    });

    let operations: Vec<&Node> = nodes.iter().copied().filter(|n| n.content.is_operation()).collect();
    if operations.is_empty() {
        // A selection with connections but no operation nodes cannot run.
        let offending = match target {
            PlanTarget::Node(id) => *id,
            PlanTarget::Connections(_) => node_ids.into_iter().next().unwrap_or(Uuid::nil()),
        };
        return Err(PlanError::NodeNotRunnable(offending));
    }

    let levels = stratify(&operations, &selected)?;

    Ok(materialize(
        graph,
        levels,
        &selected,
        starter,
        inputs,
        entry_node_id,
        end_node_id,
    ))
}

/// Resolve the target into the set of connections to run.
///
/// For a node target this is the undirected closure of connections touching
/// the node: the node's whole group runs, not just its downstream cone. A
/// node with no connections at all falls back to a one-node plan if it is
/// itself an operation.
fn select_connections<'a>(
    graph: &'a WorkspaceGraph,
    target: &PlanTarget,
) -> Result<Vec<&'a Connection>, PlanError> {
    match target {
        PlanTarget::Connections(ids) => {
            if ids.is_empty() {
                return Err(PlanError::EmptySelection);
            }
            ids.iter()
                .map(|id| graph.connection(*id).ok_or(PlanError::ConnectionNotFound(*id)))
                .collect()
        }
        PlanTarget::Node(node_id) => {
            let node = graph.node(*node_id).ok_or(PlanError::NodeNotFound(*node_id))?;

            // Undirected closure from the node.
            let mut frontier = vec![*node_id];
            let mut visited_nodes: HashSet<Uuid> = HashSet::new();
            let mut selected: Vec<&Connection> = Vec::new();
            let mut selected_ids: HashSet<Uuid> = HashSet::new();
            while let Some(current) = frontier.pop() {
                if !visited_nodes.insert(current) {
                    continue;
                }
                for connection in graph
                    .connections
                    .iter()
                    .filter(|c| c.source_node_id == current || c.target_node_id == current)
                {
                    if selected_ids.insert(connection.id) {
                        selected.push(connection);
                    }
                    frontier.push(connection.source_node_id);
                    frontier.push(connection.target_node_id);
                }
            }

            if selected.is_empty() && !node.content.is_operation() {
                return Err(PlanError::NodeNotRunnable(*node_id));
            }
            Ok(selected)
        }
    }
}

/// Group operation nodes into dependency levels.
///
/// Builds a `DiGraph` with an edge per connection joining two operation
/// nodes, verifies acyclicity via toposort, computes each node's depth
/// (max predecessor depth + 1), and groups by depth. Level 0 is the first
/// to execute.
fn stratify<'a>(
    operations: &[&'a Node],
    connections: &[&Connection],
) -> Result<Vec<Vec<&'a Node>>, PlanError> {
    let id_to_pos: HashMap<Uuid, usize> = operations
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id, i))
        .collect();

    let mut dag = DiGraph::<Uuid, ()>::new();
    let indices: Vec<_> = operations.iter().map(|n| dag.add_node(n.id)).collect();

    for connection in connections {
        let (Some(&from), Some(&to)) = (
            id_to_pos.get(&connection.source_node_id),
            id_to_pos.get(&connection.target_node_id),
        ) else {
            // Edges through source or boundary nodes carry data, not ordering.
            continue;
        };
        dag.add_edge(indices[from], indices[to], ());
    }

    let sorted = toposort(&dag, None).map_err(|cycle| {
        let node_id = dag[cycle.node_id()];
        PlanError::CycleDetected(node_id.to_string())
    })?;

    // Depth per node: roots at 0, otherwise max predecessor depth + 1.
    let mut depths: HashMap<Uuid, usize> = HashMap::new();
    for &idx in &sorted {
        let depth = dag
            .neighbors_directed(idx, Direction::Incoming)
            .map(|pred| depths.get(&dag[pred]).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(dag[idx], depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<&Node>> = vec![vec![]; max_depth + 1];
    for node in operations.iter().copied() {
        levels[depths[&node.id]].push(node);
    }
    Ok(levels)
}

/// Materialize the task skeleton from the computed levels.
fn materialize(
    graph: &WorkspaceGraph,
    levels: Vec<Vec<&Node>>,
    selected: &[&Connection],
    starter: TaskStarter,
    inputs: Vec<ExternalInput>,
    entry_node_id: Option<Uuid>,
    end_node_id: Option<Uuid>,
) -> PlannedTask {
    let task_id = Uuid::now_v7();
    let now = Utc::now();
    let mut generations = Vec::new();

    let sequences: Vec<Sequence> = levels
        .into_iter()
        .map(|level| {
            let steps = level
                .into_iter()
                .map(|node| {
                    let generation_id = Uuid::now_v7();
                    let upstream: Vec<&Connection> = selected
                        .iter()
                        .copied()
                        .filter(|c| c.target_node_id == node.id)
                        .collect();
                    let source_nodes: Vec<Node> = upstream
                        .iter()
                        .filter_map(|c| graph.node(c.source_node_id).cloned())
                        .collect();

                    generations.push(Generation::created(
                        generation_id,
                        GenerationContext {
                            operation_node: node.clone(),
                            source_nodes,
                            connections: upstream.into_iter().cloned().collect(),
                            inputs: inputs.clone(),
                            origin: RunOrigin {
                                kind: starter.origin,
                                workspace_id: graph.workspace_id,
                                task_id: Some(task_id),
                            },
                        },
                        now,
                    ));

                    Step {
                        id: Uuid::now_v7(),
                        name: node.name.clone(),
                        node_id: node.id,
                        status: StepStatus::Created,
                        generation_id,
                        duration_ms: None,
                        usage: TokenUsage::default(),
                    }
                })
                .collect();

            Sequence {
                id: Uuid::now_v7(),
                status: SequenceStatus::Created,
                steps,
                duration_ms: None,
                usage: TokenUsage::default(),
            }
        })
        .collect();

    let task = Task {
        id: task_id,
        workspace_id: graph.workspace_id,
        status: TaskStatus::Created,
        starter,
        sequences,
        steps: StepCounts::default(),
        duration_ms: None,
        usage: TokenUsage::default(),
        created_at: now,
        updated_at: now,
        annotations: vec![],
    };

    PlannedTask {
        task,
        generations,
        entry_node_id,
        end_node_id,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
