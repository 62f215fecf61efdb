//! Placeholder resolution for generation inputs.
//!
//! Instruction text references upstream nodes with `{{nodeId:outputId}}`
//! placeholders. Resolution consults the generation's context:
//! - text nodes inline their text
//! - file nodes attach binary parts and leave a marker in the text
//! - generation-producing nodes resolve their latest completed output
//!   through the node generation index
//! - app-entry nodes resolve externally supplied parameters
//! - trigger nodes resolve to their configured payload
//!
//! Unresolvable placeholders are left as-is; only storage failures are
//! errors.

use serde_json::Value;
use uuid::Uuid;

use weft_types::error::StoreError;
use weft_types::generation::{Generation, GenerationContext, GenerationOutput};
use weft_types::graph::{Node, NodeContent};

use crate::provider::MessagePart;
use crate::storage::{StorageBackend, TaskStore};

// ---------------------------------------------------------------------------
// ResolvedPrompt
// ---------------------------------------------------------------------------

/// The outcome of resolving one piece of instruction text.
#[derive(Debug, Default)]
pub struct ResolvedPrompt {
    pub text: String,
    /// Binary parts referenced by file or image placeholders.
    pub attachments: Vec<MessagePart>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve all `{{nodeId:outputId}}` placeholders in `template` against the
/// generation context and the persisted generation index.
pub async fn resolve_placeholders<S: StorageBackend>(
    store: &TaskStore<S>,
    context: &GenerationContext,
    template: &str,
) -> Result<ResolvedPrompt, StoreError> {
    let mut prompt = ResolvedPrompt {
        text: template.to_string(),
        attachments: Vec::new(),
    };

    // Collect placeholder spans first, then substitute back-to-front so
    // earlier ranges stay valid.
    let spans = placeholder_spans(template);
    for (start, end, node_id, output_id) in spans.into_iter().rev() {
        let Some(node) = context.source_nodes.iter().find(|n| n.id == node_id) else {
            continue; // unknown reference: leave as-is
        };
        if let Some(replacement) = resolve_node(store, context, node, &output_id, &mut prompt.attachments).await? {
            prompt.text.replace_range(start..end, &replacement);
        }
    }

    Ok(prompt)
}

/// Find `(start, end, node_id, output_id)` for each well-formed placeholder.
fn placeholder_spans(template: &str) -> Vec<(usize, usize, Uuid, String)> {
    let mut spans = Vec::new();
    let mut search_from = 0;
    while let Some(open) = template[search_from..].find("{{") {
        let open = search_from + open;
        let Some(close) = template[open..].find("}}") else {
            break;
        };
        let close = open + close + 2;
        let inner = template[open + 2..close - 2].trim();
        if let Some((node_part, output_part)) = inner.split_once(':') {
            if let Ok(node_id) = node_part.trim().parse::<Uuid>() {
                spans.push((open, close, node_id, output_part.trim().to_string()));
            }
        }
        search_from = close;
    }
    spans
}

/// Resolve one referenced node to replacement text, possibly attaching
/// binary parts. `None` leaves the placeholder as-is.
async fn resolve_node<S: StorageBackend>(
    store: &TaskStore<S>,
    context: &GenerationContext,
    node: &Node,
    output_id: &str,
    attachments: &mut Vec<MessagePart>,
) -> Result<Option<String>, StoreError> {
    match &node.content {
        NodeContent::Text { text } => Ok(Some(text.clone())),

        NodeContent::File { blob_path, mime_type } => {
            match store.backend().get_blob(blob_path).await? {
                Some(bytes) => {
                    attachments.push(MessagePart::Binary {
                        mime_type: mime_type.clone(),
                        bytes,
                    });
                    Ok(Some(format!("[attachment: {}]", node.name)))
                }
                None => Ok(None),
            }
        }

        NodeContent::TextGenerator { .. }
        | NodeContent::ImageGenerator { .. }
        | NodeContent::Action { .. }
        | NodeContent::Query { .. }
        | NodeContent::DataQuery { .. } => {
            resolve_upstream_generation(store, context, node, output_id, attachments).await
        }

        NodeContent::Trigger { payload } => Ok(Some(value_to_string(payload))),

        NodeContent::AppEntry { .. } => Ok(context
            .inputs
            .iter()
            .find(|input| input.key == output_id)
            .map(|input| value_to_string(&input.value))),

        NodeContent::End => Ok(None),
    }
}

/// Look up the node's latest completed generation through the index and
/// render the requested output.
async fn resolve_upstream_generation<S: StorageBackend>(
    store: &TaskStore<S>,
    context: &GenerationContext,
    node: &Node,
    output_id: &str,
    attachments: &mut Vec<MessagePart>,
) -> Result<Option<String>, StoreError> {
    let workspace_id = context.origin.workspace_id;
    let Some(entry) = store.get_latest_generation(workspace_id, node.id).await? else {
        return Ok(None);
    };
    let Some(generation) = store.get_generation(workspace_id, entry.generation_id).await? else {
        return Ok(None);
    };
    let Generation::Completed { outputs, .. } = &generation else {
        return Ok(None);
    };
    let Some(output) = select_output(outputs, output_id) else {
        return Ok(None);
    };

    match output {
        GenerationOutput::GeneratedText { text } | GenerationOutput::Reasoning { text } => {
            Ok(Some(text.clone()))
        }
        GenerationOutput::GeneratedImage { blob_path, mime_type } => {
            match store.backend().get_blob(blob_path).await? {
                Some(bytes) => {
                    attachments.push(MessagePart::Binary {
                        mime_type: mime_type.clone(),
                        bytes,
                    });
                    Ok(Some(format!("[attachment: {}]", node.name)))
                }
                None => Ok(None),
            }
        }
        GenerationOutput::Source { value }
        | GenerationOutput::QueryResult { value }
        | GenerationOutput::DataQueryResult { value } => Ok(Some(value_to_string(value))),
    }
}

/// Pick the output matching the placeholder's output id, falling back to the
/// first output for unrecognized ids.
fn select_output<'a>(
    outputs: &'a [GenerationOutput],
    output_id: &str,
) -> Option<&'a GenerationOutput> {
    let wanted = |output: &GenerationOutput| match output_id {
        "text" => matches!(output, GenerationOutput::GeneratedText { .. }),
        "reasoning" => matches!(output, GenerationOutput::Reasoning { .. }),
        "image" => matches!(output, GenerationOutput::GeneratedImage { .. }),
        "source" => matches!(output, GenerationOutput::Source { .. }),
        "result" => matches!(
            output,
            GenerationOutput::QueryResult { .. } | GenerationOutput::DataQueryResult { .. }
        ),
        _ => false,
    };
    outputs.iter().find(|o| wanted(o)).or_else(|| outputs.first())
}

/// Convert a JSON value to a display string for template substitution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects/arrays inline as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Resolve placeholders inside every string value of a JSON tree (action
/// parameters). Attachments referenced from parameters are dropped; only the
/// textual substitution applies.
pub async fn resolve_value_strings<S: StorageBackend>(
    store: &TaskStore<S>,
    context: &GenerationContext,
    value: &Value,
) -> Result<Value, StoreError> {
    Ok(match value {
        Value::String(s) => Value::String(resolve_placeholders(store, context, s).await?.text),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(Box::pin(resolve_value_strings(store, context, item)).await?);
            }
            Value::Array(resolved)
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(
                    key.clone(),
                    Box::pin(resolve_value_strings(store, context, item)).await?,
                );
            }
            Value::Object(resolved)
        }
        other => other.clone(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
