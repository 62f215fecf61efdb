//! Deterministic scripted provider.
//!
//! Stands in for a real model backend in tests and demos: every request
//! resolves to a canned reply derived from the operation node, nodes can be
//! scripted to fail by name, and streaming mode chunks the reply through
//! `TextDelta` events. The echo format (`node-name :: resolved input`) makes
//! placeholder resolution observable from the outside.

use std::collections::HashSet;
use std::pin::Pin;

use futures_util::Stream;

use weft_core::provider::{
    GenerationProvider, GenerationRequest, MessagePart, MessageRole, ProviderError, ProviderEvent,
    ProviderReply, RawUsage,
};
use weft_types::generation::GenerationOutput;
use weft_types::graph::NodeContent;

/// A provider whose replies are a pure function of the request.
pub struct ScriptedProvider {
    streaming: bool,
    chunk_len: usize,
    fail_names: HashSet<String>,
    usage: RawUsage,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            streaming: false,
            chunk_len: 8,
            fail_names: HashSet::new(),
            usage: RawUsage {
                input_tokens: 12.0,
                output_tokens: 4.0,
            },
        }
    }

    /// Stream replies as `TextDelta` chunks of `chunk_len` bytes.
    pub fn streaming(mut self, chunk_len: usize) -> Self {
        self.streaming = true;
        self.chunk_len = chunk_len.max(1);
        self
    }

    /// Fail every request whose operation node carries this name.
    pub fn fail_on(mut self, node_name: impl Into<String>) -> Self {
        self.fail_names.insert(node_name.into());
        self
    }

    /// Override the usage reported with every reply.
    pub fn with_usage(mut self, input_tokens: f64, output_tokens: f64) -> Self {
        self.usage = RawUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    /// Concatenated text of the request's user messages.
    fn user_text(request: &GenerationRequest) -> String {
        request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .flat_map(|m| m.parts.iter())
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Binary { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn reply_for(&self, request: &GenerationRequest) -> Result<ProviderReply, ProviderError> {
        if self.fail_names.contains(&request.node.name) {
            return Err(ProviderError::Provider(format!(
                "scripted failure for '{}'",
                request.node.name
            )));
        }

        let echoed = Self::user_text(request);
        let outputs = match &request.node.content {
            NodeContent::TextGenerator { .. } => vec![GenerationOutput::GeneratedText {
                text: format!("{} :: {}", request.node.name, echoed),
            }],
            NodeContent::ImageGenerator { .. } => vec![GenerationOutput::GeneratedImage {
                blob_path: format!("blobs/scripted/{}.png", request.generation_id),
                mime_type: "image/png".to_string(),
            }],
            NodeContent::Action { action_name, .. } => vec![GenerationOutput::Source {
                value: serde_json::json!({
                    "action": action_name,
                    "tools": request.tools.len(),
                    "authenticated": request.tools.iter().any(|t| t.credential.is_some()),
                }),
            }],
            NodeContent::Query { .. } => vec![GenerationOutput::QueryResult {
                value: serde_json::json!({ "query": echoed, "rows": 1 }),
            }],
            NodeContent::DataQuery { .. } => vec![GenerationOutput::DataQueryResult {
                value: serde_json::json!({ "query": echoed, "rows": 1 }),
            }],
            // The executor resolves these without a provider call; replying
            // empty keeps the scripted provider honest if one arrives.
            NodeContent::Text { .. }
            | NodeContent::File { .. }
            | NodeContent::Trigger { .. }
            | NodeContent::AppEntry { .. }
            | NodeContent::End => vec![],
        };

        Ok(ProviderReply {
            outputs,
            usage: self.usage,
        })
    }
}

impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<ProviderReply, ProviderError> {
        self.reply_for(&request)
    }

    fn stream(
        &self,
        request: GenerationRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send + 'static>> {
        let reply = self.reply_for(&request);
        let chunk_len = self.chunk_len;

        Box::pin(async_stream::stream! {
            match reply {
                Err(error) => yield Err(error),
                Ok(ProviderReply { outputs, usage }) => {
                    for output in outputs {
                        match output {
                            GenerationOutput::GeneratedText { text } => {
                                // Deltas only; the executor reassembles the
                                // final text output from the transcript.
                                let chars: Vec<char> = text.chars().collect();
                                for chunk in chars.chunks(chunk_len) {
                                    yield Ok(ProviderEvent::TextDelta {
                                        text: chunk.iter().collect(),
                                    });
                                }
                            }
                            other => yield Ok(ProviderEvent::Output(other)),
                        }
                    }
                    yield Ok(ProviderEvent::Usage(usage));
                    yield Ok(ProviderEvent::Done);
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
