//! Content-generation port.
//!
//! The engine never talks to a concrete model API: it assembles resolved
//! messages and hands them to an injected `GenerationProvider`, which returns
//! typed outputs and usage, or streams incrementally. The core exploits
//! streaming when the provider offers it but does not require it.

use std::pin::Pin;

use futures_util::Stream;
use secrecy::SecretString;
use serde_json::Value;
use uuid::Uuid;

use weft_types::generation::GenerationOutput;
use weft_types::graph::{ModelConfig, Node};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Role of a resolved message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
}

/// One part of a resolved message: inline text or an attached binary.
#[derive(Debug, Clone)]
pub enum MessagePart {
    Text { text: String },
    Binary { mime_type: String, bytes: Vec<u8> },
}

/// A fully resolved message, ready for a provider.
#[derive(Debug, Clone)]
pub struct ResolvedMessage {
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}

impl ResolvedMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Text { text: text.into() }],
        }
    }
}

/// A tool made available to the provider, with its decrypted credential.
pub struct ToolBinding {
    pub action_name: String,
    pub parameters: Value,
    /// Decrypted credential; never serialized, never logged.
    pub credential: Option<SecretString>,
}

impl std::fmt::Debug for ToolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBinding")
            .field("action_name", &self.action_name)
            .field("credential", &self.credential.is_some())
            .finish()
    }
}

/// The assembled request handed to a provider.
#[derive(Debug)]
pub struct GenerationRequest {
    pub generation_id: Uuid,
    /// The operation node being executed.
    pub node: Node,
    pub messages: Vec<ResolvedMessage>,
    pub model: Option<ModelConfig>,
    pub tools: Vec<ToolBinding>,
}

// ---------------------------------------------------------------------------
// Reply types
// ---------------------------------------------------------------------------

/// Usage as reported by a provider, before sanitization.
///
/// Floating point because providers have been observed returning fractional
/// and negative counts; the executor clamps before persisting.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawUsage {
    pub input_tokens: f64,
    pub output_tokens: f64,
}

/// A complete (non-streaming) provider reply.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub outputs: Vec<GenerationOutput>,
    pub usage: RawUsage,
}

/// Events emitted during a streaming provider reply.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A delta of generated text, appended to the live transcript.
    TextDelta { text: String },
    /// A fully-formed typed output.
    Output(GenerationOutput),
    /// Usage information, typically once near the end of the stream.
    Usage(RawUsage),
    /// The stream has completed.
    Done,
}

/// Errors from provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("unsupported operation for this provider: {0}")]
    Unsupported(String),

    #[error("stream error: {0}")]
    Stream(String),
}

// ---------------------------------------------------------------------------
// GenerationProvider port
// ---------------------------------------------------------------------------

/// Trait for content-generation backends.
///
/// Uses native async fn in traits (RPITIT) for `generate`; `stream` returns a
/// boxed stream because streams need to be nameable across await points.
/// Implementations live outside the core (weft-infra ships a scripted one
/// for tests).
pub trait GenerationProvider: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Whether `stream` is meaningful for this provider. When false the
    /// executor calls `generate` and observes cancellation only at the
    /// call boundary.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Run a request to completion and return the full reply.
    fn generate(
        &self,
        request: GenerationRequest,
    ) -> impl std::future::Future<Output = Result<ProviderReply, ProviderError>> + Send;

    /// Run a request as an incremental event stream.
    ///
    /// Only called when `supports_streaming()` is true.
    fn stream(
        &self,
        request: GenerationRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send + 'static>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
