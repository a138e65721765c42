//! Provider adapter surface (§6, §4.6).
//!
//! `Provider` mirrors the teacher's `agents::executor` seam for invoking an
//! external agent binary, generalized from a single hardcoded CLI to a named
//! registry so the executor can `resolveProvider(node.provider)`. Real
//! adapters (codex/claude CLI bootstrap, auth, binary discovery) are external
//! collaborators per spec §1; this crate only defines the trait and ships
//! test doubles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Per-step options passed through to [`Provider::run`].
///
/// `cancellation` carries the signal described in §5: derived from an
/// explicit lifecycle cancel/pause (see [`crate::lifecycle`]) or a per-step
/// timeout, consulted once per provider event by the executor's stream
/// consumer. It cannot be serialized (a token is a live handle, not data),
/// so it is excluded from the wire-stable option shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunOptions {
    pub working_directory: Option<String>,
    pub timeout_secs: Option<u64>,
    pub extra: Option<serde_json::Value>,
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderEventType {
    System,
    Assistant,
    Result,
    ToolUse,
    ToolResult,
    Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    #[serde(rename = "type")]
    pub event_type: ProviderEventType,
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl ProviderEvent {
    pub fn new(event_type: ProviderEventType, content: Option<String>) -> Self {
        Self {
            event_type,
            content,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("run failed: {0}")]
    RunFailed(String),
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::InvalidOptions(m) => EngineError::ProviderInvalidOptions(m),
            ProviderError::RunFailed(m) => EngineError::ProviderRunFailed(m),
        }
    }
}

/// A capability interface over an LLM-agent CLI/SDK. Implementations return a
/// lazy, finite stream of normalized events; consumption order is preserved
/// end-to-end into diagnostics (§5).
#[async_trait]
pub trait Provider: Send + Sync {
    async fn run(
        &self,
        prompt: String,
        options: RunOptions,
    ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError>;
}

/// Resolve a named provider against a small in-process registry. Real
/// deployments register `codex`/`claude` adapters at startup; this crate
/// ships only test doubles (below).
pub fn resolve_provider<'a>(
    registry: &'a [(&'a str, &'a dyn Provider)],
    name: &str,
) -> Result<&'a dyn Provider, EngineError> {
    registry
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, provider)| *provider)
        .ok_or_else(|| EngineError::UnknownAgentProvider(name.to_string()))
}

/// A provider that replays a fixed sequence of events, used by integration
/// tests to drive the executor through scripted scenarios (S1-S6).
pub struct ScriptedProvider {
    events: Vec<ProviderEvent>,
}

impl ScriptedProvider {
    pub fn new(events: Vec<ProviderEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn run(
        &self,
        _prompt: String,
        _options: RunOptions,
    ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
        let events = self.events.clone();
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// A provider that always fails immediately, useful for exercising
/// `ProviderRunFailed` paths without constructing a stream.
pub struct NullProvider {
    pub message: String,
}

#[async_trait]
impl Provider for NullProvider {
    async fn run(
        &self,
        _prompt: String,
        _options: RunOptions,
    ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
        Err(ProviderError::RunFailed(self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_provider_replays_events_in_order() {
        let provider = ScriptedProvider::new(vec![
            ProviderEvent::new(ProviderEventType::System, None),
            ProviderEvent::new(ProviderEventType::Result, Some("done".into())),
        ]);
        let mut stream = provider.run("p".into(), RunOptions::default()).await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.event_type, ProviderEventType::System);
        let second = stream.next().await.unwrap();
        assert_eq!(second.content.as_deref(), Some("done"));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn unknown_provider_name_is_a_typed_error() {
        let registry: Vec<(&str, &dyn Provider)> = vec![];
        let err = resolve_provider(&registry, "codex").unwrap_err();
        assert!(matches!(err, EngineError::UnknownAgentProvider(name) if name == "codex"));
    }
}
