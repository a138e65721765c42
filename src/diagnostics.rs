//! Diagnostics (C9, §4.9): a size-capped, redaction-bounded JSON record of
//! one node attempt.
//!
//! Token accounting and redaction are pure functions over the event stream
//! the executor already consumed; this module owns neither persistence (the
//! store's `insert_diagnostics` does that) nor the decision of *when* to
//! persist (the executor calls this unconditionally, success or failure,
//! per §4.6 step 10 / §7 "diagnostics always persist, even on failure").

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::model::{DecisionType, RunNodeStatus};
use crate::provider::{ProviderEvent, ProviderEventType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub persisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub tokens_used: u64,
    pub event_count: usize,
    pub retained_event_count: usize,
    pub dropped_event_count: usize,
    pub tool_event_count: usize,
    pub redacted: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    Aborted,
}

/// Size-capped, redaction-bounded JSON record of one node attempt (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNodeDiagnosticsPayload {
    pub schema_version: u32,
    pub workflow_run_id: Uuid,
    pub run_node_id: Uuid,
    pub node_key: String,
    pub attempt: u32,
    pub outcome: Outcome,
    pub status: RunNodeStatus,
    pub provider: Option<String>,
    pub timing: Timing,
    pub summary: Summary,
    pub context_handoff: Option<Value>,
    pub event_type_counts: Value,
    pub events: Vec<Value>,
    pub tool_events: Vec<Value>,
    pub routing_decision: Option<Value>,
    pub failure_route: Option<Value>,
    pub error: Option<Value>,
    pub error_handler: Option<Value>,
}

/// Everything the executor has in hand by the time it is ready to persist a
/// diagnostics payload for one attempt.
pub struct BuildDiagnosticsRequest<'a> {
    pub schema_version: u32,
    pub workflow_run_id: Uuid,
    pub run_node_id: Uuid,
    pub node_key: &'a str,
    pub attempt: u32,
    pub outcome: Outcome,
    pub status: RunNodeStatus,
    pub provider: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub events: &'a [ProviderEvent],
    pub context_handoff: Option<Value>,
    pub routing_decision: Option<DecisionType>,
    pub failure_route: Option<String>,
    pub error: Option<String>,
    pub error_handler: Option<Value>,
    pub max_bytes: usize,
}

fn event_type_str(t: ProviderEventType) -> &'static str {
    match t {
        ProviderEventType::System => "system",
        ProviderEventType::Assistant => "assistant",
        ProviderEventType::Result => "result",
        ProviderEventType::ToolUse => "tool_use",
        ProviderEventType::ToolResult => "tool_result",
        ProviderEventType::Usage => "usage",
    }
}

/// Prefer cumulative usage signals over incremental, top-level over nested
/// (§4.9 "Token accounting"). Returns the delta to apply to the running
/// total: `Some(Cumulative(n))` resets it, `Some(Incremental(n))` adds to
/// it.
enum TokenSignal {
    Cumulative(u64),
    Incremental(u64),
}

fn cumulative_field(obj: &serde_json::Map<String, Value>) -> Option<u64> {
    for key in ["totalTokens", "total_tokens", "tokensUsed", "tokens_used"] {
        if let Some(n) = obj.get(key).and_then(Value::as_u64) {
            return Some(n);
        }
    }
    let input = obj
        .get("inputTokens")
        .or_else(|| obj.get("input_tokens"))
        .and_then(Value::as_u64);
    let output = obj
        .get("outputTokens")
        .or_else(|| obj.get("output_tokens"))
        .and_then(Value::as_u64);
    match (input, output) {
        (Some(i), Some(o)) => Some(i + o),
        (Some(i), None) => Some(i),
        (None, Some(o)) => Some(o),
        (None, None) => None,
    }
}

fn extract_token_signal(metadata: &Value) -> Option<TokenSignal> {
    let obj = metadata.as_object()?;
    if let Some(n) = cumulative_field(obj) {
        return Some(TokenSignal::Cumulative(n));
    }
    if let Some(nested) = obj.get("usage").and_then(Value::as_object) {
        if let Some(n) = cumulative_field(nested) {
            return Some(TokenSignal::Cumulative(n));
        }
        if let Some(n) = nested.get("tokens").and_then(Value::as_u64) {
            return Some(TokenSignal::Incremental(n));
        }
    }
    if let Some(n) = obj.get("tokens").and_then(Value::as_u64) {
        return Some(TokenSignal::Incremental(n));
    }
    None
}

/// Accumulate token usage across a stream's `usage` events (§4.9).
pub fn accumulate_tokens(events: &[ProviderEvent]) -> u64 {
    let mut total: u64 = 0;
    for event in events {
        if event.event_type != ProviderEventType::Usage {
            continue;
        }
        let Some(metadata) = event.metadata.as_ref() else {
            continue;
        };
        match extract_token_signal(metadata) {
            Some(TokenSignal::Cumulative(n)) => total = n,
            Some(TokenSignal::Incremental(n)) => total += n,
            None => {}
        }
    }
    total
}

fn sensitive_key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(password|secret|token|authorization|api[_-]?key|bearer|private[_-]?key)$")
            .expect("static pattern compiles")
    })
}

fn sensitive_value_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(bearer\s+[a-z0-9._~+/=-]{10,}|sk-[a-z0-9]{16,}|-----BEGIN [A-Z ]*PRIVATE KEY-----)",
        )
        .expect("static pattern compiles")
    })
}

const MAX_REDACTION_DEPTH: usize = 12;
const MAX_REDACTION_ARRAY_LEN: usize = 500;

/// Redact sensitive strings and metadata keys from a JSON value (§4.9,
/// testable property 9). Object keys matching the sensitive-key pattern are
/// redacted wholesale; string values matching the sensitive-value pattern
/// are redacted regardless of key. Recursion depth and array length are
/// bounded to keep the pass linear even on adversarial inputs.
pub fn redact(value: &Value) -> (Value, bool) {
    let mut redacted_any = false;
    let out = redact_inner(value, 0, &mut redacted_any);
    (out, redacted_any)
}

fn redact_inner(value: &Value, depth: usize, redacted_any: &mut bool) -> Value {
    if depth >= MAX_REDACTION_DEPTH {
        return Value::String("[DEPTH_LIMIT]".into());
    }
    match value {
        Value::String(s) => {
            if sensitive_value_pattern().is_match(s) {
                *redacted_any = true;
                Value::String("[REDACTED]".into())
            } else {
                Value::String(s.clone())
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(MAX_REDACTION_ARRAY_LEN)
                .map(|v| redact_inner(v, depth + 1, redacted_any))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if sensitive_key_pattern().is_match(k) {
                    *redacted_any = true;
                    out.insert(k.clone(), Value::String("[REDACTED]".into()));
                } else {
                    out.insert(k.clone(), redact_inner(v, depth + 1, redacted_any));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn event_to_redacted_json(event: &ProviderEvent) -> (Value, bool) {
    let raw = serde_json::json!({
        "type": event_type_str(event.event_type),
        "content": event.content,
        "timestamp": event.timestamp,
        "metadata": event.metadata,
    });
    redact(&raw)
}

/// Build a diagnostics payload, applying redaction then the size-shedding
/// policy: over-budget payloads shed events from the tail, then drop the
/// error stack, then mark `truncated=true` (§4.9).
pub fn build(request: BuildDiagnosticsRequest<'_>) -> RunNodeDiagnosticsPayload {
    let mut event_type_counts = serde_json::Map::new();
    let mut tool_events = Vec::new();
    let mut redacted_events = Vec::new();
    let mut any_redacted = false;

    for event in request.events {
        let key = event_type_str(event.event_type).to_string();
        let counter = event_type_counts.entry(key).or_insert(Value::from(0));
        let next = counter.as_i64().unwrap_or(0) + 1;
        *counter = Value::from(next);
    }

    for event in request.events {
        let (redacted, was_redacted) = event_to_redacted_json(event);
        any_redacted |= was_redacted;
        if matches!(
            event.event_type,
            ProviderEventType::ToolUse | ProviderEventType::ToolResult
        ) {
            tool_events.push(redacted.clone());
        }
        redacted_events.push(redacted);
    }

    let tokens_used = accumulate_tokens(request.events);
    let event_count = request.events.len();
    let tool_event_count = tool_events.len();

    let mut payload = RunNodeDiagnosticsPayload {
        schema_version: request.schema_version,
        workflow_run_id: request.workflow_run_id,
        run_node_id: request.run_node_id,
        node_key: request.node_key.to_string(),
        attempt: request.attempt,
        outcome: request.outcome,
        status: request.status,
        provider: request.provider,
        timing: Timing {
            queued_at: request.queued_at,
            started_at: request.started_at,
            completed_at: request.completed_at,
            failed_at: request.failed_at,
            persisted_at: Utc::now(),
        },
        summary: Summary {
            tokens_used,
            event_count,
            retained_event_count: redacted_events.len(),
            dropped_event_count: 0,
            tool_event_count,
            redacted: any_redacted,
            truncated: false,
        },
        context_handoff: request.context_handoff,
        event_type_counts: Value::Object(event_type_counts),
        events: redacted_events,
        tool_events,
        routing_decision: request.routing_decision.map(|d| Value::String(d.as_guard_str().to_string())),
        failure_route: request.failure_route.map(Value::String),
        error: request.error.map(Value::String),
        error_handler: request.error_handler,
    };

    shed_to_budget(&mut payload, request.max_bytes);
    payload
}

/// Shed payload contents until it serializes within `max_bytes`: drop events
/// from the tail first, then the error field, then mark `truncated=true`
/// regardless (§4.9).
fn shed_to_budget(payload: &mut RunNodeDiagnosticsPayload, max_bytes: usize) {
    if serialized_len(payload) <= max_bytes {
        return;
    }
    payload.summary.truncated = true;

    while !payload.events.is_empty() && serialized_len(payload) > max_bytes {
        payload.events.pop();
        payload.summary.dropped_event_count += 1;
        payload.summary.retained_event_count = payload.events.len();
    }

    if serialized_len(payload) > max_bytes && payload.error.is_some() {
        payload.error = Some("[REDACTED: diagnostics payload exceeded size budget]".into());
    }

    if serialized_len(payload) > max_bytes {
        payload.tool_events.clear();
        payload.context_handoff = None;
    }
}

fn serialized_len(payload: &RunNodeDiagnosticsPayload) -> usize {
    serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunNodeStatus;
    use crate::provider::ProviderEvent;
    use serde_json::json;

    #[test]
    fn cumulative_usage_wins_over_incremental() {
        let events = vec![
            ProviderEvent::new(ProviderEventType::Usage, None)
                .with_metadata(json!({"tokens": 5})),
            ProviderEvent::new(ProviderEventType::Usage, None)
                .with_metadata(json!({"totalTokens": 42})),
        ];
        assert_eq!(accumulate_tokens(&events), 42);
    }

    #[test]
    fn incremental_usage_accumulates() {
        let events = vec![
            ProviderEvent::new(ProviderEventType::Usage, None)
                .with_metadata(json!({"tokens": 5})),
            ProviderEvent::new(ProviderEventType::Usage, None)
                .with_metadata(json!({"tokens": 7})),
        ];
        assert_eq!(accumulate_tokens(&events), 12);
    }

    #[test]
    fn redact_strips_bearer_tokens_and_sensitive_keys() {
        let value = json!({
            "authorization": "whatever",
            "note": "Bearer sk-proj-abcdefghijklmnopqrstuvwxyz",
        });
        let (redacted, any) = redact(&value);
        assert!(any);
        assert_eq!(redacted["authorization"], json!("[REDACTED]"));
        assert_eq!(redacted["note"], json!("[REDACTED]"));
    }

    #[test]
    fn redact_leaves_ordinary_values_alone() {
        let value = json!({"decision": "approved", "count": 3});
        let (redacted, any) = redact(&value);
        assert!(!any);
        assert_eq!(redacted, value);
    }

    #[test]
    fn shed_to_budget_drops_events_before_truncating_flag_stays_set() {
        let events: Vec<ProviderEvent> = (0..200)
            .map(|i| {
                ProviderEvent::new(ProviderEventType::Assistant, Some("x".repeat(200)))
                    .with_metadata(json!({"i": i}))
            })
            .collect();
        let payload = build(BuildDiagnosticsRequest {
            schema_version: 1,
            workflow_run_id: Uuid::new_v4(),
            run_node_id: Uuid::new_v4(),
            node_key: "design",
            attempt: 1,
            outcome: Outcome::Completed,
            status: RunNodeStatus::Completed,
            provider: Some("scripted".into()),
            queued_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            failed_at: None,
            events: &events,
            context_handoff: None,
            routing_decision: None,
            failure_route: None,
            error: None,
            error_handler: None,
            max_bytes: 4_000,
        });
        assert!(payload.summary.truncated);
        assert!(payload.summary.dropped_event_count > 0);
        assert!(serialized_len(&payload) <= 4_000 || payload.events.is_empty());
    }
}
