//! Context handoff (C8, §4.8).
//!
//! Assembles the audit-tagged envelope of upstream report artifacts (and,
//! analogously, retry-failure summaries and failure-route context) that gets
//! appended to a node's prompt before it is handed to a provider. Grounded on
//! the teacher's `io/context.rs` (`ContextPayload`/`write_context`):
//! generalized from three fixed Markdown files on disk to an arbitrary number
//! of typed, hashed, truncation-tracked envelopes appended in-memory to a
//! prompt string, since this crate has no filesystem concept of "the current
//! iteration" — everything a step needs is reloaded from the store (§5).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::{ArtifactType, ContentType, PhaseArtifact, RouteOn, RunNode, RunNodeStatus};
use crate::store::Store;

fn content_type_str(c: ContentType) -> &'static str {
    match c {
        ContentType::Text => "text",
        ContentType::Markdown => "markdown",
        ContentType::Json => "json",
        ContentType::Diff => "diff",
    }
}

#[derive(Debug, Clone)]
struct Truncation {
    applied: bool,
    method: &'static str,
    original_chars: usize,
    included_chars: usize,
    dropped_chars: usize,
}

/// Head-tail truncation at a budgeted character count (§4.8). Splits the
/// budget evenly between head and tail; content that already fits is
/// returned unmodified.
fn truncate_head_tail(content: &str, limit: usize) -> (String, Truncation) {
    let original_chars = content.chars().count();
    if original_chars <= limit || limit == 0 {
        return (
            content.to_string(),
            Truncation {
                applied: false,
                method: "none",
                original_chars,
                included_chars: original_chars,
                dropped_chars: 0,
            },
        );
    }
    let head_len = limit / 2;
    let tail_len = limit - head_len;
    let chars: Vec<char> = content.chars().collect();
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    let marker = "\n...[truncated]...\n";
    let included = head.chars().count() + tail.chars().count();
    (
        format!("{head}{marker}{tail}"),
        Truncation {
            applied: true,
            method: "head_tail",
            original_chars,
            included_chars: included,
            dropped_chars: original_chars - included,
        },
    )
}

fn sha256_hex(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// One envelope's worth of inputs, independent of whether the artifact is an
/// upstream report, a retry-failure summary, or failure-route context.
struct EnvelopeInput<'a> {
    tag: &'a str,
    policy_version: u32,
    workflow_run_id: Uuid,
    target_node_key: &'a str,
    source_node_key: &'a str,
    source_run_node_id: Uuid,
    source_attempt: u32,
    artifact: &'a PhaseArtifact,
}

fn render_envelope(input: EnvelopeInput<'_>, truncation_limit: usize) -> String {
    let (body, truncation) = truncate_head_tail(&input.artifact.content, truncation_limit);
    let sha256 = sha256_hex(&input.artifact.content);
    let artifact_type = match input.artifact.artifact_type {
        ArtifactType::Report => "report",
        ArtifactType::Log => "log",
        ArtifactType::Note => "note",
    };
    format!(
        "{tag} v1\n\
         policy_version: {policy_version}\n\
         untrusted_data: true\n\
         workflow_run_id: {workflow_run_id}\n\
         target_node_key: {target_node_key}\n\
         source_node_key: {source_node_key}\n\
         source_run_node_id: {source_run_node_id}\n\
         source_attempt: {source_attempt}\n\
         artifact_id: {artifact_id}\n\
         artifact_type: {artifact_type}\n\
         content_type: {content_type}\n\
         created_at: {created_at}\n\
         sha256: {sha256}\n\
         truncation:\n\
         \u{20}\u{20}applied: {applied}\n\
         \u{20}\u{20}method: {method}\n\
         \u{20}\u{20}original_chars: {original_chars}\n\
         \u{20}\u{20}included_chars: {included_chars}\n\
         \u{20}\u{20}dropped_chars: {dropped_chars}\n\
         content:\n\
         <<<BEGIN>>>\n\
         {body}\n\
         <<<END>>>\n",
        tag = input.tag,
        policy_version = input.policy_version,
        workflow_run_id = input.workflow_run_id,
        target_node_key = input.target_node_key,
        source_node_key = input.source_node_key,
        source_run_node_id = input.source_run_node_id,
        source_attempt = input.source_attempt,
        artifact_id = input.artifact.id,
        artifact_type = artifact_type,
        content_type = content_type_str(input.artifact.content_type),
        created_at = format_rfc3339(input.artifact.created_at),
        sha256 = sha256,
        applied = truncation.applied,
        method = truncation.method,
        original_chars = truncation.original_chars,
        included_chars = truncation.included_chars,
        dropped_chars = truncation.dropped_chars,
        body = body,
    )
}

fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Upstream source node ids for `node`, resolved to their *latest attempt*
/// (edges are materialized against the run-node row that existed at run
/// creation or fan-out time; a source may since have been retried into a
/// new attempt row under the same `node_key`).
async fn latest_upstream_sources(
    store: &dyn Store,
    node: &RunNode,
) -> EngineResult<Vec<RunNode>> {
    let edges = store.run_node_edges(node.workflow_run_id).await?;
    let latest = store.latest_run_nodes(node.workflow_run_id).await?;
    let latest_by_key: std::collections::HashMap<&str, &RunNode> =
        latest.iter().map(|n| (n.node_key.as_str(), n)).collect();

    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for edge in &edges {
        if edge.target_run_node_id != node.id {
            continue;
        }
        let source = store.get_run_node(edge.source_run_node_id).await?;
        if let Some(latest_source) = latest_by_key.get(source.node_key.as_str()) {
            if seen.insert(latest_source.id) {
                sources.push((**latest_source).clone());
            }
        }
    }
    sources.sort_by(|a, b| (a.sequence_index, &a.node_key, a.id).cmp(&(b.sequence_index, &b.node_key, b.id)));
    Ok(sources)
}

/// Build the upstream-artifact envelope block for `node`'s next prompt
/// (§4.8): one envelope per upstream source's latest `report` artifact, in
/// `(sequenceIndex, nodeKey, runNodeId)` order, concatenated.
pub async fn build_upstream_envelope(
    store: &dyn Store,
    node: &RunNode,
    policy_version: u32,
    truncation_limit: usize,
) -> EngineResult<String> {
    let sources = latest_upstream_sources(store, node).await?;
    let mut out = String::new();
    for source in &sources {
        let Some(artifact) = store.latest_artifact(source.id, ArtifactType::Report).await? else {
            continue;
        };
        out.push_str(&render_envelope(
            EnvelopeInput {
                tag: "ALPHRED_UPSTREAM_ARTIFACT",
                policy_version,
                workflow_run_id: node.workflow_run_id,
                target_node_key: &node.node_key,
                source_node_key: &source.node_key,
                source_run_node_id: source.id,
                source_attempt: source.attempt,
                artifact: &artifact,
            },
            truncation_limit,
        ));
        out.push('\n');
    }
    Ok(out)
}

/// Build a retry-failure-summary envelope for the next attempt of a failed
/// node (§4.6 retry policy, §4.8 "analogous envelopes").
pub fn build_retry_failure_envelope(
    node: &RunNode,
    summary_artifact: &PhaseArtifact,
    policy_version: u32,
    truncation_limit: usize,
) -> String {
    render_envelope(
        EnvelopeInput {
            tag: "ALPHRED_RETRY_FAILURE_SUMMARY",
            policy_version,
            workflow_run_id: node.workflow_run_id,
            target_node_key: &node.node_key,
            source_node_key: &node.node_key,
            source_run_node_id: node.id,
            source_attempt: node.attempt,
            artifact: summary_artifact,
        },
        truncation_limit,
    )
}

/// Build a failure-route-context envelope describing a failed node whose
/// `failure` edge routed to `node` (§4.5, §4.8).
pub fn build_failure_route_envelope(
    node: &RunNode,
    failed_source: &RunNode,
    log_artifact: &PhaseArtifact,
    policy_version: u32,
    truncation_limit: usize,
) -> String {
    render_envelope(
        EnvelopeInput {
            tag: "ALPHRED_FAILURE_ROUTE_CONTEXT",
            policy_version,
            workflow_run_id: node.workflow_run_id,
            target_node_key: &node.node_key,
            source_node_key: &failed_source.node_key,
            source_run_node_id: failed_source.id,
            source_attempt: failed_source.attempt,
            artifact: log_artifact,
        },
        truncation_limit,
    )
}

/// Build the full context handoff a claimed node's prompt gets (§4.6, §4.8):
/// upstream report artifacts, plus — if applicable — this attempt's own
/// retry-failure summary and any upstream failure that routed here over a
/// `failure` edge. The upstream envelope always runs first so the newest,
/// most relevant context reads last in the composed prompt.
pub async fn build_context_envelope(
    store: &dyn Store,
    node: &RunNode,
    policy_version: u32,
    truncation_limit: usize,
) -> EngineResult<String> {
    let mut out = build_upstream_envelope(store, node, policy_version, truncation_limit).await?;

    if let Some(summary) = store.latest_artifact(node.id, ArtifactType::Note).await? {
        let is_retry_summary = summary
            .metadata
            .as_ref()
            .and_then(|m| m.get("kind"))
            .and_then(|v| v.as_str())
            == Some("retry_failure_summary");
        if is_retry_summary {
            out.push_str(&build_retry_failure_envelope(
                node,
                &summary,
                policy_version,
                truncation_limit,
            ));
            out.push('\n');
        }
    }

    let edges = store.run_node_edges(node.workflow_run_id).await?;
    let latest = store.latest_run_nodes(node.workflow_run_id).await?;
    let latest_by_key: HashMap<&str, &RunNode> = latest.iter().map(|n| (n.node_key.as_str(), n)).collect();
    for edge in &edges {
        if edge.target_run_node_id != node.id || edge.route_on != RouteOn::Failure {
            continue;
        }
        let source = store.get_run_node(edge.source_run_node_id).await?;
        let Some(latest_source) = latest_by_key.get(source.node_key.as_str()) else {
            continue;
        };
        if latest_source.status != RunNodeStatus::Failed {
            continue;
        }
        let Some(log) = store.latest_artifact(latest_source.id, ArtifactType::Log).await? else {
            continue;
        };
        out.push_str(&build_failure_route_envelope(
            node,
            *latest_source,
            &log,
            policy_version,
            truncation_limit,
        ));
        out.push('\n');
    }

    Ok(out)
}
