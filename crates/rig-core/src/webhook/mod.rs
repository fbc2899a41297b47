//! `WebhookIngress` (§4.5): the HTTP boundary that turns a signed GitHub
//! webhook delivery into an `onExecute(issue)` dispatch.
//!
//! The router itself lives here, not in a CLI crate (§4.5: "only the
//! surrounding CLI command surface and the dashboard/SSE layer are out of
//! scope"), following the same `axum` + graceful-shutdown shape this
//! lineage uses for its own HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State as AxumState;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::TriggerRule;
use crate::model::Issue;
use crate::store::StateStore;

type HmacSha256 = Hmac<Sha256>;

/// Request body cap (§4.5, §6): larger bodies are rejected before the
/// handler even sees them.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Graceful-shutdown drain deadline (§5: "graceful with a 10s deadline").
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Dispatch callback invoked once a webhook delivery clears signature
/// verification, event/trigger filtering, and duplicate suppression
/// (§4.5 step 5). Boxed so the router can hold it as shared state.
#[async_trait::async_trait]
pub trait ExecuteDispatcher: Send + Sync {
    async fn dispatch(&self, issue: Issue) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<F, Fut> ExecuteDispatcher for F
where
    F: Fn(Issue) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn dispatch(&self, issue: Issue) -> anyhow::Result<()> {
        self(issue).await
    }
}

struct IngressState {
    webhook_secret: String,
    triggers: Vec<TriggerRule>,
    store: StateStore,
    dispatcher: Arc<dyn ExecuteDispatcher>,
}

/// Build the `POST /webhook` router (§4.5, §6).
pub fn router(
    webhook_secret: String,
    triggers: Vec<TriggerRule>,
    store: StateStore,
    dispatcher: Arc<dyn ExecuteDispatcher>,
) -> Router {
    let state = Arc::new(IngressState {
        webhook_secret,
        triggers,
        store,
        dispatcher,
    });
    Router::new()
        .route("/webhook", post(handle_webhook))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve `router` on `addr` until `shutdown` is cancelled, then wait up to
/// 10s for in-flight requests to drain (§5: "graceful... with a 10s
/// deadline; in-flight dispatched tasks are not cancelled by server
/// shutdown"). `axum`'s own graceful shutdown has no drain deadline of its
/// own, so the deadline is enforced here: once `shutdown` fires, the drain
/// races against a 10s timer and the function returns (forcing the
/// listener closed) if the timer wins.
pub async fn serve(router: Router, addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let shutdown_signal = shutdown.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown_signal.cancelled().await });

    tokio::select! {
        result = server => result?,
        _ = deadline_after(shutdown) => {
            tracing::warn!("graceful shutdown deadline elapsed, forcing exit");
        }
    }
    Ok(())
}

/// Resolves `SHUTDOWN_DEADLINE` after `shutdown` fires; never resolves
/// before it does.
async fn deadline_after(shutdown: CancellationToken) {
    shutdown.cancelled().await;
    tokio::time::sleep(SHUTDOWN_DEADLINE).await;
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: u64,
    title: String,
    #[serde(default)]
    labels: Vec<IssueLabel>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct IssueLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    issue: Option<IssuePayload>,
    #[serde(default)]
    comment: Option<CommentPayload>,
    repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

async fn handle_webhook(
    AxumState(state): AxumState<Arc<IngressState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    if let Err((status, message)) = verify_signature(&state.webhook_secret, &headers, &body) {
        return (status, message);
    }

    let Some(event) = headers.get("X-GitHub-Event").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing X-GitHub-Event header".to_string());
    };
    let event = event.to_string();

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("unparseable body: {e}")),
    };

    let Some((issue, labels, keyword_text)) = tracked_issue(&event, &payload) else {
        return (StatusCode::OK, format!("event {event} untracked, skipped"));
    };

    let full_event = format!("{event}.{}", payload.action);
    if !trigger_matches(&state.triggers, &full_event, &labels, &keyword_text) {
        return (StatusCode::OK, format!("event {full_event} matched no trigger, skipped"));
    }

    let dedup_state = match state.store.load().await {
        Ok(s) => s,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("state load failed: {e}")),
    };
    if dedup_state.is_in_flight(&issue.id) {
        return (StatusCode::OK, format!("issue {} already in flight, deduped", issue.id));
    }

    match state.dispatcher.dispatch(issue).await {
        Ok(()) => (StatusCode::ACCEPTED, "dispatched".to_string()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("dispatch failed: {e}")),
    }
}

/// Pull an `Issue` plus its matching text out of a payload, for the
/// event/action combinations the engine tracks (§4.5 step 2):
/// `issues.opened`, `issues.labeled`, `issue_comment.created`.
fn tracked_issue(event: &str, payload: &WebhookPayload) -> Option<(Issue, Vec<String>, String)> {
    let tracked = matches!(
        (event, payload.action.as_str()),
        ("issues", "opened") | ("issues", "labeled") | ("issue_comment", "created")
    );
    if !tracked {
        return None;
    }
    let issue_payload = payload.issue.as_ref()?;
    let labels: Vec<String> = issue_payload.labels.iter().map(|l| l.name.clone()).collect();
    let keyword_text = match event {
        "issue_comment" => payload.comment.as_ref().map(|c| c.body.clone()).unwrap_or_default(),
        _ => issue_payload.title.clone(),
    };
    let issue = Issue {
        platform: "github".to_string(),
        repo: payload.repository.full_name.clone(),
        id: issue_payload.number.to_string(),
        title: issue_payload.title.clone(),
        url: issue_payload.html_url.clone(),
        labels: labels.clone(),
        body: issue_payload.body.clone(),
    };
    Some((issue, labels, keyword_text))
}

/// §4.5 step 3: an empty trigger list accepts all tracked events; a
/// non-empty one requires some trigger whose `event` matches and whose
/// optional `labels`/`keyword` predicates (if present) also match.
fn trigger_matches(triggers: &[TriggerRule], event: &str, labels: &[String], keyword_text: &str) -> bool {
    if triggers.is_empty() {
        return true;
    }
    triggers.iter().any(|t| {
        t.event == event
            && t.labels
                .as_ref()
                .is_none_or(|wanted| wanted.iter().any(|w| labels.iter().any(|l| l.eq_ignore_ascii_case(w))))
            && t.keyword
                .as_ref()
                .is_none_or(|kw| keyword_text.to_lowercase().contains(&kw.to_lowercase()))
    })
}

fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), (StatusCode, String)> {
    if secret.is_empty() {
        return Err((StatusCode::UNAUTHORIZED, "webhook secret not configured".to_string()));
    }
    let Some(header) = headers.get("X-Hub-Signature-256").and_then(|v| v.to_str().ok()) else {
        return Err((StatusCode::UNAUTHORIZED, "missing signature header".to_string()));
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return Err((StatusCode::UNAUTHORIZED, "malformed signature header".to_string()));
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return Err((StatusCode::UNAUTHORIZED, "malformed signature hex".to_string()));
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return Err((StatusCode::UNAUTHORIZED, "invalid secret".to_string()));
    };
    mac.update(body);
    if mac.verify_slice(&expected).is_err() {
        return Err((StatusCode::UNAUTHORIZED, "signature mismatch".to_string()));
    }
    Ok(())
}
