//! # orca-server
//!
//! HTTP transport for the Orca engine. Provides:
//!
//! - `POST /api/chat` for a complete reply in one response
//! - `GET /api/chat/stream` for Server-Sent Events with progress markers
//! - `GET /api/conversations` and `GET /api/conversations/{id}` for transcripts
//! - `GET /health`

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Json, Sse, sse::Event as SseEvent},
    routing::{get, post},
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use orca_config::ServerConfig;
use orca_core::{Message, OrcaError, Result, Role, StreamEvent};
use orca_memory::{Conversation, ConversationStore};
use orca_runtime::{DEFAULT_TITLE, Engine, IdentityBinder};

/// Characters of the first user message kept in a listing title.
const TITLE_CHARS: usize = 30;

/// Shared server state.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub binder: IdentityBinder,
}

/// Chat request body.
#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct ReplyMessage {
    role: Role,
    content: String,
}

/// Chat response body.
#[derive(Serialize)]
struct ChatResponse {
    conversation_id: String,
    message: ReplyMessage,
}

/// Query params for the streaming endpoint.
#[derive(Deserialize)]
struct StreamParams {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
struct ConversationSummary {
    /// Handle to resume with: the bound caller handle, or the session id when unbound.
    id: String,
    agent_conversation_id: String,
    title: String,
    created_at: chrono::DateTime<chrono::Utc>,
    message_count: usize,
}

#[derive(Serialize)]
struct ConversationDetail {
    id: String,
    messages: Vec<Message>,
    created_at: chrono::DateTime<chrono::Utc>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn engine_error(e: OrcaError) -> ApiError {
    let status = match &e {
        OrcaError::Validation(_) | OrcaError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        OrcaError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_backend() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

/// Build the Axum router.
pub fn build_router(engine: Arc<Engine>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        engine,
        binder: IdentityBinder::new(),
    });

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        .route("/api/conversations", get(conversations_handler))
        .route("/api/conversations/{id}", get(conversation_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> std::result::Result<Json<ChatResponse>, ApiError> {
    if req.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message is required"));
    }
    let binding = state
        .binder
        .resolve(&state.engine, req.conversation_id.as_deref())
        .await
        .map_err(engine_error)?;
    debug!(conversation = %binding.external, session = %binding.internal, chars = req.message.len(), "chat request");

    match state.engine.process_in(&binding.internal, &req.message).await {
        Ok(reply) => Ok(Json(ChatResponse {
            conversation_id: binding.external,
            message: ReplyMessage {
                role: Role::Assistant,
                content: reply,
            },
        })),
        Err(e) => {
            warn!(conversation = %binding.external, error = %e, "chat turn failed");
            Err(engine_error(e))
        }
    }
}

/// Translate one engine event into its SSE frame. `Done` has no frame of its
/// own; the closing frame is sent once the event channel closes.
fn sse_frame(event: &StreamEvent) -> Option<SseEvent> {
    match event {
        StreamEvent::Meta {
            conversation_id,
            agent_conversation_id,
        } => Some(SseEvent::default().event("meta").data(
            json!({
                "conversation_id": conversation_id,
                "agent_conversation_id": agent_conversation_id,
            })
            .to_string(),
        )),
        StreamEvent::Thinking { stage, message } => Some(
            SseEvent::default()
                .event("thinking")
                .data(json!({ "stage": stage, "message": message }).to_string()),
        ),
        StreamEvent::Content { delta } => Some(SseEvent::default().data(Value::from(delta.as_str()).to_string())),
        StreamEvent::Error { message } => Some(
            SseEvent::default()
                .event("error")
                .data(json!({ "message": message }).to_string()),
        ),
        StreamEvent::Done => None,
    }
}

/// SSE streaming chat handler.
///
/// The turn runs in its own task; this handler only relays its events. When
/// the client goes away the relay is dropped, which cancels the turn.
async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>, ApiError>
{
    if params.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message is required"));
    }
    let binding = state
        .binder
        .resolve(&state.engine, params.conversation_id.as_deref())
        .await
        .map_err(engine_error)?;
    info!(conversation = %binding.external, session = %binding.internal, "stream request");

    let (tx, mut rx) = mpsc::channel(state.engine.config().stream_buffer.max(1));
    let engine = Arc::clone(&state.engine);
    let message = params.message;
    tokio::spawn(async move {
        let _ = engine
            .process_stream_in(&binding.external, &binding.internal, &message, tx)
            .await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            if let Some(frame) = sse_frame(&event) {
                yield Ok(frame);
            }
        }
        yield Ok(SseEvent::default().event("done").data("done"));
    };

    Ok(Sse::new(stream))
}

/// Title shown in listings: the first user message, shortened.
fn title_for(conversation: &Conversation) -> String {
    conversation
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| {
            if m.content.chars().count() > TITLE_CHARS {
                let head: String = m.content.chars().take(TITLE_CHARS).collect();
                format!("{head}...")
            } else {
                m.content.clone()
            }
        })
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

async fn conversations_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> std::result::Result<Json<Value>, ApiError> {
    let conversations = state
        .engine
        .memory()
        .list_conversations(params.limit)
        .await
        .map_err(engine_error)?;
    let handles = state.binder.handles_by_session().await;
    let summaries: Vec<ConversationSummary> = conversations
        .iter()
        .map(|c| ConversationSummary {
            id: handles.get(&c.id).cloned().unwrap_or_else(|| c.id.clone()),
            agent_conversation_id: c.id.clone(),
            title: title_for(c),
            created_at: c.created_at,
            message_count: c.messages.len(),
        })
        .collect();
    Ok(Json(json!({
        "total": summaries.len(),
        "conversations": summaries,
    })))
}

/// Accepts either a caller-facing handle or an internal session id.
async fn conversation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<ConversationDetail>, ApiError> {
    let session_id = state.binder.lookup(&id).await.unwrap_or(id);
    match state.engine.memory().get_conversation(&session_id).await {
        Ok(conversation) => Ok(Json(ConversationDetail {
            id: conversation.id,
            messages: conversation.messages,
            created_at: conversation.created_at,
        })),
        Err(e) if e.is_not_found() => Err(api_error(StatusCode::NOT_FOUND, "conversation not found")),
        Err(e) => Err(engine_error(e)),
    }
}

/// Start the HTTP server and serve until the process exits.
pub async fn start_server(engine: Arc<Engine>, config: &ServerConfig) -> Result<()> {
    let router = build_router(engine, config);

    info!(listen = %config.listen, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|e| OrcaError::Config(format!("failed to bind {}: {}", config.listen, e)))?;

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(messages: Vec<Message>) -> Conversation {
        let mut c = Conversation::new("c1", "ignored");
        c.messages = messages;
        c
    }

    #[test]
    fn test_title_from_first_user_message() {
        let c = conversation(vec![Message::system("note"), Message::user("hello"), Message::user("later")]);
        assert_eq!(title_for(&c), "hello");
    }

    #[test]
    fn test_title_truncates_by_characters() {
        let long = "ä".repeat(40);
        let c = conversation(vec![Message::user(long)]);
        assert_eq!(title_for(&c), format!("{}...", "ä".repeat(30)));
    }

    #[test]
    fn test_title_defaults() {
        assert_eq!(title_for(&conversation(vec![])), DEFAULT_TITLE);
    }

    #[test]
    fn test_content_frames_are_json_escaped() {
        let frame = sse_frame(&StreamEvent::Content {
            delta: "line\n\"quoted\"".into(),
        });
        assert!(frame.is_some());
        assert!(sse_frame(&StreamEvent::Done).is_none());
    }
}
