//! HTTP 层
//!
//! 身份来自 x-user-id 请求头（部署上由前置网关鉴权后注入），除 404
//! 意外每个端点第一件事就是确定 caller_id。聊天端点有原子与流式两种，
//! 共享同一个编排器；同一会话用 per-conversation 锁串行化并发轮次。

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Response, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::error;

use crate::core::{AgentError, Orchestrator, ToolCallSummary, TurnEvent, TurnRequest};
use crate::store::{ConversationStore, Message};

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub conversations: Arc<ConversationStore>,
    turn_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, conversations: Arc<ConversationStore>) -> Self {
        Self {
            orchestrator,
            conversations,
            turn_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// 同一会话内的轮次必须串行（seq 分配与上下文重建都假设这一点）
    async fn turn_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 轮次结束后摘除无人持有的锁条目，防止映射随历史会话无限增长
    async fn release_turn_lock(&self, conversation_id: &str) {
        let mut locks = self.turn_locks.lock().await;
        if let Some(entry) = locks.get(conversation_id) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(conversation_id);
            }
        }
    }
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub response: String,
    pub tool_calls: Vec<ToolCallSummary>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/api/chat/stream", post(api_chat_stream))
        .route("/api/chat/conversations", get(api_list_conversations))
        .route(
            "/api/chat/conversations/:id/messages",
            get(api_list_messages),
        )
        .route("/api/chat/conversations/:id", delete(api_delete_conversation))
        .with_state(state)
}

fn caller_id(headers: &HeaderMap) -> Result<String, (StatusCode, String)> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "missing x-user-id header".to_string(),
        ))
}

fn map_error(e: AgentError) -> (StatusCode, String) {
    let status = match &e {
        AgentError::NotFound(_) => StatusCode::NOT_FOUND,
        AgentError::Unauthorized(_) => StatusCode::FORBIDDEN,
        AgentError::UpstreamFatal(_) => StatusCode::BAD_GATEWAY,
        AgentError::UpstreamTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
        AgentError::Storage(_) | AgentError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// POST /api/chat：原子路径，轮次跑完一次性返回
async fn api_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    let user_id = caller_id(&headers)?;
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message must not be empty".into()));
    }

    let lock_id = req.conversation_id.clone();
    let guard = match &lock_id {
        Some(id) => Some(state.turn_lock(id).await.lock_owned().await),
        None => None,
    };

    let result = state
        .orchestrator
        .run_turn(
            TurnRequest {
                user_id,
                conversation_id: req.conversation_id,
                message: req.message,
            },
            None,
        )
        .await;

    drop(guard);
    if let Some(id) = &lock_id {
        state.release_turn_lock(id).await;
    }
    let outcome = result.map_err(map_error)?;

    Ok(Json(ChatResponse {
        conversation_id: outcome.conversation_id,
        response: outcome.response,
        tool_calls: outcome.tool_calls,
    }))
}

/// POST /api/chat/stream：ndjson 流式路径，一行一个 TurnEvent
async fn api_chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response<Body>, (StatusCode, String)> {
    let user_id = caller_id(&headers)?;
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message must not be empty".into()));
    }

    // 既有会话的属主/存在性在流开始前校验，错误还能走 HTTP 状态码
    if let Some(id) = &req.conversation_id {
        let conv = state
            .conversations
            .get_conversation(id)
            .map_err(map_error)?
            .ok_or_else(|| map_error(AgentError::NotFound(format!("conversation {id}"))))?;
        if conv.user_id != user_id {
            return Err(map_error(AgentError::Unauthorized(format!(
                "conversation {id} belongs to another user"
            ))));
        }
    }

    let lock_id = req.conversation_id.clone();
    let guard = match &lock_id {
        Some(id) => Some(state.turn_lock(id).await.lock_owned().await),
        None => None,
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel::<TurnEvent>();
    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let result = task_state
            .orchestrator
            .run_turn(
                TurnRequest {
                    user_id,
                    conversation_id: req.conversation_id,
                    message: req.message,
                },
                Some(&event_tx),
            )
            .await;
        drop(guard);
        if let Some(id) = &lock_id {
            task_state.release_turn_lock(id).await;
        }
        if let Err(e) = result {
            error!(error = %e, "Streaming turn failed");
        }
    });

    let stream = stream::unfold(event_rx, |mut event_rx| async move {
        match event_rx.recv().await {
            Some(ev) => {
                let line = format!("{}\n", serde_json::to_string(&ev).unwrap_or_default());
                Some((Ok::<_, std::convert::Infallible>(Bytes::from(line)), event_rx))
            }
            None => None,
        }
    });

    let mut res = Response::new(Body::from_stream(stream));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/x-ndjson; charset=utf-8".parse().unwrap(),
    );
    Ok(res)
}

/// GET /api/chat/conversations：当前用户的会话，最近更新在前
async fn api_list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let user_id = caller_id(&headers)?;
    let conversations = state
        .conversations
        .list_conversations(&user_id)
        .map_err(map_error)?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

/// 属主检查：先判存在（404），再判属主（403）
fn check_owner(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<(), (StatusCode, String)> {
    let conv = state
        .conversations
        .get_conversation(conversation_id)
        .map_err(map_error)?
        .ok_or_else(|| {
            map_error(AgentError::NotFound(format!(
                "conversation {conversation_id}"
            )))
        })?;
    if conv.user_id != user_id {
        return Err(map_error(AgentError::Unauthorized(format!(
            "conversation {conversation_id} belongs to another user"
        ))));
    }
    Ok(())
}

/// GET /api/chat/conversations/{id}/messages
async fn api_list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, (StatusCode, String)> {
    let user_id = caller_id(&headers)?;
    check_owner(&state, &user_id, &id)?;
    let messages = state
        .conversations
        .load_messages(&id, None)
        .map_err(map_error)?;
    Ok(Json(messages))
}

/// DELETE /api/chat/conversations/{id}
async fn api_delete_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let user_id = caller_id(&headers)?;
    check_owner(&state, &user_id, &id)?;
    state.conversations.delete_conversation(&id).map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContextBuilder, RetryGovernor};
    use crate::llm::{ModelClient, ScriptedModelClient};
    use crate::tools::{ToolExecutor, ToolRegistry};
    use std::time::Duration;

    fn app_state() -> AppState {
        let conversations = Arc::new(ConversationStore::open_in_memory().unwrap());
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(ToolRegistry::new()),
            Duration::from_secs(1),
        ));
        let model = Arc::new(ScriptedModelClient::new(vec![]));
        let orchestrator = Arc::new(Orchestrator::new(
            conversations.clone(),
            executor,
            model as Arc<dyn ModelClient>,
            RetryGovernor::new(1, Duration::from_millis(1), false),
            ContextBuilder::new("sys", 20),
            5,
            Duration::from_secs(5),
        ));
        AppState::new(orchestrator, conversations)
    }

    #[tokio::test]
    async fn turn_lock_entry_is_pruned_after_the_turn() {
        let state = app_state();
        let guard = state.turn_lock("c1").await.lock_owned().await;
        assert_eq!(state.turn_locks.lock().await.len(), 1);

        drop(guard);
        state.release_turn_lock("c1").await;
        assert!(state.turn_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn turn_lock_entry_survives_while_another_holder_exists() {
        let state = app_state();
        let guard = state.turn_lock("c1").await.lock_owned().await;

        // 并发请求仍持有该条目时不得摘除
        state.release_turn_lock("c1").await;
        assert_eq!(state.turn_locks.lock().await.len(), 1);

        drop(guard);
        state.release_turn_lock("c1").await;
        assert!(state.turn_locks.lock().await.is_empty());
    }
}
