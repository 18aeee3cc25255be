use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;

use crate::{
    dispatcher::Dispatcher,
    error::AiError,
    models::{ConversationEntry, MarketSnapshot, ProviderId},
    registry::ProviderDescriptor,
    telemetry,
};

/** \brief 前端静态文件目录配置项。 */
pub const UI_DIR_KEY: &str = "FINCHAT_UI_DIR";

type ApiError = (StatusCode, Json<serde_json::Value>);

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 AI 接口。
 * \param addr 监听地址，如 "127.0.0.1:3000"
 */
pub async fn run(addr: &str, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let ui_root = std::env::var(UI_DIR_KEY).unwrap_or_else(|_| "web".to_string());
    let static_service =
        get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    let app = router(dispatcher).fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API 路由，不含静态文件。
 */
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/api/ai/chat", post(chat))
        .route("/api/ai/status", get(status))
        .route("/api/ai/provider", post(switch_provider))
        .route("/api/ai/providers", get(list_providers))
        .route("/api/ai/history", get(history).delete(clear_history))
        .route("/api/health", get(health_check))
        .with_state(dispatcher)
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChatRequestBody {
    /** \brief 用户消息 */
    message: String,
    /** \brief 当前图表的行情快照（可选） */
    #[serde(default, alias = "snapshot")]
    stock_data: Option<MarketSnapshot>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChatResponseBody {
    success: bool,
    response: String,
    provider: ProviderId,
    degraded: bool,
    entry_id: u64,
    timestamp: String,
}

#[derive(Deserialize, Debug)]
struct SwitchRequestBody {
    provider: String,
}

#[derive(Deserialize, Debug)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize, Debug)]
struct HistoryResponse {
    success: bool,
    history: Vec<ConversationEntry>,
    count: usize,
}

#[derive(Serialize, Debug)]
struct ProvidersResponse {
    success: bool,
    providers: std::collections::BTreeMap<ProviderId, ProviderDescriptor>,
    current: ProviderId,
}

/**
 * \brief 聊天接口：POST /api/ai/chat
 */
async fn chat(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, ApiError> {
    let outcome = dispatcher
        .analyze(&body.message, body.stock_data.as_ref())
        .await
        .map_err(api_err)?;
    Ok(Json(ChatResponseBody {
        success: true,
        response: outcome.text,
        provider: outcome.provider_id_used,
        degraded: outcome.degraded,
        entry_id: outcome.entry_id,
        timestamp: outcome.timestamp,
    }))
}

/**
 * \brief 当前模型服务状态。
 */
async fn status(State(dispatcher): State<Arc<Dispatcher>>) -> Json<serde_json::Value> {
    let status = dispatcher.current_status();
    Json(json!({ "success": true, "status": status }))
}

/**
 * \brief 切换模型服务。
 */
async fn switch_provider(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<SwitchRequestBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = dispatcher.switch_to(&body.provider).map_err(api_err)?;
    telemetry::log_event(
        "server.ai",
        &format!(
            "switch {} -> {}",
            outcome.old_provider_id, outcome.new_provider_id
        ),
    );
    Ok(Json(json!({ "success": true, "result": outcome })))
}

async fn list_providers(State(dispatcher): State<Arc<Dispatcher>>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        success: true,
        providers: dispatcher.list_providers(),
        current: dispatcher.current_status().provider_id,
    })
}

async fn history(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(q): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let history = dispatcher.history(q.limit);
    Json(HistoryResponse {
        success: true,
        count: history.len(),
        history,
    })
}

async fn clear_history(State(dispatcher): State<Arc<Dispatcher>>) -> Json<serde_json::Value> {
    dispatcher.clear_history();
    Json(json!({ "success": true }))
}

async fn health_check(State(dispatcher): State<Arc<Dispatcher>>) -> Json<serde_json::Value> {
    let status = dispatcher.current_status();
    Json(json!({
        "ok": true,
        "provider": status.provider_id,
        "available": status.available,
        "history": dispatcher.store().len()
    }))
}

fn status_for(err: &AiError) -> StatusCode {
    match err {
        AiError::UnknownProvider(_) | AiError::EmptyUserMessage => StatusCode::BAD_REQUEST,
        AiError::MissingCredential { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_err(err: AiError) -> ApiError {
    telemetry::log_error("server.ai", &format!("{}: {}", err.code(), err));
    (
        status_for(&err),
        Json(json!({
            "success": false,
            "code": err.code(),
            "error": err.to_string()
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&AiError::UnknownProvider("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&AiError::EmptyUserMessage), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&AiError::MissingCredential {
                provider: "openai".to_string(),
                env_key: "OPENAI_API_KEY".to_string()
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&AiError::RemoteCallTimeout(60)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_chat_body_accepts_stock_data() {
        let body: ChatRequestBody = serde_json::from_value(json!({
            "message": "趋势",
            "stockData": {"code": "600000", "data": [{"date": "2024-01-01", "close": 10}]}
        }))
        .expect("parse body");
        let snap = body.stock_data.expect("snapshot");
        assert_eq!(snap.code.as_deref(), Some("600000"));
        assert_eq!(snap.data.len(), 1);
    }
}
