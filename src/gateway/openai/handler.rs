use super::dispatch::RequestDispatcher;
use super::types::{ChatRequest, ModelItem, ModelsResponse};
use crate::config::Config;
use crate::error::AppError;
use crate::logging;
use crate::util::id;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// `/v1` 路由共享的状态。
#[derive(Debug)]
pub struct ApiState {
    pub cfg: Config,
    pub dispatcher: RequestDispatcher,
}

pub async fn handle_list_models(State(state): State<Arc<ApiState>>) -> Json<ModelsResponse> {
    let created = Utc::now().timestamp();
    let data = state
        .dispatcher
        .catalog()
        .active_models()
        .into_iter()
        .map(|m| ModelItem {
            id: m.model_id,
            object: "model".to_string(),
            created,
            owned_by: state.cfg.model_owner.clone(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

pub async fn handle_chat_completions(
    State(state): State<Arc<ApiState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let req: ChatRequest = match serde_json::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("请求体解析失败：{e}");
            return finish_error(
                log_level.client_enabled(),
                start,
                AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。"),
            );
        }
    };
    if req.model.trim().is_empty() {
        return finish_error(
            log_level.client_enabled(),
            start,
            AppError::bad_request("缺少 model 字段"),
        );
    }

    match state
        .dispatcher
        .chat_completion(req, id::request_id(), start)
        .await
    {
        Ok(resp) => {
            if log_level.client_enabled() {
                tracing::info!(
                    status = resp.status().as_u16(),
                    elapsed_ms = logging::format_duration_ms(start.elapsed()),
                    "客户端响应已发出"
                );
            }
            resp
        }
        Err(e) => finish_error(log_level.client_enabled(), start, e),
    }
}

fn finish_error(client_log: bool, start: Instant, err: AppError) -> Response {
    if client_log {
        let body = serde_json::json!({ "error": { "message": err.to_string() } });
        logging::client_response(
            err.status().as_u16(),
            start.elapsed(),
            body.to_string().as_bytes(),
        );
    }
    err.into_response()
}
