//! 单次 chat completion 的分发：模型校验 → 输出预算 → 占用凭据 → 转发上游 → 记账。

use super::stream::{self, StreamContext};
use super::types::{ChatRequest, CompletionEnvelope};
use crate::catalog::ModelCatalog;
use crate::credential::CredentialPool;
use crate::error::AppError;
use crate::logging::LogLevel;
use crate::token;
use crate::upstream::{BufferedResponse, UpstreamClient};
use crate::usage::{TokenCounts, UsageRecord, UsageRecorder};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;

/// 目录中没有上下文长度时采用的默认值。
pub const DEFAULT_CONTEXT_LENGTH: i64 = 4096;
/// 为模板开销等预留的 token 数。
pub const RESERVED_TOKENS: i64 = 100;
pub const MIN_OUTPUT_TOKENS: i64 = 512;
pub const SOFT_OUTPUT_TOKENS: i64 = 2048;
pub const MAX_OUTPUT_TOKENS: i64 = 4096;

/// 调用方未指定 `max_tokens` 时的输出预算。
pub fn output_budget(context_length: Option<i64>, input_tokens: i64) -> i64 {
    let limit = context_length
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_CONTEXT_LENGTH);
    let available = limit - input_tokens - RESERVED_TOKENS;

    if available <= 0 {
        MIN_OUTPUT_TOKENS
    } else if available > MAX_OUTPUT_TOKENS {
        MAX_OUTPUT_TOKENS
    } else {
        available.min(SOFT_OUTPUT_TOKENS).max(MIN_OUTPUT_TOKENS)
    }
}

/// 缓冲响应的 token 计数：仅 2xx 且带 usage 时取上游值，其余为 0。
pub fn buffered_usage(resp: &BufferedResponse) -> TokenCounts {
    if !(200..300).contains(&resp.status) {
        return TokenCounts::default();
    }
    sonic_rs::from_slice::<CompletionEnvelope>(&resp.body)
        .ok()
        .and_then(|env| env.usage)
        .map(|u| TokenCounts::new(u.prompt_tokens, u.completion_tokens, u.total_tokens))
        .unwrap_or_default()
}

/// 原样回传上游状态码与响应体。
pub fn passthrough(resp: BufferedResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .content_type
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    (status, [(header::CONTENT_TYPE, content_type)], resp.body).into_response()
}

#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    pool: CredentialPool,
    catalog: Arc<ModelCatalog>,
    recorder: UsageRecorder,
    upstream: UpstreamClient,
    log_level: LogLevel,
}

impl RequestDispatcher {
    pub fn new(
        pool: CredentialPool,
        catalog: Arc<ModelCatalog>,
        recorder: UsageRecorder,
        upstream: UpstreamClient,
        log_level: LogLevel,
    ) -> Self {
        Self {
            pool,
            catalog,
            recorder,
            upstream,
            log_level,
        }
    }

    pub async fn chat_completion(
        &self,
        mut req: ChatRequest,
        request_id: String,
        started_at: Instant,
    ) -> Result<Response, AppError> {
        if !self.catalog.is_allowed(&req.model) {
            return Err(AppError::ModelNotAllowed(req.model));
        }

        let estimated_prompt_tokens = token::estimate_from_messages(req.text_parts());
        if req.max_tokens.is_none() {
            let budget = output_budget(
                self.catalog.context_length(&req.model),
                estimated_prompt_tokens,
            );
            req.max_tokens = Some(budget);
        }

        let Some(credential) = self.pool.acquire().await? else {
            return Err(AppError::PoolExhausted);
        };
        tracing::info!(
            request_id = %request_id,
            credential_id = credential.id,
            model = %req.model,
            stream = req.is_stream(),
            "已分配凭据"
        );

        if req.is_stream() {
            req.force_include_usage();
        }
        let body = serde_json::to_vec(&req).map_err(|e| AppError::bad_request(e.to_string()))?;

        if req.is_stream() {
            let ctx = StreamContext {
                credential_id: credential.id,
                model: req.model,
                estimated_prompt_tokens,
                recorder: self.recorder.clone(),
                log_level: self.log_level,
                request_id,
                started_at,
            };
            let upstream = self.upstream.clone();
            let secret = credential.secret;
            let (body, _outcome) =
                stream::intercept(async move { upstream.chat_stream(&secret, body).await }, ctx);

            return Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response());
        }

        let resp = match self.upstream.chat(&credential.secret, body).await {
            Ok(resp) => resp,
            Err(e) => {
                self.recorder
                    .append_or_warn(UsageRecord::new(
                        credential.id,
                        req.model,
                        TokenCounts::default(),
                        stream::STATUS_TRANSPORT_FAULT,
                    ))
                    .await;
                return Err(AppError::transport(e.to_string()));
            }
        };

        let tokens = buffered_usage(&resp);
        self.recorder
            .append_or_warn(UsageRecord::new(credential.id, req.model, tokens, resp.status))
            .await;
        Ok(passthrough(resp))
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::ModelDescriptor;
    use crate::config::Config;
    use crate::credential::CredentialStore;
    use crate::credential::types::NewCredential;
    use crate::storage::Database;
    use crate::usage::types::{LogQuery, UsageLogEntry};
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn budget_prefers_soft_cap() {
        assert_eq!(output_budget(Some(4096), 1000), 2048);
        assert_eq!(output_budget(Some(4096), 3500), 512);
    }

    #[test]
    fn budget_floors_when_input_exceeds_context() {
        assert_eq!(output_budget(Some(4096), 4200), 512);
        assert_eq!(output_budget(None, 4200), 512);
    }

    #[test]
    fn budget_caps_large_contexts() {
        assert_eq!(output_budget(Some(131_072), 10), 4096);
        assert_eq!(output_budget(Some(0), 1000), 2048);
    }

    #[test]
    fn buffered_usage_only_trusts_success_bodies() {
        let body = Bytes::from_static(
            br#"{"id":"x","usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
        );
        let ok = BufferedResponse {
            status: 200,
            content_type: None,
            body: body.clone(),
        };
        assert_eq!(buffered_usage(&ok), TokenCounts::new(3, 4, 7));

        let failed = BufferedResponse {
            status: 500,
            content_type: None,
            body,
        };
        assert_eq!(buffered_usage(&failed), TokenCounts::default());

        let no_usage = BufferedResponse {
            status: 200,
            content_type: None,
            body: Bytes::from_static(b"not json"),
        };
        assert_eq!(buffered_usage(&no_usage), TokenCounts::default());
    }

    #[tokio::test]
    async fn passthrough_keeps_status_and_body() {
        let resp = passthrough(BufferedResponse {
            status: 429,
            content_type: Some(HeaderValue::from_static("application/json; charset=utf-8")),
            body: Bytes::from_static(b"{\"error\":\"slow down\"}"),
        });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{\"error\":\"slow down\"}");
    }

    const BUFFERED_REPLY: &str = concat!(
        r#"{"id":"gen-1","choices":[{"message":{"role":"assistant","content":"ok"}}],"#,
        r#""usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
    );
    const STREAM_REPLY: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":",
        "{\"prompt_tokens\":2,\"completion_tokens\":1,\"total_tokens\":3}}\n\n",
        "data: [DONE]\n\n",
    );

    type Seen = Arc<Mutex<Vec<Value>>>;

    /// 本地模拟上游：首条消息为 "slow down" 时返回 429，
    /// 流式请求返回 SSE，其余返回带 usage 的 JSON。
    async fn mock_chat(State(seen): State<Seen>, Json(body): Json<Value>) -> Response {
        let stream = body["stream"].as_bool().unwrap_or(false);
        let slow_down = body["messages"][0]["content"] == "slow down";
        seen.lock().unwrap().push(body);

        if slow_down {
            let reason = r#"{"error":{"message":"Rate limit exceeded"}}"#;
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::CONTENT_TYPE, "application/json")],
                reason,
            )
                .into_response();
        }
        if stream {
            return ([(header::CONTENT_TYPE, "text/event-stream")], STREAM_REPLY).into_response();
        }
        ([(header::CONTENT_TYPE, "application/json")], BUFFERED_REPLY).into_response()
    }

    async fn spawn_upstream() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/chat/completions", post(mock_chat))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), seen)
    }

    /// 一个刚释放的本地端口，连接会被拒绝。
    async fn unreachable_base_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    async fn dispatcher(db: &Database, upstream_base_url: String) -> RequestDispatcher {
        let catalog = Arc::new(ModelCatalog::load(db.clone()).await.unwrap());
        catalog
            .replace_all(vec![ModelDescriptor::new("vendor/m:free", Some(8192))])
            .await
            .unwrap();
        let cfg = Config {
            upstream_base_url,
            ..Config::default()
        };
        RequestDispatcher::new(
            CredentialPool::new(db.clone()),
            catalog,
            UsageRecorder::new(db.clone()),
            UpstreamClient::new(&cfg).unwrap(),
            LogLevel::Off,
        )
    }

    async fn add_key(db: &Database) -> i64 {
        CredentialStore::new(db.clone())
            .add(NewCredential {
                name: "k1".to_string(),
                key: "sk-1".to_string(),
                daily_limit: -1,
            })
            .await
            .unwrap()
    }

    fn request(model: &str, content: &str, stream: bool) -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": content}],
            "stream": stream,
            "stream_options": {"foo": 1},
        }))
        .unwrap()
    }

    async fn call(d: &RequestDispatcher, req: ChatRequest) -> Result<Response, AppError> {
        d.chat_completion(req, "req-test".to_string(), Instant::now()).await
    }

    async fn records(db: &Database) -> Vec<UsageLogEntry> {
        UsageRecorder::new(db.clone())
            .logs(LogQuery::default())
            .await
            .unwrap()
            .logs
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_without_touching_credentials() {
        let db = Database::open_in_memory().unwrap();
        let id = add_key(&db).await;
        let d = dispatcher(&db, unreachable_base_url().await).await;

        let err = call(&d, request("vendor/paid", "hi", false)).await.unwrap_err();
        assert!(matches!(err, AppError::ModelNotAllowed(ref m) if m == "vendor/paid"));
        let store = CredentialStore::new(db.clone());
        assert_eq!(store.get(id).await.unwrap().unwrap().usage_count, 0);
    }

    #[tokio::test]
    async fn empty_pool_is_reported_as_exhausted() {
        let db = Database::open_in_memory().unwrap();
        let d = dispatcher(&db, unreachable_base_url().await).await;

        let err = call(&d, request("vendor/m:free", "hi", false)).await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted));
        assert_eq!(UsageRecorder::new(db).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn buffered_success_is_passed_through_and_recorded_once() {
        let db = Database::open_in_memory().unwrap();
        let id = add_key(&db).await;
        let (base_url, seen) = spawn_upstream().await;
        let d = dispatcher(&db, base_url).await;

        let resp = call(&d, request("vendor/m:free", "hi", false)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, BUFFERED_REPLY);

        let logs = records(&db).await;
        assert_eq!(logs.len(), 1);
        let entry = &logs[0];
        assert_eq!(entry.credential_id, id);
        assert_eq!(
            (entry.prompt_tokens, entry.completion_tokens, entry.total_tokens),
            (3, 4, 7)
        );
        assert_eq!(entry.response_status, 200);

        // 8192 上下文、输入约 1 token：预算封顶 4096。
        let sent = seen.lock().unwrap()[0].clone();
        assert_eq!(sent["max_tokens"], 4096);
        assert_eq!(sent["stream_options"]["foo"], 1);
    }

    #[tokio::test]
    async fn buffered_upstream_error_keeps_status_and_records_zero_tokens() {
        let db = Database::open_in_memory().unwrap();
        add_key(&db).await;
        let (base_url, _seen) = spawn_upstream().await;
        let d = dispatcher(&db, base_url).await;

        let resp = call(&d, request("vendor/m:free", "slow down", false)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(body_text(resp).await.contains("Rate limit exceeded"));

        let logs = records(&db).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].response_status, 429);
        assert_eq!(
            (logs[0].prompt_tokens, logs[0].completion_tokens, logs[0].total_tokens),
            (0, 0, 0)
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_records_500_and_returns_bad_gateway() {
        let db = Database::open_in_memory().unwrap();
        add_key(&db).await;
        let d = dispatcher(&db, unreachable_base_url().await).await;

        let err = call(&d, request("vendor/m:free", "hi", false)).await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);

        let logs = records(&db).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].response_status, 500);
        assert_eq!(logs[0].total_tokens, 0);
    }

    #[tokio::test]
    async fn streaming_call_forces_usage_and_records_after_the_stream() {
        let db = Database::open_in_memory().unwrap();
        let id = add_key(&db).await;
        let (base_url, seen) = spawn_upstream().await;
        let d = dispatcher(&db, base_url).await;

        let resp = call(&d, request("vendor/m:free", "hi", true)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(body_text(resp).await, STREAM_REPLY);

        // 记录在客户端流结束后写入。
        let mut logs = Vec::new();
        for _ in 0..50 {
            logs = records(&db).await;
            if !logs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].credential_id, id);
        assert_eq!(
            (logs[0].prompt_tokens, logs[0].completion_tokens, logs[0].total_tokens),
            (2, 1, 3)
        );
        assert_eq!(logs[0].response_status, 200);

        let sent = seen.lock().unwrap()[0].clone();
        assert_eq!(sent["stream"], true);
        assert_eq!(sent["stream_options"]["include_usage"], true);
        assert_eq!(sent["stream_options"]["foo"], 1);
    }
}
