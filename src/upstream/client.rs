use crate::catalog::types::{UpstreamModel, UpstreamModelList};
use crate::config::Config;
use crate::logging::{self, LogLevel};
use axum::body::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("上游不可达: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("上游返回错误 {status}: {body}")]
    Status { status: u16, body: String },

    #[error("上游响应解析失败: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 缓冲调用的上游响应，原样回传给客户端。
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: u16,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// 流式调用：状态码已知，响应体按上游分块逐个产出。
pub struct StreamingResponse {
    pub status: u16,
    pub body: BoxStream<'static, Result<Bytes, UpstreamError>>,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    chat_url: String,
    models_url: String,
    http_referer: String,
    x_title: String,
    log_level: LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        // 流式响应可能持续很久，这里只限制建连与读空闲，不限制总时长。
        if cfg.timeout_ms > 0 {
            let t = Duration::from_millis(cfg.timeout_ms);
            builder = builder.connect_timeout(t).read_timeout(t);
        }

        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            chat_url: cfg.chat_completions_url(),
            models_url: cfg.models_url(),
            http_referer: cfg.http_referer.clone(),
            x_title: cfg.x_title.clone(),
            log_level: cfg.log_level(),
        })
    }

    fn build_headers(&self, secret: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(secret) = secret
            && let Ok(v) = HeaderValue::from_str(&format!("Bearer {secret}"))
        {
            h.insert(AUTHORIZATION, v);
        }
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in [("http-referer", &self.http_referer), ("x-title", &self.x_title)] {
            if value.trim().is_empty() {
                continue;
            }
            if let Ok(v) = HeaderValue::from_str(value.trim()) {
                h.insert(HeaderName::from_static(name), v);
            }
        }
        h
    }

    /// 一次非流式调用；非 2xx 也作为正常响应返回，由调用方原样透传。
    pub async fn chat(
        &self,
        secret: &str,
        body: Vec<u8>,
    ) -> Result<BufferedResponse, UpstreamError> {
        let headers = self.build_headers(Some(secret));
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &self.chat_url, &headers, &body);
        }

        let start = Instant::now();
        let resp = self
            .http
            .post(&self.chat_url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let content_type = resp.headers().get(CONTENT_TYPE).cloned();
        let body = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status, start.elapsed(), &body);
        }

        Ok(BufferedResponse {
            status,
            content_type,
            body,
        })
    }

    /// 发起流式调用，拿到响应头后立即返回。
    pub async fn chat_stream(
        &self,
        secret: &str,
        body: Vec<u8>,
    ) -> Result<StreamingResponse, UpstreamError> {
        let headers = self.build_headers(Some(secret));
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &self.chat_url, &headers, &body);
        }

        let resp = self
            .http
            .post(&self.chat_url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes_stream()
            .map(|item| item.map_err(UpstreamError::from))
            .boxed();
        Ok(StreamingResponse { status, body })
    }

    /// 拉取上游模型列表。
    pub async fn list_models(&self) -> Result<Vec<UpstreamModel>, UpstreamError> {
        let headers = self.build_headers(None);
        let start = Instant::now();
        let resp = self
            .http
            .get(&self.models_url)
            .headers(headers)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        if self.log_level.backend_enabled() {
            logging::backend_response(status, start.elapsed(), &bytes);
        }
        if !(200..300).contains(&status) {
            return Err(UpstreamError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let list: UpstreamModelList =
            sonic_rs::from_slice(&bytes).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(list.data)
    }
}
