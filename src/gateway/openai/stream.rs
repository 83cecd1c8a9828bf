//! 流式转发与用量统计。
//!
//! 上游字节块原样、逐块转发给客户端，同时按行解析 `data:` 帧收集 usage 与增量文本。
//! 无论流以何种方式结束（正常结束、上游错误、传输中断、客户端断开），
//! 收尾逻辑都只执行一次，写入恰好一条调用记录。

use super::types::{StreamChunk, Usage};
use crate::logging::{self, LogLevel};
use crate::token;
use crate::upstream::{StreamingResponse, UpstreamError};
use crate::usage::{TokenCounts, UsageRecord, UsageRecorder};
use axum::body::{Body, Bytes};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::convert::Infallible;
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// 客户端主动断开时记录的状态码。
pub const STATUS_CLIENT_CLOSED: u16 = 499;
/// 传输层失败（未拿到上游状态或读流中断）时记录的状态码。
pub const STATUS_TRANSPORT_FAULT: u16 = 500;

/// 读取上游错误响应体的上限。
const ERROR_BODY_LIMIT: usize = 4096;

const SSE_DATA_PREFIX: &[u8] = b"data:";
const SSE_DONE: &[u8] = b"[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Done { status: u16 },
    Failed { status: u16 },
    Cancelled,
}

impl StreamOutcome {
    pub fn status(self) -> u16 {
        match self {
            Self::Done { status } | Self::Failed { status } => status,
            Self::Cancelled => STATUS_CLIENT_CLOSED,
        }
    }
}

/// 一次流式调用的记账信息。
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub credential_id: i64,
    pub model: String,
    pub estimated_prompt_tokens: i64,
    pub recorder: UsageRecorder,
    pub log_level: LogLevel,
    pub request_id: String,
    pub started_at: Instant,
}

/// 从 SSE 字节流中旁路提取 usage 与助手文本；跨块的半行会暂存到下一块。
#[derive(Debug, Default)]
pub struct UsageTap {
    pending: Vec<u8>,
    text: String,
    usage: Option<Usage>,
    log_lines: bool,
}

impl UsageTap {
    pub fn new(log_lines: bool) -> Self {
        Self {
            log_lines,
            ..Self::default()
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.process_line(&line);
        }
    }

    /// 处理末尾没有换行的残留数据。
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.process_line(&line);
        }
    }

    fn process_line(&mut self, raw: &[u8]) {
        let line = raw.trim_ascii();
        if line.is_empty() {
            return;
        }
        if self.log_lines {
            logging::backend_stream_line(&String::from_utf8_lossy(line));
        }

        let Some(payload) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim_ascii();
        if payload.is_empty() || payload == SSE_DONE {
            return;
        }

        // 无法解析的帧直接跳过，不影响转发。
        let Ok(chunk) = sonic_rs::from_slice::<StreamChunk>(payload) else {
            return;
        };
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        for choice in chunk.choices {
            if let Some(content) = choice.delta.and_then(|d| d.content) {
                self.text.push_str(&content);
            }
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 有上游 usage 用上游的，否则按累计文本估算输出并与估算的输入相加。
    pub fn resolve(&self, estimated_prompt_tokens: i64) -> TokenCounts {
        match self.usage {
            Some(u) => TokenCounts::new(u.prompt_tokens, u.completion_tokens, u.total_tokens),
            None => TokenCounts::estimated(estimated_prompt_tokens, token::estimate(&self.text)),
        }
    }
}

/// 单个 SSE 错误事件：`data: {"error":{...}}`。
pub fn sse_error_event(message: &str, status: u16) -> Bytes {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "upstream_error",
            "code": status,
        }
    });
    Bytes::from(format!("data: {body}\n\n"))
}

/// 挂接流式转发。
///
/// 返回立即交给客户端的响应体，以及收尾完成后给出结局的任务句柄。
pub fn intercept<F>(upstream: F, ctx: StreamContext) -> (Body, JoinHandle<StreamOutcome>)
where
    F: Future<Output = Result<StreamingResponse, UpstreamError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
    let handle = tokio::spawn(run(upstream, tx, ctx));
    (Body::from_stream(ReceiverStream::new(rx)), handle)
}

async fn run<F>(
    upstream: F,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    ctx: StreamContext,
) -> StreamOutcome
where
    F: Future<Output = Result<StreamingResponse, UpstreamError>> + Send,
{
    let mut tap = UsageTap::new(ctx.log_level.raw_enabled());
    let outcome = pump(upstream, &tx, &mut tap).await;

    // 先结束客户端流，再写记录。
    drop(tx);
    tap.finish();

    let tokens = tap.resolve(ctx.estimated_prompt_tokens);
    if ctx.log_level.client_enabled() {
        logging::client_stream_summary(
            outcome.status(),
            ctx.started_at.elapsed(),
            tokens.prompt,
            tokens.completion,
            tokens.total,
        );
    }
    tracing::debug!(
        request_id = %ctx.request_id,
        outcome = ?outcome,
        upstream_usage = tap.usage().is_some(),
        "流式调用结束"
    );

    ctx.recorder
        .append_or_warn(UsageRecord::new(
            ctx.credential_id,
            ctx.model,
            tokens,
            outcome.status(),
        ))
        .await;
    outcome
}

async fn pump<F>(
    upstream: F,
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    tap: &mut UsageTap,
) -> StreamOutcome
where
    F: Future<Output = Result<StreamingResponse, UpstreamError>> + Send,
{
    let resp = tokio::select! {
        resp = upstream => resp,
        _ = tx.closed() => return StreamOutcome::Cancelled,
    };

    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!("上游流式请求失败：{e}");
            let status = e.status().unwrap_or(STATUS_TRANSPORT_FAULT);
            let _ = tx.send(Ok(sse_error_event(&e.to_string(), status))).await;
            return StreamOutcome::Failed { status };
        }
    };

    let status = resp.status;
    let mut body = resp.body;
    if !(200..300).contains(&status) {
        let detail = tokio::select! {
            detail = read_error_body(&mut body) => detail,
            _ = tx.closed() => return StreamOutcome::Cancelled,
        };
        tracing::warn!(status, "上游流式响应状态异常：{detail}");
        let message = if detail.is_empty() {
            format!("上游返回错误 {status}")
        } else {
            format!("上游返回错误 {status}: {detail}")
        };
        let _ = tx.send(Ok(sse_error_event(&message, status))).await;
        return StreamOutcome::Failed { status };
    }

    loop {
        let item = tokio::select! {
            item = body.next() => item,
            _ = tx.closed() => return StreamOutcome::Cancelled,
        };

        match item {
            None => return StreamOutcome::Done { status },
            Some(Ok(chunk)) => {
                if tx.send(Ok(chunk.clone())).await.is_err() {
                    return StreamOutcome::Cancelled;
                }
                tap.feed(&chunk);
            }
            Some(Err(e)) => {
                tracing::warn!("读取上游流式响应中断：{e}");
                let _ = tx
                    .send(Ok(sse_error_event(&e.to_string(), STATUS_TRANSPORT_FAULT)))
                    .await;
                return StreamOutcome::Failed {
                    status: STATUS_TRANSPORT_FAULT,
                };
            }
        }
    }
}

type UpstreamBody = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// 读取错误响应体，最多 `ERROR_BODY_LIMIT` 字节；读取中断时保留已读部分。
async fn read_error_body(body: &mut UpstreamBody) -> String {
    let mut buf = Vec::new();
    while buf.len() < ERROR_BODY_LIMIT {
        match body.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&buf).trim().to_string()
}
