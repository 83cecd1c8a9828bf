//! 上游 chat-completion / 模型列表接口的客户端。

pub mod client;

pub use client::{BufferedResponse, StreamingResponse, UpstreamClient, UpstreamError};
