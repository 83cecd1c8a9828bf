//! OpenAI 兼容接口：`/v1/chat/completions` 与 `/v1/models`。

pub mod dispatch;
pub mod handler;
pub mod stream;
pub mod types;

pub use dispatch::RequestDispatcher;
pub use handler::{ApiState, handle_chat_completions, handle_list_models};
