//! 管理端 JSON 接口，挂在 `/manager/api` 下，与 `/v1` 共用 Bearer 认证。

pub mod handler;

pub use handler::*;
