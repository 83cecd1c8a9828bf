//! 单一共享密钥的 Bearer 认证，覆盖 `/v1/*` 与 `/manager/api/*`。

use crate::error::AppError;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct BearerAuth {
    secret: Arc<str>,
}

impl BearerAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret.trim()),
        }
    }

    /// 未配置密钥时拒绝所有请求。
    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        bearer_token(headers).is_some_and(|token| constant_time_eq(token, &self.secret))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub async fn require_bearer(
    State(auth): State<BearerAuth>,
    request: Request,
    next: Next,
) -> Response {
    if auth.is_authorized(request.headers()) {
        return next.run(request).await;
    }

    tracing::warn!(path = %request.uri().path(), "认证失败");
    AppError::unauthorized("无效的 API Key").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn accepts_matching_bearer_only() {
        let auth = BearerAuth::new("s3cret");
        assert!(auth.is_authorized(&headers("Bearer s3cret")));
        assert!(auth.is_authorized(&headers("bearer s3cret")));
        assert!(!auth.is_authorized(&headers("Bearer s3cre")));
        assert!(!auth.is_authorized(&headers("Basic s3cret")));
        assert!(!auth.is_authorized(&headers("s3cret")));
        assert!(!auth.is_authorized(&HeaderMap::new()));
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let auth = BearerAuth::new("  ");
        assert!(!auth.is_authorized(&headers("Bearer ")));
        assert!(!auth.is_authorized(&headers("Bearer x")));
    }
}
