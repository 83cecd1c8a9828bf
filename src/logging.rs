use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::Duration;

/// 调试日志等级（DEBUG 环境变量）：
/// - off：不输出请求/响应详情
/// - low：输出客户端请求/响应（格式化、脱敏）
/// - medium：在 low 基础上输出上游请求/响应
/// - high：在 medium 基础上逐行输出上游流式数据（原样）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

/// 流式响应结束时的摘要：只记录状态、耗时与 token 计数，不回放事件。
pub fn client_stream_summary(
    status: u16,
    duration: Duration,
    prompt: i64,
    completion: i64,
    total: i64,
) {
    tracing::info!(
        "\n=================== 客户端流式响应 =======================\n[客户端流式] {} {}ms prompt={} completion={} total={}\n==========================================================",
        status,
        format_duration_ms(duration),
        prompt,
        completion,
        total
    );
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

/// high 等级下逐行输出上游 SSE 数据。
pub fn backend_stream_line(line: &str) {
    tracing::info!("[后端流式] {}", line);
}

fn is_secret_header(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "proxy-authorization" | "x-api-key" | "cookie"
    )
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let v = if is_secret_header(key) {
            sonic_rs::Value::from("Bearer ***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // 同名多值统一用数组输出。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head_len = bytes.len().min(HEAD_TAIL);
        let tail_len = bytes.len().saturating_sub(head_len).min(HEAD_TAIL);
        let head_s = String::from_utf8_lossy(&bytes[..head_len]);
        let tail_s = String::from_utf8_lossy(&bytes[bytes.len() - tail_len..]);
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            truncate_text_for_log(&head_s),
            truncate_text_for_log(&tail_s)
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}

/// 折叠消息里内嵌的 data URL 图片（`image_url.url`），其余字段原样保留。
fn sanitize_json_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            out.insert(key, sanitize_json_for_log(child));
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr.iter().map(sanitize_json_for_log).collect();
        return sonic_rs::Value::from(out);
    }

    if let Some(s) = v.as_str() {
        return sonic_rs::Value::from(truncate_data_url(s).as_ref());
    }

    v.to_owned()
}

fn truncate_data_url(s: &str) -> Cow<'_, str> {
    const KEEP: usize = 20;

    let Some(idx) = s.find(";base64,") else {
        return Cow::Borrowed(s);
    };
    let prefix_end = idx + ";base64,".len();
    let payload = &s[prefix_end..];
    if payload.len() <= 100 || !payload.is_ascii() {
        return Cow::Borrowed(s);
    }

    let omitted = payload.len() - KEEP * 2;
    Cow::Owned(format!(
        "{}{}...[TRUNCATED: {omitted} chars]...{}",
        &s[..prefix_end],
        &payload[..KEEP],
        &payload[payload.len() - KEEP..]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parse_accepts_aliases_and_defaults_to_off() {
        assert_eq!(LogLevel::parse("LOW"), LogLevel::Low);
        assert_eq!(LogLevel::parse("backend"), LogLevel::Medium);
        assert_eq!(LogLevel::parse(" raw "), LogLevel::High);
        assert_eq!(LogLevel::parse(""), LogLevel::Off);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Off);

        assert!(LogLevel::Low.client_enabled());
        assert!(!LogLevel::Low.backend_enabled());
        assert!(LogLevel::High.raw_enabled());
    }

    #[test]
    fn headers_hide_credentials() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer sk-secret"));
        h.insert("x-title", HeaderValue::from_static("demo"));

        let out = format_headers(&h);
        assert!(!out.contains("sk-secret"));
        assert!(out.contains("Bearer ***"));
        assert!(out.contains("demo"));
    }

    #[test]
    fn data_urls_are_collapsed() {
        let payload = "A".repeat(400);
        let url = format!("data:image/png;base64,{payload}");
        let out = truncate_data_url(&url);
        assert!(out.starts_with("data:image/png;base64,AAAA"));
        assert!(out.contains("[TRUNCATED: 360 chars]"));

        assert_eq!(truncate_data_url("hello"), "hello");
    }
}
