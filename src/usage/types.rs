use serde::{Deserialize, Serialize};

/// 一次调用的 token 计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounts {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

impl TokenCounts {
    pub fn new(prompt: i64, completion: i64, total: i64) -> Self {
        Self {
            prompt,
            completion,
            total,
        }
    }

    /// 由估算值组成，total 取两者之和。
    pub fn estimated(prompt: i64, completion: i64) -> Self {
        Self::new(prompt, completion, prompt + completion)
    }
}

/// 待写入的调用记录；时间戳在写入时生成，写入后不可修改。
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub credential_id: i64,
    pub model: String,
    pub tokens: TokenCounts,
    /// 不做计费，恒为 0。
    pub cost: f64,
    pub status: u16,
}

impl UsageRecord {
    pub fn new(
        credential_id: i64,
        model: impl Into<String>,
        tokens: TokenCounts,
        status: u16,
    ) -> Self {
        Self {
            credential_id,
            model: model.into(),
            tokens,
            cost: 0.0,
            status,
        }
    }
}

/// 调用记录列表项（关联凭据名称）。
#[derive(Debug, Clone, Serialize)]
pub struct UsageLogEntry {
    pub request_time: String,
    pub credential_id: i64,
    pub key_name: Option<String>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    pub response_status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Success,
    Error,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub key: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Option<StatusFilter>,
    /// UTC 日期 `YYYY-MM-DD`。
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub logs: Vec<UsageLogEntry>,
    pub page: u32,
    pub page_size: u32,
    pub total_records: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TodayStats {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub unique_models: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStat {
    pub model: String,
    pub usage_count: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyOption {
    pub id: i64,
    pub key_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterOptions {
    pub keys: Vec<KeyOption>,
    pub models: Vec<String>,
}
