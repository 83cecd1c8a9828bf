use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// `daily_limit` 取该值表示不限量。
pub const UNLIMITED: i64 = -1;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// 上游 API Key 及其配额/用量计数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: i64,
    pub name: String,
    pub secret: String,
    pub active: bool,
    /// 累计调用次数（决定最少使用优先的选择顺序）。
    pub usage_count: i64,
    pub daily_usage: i64,
    pub daily_limit: i64,
    /// 最近一次每日重置的 UTC 日期；缺失或无法解析时视为需要重置。
    pub last_reset_date: Option<NaiveDate>,
    pub last_used: Option<String>,
    pub created_at: String,
}

impl Credential {
    pub(crate) const COLUMNS: &'static str = "id, key_name, api_key, is_active, usage_count, daily_usage, daily_limit, last_reset_date, last_used, created_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let last_reset: Option<String> = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            secret: row.get(2)?,
            active: row.get(3)?,
            usage_count: row.get(4)?,
            daily_usage: row.get(5)?,
            daily_limit: row.get(6)?,
            last_reset_date: last_reset.as_deref().and_then(parse_date),
            last_used: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    /// 启用且未超出当日限额。
    pub fn is_eligible(&self) -> bool {
        self.active && (self.daily_limit == UNLIMITED || self.daily_usage < self.daily_limit)
    }

    pub fn masked_secret(&self) -> String {
        mask_secret(&self.secret)
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    // 兼容写入完整时间戳的旧数据：只取日期部分。
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// 管理端列表视图：密钥脱敏。
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub is_active: bool,
    pub usage_count: i64,
    pub daily_usage: i64,
    pub daily_limit: i64,
    pub last_reset_date: Option<String>,
    pub last_used: Option<String>,
    pub created_at: String,
}

impl From<&Credential> for CredentialView {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            key: c.masked_secret(),
            is_active: c.active,
            usage_count: c.usage_count,
            daily_usage: c.daily_usage,
            daily_limit: c.daily_limit,
            last_reset_date: c.last_reset_date.map(format_date),
            last_used: c.last_used.clone(),
            created_at: c.created_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCredential {
    pub name: String,
    pub key: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialUpdate {
    pub name: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_daily_limit() -> i64 {
    UNLIMITED
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(active: bool, daily_usage: i64, daily_limit: i64) -> Credential {
        Credential {
            id: 1,
            name: "k".to_string(),
            secret: "sk-or-v1-abcdef0123456789".to_string(),
            active,
            usage_count: 0,
            daily_usage,
            daily_limit,
            last_reset_date: None,
            last_used: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn eligibility_respects_active_flag_and_limit() {
        assert!(credential(true, 100, UNLIMITED).is_eligible());
        assert!(credential(true, 4, 5).is_eligible());
        assert!(!credential(true, 5, 5).is_eligible());
        assert!(!credential(false, 0, UNLIMITED).is_eligible());
    }

    #[test]
    fn parse_date_accepts_plain_dates_and_timestamps() {
        let d = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        assert_eq!(parse_date("2026-10-17"), Some(d));
        assert_eq!(parse_date("2026-10-17 08:30:00.123"), Some(d));
        assert_eq!(parse_date("garbage"), None);
    }

    #[test]
    fn masked_secret_keeps_only_edges() {
        let c = credential(true, 0, UNLIMITED);
        assert_eq!(c.masked_secret(), "sk-or-...6789");
        assert_eq!(mask_secret("short"), "*****");
    }
}
