use crate::storage::{Database, StorageError, now_text};
use crate::usage::types::UsageRecord;
use rusqlite::params;

/// 只追加的调用记录表。
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    pub(crate) db: Database,
}

impl UsageRecorder {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, record: UsageRecord) -> Result<(), StorageError> {
        let request_time = now_text();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO usage_logs (api_key_id, model, prompt_tokens, completion_tokens, total_tokens, cost, request_time, response_status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        record.credential_id,
                        record.model,
                        record.tokens.prompt,
                        record.tokens.completion,
                        record.tokens.total,
                        record.cost,
                        request_time,
                        record.status,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// 尽力写入：失败只记日志，不影响已经返回/正在返回给客户端的响应。
    pub async fn append_or_warn(&self, record: UsageRecord) {
        let credential_id = record.credential_id;
        let status = record.status;
        let tokens = record.tokens;
        match self.append(record).await {
            Ok(()) => tracing::info!(
                credential_id,
                status,
                prompt = tokens.prompt,
                completion = tokens.completion,
                total = tokens.total,
                "已记录调用"
            ),
            Err(e) => tracing::warn!(credential_id, status, error = %e, "写入调用记录失败"),
        }
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        self.db
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM usage_logs", [], |row| row.get(0)))
            .await
    }
}
