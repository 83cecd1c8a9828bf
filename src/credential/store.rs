//! 管理端使用的凭据增删改查。计数字段只由 [`CredentialPool`](super::CredentialPool) 修改。

use crate::credential::types::{Credential, CredentialUpdate, NewCredential, format_date};
use crate::storage::{Database, StorageError, now_text};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

#[derive(Debug, Clone)]
pub struct CredentialStore {
    db: Database,
}

impl CredentialStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 按累计用量降序列出全部凭据。
    pub async fn list(&self) -> Result<Vec<Credential>, StorageError> {
        self.db
            .call(|conn| {
                let sql = format!(
                    "SELECT {} FROM api_keys ORDER BY usage_count DESC, id",
                    Credential::COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], Credential::from_row)?;
                rows.collect()
            })
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Credential>, StorageError> {
        self.db
            .call(move |conn| {
                let sql = format!("SELECT {} FROM api_keys WHERE id = ?1", Credential::COLUMNS);
                conn.query_row(&sql, params![id], Credential::from_row)
                    .optional()
            })
            .await
    }

    /// 新增凭据，返回其 id。重置日期记为今天，新 Key 从零用量开始。
    pub async fn add(&self, new: NewCredential) -> Result<i64, StorageError> {
        let created_at = now_text();
        let today = format_date(Utc::now().date_naive());
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO api_keys (key_name, api_key, daily_limit, created_at, last_reset_date)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        new.name.trim(),
                        new.key.trim(),
                        new.daily_limit,
                        created_at,
                        today
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// 返回是否找到并更新了该凭据。
    pub async fn update(&self, id: i64, update: CredentialUpdate) -> Result<bool, StorageError> {
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE api_keys SET key_name = ?2, daily_limit = ?3, is_active = ?4 WHERE id = ?1",
                    params![id, update.name.trim(), update.daily_limit, update.is_active],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<bool, StorageError> {
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE api_keys SET is_active = ?2 WHERE id = ?1",
                    params![id, active],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// 删除凭据；历史调用记录保留。
    pub async fn delete(&self, id: i64) -> Result<bool, StorageError> {
        self.db
            .call(move |conn| {
                let changed = conn.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
                Ok(changed == 1)
            })
            .await
    }
}
