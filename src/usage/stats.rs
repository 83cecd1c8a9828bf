//! 调用记录的只读查询：分页列表、今日汇总、模型排行、筛选项。

use crate::storage::StorageError;
use crate::usage::UsageRecorder;
use crate::usage::types::{
    FilterOptions, KeyOption, LogPage, LogQuery, ModelStat, StatusFilter, TodayStats,
    UsageLogEntry,
};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 200;

impl UsageRecorder {
    pub async fn logs(&self, query: LogQuery) -> Result<LogPage, StorageError> {
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let (where_clause, args) = build_filter(&query);

        self.db
            .call(move |conn| {
                let count_sql = format!("SELECT COUNT(*) FROM usage_logs ul WHERE {where_clause}");
                let total_records: i64 =
                    conn.query_row(&count_sql, params_from_iter(args.iter()), |row| row.get(0))?;

                let data_sql = format!(
                    "SELECT ul.request_time, ul.api_key_id, ak.key_name, ul.model,
                            ul.prompt_tokens, ul.completion_tokens, ul.total_tokens, ul.cost, ul.response_status
                     FROM usage_logs ul
                     LEFT JOIN api_keys ak ON ul.api_key_id = ak.id
                     WHERE {where_clause}
                     ORDER BY ul.request_time DESC, ul.id DESC
                     LIMIT {page_size} OFFSET {}",
                    (page as i64 - 1) * page_size as i64
                );
                let mut stmt = conn.prepare(&data_sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                    Ok(UsageLogEntry {
                        request_time: row.get(0)?,
                        credential_id: row.get(1)?,
                        key_name: row.get(2)?,
                        model: row.get(3)?,
                        prompt_tokens: row.get(4)?,
                        completion_tokens: row.get(5)?,
                        total_tokens: row.get(6)?,
                        cost: row.get(7)?,
                        response_status: row.get(8)?,
                    })
                })?;
                let logs = rows.collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(LogPage {
                    logs,
                    page,
                    page_size,
                    total_records,
                    total_pages: (total_records + page_size as i64 - 1) / page_size as i64,
                })
            })
            .await
    }

    pub async fn today_stats(&self) -> Result<TodayStats, StorageError> {
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(total_tokens), 0), COUNT(DISTINCT model)
                     FROM usage_logs
                     WHERE substr(request_time, 1, 10) = ?1",
                    params![today],
                    |row| {
                        Ok(TodayStats {
                            total_requests: row.get(0)?,
                            total_tokens: row.get(1)?,
                            unique_models: row.get(2)?,
                        })
                    },
                )
            })
            .await
    }

    /// 调用次数最多的前 10 个模型。
    pub async fn model_stats(&self) -> Result<Vec<ModelStat>, StorageError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT model, COUNT(*) AS usage_count, COALESCE(SUM(total_tokens), 0)
                     FROM usage_logs
                     GROUP BY model
                     ORDER BY usage_count DESC, model
                     LIMIT 10",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ModelStat {
                        model: row.get(0)?,
                        usage_count: row.get(1)?,
                        total_tokens: row.get(2)?,
                    })
                })?;
                rows.collect()
            })
            .await
    }

    pub async fn filter_options(&self) -> Result<FilterOptions, StorageError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, key_name FROM api_keys ORDER BY key_name")?;
                let keys = stmt
                    .query_map([], |row| {
                        Ok(KeyOption {
                            id: row.get(0)?,
                            key_name: row.get(1)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut stmt = conn.prepare("SELECT DISTINCT model FROM usage_logs ORDER BY model")?;
                let models = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;

                Ok(FilterOptions { keys, models })
            })
            .await
    }
}

fn build_filter(query: &LogQuery) -> (String, Vec<Value>) {
    let mut conditions: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    if let Some(key) = query.key {
        conditions.push("ul.api_key_id = ?");
        args.push(Value::Integer(key));
    }
    if let Some(model) = query.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        conditions.push("ul.model = ?");
        args.push(Value::Text(model.to_string()));
    }
    match query.status {
        Some(StatusFilter::Success) => conditions.push("ul.response_status BETWEEN 200 AND 299"),
        Some(StatusFilter::Error) => conditions.push("ul.response_status >= 400"),
        None => {}
    }
    if let Some(date) = query.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        conditions.push("substr(ul.request_time, 1, 10) = ?");
        args.push(Value::Text(date.to_string()));
    }

    let clause = if conditions.is_empty() {
        "1 = 1".to_string()
    } else {
        conditions.join(" AND ")
    };
    (clause, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use crate::usage::{TokenCounts, UsageRecord};

    async fn recorder_with(records: &[(i64, &str, i64, u16)]) -> UsageRecorder {
        let recorder = UsageRecorder::new(Database::open_in_memory().unwrap());
        for (key, model, total, status) in records {
            recorder
                .append(UsageRecord::new(
                    *key,
                    *model,
                    TokenCounts::new(*total / 2, *total - *total / 2, *total),
                    *status,
                ))
                .await
                .unwrap();
        }
        recorder
    }

    #[tokio::test]
    async fn append_writes_exactly_one_row_with_zero_cost() {
        let recorder = recorder_with(&[(1, "m", 15, 200)]).await;
        assert_eq!(recorder.count().await.unwrap(), 1);

        let page = recorder.logs(LogQuery::default()).await.unwrap();
        let entry = &page.logs[0];
        assert_eq!(entry.total_tokens, 15);
        assert_eq!(entry.cost, 0.0);
        assert_eq!(entry.response_status, 200);
        assert_eq!(entry.key_name, None);
    }

    #[tokio::test]
    async fn logs_filter_and_paginate() {
        let recorder = recorder_with(&[
            (1, "a", 10, 200),
            (1, "b", 10, 500),
            (2, "a", 10, 429),
            (2, "a", 10, 200),
            (2, "b", 10, 200),
        ])
        .await;

        let errors = recorder
            .logs(LogQuery {
                status: Some(StatusFilter::Error),
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.total_records, 2);

        let key2_model_a = recorder
            .logs(LogQuery {
                key: Some(2),
                model: Some("a".to_string()),
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(key2_model_a.total_records, 2);

        let paged = recorder
            .logs(LogQuery {
                page: Some(2),
                page_size: Some(2),
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.total_pages, 3);
        assert_eq!(paged.logs.len(), 2);

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let by_date = recorder
            .logs(LogQuery {
                date: Some(today),
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_date.total_records, 5);
    }

    #[tokio::test]
    async fn today_and_model_stats_aggregate() {
        let recorder =
            recorder_with(&[(1, "a", 10, 200), (1, "a", 5, 200), (1, "b", 1, 200)]).await;

        assert_eq!(
            recorder.today_stats().await.unwrap(),
            TodayStats {
                total_requests: 3,
                total_tokens: 16,
                unique_models: 2,
            }
        );

        let stats = recorder.model_stats().await.unwrap();
        assert_eq!(stats[0].model, "a");
        assert_eq!(stats[0].usage_count, 2);
        assert_eq!(stats[0].total_tokens, 15);

        let options = recorder.filter_options().await.unwrap();
        assert_eq!(options.models, vec!["a".to_string(), "b".to_string()]);
    }
}
