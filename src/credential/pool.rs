//! 凭据池：每日重置、最少使用优先的选择，以及原子的条件计数。
//!
//! 选择与计数拆成两个操作，但计数本身是一条带限额谓词的 UPDATE：
//! 两个并发请求即使都看到同一个 Key 可用，也只有仍在限额内的那次 UPDATE 会生效，
//! 另一次得到 0 行影响并重新选择。

use crate::credential::types::{Credential, format_date};
use crate::storage::{Database, StorageError, now_text};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};

#[derive(Debug, Clone)]
pub struct CredentialPool {
    db: Database,
}

impl CredentialPool {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 先执行每日重置，再返回累计用量最少的可用凭据（同用量取 id 最小者）。
    ///
    /// `Ok(None)` 表示没有可用凭据，属于正常结果。
    pub async fn select(&self) -> Result<Option<Credential>, StorageError> {
        self.select_excluding(today(), Vec::new()).await
    }

    /// 对指定凭据执行一次条件计数：累计与当日用量各加 1，并记录最近使用时间。
    ///
    /// 返回 `false` 表示该凭据已被禁用、删除或在此期间达到当日限额，本次未计数。
    pub async fn record_use(&self, credential_id: i64) -> Result<bool, StorageError> {
        let used_at = now_text();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE api_keys
                     SET usage_count = usage_count + 1,
                         daily_usage = daily_usage + 1,
                         last_used = ?2
                     WHERE id = ?1
                       AND is_active = 1
                       AND (daily_limit = -1 OR daily_usage < daily_limit)",
                    params![credential_id, used_at],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    /// 选择并占用一个凭据：`select` 之后立即条件计数，计数失败则排除该凭据重选。
    ///
    /// 返回的快照已包含本次计数。
    pub async fn acquire(&self) -> Result<Option<Credential>, StorageError> {
        let today = today();
        let mut excluded: Vec<i64> = Vec::new();

        loop {
            let Some(mut credential) = self.select_excluding(today, excluded.clone()).await? else {
                return Ok(None);
            };

            if self.record_use(credential.id).await? {
                credential.usage_count += 1;
                credential.daily_usage += 1;
                return Ok(Some(credential));
            }

            tracing::debug!(
                credential_id = credential.id,
                "凭据在选择后已不可用，重新选择"
            );
            excluded.push(credential.id);
        }
    }

    /// 把上次重置日期不是 `today` 的启用凭据的当日用量清零。
    pub async fn reset_stale(&self, today: NaiveDate) -> Result<usize, StorageError> {
        self.db.call(move |conn| reset_stale(conn, today)).await
    }

    pub(crate) async fn select_excluding(
        &self,
        today: NaiveDate,
        excluded: Vec<i64>,
    ) -> Result<Option<Credential>, StorageError> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let reset = reset_stale(&tx, today)?;
                if reset > 0 {
                    tracing::info!(count = reset, date = %today, "已重置凭据的每日用量");
                }
                let active = load_active(&tx)?;
                tx.commit()?;

                let candidates: Vec<Credential> = active
                    .into_iter()
                    .filter(|c| !excluded.contains(&c.id))
                    .collect();
                Ok(pick_least_used(&candidates).cloned())
            })
            .await
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// 从候选中挑出可用且累计用量最少的凭据；同用量时 id 小者优先。
pub fn pick_least_used(candidates: &[Credential]) -> Option<&Credential> {
    candidates
        .iter()
        .filter(|c| c.is_eligible())
        .min_by_key(|c| (c.usage_count, c.id))
}

fn reset_stale(conn: &Connection, today: NaiveDate) -> rusqlite::Result<usize> {
    let today = format_date(today);
    conn.execute(
        "UPDATE api_keys
         SET daily_usage = 0, last_reset_date = ?1
         WHERE is_active = 1
           AND (last_reset_date IS NULL OR substr(last_reset_date, 1, 10) <> ?1)",
        params![today],
    )
}

fn load_active(conn: &Connection) -> rusqlite::Result<Vec<Credential>> {
    let sql = format!(
        "SELECT {} FROM api_keys WHERE is_active = 1 ORDER BY id",
        Credential::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], Credential::from_row)?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::store::CredentialStore;
    use crate::credential::types::{NewCredential, UNLIMITED};
    use chrono::Days;

    async fn setup() -> (Database, CredentialPool, CredentialStore) {
        let db = Database::open_in_memory().unwrap();
        (
            db.clone(),
            CredentialPool::new(db.clone()),
            CredentialStore::new(db),
        )
    }

    async fn add(store: &CredentialStore, name: &str, daily_limit: i64) -> i64 {
        store
            .add(NewCredential {
                name: name.to_string(),
                key: format!("sk-{name}"),
                daily_limit,
            })
            .await
            .unwrap()
    }

    async fn set_counts(db: &Database, id: i64, usage_count: i64, daily_usage: i64) {
        db.call(move |conn| {
            conn.execute(
                "UPDATE api_keys SET usage_count = ?2, daily_usage = ?3 WHERE id = ?1",
                params![id, usage_count, daily_usage],
            )
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn select_prefers_least_used_then_lowest_id() {
        let (db, pool, store) = setup().await;
        let a = add(&store, "a", UNLIMITED).await;
        let b = add(&store, "b", UNLIMITED).await;
        set_counts(&db, a, 5, 0).await;
        set_counts(&db, b, 2, 0).await;
        assert_eq!(pool.select().await.unwrap().unwrap().id, b);

        set_counts(&db, a, 2, 0).await;
        assert_eq!(pool.select().await.unwrap().unwrap().id, a);
    }

    #[tokio::test]
    async fn select_skips_inactive_and_exhausted() {
        let (db, pool, store) = setup().await;
        let exhausted = add(&store, "exhausted", 3).await;
        let disabled = add(&store, "disabled", UNLIMITED).await;
        let busy = add(&store, "busy", UNLIMITED).await;
        pool.select().await.unwrap();
        set_counts(&db, exhausted, 0, 3).await;
        set_counts(&db, busy, 100, 100).await;
        store.set_active(disabled, false).await.unwrap();

        let picked = pool.select().await.unwrap().unwrap();
        assert_eq!(picked.id, busy);
        assert!(picked.is_eligible());
    }

    #[tokio::test]
    async fn select_returns_none_when_pool_is_empty_or_exhausted() {
        let (db, pool, store) = setup().await;
        assert!(pool.select().await.unwrap().is_none());

        let id = add(&store, "only", 1).await;
        pool.select().await.unwrap();
        set_counts(&db, id, 1, 1).await;
        assert!(pool.select().await.unwrap().is_none());
        assert!(pool.acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn select_then_record_use_increments_both_counters_once() {
        let (_db, pool, store) = setup().await;
        let id = add(&store, "a", UNLIMITED).await;

        let before = pool.select().await.unwrap().unwrap();
        assert!(pool.record_use(before.id).await.unwrap());
        let after = store.get(id).await.unwrap().unwrap();

        assert_eq!(after.usage_count, before.usage_count + 1);
        assert_eq!(after.daily_usage, before.daily_usage + 1);
        assert!(after.last_used.is_some());
    }

    #[tokio::test]
    async fn stale_daily_usage_resets_once_per_day() {
        let (db, pool, store) = setup().await;
        let id = add(&store, "a", 20).await;
        let yesterday = format_date(today().checked_sub_days(Days::new(1)).unwrap());
        db.call(move |conn| {
            conn.execute(
                "UPDATE api_keys SET daily_usage = 10, last_reset_date = ?2 WHERE id = ?1",
                params![id, yesterday],
            )
        })
        .await
        .unwrap();

        pool.select().await.unwrap();
        let after_first = store.get(id).await.unwrap().unwrap();
        assert_eq!(after_first.daily_usage, 0);
        assert_eq!(after_first.last_reset_date, Some(today()));

        set_counts(&db, id, after_first.usage_count, 0).await;
        pool.select().await.unwrap();
        let after_second = store.get(id).await.unwrap().unwrap();
        assert_eq!(after_second.daily_usage, 0);

        assert!(pool.record_use(id).await.unwrap());
        pool.select().await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().daily_usage, 1);
    }

    #[tokio::test]
    async fn record_use_refuses_to_pass_the_daily_limit() {
        let (_db, pool, store) = setup().await;
        let id = add(&store, "a", 1).await;
        pool.select().await.unwrap();

        assert!(pool.record_use(id).await.unwrap());
        assert!(!pool.record_use(id).await.unwrap());
        let c = store.get(id).await.unwrap().unwrap();
        assert_eq!(c.daily_usage, 1);
        assert_eq!(c.usage_count, 1);
    }

    #[tokio::test]
    async fn concurrent_acquire_never_exceeds_limit() {
        let (_db, pool, store) = setup().await;
        let id = add(&store, "a", 3).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.acquire().await.unwrap() }));
        }
        let mut granted = 0;
        for t in tasks {
            if t.await.unwrap().is_some() {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(store.get(id).await.unwrap().unwrap().daily_usage, 3);
    }

    #[tokio::test]
    async fn acquire_falls_through_to_next_credential() {
        let (db, pool, store) = setup().await;
        let a = add(&store, "a", 1).await;
        let b = add(&store, "b", UNLIMITED).await;
        pool.select().await.unwrap();
        set_counts(&db, b, 10, 0).await;

        let first = pool.acquire().await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.usage_count, 1);

        let second = pool.acquire().await.unwrap().unwrap();
        assert_eq!(second.id, b);
    }
}
