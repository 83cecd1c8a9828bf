//! 允许使用的模型目录。
//!
//! 数据库是持久副本，请求路径只读内存快照（ArcSwap，无锁读取）。
//! `replace_all` 先在一个事务里整体替换表内容，提交成功后再原子地替换快照，
//! 读者要么看到旧目录，要么看到新目录，不会看到中间的空状态。
//! 并发的 `replace_all` 串行执行，快照与表内容的先后顺序一致。

use crate::catalog::types::ModelDescriptor;
use crate::storage::{Database, StorageError};
use arc_swap::ArcSwap;
use rusqlite::params;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct ModelCatalog {
    db: Database,
    snapshot: ArcSwap<Vec<ModelDescriptor>>,
    replace_lock: Mutex<()>,
}

impl ModelCatalog {
    /// 从数据库加载当前目录。
    pub async fn load(db: Database) -> Result<Self, StorageError> {
        let models = db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT model_id, model_name, is_active, context_length, parameters
                     FROM free_models
                     ORDER BY model_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ModelDescriptor {
                        model_id: row.get(0)?,
                        name: row.get(1)?,
                        active: row.get(2)?,
                        context_length: row.get(3)?,
                        parameters: row.get(4)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        Ok(Self {
            db,
            snapshot: ArcSwap::from_pointee(models),
            replace_lock: Mutex::new(()),
        })
    }

    pub fn is_allowed(&self, model_id: &str) -> bool {
        self.snapshot
            .load()
            .iter()
            .any(|m| m.active && m.model_id == model_id)
    }

    /// 已知且启用的模型的上下文长度。
    pub fn context_length(&self, model_id: &str) -> Option<i64> {
        self.snapshot
            .load()
            .iter()
            .find(|m| m.active && m.model_id == model_id)
            .and_then(|m| m.context_length)
    }

    /// 启用的模型，按 id 排序。
    pub fn active_models(&self) -> Vec<ModelDescriptor> {
        self.snapshot
            .load()
            .iter()
            .filter(|m| m.active)
            .cloned()
            .collect()
    }

    pub fn all_models(&self) -> Arc<Vec<ModelDescriptor>> {
        self.snapshot.load_full()
    }

    /// 整体替换目录，返回新目录的条目数。重复的 model_id 只保留第一条。
    pub async fn replace_all(
        &self,
        descriptors: Vec<ModelDescriptor>,
    ) -> Result<usize, StorageError> {
        let mut models = descriptors;
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models.dedup_by(|a, b| a.model_id == b.model_id);

        let _guard = self.replace_lock.lock().await;
        let rows = models.clone();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM free_models", [])?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO free_models
                             (model_id, model_name, is_active, context_length, parameters)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for m in &rows {
                        stmt.execute(params![
                            m.model_id,
                            m.name,
                            m.active,
                            m.context_length,
                            m.parameters
                        ])?;
                    }
                }
                tx.commit()
            })
            .await?;

        let count = models.len();
        self.snapshot.store(Arc::new(models));
        Ok(count)
    }
}
