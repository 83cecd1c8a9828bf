//! 后台刷新任务：周期性拉取上游模型列表，筛出免费模型并整体替换目录。

use crate::catalog::ModelCatalog;
use crate::catalog::types::{ModelDescriptor, UpstreamModel};
use crate::storage::StorageError;
use crate::upstream::{UpstreamClient, UpstreamError};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("上游未返回任何免费模型，保留现有目录")]
    Empty,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct ModelRefresher {
    catalog: Arc<ModelCatalog>,
    upstream: UpstreamClient,
    free_model_suffix: String,
}

impl ModelRefresher {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        upstream: UpstreamClient,
        free_model_suffix: String,
    ) -> Self {
        Self {
            catalog,
            upstream,
            free_model_suffix,
        }
    }

    /// 刷新一次，返回新目录的模型数。拉取失败或结果为空时不改动现有目录。
    pub async fn refresh_once(&self) -> Result<usize, RefreshError> {
        let models = self.upstream.list_models().await?;
        let descriptors = to_descriptors(&models, &self.free_model_suffix);
        if descriptors.is_empty() {
            return Err(RefreshError::Empty);
        }
        let count = self.catalog.replace_all(descriptors).await?;
        tracing::info!(count, "模型目录已更新");
        Ok(count)
    }
}

/// 启动后台刷新：启动后立即执行一次，之后按 `interval` 周期执行。
pub fn spawn_refresh_task(refresher: ModelRefresher, interval: Duration) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = refresher.refresh_once().await {
                tracing::warn!("模型目录刷新失败：{e}");
            }
            tokio::time::sleep(interval).await;
        }
    });
}

/// 只保留 id 含有免费标记的模型。
pub fn to_descriptors(models: &[UpstreamModel], free_model_suffix: &str) -> Vec<ModelDescriptor> {
    models
        .iter()
        .filter(|m| !m.id.trim().is_empty() && m.id.contains(free_model_suffix))
        .map(|m| {
            let model_id = m.id.trim().to_string();
            let name = m
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| model_id.clone());
            ModelDescriptor {
                model_id,
                name,
                active: true,
                context_length: m.context_length(),
                parameters: m.description.as_deref().and_then(extract_parameters),
            }
        })
        .collect()
}

static PARAMETERS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(billion|million|b|m)\b[\s-]*(?:active\s+)?param")
        .expect("parameter regex is valid")
});

/// 从模型描述里提取参数量，例如 "a 24B-parameter model" → `24B`。
pub fn extract_parameters(description: &str) -> Option<String> {
    let caps = PARAMETERS_RE.captures(description)?;
    let value = caps.get(1)?.as_str();
    let unit = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "m" | "million" => "M",
        _ => "B",
    };
    Some(format!("{value}{unit}"))
}
