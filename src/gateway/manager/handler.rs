//! 管理端 JSON 接口：凭据增删改查、调用记录与统计、模型目录。

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::catalog::{ModelCatalog, ModelDescriptor, ModelRefresher, RefreshError};
use crate::credential::CredentialStore;
use crate::credential::types::{CredentialUpdate, CredentialView, NewCredential, UNLIMITED};
use crate::error::AppError;
use crate::storage::StorageError;
use crate::usage::UsageRecorder;
use crate::usage::types::{FilterOptions, LogPage, LogQuery, ModelStat, TodayStats};

#[derive(Debug)]
pub struct ManagerState {
    pub credentials: CredentialStore,
    pub usage: UsageRecorder,
    pub catalog: Arc<ModelCatalog>,
    pub refresher: ModelRefresher,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_keys: usize,
    pub active_keys: usize,
    pub today: TodayStats,
    pub models: Vec<ModelStat>,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub is_active: bool,
}

fn validate_limit(daily_limit: i64) -> Result<(), AppError> {
    if daily_limit == UNLIMITED || daily_limit >= 0 {
        Ok(())
    } else {
        Err(AppError::bad_request("daily_limit 只能为 -1（不限）或非负整数"))
    }
}

fn is_unique_violation(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
    )
}

/// GET /manager/api/keys：按累计用量降序，密钥脱敏。
pub async fn handle_list_keys(
    State(state): State<Arc<ManagerState>>,
) -> Result<Json<Vec<CredentialView>>, AppError> {
    let keys = state.credentials.list().await?;
    Ok(Json(keys.iter().map(CredentialView::from).collect()))
}

/// POST /manager/api/keys
pub async fn handle_add_key(
    State(state): State<Arc<ManagerState>>,
    Json(req): Json<NewCredential>,
) -> Result<Response, AppError> {
    if req.name.trim().is_empty() || req.key.trim().is_empty() {
        return Err(AppError::bad_request("name 与 key 不能为空"));
    }
    validate_limit(req.daily_limit)?;

    match state.credentials.add(req).await {
        Ok(id) => {
            tracing::info!(credential_id = id, "已添加凭据");
            Ok((StatusCode::CREATED, Json(CreatedResponse { id })).into_response())
        }
        Err(e) if is_unique_violation(&e) => Err(AppError::bad_request("该 Key 已存在")),
        Err(e) => Err(e.into()),
    }
}

/// PUT /manager/api/keys/{id}
pub async fn handle_update_key(
    State(state): State<Arc<ManagerState>>,
    Path(id): Path<i64>,
    Json(req): Json<CredentialUpdate>,
) -> Result<StatusCode, AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::bad_request("name 不能为空"));
    }
    validate_limit(req.daily_limit)?;

    if state.credentials.update(id, req).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("凭据 {id}")))
    }
}

/// POST /manager/api/keys/{id}/active
pub async fn handle_set_key_active(
    State(state): State<Arc<ManagerState>>,
    Path(id): Path<i64>,
    Json(req): Json<ToggleRequest>,
) -> Result<StatusCode, AppError> {
    if state.credentials.set_active(id, req.is_active).await? {
        tracing::info!(credential_id = id, active = req.is_active, "凭据状态已变更");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("凭据 {id}")))
    }
}

/// DELETE /manager/api/keys/{id}
pub async fn handle_delete_key(
    State(state): State<Arc<ManagerState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if state.credentials.delete(id).await? {
        tracing::info!(credential_id = id, "已删除凭据");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("凭据 {id}")))
    }
}

/// GET /manager/api/stats
pub async fn handle_stats(
    State(state): State<Arc<ManagerState>>,
) -> Result<Json<StatsResponse>, AppError> {
    let keys = state.credentials.list().await?;
    let today = state.usage.today_stats().await?;
    let models = state.usage.model_stats().await?;

    Ok(Json(StatsResponse {
        total_keys: keys.len(),
        active_keys: keys.iter().filter(|k| k.active).count(),
        today,
        models,
    }))
}

/// GET /manager/api/logs
pub async fn handle_logs(
    State(state): State<Arc<ManagerState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>, AppError> {
    Ok(Json(state.usage.logs(query).await?))
}

/// GET /manager/api/filters
pub async fn handle_filters(
    State(state): State<Arc<ManagerState>>,
) -> Result<Json<FilterOptions>, AppError> {
    Ok(Json(state.usage.filter_options().await?))
}

/// GET /manager/api/models：包含已停用的条目。
pub async fn handle_models(State(state): State<Arc<ManagerState>>) -> Json<Vec<ModelDescriptor>> {
    Json(state.catalog.all_models().as_ref().clone())
}

/// POST /manager/api/models/refresh
pub async fn handle_refresh_models(
    State(state): State<Arc<ManagerState>>,
) -> Result<Json<RefreshResponse>, AppError> {
    match state.refresher.refresh_once().await {
        Ok(count) => Ok(Json(RefreshResponse { count })),
        Err(RefreshError::Storage(e)) => Err(e.into()),
        Err(e) => Err(AppError::transport(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Database;
    use crate::upstream::UpstreamClient;

    async fn state() -> Arc<ManagerState> {
        let db = Database::open_in_memory().unwrap();
        let catalog = Arc::new(ModelCatalog::load(db.clone()).await.unwrap());
        let upstream = UpstreamClient::new(&Config::default()).unwrap();
        Arc::new(ManagerState {
            credentials: CredentialStore::new(db.clone()),
            usage: UsageRecorder::new(db),
            refresher: ModelRefresher::new(catalog.clone(), upstream, ":free".to_string()),
            catalog,
        })
    }

    fn new_key(name: &str, key: &str, daily_limit: i64) -> NewCredential {
        NewCredential {
            name: name.to_string(),
            key: key.to_string(),
            daily_limit,
        }
    }

    #[tokio::test]
    async fn add_list_update_delete_cycle() {
        let state = state().await;

        let resp = handle_add_key(
            State(state.clone()),
            Json(new_key("main", "sk-or-v1-0123456789abcdef", 100)),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let Json(keys) = handle_list_keys(State(state.clone())).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "sk-or-...cdef");
        let id = keys[0].id;

        let status = handle_update_key(
            State(state.clone()),
            Path(id),
            Json(CredentialUpdate {
                name: "renamed".to_string(),
                daily_limit: UNLIMITED,
                is_active: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let Json(stats) = handle_stats(State(state.clone())).await.unwrap();
        assert_eq!((stats.total_keys, stats.active_keys), (1, 0));

        handle_set_key_active(
            State(state.clone()),
            Path(id),
            Json(ToggleRequest { is_active: true }),
        )
        .await
        .unwrap();
        let Json(stats) = handle_stats(State(state.clone())).await.unwrap();
        assert_eq!(stats.active_keys, 1);

        assert_eq!(
            handle_delete_key(State(state.clone()), Path(id)).await.unwrap(),
            StatusCode::NO_CONTENT
        );
        let missing = handle_delete_key(State(state), Path(id)).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_or_invalid_keys_are_bad_requests() {
        let state = state().await;
        handle_add_key(State(state.clone()), Json(new_key("a", "sk-dup", UNLIMITED)))
            .await
            .unwrap();

        let dup = handle_add_key(State(state.clone()), Json(new_key("b", "sk-dup", UNLIMITED)))
            .await
            .unwrap_err();
        assert!(matches!(dup, AppError::BadRequest(_)));

        let bad_limit = handle_add_key(State(state.clone()), Json(new_key("c", "sk-c", -5)))
            .await
            .unwrap_err();
        assert!(matches!(bad_limit, AppError::BadRequest(_)));

        let blank = handle_add_key(State(state), Json(new_key(" ", "sk-d", UNLIMITED)))
            .await
            .unwrap_err();
        assert!(matches!(blank, AppError::BadRequest(_)));
    }
}
