use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use dispatch_core::models::ReleaseEntity;
use serde::Deserialize;
use tracing::info;

use crate::{error::ApiResult, response::success, routes::AppState};

#[derive(Debug, Deserialize)]
pub struct EnsureConstraintRequest {
    pub tenant_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCapacityRequest {
    pub capacity: i32,
}

#[derive(Debug, Deserialize)]
pub struct AcquirePermitRequest {
    pub resource_unit: String,
    pub release_entity: ReleaseEntity,
    #[serde(default = "default_permits")]
    pub permits: i32,
}

fn default_permits() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct ReleasePermitRequest {
    pub resource_unit: String,
    pub release_entity_id: String,
}

/// 幂等创建
pub async fn ensure_constraint(
    State(state): State<AppState>,
    Json(request): Json<EnsureConstraintRequest>,
) -> ApiResult<Response> {
    let constraint = state
        .engine
        .admission
        .ensure(&request.tenant_id, &request.name)
        .await?;
    Ok(success(constraint))
}

pub async fn get_constraint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let constraint = state.engine.admission.get(&id).await?;
    Ok(success(constraint))
}

pub async fn update_capacity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateCapacityRequest>,
) -> ApiResult<Response> {
    let constraint = state
        .engine
        .admission
        .update_capacity(&id, request.capacity)
        .await?;
    Ok(success(constraint))
}

pub async fn acquire_permits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AcquirePermitRequest>,
) -> ApiResult<Response> {
    let instance = state
        .engine
        .admission
        .acquire(
            &id,
            &request.resource_unit,
            &request.release_entity,
            request.permits,
        )
        .await?;
    Ok(success(instance))
}

/// 释放许可，返回因此被提升的实例
pub async fn release_permits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReleasePermitRequest>,
) -> ApiResult<Response> {
    let promoted = state
        .engine
        .admission
        .release(&id, &request.resource_unit, &request.release_entity_id)
        .await?;
    Ok(success(promoted))
}

pub async fn list_instances(
    State(state): State<AppState>,
    Path((id, unit)): Path<(String, String)>,
) -> ApiResult<Response> {
    let instances = state.engine.admission.instances(&id, &unit).await?;
    Ok(success(instances))
}

/// 上层执行实体结束的通知，供回收扫描使用
pub async fn mark_release_entity_terminal(
    State(state): State<AppState>,
    Json(entity): Json<ReleaseEntity>,
) -> ApiResult<Response> {
    state.release_entities.mark_terminal(&entity).await;
    info!("执行实体 {}/{} 已结束", entity.entity_type, entity.id);
    Ok(success(entity))
}
