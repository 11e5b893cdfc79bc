//! 数据仓储层接口定义
//!
//! 每个仓储只负责一种实体。共享记录（任务状态、约束实例状态、序号身份绑定）上的
//! 状态变化都必须表达成条件更新：实现方在同一个事务或锁内完成"检查 + 写入"，
//! 调用方拿到 `false` / `None` 即表示竞争失败，不会看到部分更新。
//!
//! 实现：
//! - 内存实现（测试和单机运行）
//! - SQLite 实现（`sqlx`）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::DispatchResult;
use crate::models::{
    Connection, ConnectionResult, Constraint, ConstraintInstance, InstanceState, ReleaseEntity,
    SelectionLog, SequenceIdentity, Task, TaskStatus, Worker,
};

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 以给定初始状态保存任务
    ///
    /// 设置了 `must_execute_on_worker_id` 的点对点任务不安排广播
    /// （`next_broadcast_at` 置空）。
    async fn save(&self, task: &Task, initial_status: TaskStatus) -> DispatchResult<Task>;

    async fn get(&self, id: &str) -> DispatchResult<Option<Task>>;

    /// 状态CAS：当前状态不是 `from` 时不做任何修改并返回 `false`
    async fn update_status(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> DispatchResult<bool>;

    /// 查找可被 `worker_id` 领取的任务：QUEUED、未分配、未过期，
    /// 且没有被固定到其他Worker。按创建时间排序。
    async fn find_acquirable(
        &self,
        tenant_id: &str,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<Task>>;

    /// 原子分配：仅当任务仍为QUEUED且未分配时转为STARTED，
    /// 过期时间改为 `expires_at`。竞争失败返回 `None`。
    async fn assign(
        &self,
        id: &str,
        worker_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>>;

    /// 进入"验证中"子状态：任务仍为QUEUED且未分配时把Worker加入验证集合
    async fn start_validation(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool>;

    /// 把Worker移出验证集合并加入 `already_tried`，任务保持QUEUED
    async fn mark_tried(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>>;

    /// 释放 `stale_before` 之前开始、仍未回报的验证：清空验证集合，
    /// 非点对点任务安排在 `now` 重新广播。返回被释放的任务
    async fn release_stale_validations(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<Task>>;

    /// 已分配给 `worker_id` 的STARTED任务退回QUEUED，换其他Worker执行
    async fn requeue(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>>;

    /// 由持有任务的Worker把STARTED任务转为终态
    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool>;

    /// 记录一次广播：广播次数加一，并安排下一次广播时间
    async fn record_broadcast(
        &self,
        id: &str,
        next_broadcast_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Option<Task>>;

    /// 到了重新广播时间、仍未被领取的任务
    async fn find_due_for_broadcast(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DispatchResult<Vec<Task>>;

    /// 批量回收：未终止且已过期，或QUEUED且广播次数达到上限的任务转为ERROR，
    /// 返回被回收的任务
    async fn mark_expired(
        &self,
        now: DateTime<Utc>,
        max_broadcast_rounds: i32,
    ) -> DispatchResult<Vec<Task>>;

    /// 删除早于 `before` 更新的终态任务
    async fn purge_terminal(&self, before: DateTime<Utc>) -> DispatchResult<u64>;
}

/// Worker仓储
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn upsert(&self, worker: &Worker) -> DispatchResult<Worker>;

    async fn get(&self, id: &str) -> DispatchResult<Option<Worker>>;

    async fn find_by_hostname(
        &self,
        tenant_id: &str,
        hostname: &str,
    ) -> DispatchResult<Option<Worker>>;

    async fn delete(&self, id: &str) -> DispatchResult<bool>;

    async fn list_enabled(&self, tenant_id: &str) -> DispatchResult<Vec<Worker>>;
}

/// Worker在线会话仓储
#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    /// 新建或刷新会话，同时清除断开标记
    async fn heartbeat(&self, connection: &Connection) -> DispatchResult<()>;

    /// `since` 之后有心跳且未断开的Worker
    async fn connected_worker_ids(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> DispatchResult<Vec<String>>;

    /// 把 `before` 之前最后心跳的会话标记为断开
    async fn disconnect_stale(&self, before: DateTime<Utc>) -> DispatchResult<u64>;

    async fn disconnect(&self, connection_id: &str) -> DispatchResult<bool>;
}

/// 序号身份仓储
#[async_trait]
pub trait SequenceRepository: Send + Sync {
    async fn get(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
        sequence_number: i32,
    ) -> DispatchResult<Option<SequenceIdentity>>;

    async fn list(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
    ) -> DispatchResult<Vec<SequenceIdentity>>;

    /// `(tenant, prefix, sequence_number)` 已存在时返回 `DuplicateKey`
    async fn insert(&self, identity: &SequenceIdentity) -> DispatchResult<()>;

    /// 仅当记录仍然过期（`last_updated_at < stale_before`）时换绑新令牌
    async fn rebind_if_stale(
        &self,
        id: &str,
        new_token: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool>;

    /// 令牌匹配时刷新 `last_updated_at`
    async fn touch(
        &self,
        tenant_id: &str,
        hostname_prefix: &str,
        sequence_number: i32,
        token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<bool>;
}

/// 选择审计日志仓储，只追加
#[async_trait]
pub trait SelectionLogRepository: Send + Sync {
    async fn save(&self, log: &SelectionLog) -> DispatchResult<()>;

    async fn list_by_task(&self, tenant_id: &str, task_id: &str)
        -> DispatchResult<Vec<SelectionLog>>;

    /// 删除 `before` 之前封存的批次
    async fn purge_before(&self, before: DateTime<Utc>) -> DispatchResult<u64>;
}

/// 连通性历史仓储，按 `(tenant, worker, criteria)` 覆盖写入
#[async_trait]
pub trait ConnectionResultRepository: Send + Sync {
    async fn upsert_all(&self, results: &[ConnectionResult]) -> DispatchResult<()>;

    async fn list(
        &self,
        tenant_id: &str,
        worker_id: &str,
        criteria: &[String],
    ) -> DispatchResult<Vec<ConnectionResult>>;
}

/// 容量约束仓储
///
/// `acquire` / `promote` / `update_capacity` 各自在单个事务内完成容量判断，
/// 保证同一 `(constraint, resource_unit)` 下ACTIVE许可总数不超过容量。
#[async_trait]
pub trait ConstraintRepository: Send + Sync {
    /// `(tenant, name)` 已存在时返回 `DuplicateKey`
    async fn insert(&self, constraint: &Constraint) -> DispatchResult<()>;

    async fn get(&self, id: &str) -> DispatchResult<Option<Constraint>>;

    async fn find_by_name(&self, tenant_id: &str, name: &str)
        -> DispatchResult<Option<Constraint>>;

    /// 新容量小于任一资源单元当前ACTIVE许可总数时返回校验错误且不做修改
    async fn update_capacity(
        &self,
        id: &str,
        capacity: i32,
        now: DateTime<Utc>,
    ) -> DispatchResult<Constraint>;

    /// 申请许可；同一执行实体重复申请时返回已有实例
    async fn acquire(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity: &ReleaseEntity,
        permits: i32,
        now: DateTime<Utc>,
    ) -> DispatchResult<ConstraintInstance>;

    /// 删除执行实体持有的实例
    async fn release(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        release_entity_id: &str,
    ) -> DispatchResult<Option<ConstraintInstance>>;

    /// 按FIFO顺序提升BLOCKED实例，返回被提升的实例
    async fn promote(
        &self,
        constraint_id: &str,
        resource_unit: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<ConstraintInstance>>;

    async fn list_instances(
        &self,
        constraint_id: &str,
        resource_unit: &str,
    ) -> DispatchResult<Vec<ConstraintInstance>>;

    async fn resource_units(&self, constraint_id: &str) -> DispatchResult<Vec<String>>;

    async fn list_by_state(&self, state: InstanceState) -> DispatchResult<Vec<ConstraintInstance>>;
}
