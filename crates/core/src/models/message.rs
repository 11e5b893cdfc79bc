use serde::{Deserialize, Serialize};

use super::Task;

/// 广播路由类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RoutingClass {
    #[serde(rename = "LEGACY")]
    Legacy,
    #[serde(rename = "NEXT_GEN")]
    NextGen,
}

impl RoutingClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingClass::Legacy => "legacy",
            RoutingClass::NextGen => "ng",
        }
    }
}

/// 广播通道，按 `(protocol_version, routing_class)` 区分
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastChannel {
    pub protocol_version: String,
    pub routing_class: RoutingClass,
}

impl BroadcastChannel {
    pub fn new(protocol_version: impl Into<String>, routing_class: RoutingClass) -> Self {
        Self {
            protocol_version: protocol_version.into(),
            routing_class,
        }
    }

    /// 任务作用域未标记下一代时一律走旧通道
    pub fn for_task(protocol_version: &str, task: &Task) -> Self {
        let routing_class = if task.is_next_gen() {
            RoutingClass::NextGen
        } else {
            RoutingClass::Legacy
        };
        Self::new(protocol_version, routing_class)
    }

    /// 发布/订阅主题名
    pub fn topic(&self) -> String {
        format!(
            "dispatch.tasks.{}.{}",
            self.protocol_version,
            self.routing_class.as_str()
        )
    }
}

/// 广播给候选Worker的任务通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastMessage {
    pub task_id: String,
    pub version: String,
    pub tenant_id: String,
    pub is_async: bool,
    pub pre_assigned_worker_id: Option<String>,
    #[serde(default)]
    pub already_tried: Vec<String>,
    pub broadcast_count: i32,
}

impl BroadcastMessage {
    /// 由任务当前状态构造广播记录
    ///
    /// 已经拒绝过的Worker不会再作为预分配候选出现。
    pub fn from_task(task: &Task) -> Self {
        let pre_assigned_worker_id = task
            .pre_assigned_worker_id
            .clone()
            .filter(|id| !task.has_tried(id));
        Self {
            task_id: task.id.clone(),
            version: task.version.clone(),
            tenant_id: task.tenant_id.clone(),
            is_async: task.is_async(),
            pre_assigned_worker_id,
            already_tried: task.already_tried.clone(),
            broadcast_count: task.broadcast_count,
        }
    }

    /// Worker收到广播后判断是否应当响应
    pub fn is_offered_to(&self, worker_id: &str) -> bool {
        if self.already_tried.iter().any(|id| id == worker_id) {
            return false;
        }
        match &self.pre_assigned_worker_id {
            Some(pre) => pre == worker_id,
            None => true,
        }
    }
}
