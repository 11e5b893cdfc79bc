use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 命名容量资源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub capacity: i32,
    pub strategy: ConstraintStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Constraint {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, capacity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            capacity,
            strategy: ConstraintStrategy::Fifo,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConstraintStrategy {
    #[serde(rename = "FIFO")]
    Fifo,
}

impl ConstraintStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintStrategy::Fifo => "FIFO",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "ACTIVE")]
    Active,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Blocked => "BLOCKED",
            InstanceState::Active => "ACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BLOCKED" => Some(InstanceState::Blocked),
            "ACTIVE" => Some(InstanceState::Active),
            _ => None,
        }
    }
}

/// 持有许可的上层执行实体（工作流/流水线执行）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReleaseEntity {
    pub id: String,
    pub entity_type: String,
}

impl ReleaseEntity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
        }
    }
}

/// 针对某个约束的一次许可申请
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintInstance {
    pub id: String,
    pub constraint_id: String,
    pub resource_unit: String,
    pub release_entity: ReleaseEntity,
    pub permits: i32,
    pub state: InstanceState,
    /// 到达顺序，FIFO提升依据
    pub order: i64,
    pub acquired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConstraintInstance {
    pub fn is_active(&self) -> bool {
        self.state == InstanceState::Active
    }
}

/// 同一 `(constraint, resource_unit)` 下ACTIVE实例占用的许可总数
pub fn active_permits(instances: &[ConstraintInstance]) -> i32 {
    instances
        .iter()
        .filter(|i| i.is_active())
        .map(|i| i.permits)
        .sum()
}

/// 先进先出准入策略
///
/// 所有函数都只针对同一 `(constraint, resource_unit)` 的实例集合。
pub struct FifoStrategy;

impl FifoStrategy {
    /// 新申请能否立即生效：前面没有排队者且剩余容量足够
    pub fn admits(capacity: i32, instances: &[ConstraintInstance], permits: i32) -> bool {
        let has_waiters = instances.iter().any(|i| !i.is_active());
        !has_waiters && active_permits(instances) + permits <= capacity
    }

    /// 按到达顺序计算可以提升为ACTIVE的BLOCKED实例
    ///
    /// 队首放不下时停止，不允许后来的小申请插队。
    pub fn promotable(capacity: i32, instances: &[ConstraintInstance]) -> Vec<String> {
        let mut blocked: Vec<&ConstraintInstance> =
            instances.iter().filter(|i| !i.is_active()).collect();
        blocked.sort_by_key(|i| i.order);

        let mut used = active_permits(instances);
        let mut promoted = Vec::new();
        for instance in blocked {
            if used + instance.permits > capacity {
                break;
            }
            used += instance.permits;
            promoted.push(instance.id.clone());
        }
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, permits: i32, state: InstanceState, order: i64) -> ConstraintInstance {
        ConstraintInstance {
            id: id.to_string(),
            constraint_id: "c1".to_string(),
            resource_unit: "infra-1".to_string(),
            release_entity: ReleaseEntity::new(format!("exec-{id}"), "WORKFLOW"),
            permits,
            state,
            order,
            acquired_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_admits_when_capacity_available() {
        let instances = vec![instance("a", 1, InstanceState::Active, 1)];
        assert!(FifoStrategy::admits(2, &instances, 1));
        assert!(!FifoStrategy::admits(2, &instances, 2));
    }

    #[test]
    fn test_does_not_admit_past_waiters() {
        let instances = vec![
            instance("a", 1, InstanceState::Active, 1),
            instance("b", 2, InstanceState::Blocked, 2),
        ];
        // 容量还剩1，但队列里有人等待，新申请必须排队
        assert!(!FifoStrategy::admits(2, &instances, 1));
    }

    #[test]
    fn test_promotable_in_arrival_order() {
        let instances = vec![
            instance("c", 1, InstanceState::Blocked, 3),
            instance("b", 1, InstanceState::Blocked, 2),
        ];
        assert_eq!(FifoStrategy::promotable(1, &instances), vec!["b".to_string()]);
        assert_eq!(
            FifoStrategy::promotable(2, &instances),
            vec!["b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_promotable_stops_at_head_that_does_not_fit() {
        let instances = vec![
            instance("a", 1, InstanceState::Active, 1),
            instance("b", 3, InstanceState::Blocked, 2),
            instance("c", 1, InstanceState::Blocked, 3),
        ];
        assert!(FifoStrategy::promotable(3, &instances).is_empty());
    }
}
