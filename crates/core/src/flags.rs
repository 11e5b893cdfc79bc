//! 功能开关与决策上下文
//!
//! 开关只在服务边界查询一次，结果放进 [`DecisionContext`] 按值传入决策函数，
//! 决策函数本身不访问开关服务。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::{DispatcherConfig, FeatureFlagsConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFlag {
    /// 白名单Worker也要重新验证连通性
    RevalidateWhitelistedWorkers,
    /// 允许清理已终止执行实体遗留的约束实例
    ConstraintGarbageCollection,
}

impl FeatureFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFlag::RevalidateWhitelistedWorkers => "revalidate_whitelisted_workers",
            FeatureFlag::ConstraintGarbageCollection => "constraint_garbage_collection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "revalidate_whitelisted_workers" => Some(FeatureFlag::RevalidateWhitelistedWorkers),
            "constraint_garbage_collection" => Some(FeatureFlag::ConstraintGarbageCollection),
            _ => None,
        }
    }
}

/// 外部功能开关服务
#[async_trait]
pub trait FeatureFlagProvider: Send + Sync {
    async fn is_enabled(&self, flag: FeatureFlag, tenant_id: &str) -> bool;

    /// 不区分租户的全局开关
    async fn is_globally_enabled(&self, flag: FeatureFlag) -> bool;
}

#[derive(Debug, Default)]
struct FlagState {
    global: bool,
    tenants: HashSet<String>,
}

/// 基于配置的开关实现，运行时可调整
#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    flags: RwLock<HashMap<FeatureFlag, FlagState>>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &FeatureFlagsConfig) -> Self {
        let flags = config
            .flags
            .iter()
            .filter_map(|(name, rule)| {
                FeatureFlag::parse(name).map(|flag| {
                    (
                        flag,
                        FlagState {
                            global: rule.enabled,
                            tenants: rule.tenants.iter().cloned().collect(),
                        },
                    )
                })
            })
            .collect();
        Self {
            flags: RwLock::new(flags),
        }
    }

    pub fn enable_globally(&self, flag: FeatureFlag) {
        if let Ok(mut flags) = self.flags.write() {
            flags.entry(flag).or_default().global = true;
        }
    }

    pub fn enable_for(&self, flag: FeatureFlag, tenant_id: &str) {
        if let Ok(mut flags) = self.flags.write() {
            flags
                .entry(flag)
                .or_default()
                .tenants
                .insert(tenant_id.to_string());
        }
    }

    pub fn disable(&self, flag: FeatureFlag) {
        if let Ok(mut flags) = self.flags.write() {
            flags.remove(&flag);
        }
    }

    fn check(&self, flag: FeatureFlag, tenant_id: Option<&str>) -> bool {
        let Ok(flags) = self.flags.read() else {
            return false;
        };
        match flags.get(&flag) {
            Some(state) => {
                state.global || tenant_id.map(|t| state.tenants.contains(t)).unwrap_or(false)
            }
            None => false,
        }
    }
}

#[async_trait]
impl FeatureFlagProvider for StaticFeatureFlags {
    async fn is_enabled(&self, flag: FeatureFlag, tenant_id: &str) -> bool {
        self.check(flag, Some(tenant_id))
    }

    async fn is_globally_enabled(&self, flag: FeatureFlag) -> bool {
        self.check(flag, None)
    }
}

/// 单次决策所需的全部外部输入
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionContext {
    pub revalidate_whitelisted: bool,
    pub whitelist_ttl: Duration,
    pub blacklist_ttl: Duration,
    pub now: DateTime<Utc>,
}

impl DecisionContext {
    pub fn new(config: &DispatcherConfig, now: DateTime<Utc>) -> Self {
        Self {
            revalidate_whitelisted: false,
            whitelist_ttl: Duration::seconds(config.whitelist_ttl_seconds),
            blacklist_ttl: Duration::seconds(config.blacklist_ttl_seconds),
            now,
        }
    }

    pub fn with_revalidation(mut self, enabled: bool) -> Self {
        self.revalidate_whitelisted = enabled;
        self
    }

    /// 在服务边界为某个租户查询开关并构造上下文
    pub async fn resolve(
        flags: &dyn FeatureFlagProvider,
        config: &DispatcherConfig,
        tenant_id: &str,
    ) -> Self {
        let revalidate = flags
            .is_enabled(FeatureFlag::RevalidateWhitelistedWorkers, tenant_id)
            .await;
        Self::new(config, Utc::now()).with_revalidation(revalidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlagRule;

    #[tokio::test]
    async fn test_static_flags_per_tenant() {
        let flags = StaticFeatureFlags::new();
        flags.enable_for(FeatureFlag::RevalidateWhitelistedWorkers, "tenant-a");

        assert!(
            flags
                .is_enabled(FeatureFlag::RevalidateWhitelistedWorkers, "tenant-a")
                .await
        );
        assert!(
            !flags
                .is_enabled(FeatureFlag::RevalidateWhitelistedWorkers, "tenant-b")
                .await
        );
        assert!(
            !flags
                .is_globally_enabled(FeatureFlag::RevalidateWhitelistedWorkers)
                .await
        );
    }

    #[tokio::test]
    async fn test_from_config_and_disable() {
        let mut config = FeatureFlagsConfig::default();
        config.flags.insert(
            "constraint_garbage_collection".to_string(),
            FlagRule {
                enabled: true,
                tenants: vec![],
            },
        );
        let flags = StaticFeatureFlags::from_config(&config);
        assert!(
            flags
                .is_enabled(FeatureFlag::ConstraintGarbageCollection, "any")
                .await
        );

        flags.disable(FeatureFlag::ConstraintGarbageCollection);
        assert!(
            !flags
                .is_globally_enabled(FeatureFlag::ConstraintGarbageCollection)
                .await
        );
    }

    #[tokio::test]
    async fn test_resolve_context() {
        let flags = StaticFeatureFlags::new();
        let config = DispatcherConfig::default();
        let ctx = DecisionContext::resolve(&flags, &config, "t").await;
        assert!(!ctx.revalidate_whitelisted);
        assert_eq!(ctx.whitelist_ttl, Duration::hours(6));

        flags.enable_globally(FeatureFlag::RevalidateWhitelistedWorkers);
        let ctx = DecisionContext::resolve(&flags, &config, "t").await;
        assert!(ctx.revalidate_whitelisted);
    }

    #[test]
    fn test_flag_names_parse() {
        for flag in [
            FeatureFlag::RevalidateWhitelistedWorkers,
            FeatureFlag::ConstraintGarbageCollection,
        ] {
            assert_eq!(FeatureFlag::parse(flag.as_str()), Some(flag));
        }
    }
}
