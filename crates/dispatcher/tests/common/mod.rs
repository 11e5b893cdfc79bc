#![allow(dead_code)]

use std::sync::Arc;

use dispatch_core::config::AppConfig;
use dispatch_core::models::{HeartbeatRequest, Task, TaskData, Worker};
use dispatch_core::StaticFeatureFlags;
use dispatch_dispatcher::{DispatchEngine, DispatchEngineBuilder};
use dispatch_infrastructure::{InMemoryBroadcastBus, InMemoryReleaseEntityRegistry, Repositories};
use serde_json::json;

pub const TENANT: &str = "tenant-1";

/// 全内存的测试环境
pub struct Harness {
    pub engine: DispatchEngine,
    pub bus: InMemoryBroadcastBus,
    pub flags: Arc<StaticFeatureFlags>,
    pub registry: InMemoryReleaseEntityRegistry,
    pub config: AppConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let bus = InMemoryBroadcastBus::new(64);
        let flags = Arc::new(StaticFeatureFlags::new());
        let registry = InMemoryReleaseEntityRegistry::new();
        let engine = DispatchEngineBuilder::new(
            config.clone(),
            Repositories::in_memory(),
            Arc::new(bus.clone()),
            flags.clone(),
            Arc::new(registry.clone()),
        )
        .build();
        Self {
            engine,
            bus,
            flags,
            registry,
            config,
        }
    }

    pub fn repos(&self) -> &Repositories {
        &self.engine.repositories
    }

    /// 通过心跳注册一个在线Worker
    pub async fn register_worker(&self, prefix: &str, tags: &[&str]) -> Worker {
        let request = HeartbeatRequest {
            tenant_id: TENANT.to_string(),
            hostname_prefix: prefix.to_string(),
            token: Some(uuid::Uuid::new_v4().to_string()),
            ip_address: "10.0.0.8".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        self.engine
            .identity
            .reconcile(&request)
            .await
            .expect("register worker")
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.dispatcher.broadcast_jitter_factor = 0.0;
    config
}

pub fn shell_task() -> Task {
    Task::new(
        TENANT,
        "default",
        TaskData {
            task_type: "shell".to_string(),
            parameters: json!({"command": "echo hi"}),
            timeout_ms: 60_000,
            is_async: false,
        },
    )
}
