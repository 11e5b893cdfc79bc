use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch_api::{create_app, AppState};
use dispatch_core::config::BroadcastBackend;
use dispatch_core::traits::BroadcastPublisher;
use dispatch_core::{AppConfig, StaticFeatureFlags};
use dispatch_dispatcher::{DispatchEngine, DispatchEngineBuilder};
use dispatch_infrastructure::{
    DatabaseManager, InMemoryBroadcastBus, InMemoryReleaseEntityRegistry, RedisBroadcast,
    Repositories,
};
use dispatch_worker::{ExecutorRegistry, WorkerAgent};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 分发引擎、HTTP API和维护循环
    Dispatcher,
    /// 仅运行Worker代理
    Worker,
    /// 同一进程内运行全部组件
    All,
}

impl AppMode {
    fn runs_dispatcher(self) -> bool {
        matches!(self, AppMode::Dispatcher | AppMode::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

/// 分发端组件
struct DispatcherParts {
    engine: DispatchEngine,
    release_entities: InMemoryReleaseEntityRegistry,
    metrics: Option<PrometheusHandle>,
    database: DatabaseManager,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    dispatcher: Option<DispatcherParts>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let dispatcher = if mode.runs_dispatcher() && config.dispatcher.enabled {
            Some(build_dispatcher(&config).await?)
        } else {
            None
        };

        Ok(Self {
            config,
            mode,
            dispatcher,
        })
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let mut handles = Vec::new();

        if let Some(parts) = &self.dispatcher {
            let maintenance = parts.engine.maintenance.clone();
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = maintenance.start(rx).await {
                    error!("维护循环运行失败: {}", e);
                }
            }));

            if self.config.api.enabled {
                let listener = TcpListener::bind(&self.config.api.bind_address)
                    .await
                    .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
                let state = AppState {
                    engine: parts.engine.clone(),
                    release_entities: parts.release_entities.clone(),
                    metrics: parts.metrics.clone(),
                    default_timeout_ms: self.config.dispatcher.default_sync_timeout_ms,
                };
                let app = create_app(state, &self.config.api, &self.config.observability);
                info!("API服务器启动在 http://{}", self.config.api.bind_address);

                let mut rx = shutdown_rx.resubscribe();
                handles.push(tokio::spawn(async move {
                    let shutdown = async move {
                        let _ = rx.recv().await;
                        info!("API服务器收到关闭信号");
                    };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        error!("API服务器运行失败: {}", e);
                    }
                }));
            } else {
                warn!("API服务器被禁用，Worker无法连接到本进程");
            }
        }

        if self.mode.runs_worker() && self.config.worker.enabled {
            let executors = ExecutorRegistry::with_builtin(&self.config.worker.supported_task_types)
                .context("装配执行器失败")?;
            let agent = WorkerAgent::new(self.config.worker.clone(), executors)
                .await
                .context("创建Worker代理失败")?;
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = agent.start(rx).await {
                    error!("Worker代理运行失败: {}", e);
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("组件任务异常退出: {}", e);
            }
        }

        info!("所有组件已停止");
        Ok(())
    }

    /// 释放数据库连接
    pub async fn close(&self) {
        if let Some(parts) = &self.dispatcher {
            parts.database.close().await;
            info!("数据库连接已关闭");
        }
    }
}

async fn build_dispatcher(config: &AppConfig) -> Result<DispatcherParts> {
    info!("连接数据库: {}", config.database.url);
    let database = DatabaseManager::new(&config.database)
        .await
        .context("连接数据库失败")?;
    database.migrate().await.context("初始化数据库表结构失败")?;
    let repositories = Repositories::sqlite(&database);

    let publisher: Arc<dyn BroadcastPublisher> = match config.broadcast.backend {
        BroadcastBackend::Memory => {
            Arc::new(InMemoryBroadcastBus::new(config.broadcast.channel_capacity))
        }
        BroadcastBackend::Redis => {
            info!("连接Redis广播通道: {}", config.broadcast.redis_url);
            Arc::new(
                RedisBroadcast::connect(
                    &config.broadcast.redis_url,
                    config.broadcast.channel_capacity,
                )
                .await
                .context("连接Redis失败")?,
            )
        }
    };

    let metrics = if config.observability.metrics_enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("安装Prometheus指标记录器失败")?;
        Some(handle)
    } else {
        None
    };

    let flags = Arc::new(StaticFeatureFlags::from_config(&config.feature_flags));
    let release_entities = InMemoryReleaseEntityRegistry::new();
    let engine = DispatchEngineBuilder::new(
        config.clone(),
        repositories,
        publisher,
        flags,
        Arc::new(release_entities.clone()),
    )
    .build();

    Ok(DispatcherParts {
        engine,
        release_entities,
        metrics,
        database,
    })
}
