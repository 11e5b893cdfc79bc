use std::sync::Arc;

use dispatch_core::traits::{
    ConnectionRepository, ConnectionResultRepository, ConstraintRepository,
    SelectionLogRepository, SequenceRepository, TaskRepository, WorkerRepository,
};

use crate::database::DatabaseManager;
use crate::memory::{
    InMemoryConnectionRepository, InMemoryConnectionResultRepository,
    InMemoryConstraintRepository, InMemorySelectionLogRepository, InMemorySequenceRepository,
    InMemoryTaskRepository, InMemoryWorkerRepository,
};

/// 服务层用到的全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub sequences: Arc<dyn SequenceRepository>,
    pub selection_logs: Arc<dyn SelectionLogRepository>,
    pub connection_results: Arc<dyn ConnectionResultRepository>,
    pub constraints: Arc<dyn ConstraintRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskRepository::new()),
            workers: Arc::new(InMemoryWorkerRepository::new()),
            connections: Arc::new(InMemoryConnectionRepository::new()),
            sequences: Arc::new(InMemorySequenceRepository::new()),
            selection_logs: Arc::new(InMemorySelectionLogRepository::new()),
            connection_results: Arc::new(InMemoryConnectionResultRepository::new()),
            constraints: Arc::new(InMemoryConstraintRepository::new()),
        }
    }

    pub fn sqlite(manager: &DatabaseManager) -> Self {
        Self {
            tasks: manager.task_repository(),
            workers: manager.worker_repository(),
            connections: manager.connection_repository(),
            sequences: manager.sequence_repository(),
            selection_logs: manager.selection_log_repository(),
            connection_results: manager.connection_result_repository(),
            constraints: manager.constraint_repository(),
        }
    }
}
