//! 内存仓储实现，用于单机运行和测试

pub mod constraint;
pub mod selection;
pub mod task;
pub mod worker;

pub use constraint::InMemoryConstraintRepository;
pub use selection::{InMemoryConnectionResultRepository, InMemorySelectionLogRepository};
pub use task::InMemoryTaskRepository;
pub use worker::{
    InMemoryConnectionRepository, InMemorySequenceRepository, InMemoryWorkerRepository,
};
