pub mod sqlite_constraint_repository;
pub mod sqlite_selection_repository;
pub mod sqlite_sequence_repository;
pub mod sqlite_task_repository;
pub mod sqlite_worker_repository;

pub use sqlite_constraint_repository::SqliteConstraintRepository;
pub use sqlite_selection_repository::{
    SqliteConnectionResultRepository, SqliteSelectionLogRepository,
};
pub use sqlite_sequence_repository::SqliteSequenceRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
pub use sqlite_worker_repository::{SqliteConnectionRepository, SqliteWorkerRepository};
