//! 分发引擎的存储与传输实现
//!
//! - `memory`: 内存仓储
//! - `database`: SQLite 仓储（`sqlx`）
//! - `broadcast`: 进程内与 Redis 发布/订阅广播

pub mod broadcast;
pub mod database;
pub mod memory;
pub mod release_entity;
pub mod repositories;

pub use broadcast::{InMemoryBroadcastBus, RedisBroadcast};
pub use database::DatabaseManager;
pub use release_entity::InMemoryReleaseEntityRegistry;
pub use repositories::Repositories;
