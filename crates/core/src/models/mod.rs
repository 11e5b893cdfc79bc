//! # 数据模型
//!
//! 分发与准入控制的核心数据结构。
//!
//! - [`Task`] / [`TaskResponse`] / [`TaskPackage`] - 任务、执行结果、交给Worker的任务包
//! - [`Worker`] / [`Connection`] / [`SequenceIdentity`] - Worker注册信息、在线会话、序号身份
//! - [`SelectionLogBatch`] / [`ConnectionResult`] - 选择审计日志与连通性历史
//! - [`BroadcastChannel`] / [`BroadcastMessage`] - 广播通道与通知
//! - [`Constraint`] / [`ConstraintInstance`] - 容量约束与许可申请
//!
//! ## 任务状态流转
//! ```text
//! QUEUED → STARTED → FINISHED
//!   ↓         ↓
//! ERROR     ERROR / ABORTED
//! ```
//!
//! 所有时间字段使用 `DateTime<Utc>`，持久化时存为毫秒时间戳。

pub mod constraint;
pub mod message;
pub mod selection_log;
pub mod task;
pub mod worker;

pub use constraint::*;
pub use message::*;
pub use selection_log::*;
pub use task::*;
pub use worker::*;
