//! Worker代理
//!
//! 持久化序号身份并定期心跳，轮询领取任务，按需验证能力条件，
//! 通过执行器运行任务并回传结果。

pub mod agent;
pub mod client;
pub mod executors;
pub mod identity;
pub mod probe;

pub use agent::{PollOutcome, WorkerAgent};
pub use client::{DispatcherClient, TaskResultBody};
pub use executors::{ExecutionOutcome, ExecutorRegistry, HttpExecutor, ShellExecutor, TaskExecutor};
pub use identity::{IdentityStore, WorkerIdentity};
