//! 分发系统核心库：错误类型、配置、领域模型、仓储与端口接口、功能开关上下文。

pub mod config;
pub mod errors;
pub mod flags;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::{DispatchError, DispatchResult};
pub use flags::{DecisionContext, FeatureFlag, FeatureFlagProvider, StaticFeatureFlags};
