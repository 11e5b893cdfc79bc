pub mod api_observability;
pub mod app_config;
pub mod broadcast;
pub mod database;
pub mod dispatcher_worker;
pub mod feature_flags;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use broadcast::{BroadcastBackend, BroadcastConfig};
pub use database::DatabaseConfig;
pub use dispatcher_worker::{AdmissionConfig, DispatcherConfig, IdentityConfig, WorkerConfig};
pub use feature_flags::{FeatureFlagsConfig, FlagRule};
