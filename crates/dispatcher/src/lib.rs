//! 任务分发与准入控制服务
//!
//! 资格判定、选择审计、广播、领取、响应关联、Worker身份协调和容量准入，
//! 以及把它们组装在一起的 `DispatchEngine`。

pub mod acquisition;
pub mod admission;
pub mod broadcast;
pub mod correlator;
pub mod eligibility;
pub mod engine;
pub mod identity;
pub mod maintenance;
pub mod selection_log;
pub mod submission;

pub use acquisition::AcquisitionService;
pub use admission::AdmissionController;
pub use broadcast::BroadcastDispatcher;
pub use correlator::{DriverCallbackRegistry, ResponseCorrelator, SyncWaitTable};
pub use eligibility::{CapabilityProbe, ConnectionHistoryProbe, Verdict};
pub use engine::{DispatchEngine, DispatchEngineBuilder};
pub use identity::WorkerIdentityReconciler;
pub use maintenance::{MaintenanceReport, MaintenanceService};
pub use selection_log::SelectionAuditLog;
pub use submission::TaskSubmissionService;
