use std::sync::Arc;

use dispatch_core::config::AppConfig;
use dispatch_core::traits::{BroadcastPublisher, ReleaseEntityStatusLookup};
use dispatch_core::FeatureFlagProvider;
use dispatch_infrastructure::Repositories;

use crate::acquisition::AcquisitionService;
use crate::admission::AdmissionController;
use crate::broadcast::BroadcastDispatcher;
use crate::correlator::ResponseCorrelator;
use crate::eligibility::{CapabilityProbe, ConnectionHistoryProbe};
use crate::identity::WorkerIdentityReconciler;
use crate::maintenance::MaintenanceService;
use crate::selection_log::SelectionAuditLog;
use crate::submission::TaskSubmissionService;

/// 分发引擎的组装根
#[derive(Clone)]
pub struct DispatchEngine {
    pub repositories: Repositories,
    pub submission: Arc<TaskSubmissionService>,
    pub acquisition: Arc<AcquisitionService>,
    pub identity: Arc<WorkerIdentityReconciler>,
    pub admission: Arc<AdmissionController>,
    pub correlator: Arc<ResponseCorrelator>,
    pub audit: Arc<SelectionAuditLog>,
    pub broadcaster: Arc<BroadcastDispatcher>,
    pub maintenance: Arc<MaintenanceService>,
}

pub struct DispatchEngineBuilder {
    config: AppConfig,
    repositories: Repositories,
    publisher: Arc<dyn BroadcastPublisher>,
    flags: Arc<dyn FeatureFlagProvider>,
    lookup: Arc<dyn ReleaseEntityStatusLookup>,
    probe: Option<Arc<dyn CapabilityProbe>>,
    correlator: Option<Arc<ResponseCorrelator>>,
}

impl DispatchEngineBuilder {
    pub fn new(
        config: AppConfig,
        repositories: Repositories,
        publisher: Arc<dyn BroadcastPublisher>,
        flags: Arc<dyn FeatureFlagProvider>,
        lookup: Arc<dyn ReleaseEntityStatusLookup>,
    ) -> Self {
        Self {
            config,
            repositories,
            publisher,
            flags,
            lookup,
            probe: None,
            correlator: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_correlator(mut self, correlator: Arc<ResponseCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn build(self) -> DispatchEngine {
        let repos = self.repositories;
        let dispatcher_config = self.config.dispatcher.clone();

        let correlator = self
            .correlator
            .unwrap_or_else(|| Arc::new(ResponseCorrelator::default()));
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(ConnectionHistoryProbe::new(repos.connection_results.clone()))
        });
        let audit = Arc::new(SelectionAuditLog::new(repos.selection_logs.clone()));
        let broadcaster = Arc::new(BroadcastDispatcher::new(
            repos.tasks.clone(),
            self.publisher,
            dispatcher_config.clone(),
        ));
        let identity = Arc::new(WorkerIdentityReconciler::new(
            repos.workers.clone(),
            repos.connections.clone(),
            repos.sequences.clone(),
            self.config.identity.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            repos.constraints.clone(),
            self.lookup,
            self.flags.clone(),
            self.config.admission.clone(),
        ));
        let submission = Arc::new(TaskSubmissionService::new(
            repos.tasks.clone(),
            repos.connection_results.clone(),
            identity.clone(),
            broadcaster.clone(),
            audit.clone(),
            correlator.clone(),
            self.flags.clone(),
            probe,
            dispatcher_config.clone(),
        ));
        let acquisition = Arc::new(AcquisitionService::new(
            repos.tasks.clone(),
            repos.workers.clone(),
            repos.connection_results.clone(),
            identity.clone(),
            broadcaster.clone(),
            audit.clone(),
            correlator.clone(),
            self.flags,
            dispatcher_config.clone(),
        ));
        let maintenance = Arc::new(MaintenanceService::new(
            repos.tasks.clone(),
            broadcaster.clone(),
            audit.clone(),
            correlator.clone(),
            identity.clone(),
            admission.clone(),
            dispatcher_config,
            self.config.admission.clone(),
        ));

        DispatchEngine {
            repositories: repos,
            submission,
            acquisition,
            identity,
            admission,
            correlator,
            audit,
            broadcaster,
            maintenance,
        }
    }
}
