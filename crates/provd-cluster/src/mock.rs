//! In-memory cluster backend double.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use provd_types::{LeaseId, ManifestGroup};

use crate::client::{
    ActiveDeployment, ClusterClient, ClusterError, LeaseStatus, Node, ServiceStatus,
};

/// Calls observed by the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Deploy(LeaseId),
    Teardown(LeaseId),
}

#[derive(Default)]
struct State {
    nodes: Vec<Node>,
    deployments: Vec<ActiveDeployment>,
    statuses: HashMap<LeaseId, LeaseStatus>,
    calls: Vec<ClusterCall>,
    fail_deploys: bool,
    fail_teardowns: bool,
}

/// Mock compute backend with scripted statuses and call recording.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
    deploy_delay: Option<Duration>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every deploy call, for exercising pending-state queueing.
    pub fn with_deploy_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            deploy_delay: Some(delay),
        }
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.state.lock().unwrap().nodes = nodes;
    }

    pub fn add_active_deployment(&self, lease_id: LeaseId, group: ManifestGroup) {
        self.state
            .lock()
            .unwrap()
            .deployments
            .push(ActiveDeployment { lease_id, group });
    }

    /// Script the status response for a lease: (service name, available,
    /// total) triples.
    pub fn set_lease_status(&self, lease_id: LeaseId, services: &[(&str, u32, u32)]) {
        let status = LeaseStatus {
            services: services
                .iter()
                .map(|(name, available, total)| {
                    (
                        name.to_string(),
                        ServiceStatus {
                            available: *available,
                            total: *total,
                        },
                    )
                })
                .collect(),
        };
        self.state.lock().unwrap().statuses.insert(lease_id, status);
    }

    pub fn fail_deploys(&self, fail: bool) {
        self.state.lock().unwrap().fail_deploys = fail;
    }

    pub fn fail_teardowns(&self, fail: bool) {
        self.state.lock().unwrap().fail_teardowns = fail;
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn deploy(&self, lease: &LeaseId, _group: &ManifestGroup) -> Result<(), ClusterError> {
        if let Some(delay) = self.deploy_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::Deploy(lease.clone()));
        if state.fail_deploys {
            return Err(ClusterError::Deploy("mock deploy failure".to_string()));
        }
        Ok(())
    }

    async fn teardown_lease(&self, lease: &LeaseId) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ClusterCall::Teardown(lease.clone()));
        if state.fail_teardowns {
            return Err(ClusterError::Teardown("mock teardown failure".to_string()));
        }
        Ok(())
    }

    async fn lease_status(&self, lease: &LeaseId) -> Result<LeaseStatus, ClusterError> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(lease)
            .cloned()
            .ok_or_else(|| ClusterError::LeaseNotFound(lease.clone()))
    }

    async fn inventory(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn deployments(&self) -> Result<Vec<ActiveDeployment>, ClusterError> {
        Ok(self.state.lock().unwrap().deployments.clone())
    }
}
