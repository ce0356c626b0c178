//! Per-deployment manifest aggregation.
//!
//! A manager pairs three inputs that arrive in any order: a manifest
//! upload, won leases for the deployment, and the deployment record
//! fetched from chain. Validation runs once all three are present; a
//! validated manifest is fanned out as one manifest-received event per
//! won lease. A manager left with no leases and no pending upload
//! stops itself after the configured linger.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use provd_chain::{ChainError, DeploymentInfo, Session};
use provd_pubsub::Bus;
use provd_types::{manifest_version, DeploymentId, Event, LeaseId, Manifest};

use crate::service::ManifestConfig;
use crate::ManifestError;

pub(crate) enum ManagerCmd {
    AddLease(LeaseId),
    RemoveLease(LeaseId),
    Submit {
        manifest: Manifest,
        reply: oneshot::Sender<Result<(), ManifestError>>,
    },
}

pub(crate) struct ManagerHandle {
    pub(crate) cmd_tx: mpsc::Sender<ManagerCmd>,
    pub(crate) handle: JoinHandle<()>,
}

pub(crate) struct Manager {
    deployment_id: DeploymentId,
    session: Session,
    bus: Bus,
    config: ManifestConfig,
    cmd_rx: mpsc::Receiver<ManagerCmd>,
    shutdown: watch::Receiver<bool>,
    leases: Vec<LeaseId>,
    pending: Option<(Manifest, oneshot::Sender<Result<(), ManifestError>>)>,
    data: Option<DeploymentInfo>,
}

impl Manager {
    pub(crate) fn spawn(
        deployment_id: DeploymentId,
        session: Session,
        bus: Bus,
        config: ManifestConfig,
        shutdown: watch::Receiver<bool>,
    ) -> ManagerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let manager = Self {
            deployment_id,
            session,
            bus,
            config,
            cmd_rx,
            shutdown,
            leases: Vec::new(),
            pending: None,
            data: None,
        };
        ManagerHandle {
            cmd_tx,
            handle: tokio::spawn(manager.run()),
        }
    }

    async fn run(mut self) {
        debug!(deployment_id = %self.deployment_id, "manifest manager starting");

        let mut fetch: Option<JoinHandle<Result<DeploymentInfo, ChainError>>> = None;
        let mut idle_since = Instant::now();

        loop {
            let linger_deadline = idle_since + self.config.linger;
            tokio::select! {
                _ = self.shutdown.changed() => break,

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        ManagerCmd::AddLease(lease_id) => {
                            if !self.leases.contains(&lease_id) {
                                debug!(%lease_id, "lease registered");
                                self.leases.push(lease_id);
                            }
                        }
                        ManagerCmd::RemoveLease(lease_id) => {
                            self.leases.retain(|l| *l != lease_id);
                            if self.leases.is_empty() && self.pending.is_none() {
                                idle_since = Instant::now();
                            }
                        }
                        ManagerCmd::Submit { manifest, reply } => {
                            if let Some((_, old)) = self.pending.take() {
                                let _ = old.send(Err(ManifestError::Superseded));
                            }
                            self.pending = Some((manifest, reply));
                            if self.data.is_none() && fetch.is_none() {
                                fetch = Some(self.spawn_fetch());
                            }
                        }
                    }
                    self.try_complete();
                    if !(self.leases.is_empty() && self.pending.is_none()) {
                        idle_since = Instant::now();
                    }
                }

                res = async { fetch.as_mut().expect("fetch in flight").await }, if fetch.is_some() => {
                    fetch = None;
                    match res {
                        Ok(Ok(data)) => {
                            self.data = Some(data);
                            self.try_complete();
                        }
                        Ok(Err(err)) => {
                            warn!(deployment_id = %self.deployment_id, %err, "deployment fetch failed");
                            if let Some((_, reply)) = self.pending.take() {
                                let _ = reply.send(Err(err.into()));
                            }
                        }
                        Err(err) => {
                            warn!(deployment_id = %self.deployment_id, %err, "deployment fetch panicked");
                        }
                    }
                }

                _ = tokio::time::sleep_until(linger_deadline),
                    if self.leases.is_empty() && self.pending.is_none() =>
                {
                    info!(deployment_id = %self.deployment_id, "idle manifest manager stopping");
                    break;
                }
            }
        }

        if let Some(fetch) = fetch {
            fetch.abort();
        }
        if let Some((_, reply)) = self.pending.take() {
            let _ = reply.send(Err(ManifestError::NotRunning));
        }
        debug!(deployment_id = %self.deployment_id, "manifest manager stopped");
    }

    fn spawn_fetch(&self) -> JoinHandle<Result<DeploymentInfo, ChainError>> {
        let query = self.session.query().clone();
        let id = self.deployment_id.clone();
        tokio::spawn(async move { query.deployment(&id).await })
    }

    /// Validate and fan out once the manifest, at least one lease, and
    /// the deployment record are all present. With no won lease there
    /// is nothing a submission could ever pair with, so it fails
    /// immediately instead of waiting out the caller's deadline.
    fn try_complete(&mut self) {
        if self.leases.is_empty() {
            if let Some((_, reply)) = self.pending.take() {
                info!(deployment_id = %self.deployment_id, "no lease for deployment");
                let _ = reply.send(Err(ManifestError::NoLeaseForDeployment(
                    self.deployment_id.clone(),
                )));
            }
            return;
        }
        if self.data.is_none() {
            return;
        }
        let Some((manifest, reply)) = self.pending.take() else {
            return;
        };
        let Some(data) = self.data.as_ref() else {
            return;
        };

        let result = self.validate(&manifest, data);
        if let Err(err) = &result {
            info!(deployment_id = %self.deployment_id, %err, "manifest rejected");
            let _ = reply.send(result);
            return;
        }

        for lease_id in &self.leases {
            let Some(group_name) = data
                .groups
                .get(lease_id.order.gseq.saturating_sub(1) as usize)
                .map(|g| g.name.clone())
            else {
                warn!(%lease_id, "lease group index out of range");
                continue;
            };
            let Some(group) = manifest.group(&group_name) else {
                warn!(%lease_id, group = %group_name, "manifest has no group for lease");
                continue;
            };
            info!(%lease_id, group = %group_name, "manifest received");
            if let Err(err) = self.bus.publish(Event::ManifestReceived {
                lease_id: lease_id.clone(),
                group: group.clone(),
            }) {
                warn!(%lease_id, %err, "manifest-received publish failed");
            }
        }
        let _ = reply.send(Ok(()));
    }

    fn validate(&self, manifest: &Manifest, data: &DeploymentInfo) -> Result<(), ManifestError> {
        let version = manifest_version(manifest);
        if version != data.version {
            debug!(
                submitted = %hex::encode(&version),
                expected = %hex::encode(&data.version),
                "manifest version mismatch"
            );
            return Err(ManifestError::ManifestVersion);
        }
        manifest.validate()?;
        manifest.validate_with_groups(&data.groups)?;
        if self.config.require_hostnames_for_http {
            for group in &manifest.groups {
                for service in &group.services {
                    let missing = service
                        .expose
                        .iter()
                        .any(|e| e.is_ingress() && e.hosts.is_empty());
                    if missing {
                        return Err(ManifestError::MissingHostname(service.name.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}
