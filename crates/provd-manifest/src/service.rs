//! Manifest service: routes uploads and lease events to per-deployment
//! managers.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use provd_chain::Session;
use provd_pubsub::{Bus, Subscriber};
use provd_types::{DeploymentId, Event, Manifest};

use crate::manager::{Manager, ManagerCmd, ManagerHandle};
use crate::ManifestError;

const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Manifest layer tuning.
#[derive(Debug, Clone)]
pub struct ManifestConfig {
    /// How long an idle manager lingers before stopping itself.
    pub linger: Duration,
    /// Default deadline applied to submissions without one.
    pub submit_timeout: Duration,
    /// Require at least one hostname on every HTTP-exposed service.
    pub require_hostnames_for_http: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_secs(2 * 60),
            submit_timeout: Duration::from_secs(30),
            require_hostnames_for_http: true,
        }
    }
}

/// Counters for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestStatus {
    pub managers: usize,
}

enum Cmd {
    Submit {
        deployment_id: DeploymentId,
        manifest: Manifest,
        reply: oneshot::Sender<Result<(), ManifestError>>,
    },
    Status {
        reply: oneshot::Sender<ManifestStatus>,
    },
}

/// Handle to the manifest service task. Cheap to clone.
#[derive(Clone)]
pub struct ManifestService {
    cmd_tx: mpsc::Sender<Cmd>,
    config: ManifestConfig,
}

impl ManifestService {
    /// Spawn the service. Existing active leases are fetched so that
    /// manifests re-submitted after a restart still find their
    /// deployment.
    pub async fn spawn(
        session: Session,
        bus: Bus,
        config: ManifestConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>), ManifestError> {
        let existing = session
            .query()
            .provider_leases(session.provider_address())
            .await?;
        let sub = bus.subscribe().await.map_err(|_| ManifestError::NotRunning)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let mut task = Task {
            session,
            bus,
            config: config.clone(),
            sub,
            cmd_rx,
            shutdown,
            managers: HashMap::new(),
        };
        for lease in existing {
            task.route(lease.id.deployment_id(), ManagerCmd::AddLease(lease.id.clone()))
                .await;
        }
        info!(managers = task.managers.len(), "manifest service starting");
        let handle = tokio::spawn(task.run());
        Ok((Self { cmd_tx, config }, handle))
    }

    /// Submit a manifest for a deployment. Blocks until validation
    /// completes or `deadline` expires.
    pub async fn submit(
        &self,
        deployment_id: DeploymentId,
        manifest: Manifest,
        deadline: Option<Duration>,
    ) -> Result<(), ManifestError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Submit {
                deployment_id,
                manifest,
                reply,
            })
            .await
            .map_err(|_| ManifestError::NotRunning)?;
        let deadline = deadline.unwrap_or(self.config.submit_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ManifestError::NotRunning),
            Err(_) => Err(ManifestError::DeadlineExceeded),
        }
    }

    pub async fn status(&self) -> Result<ManifestStatus, ManifestError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Status { reply })
            .await
            .map_err(|_| ManifestError::NotRunning)?;
        rx.await.map_err(|_| ManifestError::NotRunning)
    }
}

struct Task {
    session: Session,
    bus: Bus,
    config: ManifestConfig,
    sub: Subscriber,
    cmd_rx: mpsc::Receiver<Cmd>,
    shutdown: watch::Receiver<bool>,
    managers: HashMap<DeploymentId, ManagerHandle>,
}

impl Task {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Cmd::Submit { deployment_id, manifest, reply } => {
                            // Fail fast when nothing has been won for
                            // this deployment.
                            match self.managers.get(&deployment_id) {
                                Some(m) if !m.handle.is_finished() => {
                                    let _ = m
                                        .cmd_tx
                                        .send(ManagerCmd::Submit { manifest, reply })
                                        .await;
                                }
                                _ => {
                                    let _ = reply.send(Err(
                                        ManifestError::NoLeaseForDeployment(deployment_id),
                                    ));
                                }
                            }
                        }
                        Cmd::Status { reply } => {
                            let live = self
                                .managers
                                .values()
                                .filter(|m| !m.handle.is_finished())
                                .count();
                            let _ = reply.send(ManifestStatus { managers: live });
                        }
                    }
                }

                ev = self.sub.recv() => {
                    let Some(ev) = ev else { break };
                    match ev {
                        Event::LeaseWon { lease_id, .. } => {
                            self.route(
                                lease_id.deployment_id(),
                                ManagerCmd::AddLease(lease_id),
                            )
                            .await;
                        }
                        Event::LeaseClosed { lease_id } => {
                            let deployment_id = lease_id.deployment_id();
                            if let Some(m) = self.managers.get(&deployment_id) {
                                let _ = m
                                    .cmd_tx
                                    .send(ManagerCmd::RemoveLease(lease_id))
                                    .await;
                            }
                        }
                        _ => {}
                    }
                }

                _ = sweep.tick() => {
                    self.managers.retain(|_, m| !m.handle.is_finished());
                }
            }
        }

        for (_, manager) in self.managers.drain() {
            drop(manager.cmd_tx);
            let _ = manager.handle.await;
        }
        info!("manifest service stopped");
    }

    /// Send a command to the deployment's manager, creating it first
    /// if needed.
    async fn route(&mut self, deployment_id: DeploymentId, cmd: ManagerCmd) {
        let needs_spawn = match self.managers.get(&deployment_id) {
            Some(m) => m.handle.is_finished(),
            None => true,
        };
        if needs_spawn {
            let manager = Manager::spawn(
                deployment_id.clone(),
                self.session.clone(),
                self.bus.clone(),
                self.config.clone(),
                self.shutdown.clone(),
            );
            self.managers.insert(deployment_id.clone(), manager);
        }
        if let Some(m) = self.managers.get(&deployment_id) {
            if m.cmd_tx.send(cmd).await.is_err() {
                warn!(%deployment_id, "manifest manager unreachable");
            }
        }
    }
}
