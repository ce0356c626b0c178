//! Per-lease deployment lifecycle.
//!
//! One manager task per won lease. At most one backend operation is in
//! flight at a time; updates and teardown requests that arrive while an
//! operation runs are queued as pending transitions and applied when it
//! completes, never raced against it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use provd_chain::Session;
use provd_pubsub::Bus;
use provd_types::{LeaseId, ManifestGroup};

use crate::client::{ClusterClient, ClusterError};
use crate::config::ClusterConfig;
use crate::hostname::HostnameService;
use crate::monitor::Monitor;

const TEARDOWN_ATTEMPTS: u32 = 4;
const TEARDOWN_BACKOFF_BASE: Duration = Duration::from_millis(100);
const TEARDOWN_BACKOFF_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    DeployActive,
    DeployPending,
    DeployComplete,
    TeardownActive,
    TeardownPending,
    TeardownComplete,
}

enum Cmd {
    Update(ManifestGroup),
    Teardown,
}

/// Handle to one lease's manager task.
pub struct DeploymentManager {
    lease_id: LeaseId,
    cmd_tx: mpsc::Sender<Cmd>,
    handle: JoinHandle<()>,
}

impl DeploymentManager {
    pub fn spawn(
        lease_id: LeaseId,
        group: ManifestGroup,
        client: Arc<dyn ClusterClient>,
        hostnames: HostnameService,
        session: Session,
        bus: Bus,
        config: ClusterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = Task {
            lease_id: lease_id.clone(),
            group,
            client,
            hostnames,
            session,
            bus,
            config,
            shutdown,
            cmd_rx,
            monitor: None,
        };
        Self {
            lease_id,
            cmd_tx,
            handle: tokio::spawn(task.run()),
        }
    }

    pub fn lease_id(&self) -> &LeaseId {
        &self.lease_id
    }

    /// Apply a new manifest group. Queued if a deploy is in flight.
    pub async fn update(&self, group: ManifestGroup) -> Result<(), ClusterError> {
        self.cmd_tx
            .send(Cmd::Update(group))
            .await
            .map_err(|_| ClusterError::NotRunning)
    }

    /// Tear the lease down. Queued if a deploy is in flight.
    pub async fn teardown(&self) -> Result<(), ClusterError> {
        self.cmd_tx
            .send(Cmd::Teardown)
            .await
            .map_err(|_| ClusterError::NotRunning)
    }

    /// Whether the manager task has already exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the manager task to finish.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

struct Task {
    lease_id: LeaseId,
    group: ManifestGroup,
    client: Arc<dyn ClusterClient>,
    hostnames: HostnameService,
    session: Session,
    bus: Bus,
    config: ClusterConfig,
    shutdown: watch::Receiver<bool>,
    cmd_rx: mpsc::Receiver<Cmd>,
    monitor: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl Task {
    async fn run(mut self) {
        info!(lease_id = %self.lease_id, "deployment manager starting");

        let mut state = State::DeployActive;
        let mut pending_group: Option<ManifestGroup> = None;
        let mut op: Option<JoinHandle<Result<(), ClusterError>>> = Some(self.spawn_deploy());

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Cmd::Update(group) => match state {
                            State::DeployActive | State::DeployPending => {
                                debug!(lease_id = %self.lease_id, "update queued behind in-flight deploy");
                                pending_group = Some(group);
                                state = State::DeployPending;
                            }
                            State::DeployComplete => {
                                self.stop_monitor().await;
                                self.group = group;
                                state = State::DeployActive;
                                op = Some(self.spawn_deploy());
                            }
                            _ => {
                                debug!(lease_id = %self.lease_id, "update ignored during teardown");
                            }
                        },
                        Cmd::Teardown => match state {
                            State::DeployActive | State::DeployPending => {
                                debug!(lease_id = %self.lease_id, "teardown queued behind in-flight deploy");
                                pending_group = None;
                                state = State::TeardownPending;
                            }
                            State::DeployComplete => {
                                self.stop_monitor().await;
                                state = State::TeardownActive;
                                op = Some(self.spawn_teardown());
                            }
                            _ => {}
                        },
                    }
                }

                res = async { op.as_mut().expect("op in flight").await }, if op.is_some() => {
                    op = None;
                    let res = match res {
                        Ok(res) => res,
                        Err(err) => {
                            error!(lease_id = %self.lease_id, %err, "operation task panicked");
                            Err(ClusterError::Deploy("operation panicked".to_string()))
                        }
                    };

                    match state {
                        State::DeployActive => match res {
                            Ok(()) => {
                                info!(lease_id = %self.lease_id, "deployment complete");
                                state = State::DeployComplete;
                                self.start_monitor();
                            }
                            // Stay deploy-active; a manifest update
                            // re-enters the deploy.
                            Err(err) => {
                                error!(lease_id = %self.lease_id, %err, "deploy failed");
                            }
                        },
                        State::DeployPending => {
                            if let Err(err) = res {
                                error!(lease_id = %self.lease_id, %err, "deploy failed");
                            }
                            if let Some(group) = pending_group.take() {
                                self.group = group;
                            }
                            state = State::DeployActive;
                            op = Some(self.spawn_deploy());
                        }
                        State::TeardownPending => {
                            if let Err(err) = res {
                                error!(lease_id = %self.lease_id, %err, "deploy failed");
                            }
                            state = State::TeardownActive;
                            op = Some(self.spawn_teardown());
                        }
                        State::TeardownActive => {
                            if let Err(err) = res {
                                error!(lease_id = %self.lease_id, %err, "teardown failed");
                            }
                            state = State::TeardownComplete;
                            break;
                        }
                        State::DeployComplete | State::TeardownComplete => {}
                    }
                }
            }
        }

        self.stop_monitor().await;
        if let Some(op) = op.take() {
            op.abort();
        }

        // Shut down mid-lifecycle: tear the workload down within a
        // bounded grace period so nothing is left running unmanaged.
        if state != State::TeardownComplete && *self.shutdown.borrow() {
            let client = self.client.clone();
            let lease_id = self.lease_id.clone();
            let grace = self.config.teardown_grace_period;
            let result =
                tokio::time::timeout(grace, teardown_with_retry(client, lease_id)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(lease_id = %self.lease_id, %err, "shutdown teardown failed")
                }
                Err(_) => {
                    warn!(lease_id = %self.lease_id, "shutdown teardown exceeded grace period")
                }
            }
        }

        // Claims never outlive the manager.
        if let Err(err) = self.hostnames.release_hostnames(self.lease_id.clone()).await {
            debug!(lease_id = %self.lease_id, %err, "hostname release skipped");
        }
        info!(lease_id = %self.lease_id, "deployment manager stopped");
    }

    fn spawn_deploy(&self) -> JoinHandle<Result<(), ClusterError>> {
        let client = self.client.clone();
        let hostnames = self.hostnames.clone();
        let lease_id = self.lease_id.clone();
        let group = self.group.clone();
        tokio::spawn(async move {
            let wanted = group.all_hostnames();
            if !wanted.is_empty() {
                let withheld = hostnames
                    .reserve_hostnames(wanted, lease_id.clone())
                    .await
                    .map_err(|err| ClusterError::Deploy(err.to_string()))?;
                for hostname in withheld {
                    warn!(%lease_id, %hostname, "hostname withheld pending handover");
                }
            }
            client.deploy(&lease_id, &group).await
        })
    }

    fn spawn_teardown(&self) -> JoinHandle<Result<(), ClusterError>> {
        let client = self.client.clone();
        let lease_id = self.lease_id.clone();
        tokio::spawn(teardown_with_retry(client, lease_id))
    }

    fn start_monitor(&mut self) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Monitor::spawn(
            self.lease_id.clone(),
            self.group.clone(),
            self.client.clone(),
            self.session.clone(),
            self.bus.clone(),
            self.config.clone(),
            stop_rx,
        );
        self.monitor = Some((stop_tx, handle));
    }

    async fn stop_monitor(&mut self) {
        if let Some((stop_tx, handle)) = self.monitor.take() {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
    }
}

async fn teardown_with_retry(
    client: Arc<dyn ClusterClient>,
    lease_id: LeaseId,
) -> Result<(), ClusterError> {
    let mut delay = TEARDOWN_BACKOFF_BASE;
    let mut last = None;
    for attempt in 1..=TEARDOWN_ATTEMPTS {
        match client.teardown_lease(&lease_id).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(%lease_id, attempt, %err, "teardown attempt failed");
                last = Some(err);
            }
        }
        if attempt < TEARDOWN_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(TEARDOWN_BACKOFF_CAP);
        }
    }
    Err(last.unwrap_or_else(|| ClusterError::Teardown("no attempts made".to_string())))
}
