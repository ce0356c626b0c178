//! Hostname claims.
//!
//! Hostnames are a flat, provider-global capacity domain: each name can
//! back exactly one lease's ingress at a time. One task owns the claim
//! map; all access goes over its command channel, so concurrent reserve
//! and release calls never race.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use provd_types::{HostnameId, LeaseId};

/// Hostname service errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostnameError {
    /// Held by a different owner; never transferable.
    #[error("hostname {0} not allowed")]
    HostnameNotAllowed(String),

    #[error("hostname {0} is blocked on this provider")]
    Blocked(String),

    #[error("not running")]
    NotRunning,
}

#[derive(Debug, Clone)]
struct Claim {
    lease_id: LeaseId,
    hostname_id: HostnameId,
}

enum Cmd {
    Reserve {
        hostnames: Vec<String>,
        lease_id: LeaseId,
        reply: oneshot::Sender<Result<Vec<String>, HostnameError>>,
    },
    Release {
        lease_id: LeaseId,
        reply: oneshot::Sender<()>,
    },
    CanReserve {
        hostnames: Vec<String>,
        owner: String,
        reply: oneshot::Sender<Result<(), HostnameError>>,
    },
    PrepareTransfer {
        hostnames: Vec<String>,
        lease_id: LeaseId,
        reply: oneshot::Sender<Result<(), HostnameError>>,
    },
}

/// Handle to the hostname claim task. Cheap to clone.
#[derive(Clone)]
pub struct HostnameService {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl HostnameService {
    pub fn spawn(
        blocked: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = Task {
            cmd_rx,
            shutdown,
            claims: HashMap::new(),
            blocked: blocked.into_iter().map(|h| h.to_lowercase()).collect(),
        };
        let handle = tokio::spawn(task.run());
        (Self { cmd_tx }, handle)
    }

    /// Claim `hostnames` for a lease. Names already held by the same
    /// owner under a different deployment/group are returned as
    /// withheld rather than claimed; the caller coordinates handover
    /// via [`prepare_hostnames_for_transfer`].
    ///
    /// [`prepare_hostnames_for_transfer`]: Self::prepare_hostnames_for_transfer
    pub async fn reserve_hostnames(
        &self,
        hostnames: Vec<String>,
        lease_id: LeaseId,
    ) -> Result<Vec<String>, HostnameError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Reserve {
                hostnames,
                lease_id,
                reply,
            })
            .await
            .map_err(|_| HostnameError::NotRunning)?;
        rx.await.map_err(|_| HostnameError::NotRunning)?
    }

    /// Drop every claim held by `lease_id`.
    pub async fn release_hostnames(&self, lease_id: LeaseId) -> Result<(), HostnameError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Release { lease_id, reply })
            .await
            .map_err(|_| HostnameError::NotRunning)?;
        rx.await.map_err(|_| HostnameError::NotRunning)
    }

    /// Dry run: would `owner` be able to claim all of `hostnames`?
    pub async fn can_reserve_hostnames(
        &self,
        hostnames: Vec<String>,
        owner: String,
    ) -> Result<(), HostnameError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::CanReserve {
                hostnames,
                owner,
                reply,
            })
            .await
            .map_err(|_| HostnameError::NotRunning)?;
        rx.await.map_err(|_| HostnameError::NotRunning)?
    }

    /// Rebind same-owner claims onto `lease_id`, claiming any of the
    /// names not yet held. Used while replacing a deployment so the
    /// successor takes over ingress without an unclaimed window.
    pub async fn prepare_hostnames_for_transfer(
        &self,
        hostnames: Vec<String>,
        lease_id: LeaseId,
    ) -> Result<(), HostnameError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::PrepareTransfer {
                hostnames,
                lease_id,
                reply,
            })
            .await
            .map_err(|_| HostnameError::NotRunning)?;
        rx.await.map_err(|_| HostnameError::NotRunning)?
    }
}

struct Task {
    cmd_rx: mpsc::Receiver<Cmd>,
    shutdown: watch::Receiver<bool>,
    claims: HashMap<String, Claim>,
    blocked: Vec<String>,
}

impl Task {
    async fn run(mut self) {
        info!("hostname service starting");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd);
                }
            }
        }
        debug!("hostname service stopped");
    }

    fn handle(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Reserve {
                hostnames,
                lease_id,
                reply,
            } => {
                let _ = reply.send(self.reserve(hostnames, lease_id));
            }
            Cmd::Release { lease_id, reply } => {
                self.claims.retain(|_, c| c.lease_id != lease_id);
                debug!(%lease_id, "hostname claims released");
                let _ = reply.send(());
            }
            Cmd::CanReserve {
                hostnames,
                owner,
                reply,
            } => {
                let _ = reply.send(self.can_reserve(&hostnames, &owner));
            }
            Cmd::PrepareTransfer {
                hostnames,
                lease_id,
                reply,
            } => {
                let _ = reply.send(self.prepare_transfer(hostnames, lease_id));
            }
        }
    }

    fn check_blocked(&self, hostname: &str) -> Result<(), HostnameError> {
        for entry in &self.blocked {
            let hit = if let Some(suffix) = entry.strip_prefix('.') {
                hostname.ends_with(entry) || hostname == suffix
            } else {
                hostname == entry
            };
            if hit {
                return Err(HostnameError::Blocked(hostname.to_string()));
            }
        }
        Ok(())
    }

    fn reserve(
        &mut self,
        hostnames: Vec<String>,
        lease_id: LeaseId,
    ) -> Result<Vec<String>, HostnameError> {
        let hostname_id = lease_id.hostname_id();
        let hostnames: Vec<String> = hostnames.into_iter().map(|h| h.to_lowercase()).collect();

        // Validate the whole set before mutating anything.
        for hostname in &hostnames {
            self.check_blocked(hostname)?;
            if let Some(claim) = self.claims.get(hostname) {
                if claim.hostname_id.owner != hostname_id.owner {
                    return Err(HostnameError::HostnameNotAllowed(hostname.clone()));
                }
            }
        }

        let mut withheld = Vec::new();
        for hostname in hostnames {
            match self.claims.get(&hostname) {
                // Same owner, different deployment/group: leave the
                // existing claim in place and report it for handover.
                Some(claim) if claim.hostname_id != hostname_id => {
                    debug!(%hostname, holder = %claim.lease_id, "hostname withheld");
                    withheld.push(hostname);
                }
                _ => {
                    self.claims.insert(
                        hostname,
                        Claim {
                            lease_id: lease_id.clone(),
                            hostname_id: hostname_id.clone(),
                        },
                    );
                }
            }
        }
        debug!(%lease_id, withheld = withheld.len(), "hostnames reserved");
        Ok(withheld)
    }

    fn can_reserve(&self, hostnames: &[String], owner: &str) -> Result<(), HostnameError> {
        for hostname in hostnames {
            let hostname = hostname.to_lowercase();
            self.check_blocked(&hostname)?;
            if let Some(claim) = self.claims.get(&hostname) {
                if claim.hostname_id.owner != owner {
                    return Err(HostnameError::HostnameNotAllowed(hostname));
                }
            }
        }
        Ok(())
    }

    fn prepare_transfer(
        &mut self,
        hostnames: Vec<String>,
        lease_id: LeaseId,
    ) -> Result<(), HostnameError> {
        let hostname_id = lease_id.hostname_id();
        let hostnames: Vec<String> = hostnames.into_iter().map(|h| h.to_lowercase()).collect();

        for hostname in &hostnames {
            self.check_blocked(hostname)?;
            if let Some(claim) = self.claims.get(hostname) {
                if claim.hostname_id.owner != hostname_id.owner {
                    return Err(HostnameError::HostnameNotAllowed(hostname.clone()));
                }
            }
        }

        for hostname in hostnames {
            debug!(%hostname, %lease_id, "hostname claim transferred");
            self.claims.insert(
                hostname,
                Claim {
                    lease_id: lease_id.clone(),
                    hostname_id: hostname_id.clone(),
                },
            );
        }
        Ok(())
    }
}
