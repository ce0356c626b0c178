//! Manifest ingestion endpoint.
//!
//! A small hyper HTTP/1.1 server accepting
//! `PUT /deployment/{owner}/{dseq}/manifest` with a JSON manifest body,
//! routed to the manifest service's submit.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use provd_manifest::{ManifestError, ManifestService};
use provd_types::{DeploymentId, Manifest};

pub struct ManifestIngest {
    bind_addr: SocketAddr,
    manifests: ManifestService,
}

impl ManifestIngest {
    pub fn new(bind_addr: SocketAddr, manifests: ManifestService) -> Self {
        Self {
            bind_addr,
            manifests,
        }
    }

    /// Bind and serve until shutdown. Spawns a task per connection.
    pub async fn serve(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "manifest ingest listening");

        let manifests = self.manifests;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer_addr) = match accepted {
                            Ok(conn) => conn,
                            Err(err) => {
                                warn!(%err, "accept failed");
                                continue;
                            }
                        };
                        let manifests = manifests.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let svc = service_fn(move |req: Request<Incoming>| {
                                let manifests = manifests.clone();
                                async move { handle(req, manifests).await }
                            });
                            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                                error!(%peer_addr, %err, "connection error");
                            }
                        });
                    }
                    _ = shutdown.changed() => {
                        info!("manifest ingest shutting down");
                        break;
                    }
                }
            }
        }))
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

async fn handle(
    req: Request<Incoming>,
    manifests: ManifestService,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let Some(deployment_id) = parse_path(&path) else {
        return Ok(plain(StatusCode::NOT_FOUND, "not found"));
    };
    if req.method() != Method::PUT && req.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "use PUT or POST"));
    }

    let body = req.into_body().collect().await?.to_bytes();
    let manifest: Manifest = match serde_json::from_slice(&body) {
        Ok(manifest) => manifest,
        Err(err) => {
            return Ok(plain(
                StatusCode::BAD_REQUEST,
                &format!("invalid manifest: {err}"),
            ));
        }
    };

    match manifests.submit(deployment_id, manifest, None).await {
        Ok(()) => Ok(plain(StatusCode::OK, "manifest accepted")),
        Err(err) => {
            let status = match &err {
                ManifestError::NoLeaseForDeployment(_) => StatusCode::NOT_FOUND,
                ManifestError::ManifestVersion
                | ManifestError::Validation(_)
                | ManifestError::MissingHostname(_)
                | ManifestError::Superseded => StatusCode::UNPROCESSABLE_ENTITY,
                ManifestError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
                ManifestError::Chain(_) | ManifestError::NotRunning => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            Ok(plain(status, &err.to_string()))
        }
    }
}

/// `/deployment/{owner}/{dseq}/manifest`
fn parse_path(path: &str) -> Option<DeploymentId> {
    let mut parts = path.trim_matches('/').split('/');
    if parts.next() != Some("deployment") {
        return None;
    }
    let owner = parts.next()?.to_string();
    let dseq: u64 = parts.next()?.parse().ok()?;
    if parts.next() != Some("manifest") || parts.next().is_some() {
        return None;
    }
    Some(DeploymentId { owner, dseq })
}

fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        assert_eq!(
            parse_path("/deployment/tenant1/42/manifest"),
            Some(DeploymentId {
                owner: "tenant1".to_string(),
                dseq: 42,
            })
        );
        assert_eq!(parse_path("/deployment/tenant1/42"), None);
        assert_eq!(parse_path("/deployment/tenant1/notanumber/manifest"), None);
        assert_eq!(parse_path("/status"), None);
        assert_eq!(parse_path("/deployment/tenant1/42/manifest/extra"), None);
    }
}
