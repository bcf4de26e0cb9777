//! Probes — one liveness check per role, dispatched through a table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use corral_core::{ProbeSpec, RoleCatalog, RoleTag};

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// The probe ran and the service answered wrongly or not at all.
    Failure(String),
    /// The probe did not finish within its deadline.
    Timeout,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Healthy => None,
            Self::Failure(reason) => Some(reason.clone()),
            Self::Timeout => Some("probe timed out".to_string()),
        }
    }
}

/// Liveness check against one member address.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, address: &str) -> ProbeOutcome;
}

/// Healthy when a TCP connection succeeds.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub port: u16,
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let target = format!("{address}:{}", self.port);
        match TcpStream::connect(&target).await {
            Ok(_) => ProbeOutcome::Healthy,
            Err(e) => {
                debug!(%target, error = %e, "tcp probe failed");
                ProbeOutcome::Failure(e.to_string())
            }
        }
    }
}

/// Healthy when `GET path` answers 2xx, or exactly `expect_status`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    pub port: u16,
    pub path: String,
    pub expect_status: Option<u16>,
}

impl HttpProbe {
    fn accepts(&self, status: http::StatusCode) -> bool {
        match self.expect_status {
            Some(code) => status.as_u16() == code,
            None => status.is_success(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        let authority = format!("{address}:{}", self.port);
        let uri = format!("http://{authority}{}", self.path);

        let stream = match TcpStream::connect(&authority).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%uri, error = %e, "http probe connection failed");
                return ProbeOutcome::Failure(e.to_string());
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(%uri, error = %e, "http probe handshake failed");
                return ProbeOutcome::Failure(e.to_string());
            }
        };
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = match http::Request::builder()
            .method(http::Method::GET)
            .uri(&uri)
            .header(http::header::HOST, &authority)
            .header(http::header::USER_AGENT, "corral-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::Failure(e.to_string()),
        };

        match sender.send_request(request).await {
            Ok(resp) if self.accepts(resp.status()) => ProbeOutcome::Healthy,
            Ok(resp) => {
                debug!(%uri, status = %resp.status(), "http probe rejected status");
                ProbeOutcome::Failure(format!("status {}", resp.status()))
            }
            Err(e) => {
                debug!(%uri, error = %e, "http probe request failed");
                ProbeOutcome::Failure(e.to_string())
            }
        }
    }
}

/// Run `probe` with a strict deadline; running out of time is a miss.
pub async fn probe_with_deadline(probe: &dyn Probe, address: &str, deadline: Duration) -> ProbeOutcome {
    match tokio::time::timeout(deadline, probe.probe(address)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Timeout,
    }
}

/// Probe per role, built once from the catalog.
#[derive(Clone, Default)]
pub struct ProbeTable {
    probes: BTreeMap<RoleTag, Arc<dyn Probe>>,
}

impl ProbeTable {
    pub fn from_catalog(catalog: &RoleCatalog) -> Self {
        let mut table = Self::default();
        for def in catalog.roles() {
            let Some(spec) = &def.probe else {
                continue;
            };
            let probe: Arc<dyn Probe> = match spec {
                ProbeSpec::Tcp { port } => Arc::new(TcpProbe { port: *port }),
                ProbeSpec::Http {
                    port,
                    path,
                    expect_status,
                } => Arc::new(HttpProbe {
                    port: *port,
                    path: path.clone(),
                    expect_status: *expect_status,
                }),
            };
            table.probes.insert(def.name.clone(), probe);
        }
        table
    }

    /// Replace the probe for one role.
    pub fn with_probe(mut self, role: &str, probe: Arc<dyn Probe>) -> Self {
        self.probes.insert(RoleTag::new(role), probe);
        self
    }

    pub fn get(&self, role: &RoleTag) -> Option<Arc<dyn Probe>> {
        self.probes.get(role).cloned()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}
