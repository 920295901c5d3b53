use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::shutdown::pause;
use crate::types::ContainerIdentity;
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::ContainerInspectResponse;
use bollard::{Docker, API_DEFAULT_VERSION};
use log::{debug, error, info};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Seconds before a single Docker API request gives up.
const REQUEST_TIMEOUT: u64 = 30;

/// Length of the short container id, as shown by `docker ps`.
const SHORT_ID_LEN: usize = 12;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Builds a client for `endpoint` (`unix://`, `tcp://` or `http://`).
    /// No request is made yet.
    pub fn new(endpoint: &str) -> Result<Self, RuntimeError> {
        let docker = if endpoint.starts_with("unix://") {
            Docker::connect_with_unix(endpoint, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
        } else {
            return Err(RuntimeError::Unreachable(format!(
                "unsupported docker endpoint: {endpoint}"
            )));
        };
        let docker = docker.map_err(classify)?;
        Ok(Self { docker })
    }

    /// Connects and pings the daemon, retrying every `backoff` until it
    /// answers. Gives up with the last error when `cancel` fires.
    pub async fn connect(
        endpoint: &str,
        backoff: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, RuntimeError> {
        loop {
            let attempt = match Self::new(endpoint) {
                Ok(runtime) => {
                    let pinged = runtime.ping().await;
                    pinged.map(|()| runtime)
                }
                Err(e) => Err(e),
            };
            match attempt {
                Ok(runtime) => {
                    info!("Connected to Docker at {}", endpoint);
                    return Ok(runtime);
                }
                Err(e) => {
                    error!(
                        "Failed to connect to Docker: {}. Retrying in {}s...",
                        e,
                        backoff.as_secs()
                    );
                    if pause(cancel, backoff).await {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map(|_| ()).map_err(classify)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn running_container_ids(&self) -> Result<Vec<String>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(classify)?;

        let mut ids: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.id)
            .map(|id| id.chars().take(SHORT_ID_LEN).collect())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerIdentity, RuntimeError> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::NotFound(id.to_string()),
                other => classify(other),
            })?;

        let identity = identity_from(&detail);
        debug!(
            "Inspected {}: {} ({}) -> {:?}",
            id, identity.container_name, identity.hostname, identity.address
        );
        Ok(identity)
    }
}

fn classify(err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        other => RuntimeError::Unreachable(other.to_string()),
    }
}

fn identity_from(detail: &ContainerInspectResponse) -> ContainerIdentity {
    let (hostname, domain) = detail
        .config
        .as_ref()
        .map(|c| {
            (
                c.hostname.clone().unwrap_or_default(),
                c.domainname.clone().unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    ContainerIdentity {
        hostname,
        domain,
        container_name: detail
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        address: first_network_address(detail),
    }
}

/// Address on the first attached network. Docker reports networks as a map,
/// so "first" means first by network name; no attempt is made to pick a
/// better network for multi-network containers.
fn first_network_address(detail: &ContainerInspectResponse) -> Option<String> {
    let networks = detail.network_settings.as_ref()?.networks.as_ref()?;
    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();

    let net = networks.get(*names.first()?)?;
    if let Some(ipv4) = &net.ip_address {
        if !ipv4.is_empty() {
            return Some(ipv4.clone());
        }
    }
    if let Some(ipv6) = &net.global_ipv6_address {
        if !ipv6.is_empty() {
            return Some(ipv6.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, EndpointSettings, NetworkSettings};
    use std::collections::HashMap;

    fn detail(networks: &[(&str, &str)]) -> ContainerInspectResponse {
        let networks: HashMap<String, EndpointSettings> = networks
            .iter()
            .map(|(name, ip)| {
                (
                    name.to_string(),
                    EndpointSettings {
                        ip_address: Some(ip.to_string()),
                        ..Default::default()
                    },
                )
            })
            .collect();
        ContainerInspectResponse {
            name: Some("/db".into()),
            config: Some(ContainerConfig {
                hostname: Some("f00dfeed".into()),
                domainname: Some("corp.lan".into()),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn identity_strips_leading_slash() {
        let identity = identity_from(&detail(&[("bridge", "172.17.0.3")]));
        assert_eq!(identity.container_name, "db");
        assert_eq!(identity.hostname, "f00dfeed");
        assert_eq!(identity.domain, "corp.lan");
        assert_eq!(identity.address.as_deref(), Some("172.17.0.3"));
    }

    #[test]
    fn first_network_by_name_wins() {
        let identity = identity_from(&detail(&[("zeta", "10.9.0.2"), ("alpha", "10.1.0.2")]));
        assert_eq!(identity.address.as_deref(), Some("10.1.0.2"));
    }

    #[test]
    fn no_network_means_no_address() {
        assert_eq!(identity_from(&detail(&[])).address, None);
        assert_eq!(identity_from(&detail(&[("host", "")])).address, None);
    }

    #[test]
    fn server_errors_are_not_unreachable() {
        let err = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        });
        assert!(!err.is_unreachable());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(DockerRuntime::new("ssh://example").is_err());
    }

    #[tokio::test]
    async fn stop_while_waiting_for_docker_gives_up() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let connected = DockerRuntime::connect(
            "unix:///nonexistent/dockhosts-test.sock",
            Duration::from_secs(60),
            &cancel,
        )
        .await;
        let err = connected.err().expect("connect succeeded without a daemon");
        assert!(err.is_unreachable());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
