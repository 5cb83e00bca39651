//! Docker-backed nodes
//!
//! Containers are created and started through the engine API on the
//! local unix socket. Every container the engine owns carries the
//! `com.mn_docker` label, which is the only thing cleanup trusts when
//! deciding what to stop and remove. The container's init pid serves as
//! the node's namespace leader, exactly like a sentinel pid.

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Label marking engine-owned containers.
pub const OWNED_LABEL: &str = "com.mn_docker";

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Docker daemon unavailable: {0}")]
    Connect(bollard::errors::Error),

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("Container '{0}' has no running init process")]
    NoPid(String),
}

/// Options forwarded into the container's HostConfig.
#[derive(Clone, Debug, Default)]
pub struct RunOpts {
    pub privileged: bool,
    pub network_mode: Option<String>,
    pub binds: Vec<String>,
    pub env: Vec<String>,
}

pub struct DockerDriver {
    client: Docker,
}

impl DockerDriver {
    pub fn connect() -> Result<Self, DockerError> {
        let client = Docker::connect_with_socket_defaults().map_err(DockerError::Connect)?;
        Ok(Self { client })
    }

    /// Create and start a labelled container, returning (container id,
    /// init pid). The pid is what the engine uses as netns leader.
    pub async fn run(
        &self,
        image: &str,
        name: &str,
        opts: &RunOpts,
    ) -> Result<(String, u32), DockerError> {
        let mut labels = HashMap::new();
        labels.insert(OWNED_LABEL.to_string(), "true".to_string());

        let host_config = HostConfig {
            privileged: Some(opts.privileged),
            network_mode: opts.network_mode.clone(),
            binds: if opts.binds.is_empty() {
                None
            } else {
                Some(opts.binds.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            labels: Some(labels),
            env: if opts.env.is_empty() {
                None
            } else {
                Some(opts.env.clone())
            },
            host_config: Some(host_config),
            // Keep the container alive; the engine execs into it.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await?;
        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;

        let pid = self.init_pid(name).await?;
        info!("Started container {} ({}) pid {}", name, created.id, pid);
        Ok((created.id, pid))
    }

    /// Init pid of a running container.
    pub async fn init_pid(&self, name: &str) -> Result<u32, DockerError> {
        let inspect = self.client.inspect_container(name, None).await?;
        let pid = inspect
            .state
            .as_ref()
            .and_then(|s| s.pid)
            .filter(|p| *p > 0)
            .ok_or_else(|| DockerError::NoPid(name.to_string()))?;
        Ok(pid as u32)
    }

    /// Force-remove a container; absent containers are not an error.
    pub async fn remove(&self, name: &str) -> Result<(), DockerError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(opts)).await {
            Ok(()) => {
                debug!("Removed container {}", name);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all engine-owned containers, running or not.
    pub async fn list_owned(&self) -> Result<Vec<String>, DockerError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![OWNED_LABEL.to_string()]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.names)
            .filter_map(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect())
    }

    /// Stop then remove every owned container. Errors on individual
    /// containers are logged and skipped so one wedged container cannot
    /// block the rest of cleanup.
    pub async fn stop_and_remove_owned(&self) -> Result<usize, DockerError> {
        let names = self.list_owned().await?;
        let count = names.len();
        for name in names {
            if let Err(e) = self
                .client
                .stop_container(&name, Some(StopContainerOptions { t: 10 }))
                .await
            {
                debug!("Stop of {} reported: {}", name, e);
            }
            if let Err(e) = self.remove(&name).await {
                warn!("Failed to remove container {}: {}", name, e);
            }
        }
        Ok(count)
    }
}
