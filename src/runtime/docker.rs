//! Docker-backed [`ContainerRuntime`] using bollard.

use super::{
    AttachedExec, ContainerRuntime, ContainerSpec, ContainerSummary, ExecRequest, LABEL_MANAGED,
};
use crate::error::{Error, Result, RuntimeErrorKind};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceMapping, HostConfig, PortBinding, PortMap, ResourcesUlimits};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Client timeout for runtime API calls, in seconds.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Container runtime backed by a Docker-compatible daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the daemon, through `socket` if given, otherwise the
    /// platform default (`DOCKER_HOST` or the local socket).
    pub fn connect(socket: Option<&Path>) -> Result<Self> {
        let docker = match socket {
            Some(path) => {
                let path = path.to_str().ok_or_else(|| {
                    Error::config("docker socket", format!("non-utf8 path: {}", path.display()))
                })?;
                Docker::connect_with_unix(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::runtime_kind("connect", e.to_string(), RuntimeErrorKind::Unavailable))?;
        Ok(Self { docker })
    }
}

/// Map a bollard error onto the runtime taxonomy.
fn classify(operation: &str, target: &str, err: BollardError) -> Error {
    let kind = match &err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match *status_code {
            404 => RuntimeErrorKind::NotFound,
            409 if message.contains("is not running") || message.contains("is paused") => {
                RuntimeErrorKind::NotRunning
            }
            409 => RuntimeErrorKind::Conflict,
            _ => RuntimeErrorKind::Other,
        },
        BollardError::IOError { .. } | BollardError::RequestTimeoutError => {
            RuntimeErrorKind::Unavailable
        }
        _ => RuntimeErrorKind::Other,
    };
    Error::runtime_kind(operation, format!("{}: {}", target, err), kind)
}

/// Whether the daemon answered "not modified" (already started/stopped).
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn published_ports(ports: Option<PortMap>) -> BTreeMap<String, u16> {
    ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(container_port, bindings)| {
            let host_port = bindings?
                .into_iter()
                .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))?;
            Some((container_port, host_port))
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| classify("ping", "daemon", e))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>> {
        // The name filter matches substrings; keep only the exact name.
        let filters = HashMap::from([("name".to_string(), vec![format!("^/{}$", name)])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify("list", name, e))?;

        let found = containers.into_iter().find(|c| {
            c.names
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|n| n.trim_start_matches('/') == name)
        });

        match found.and_then(|c| c.id) {
            Some(id) => self.inspect(&id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSummary> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify("inspect", id, e))?;

        Ok(ContainerSummary {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            image: info.config.and_then(|c| c.image),
            published: published_ports(info.network_settings.and_then(|n| n.ports)),
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut progress = Box::pin(self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        ));
        while let Some(step) = progress.next().await {
            step.map_err(|e| classify("pull", image, e))?;
        }
        tracing::debug!(image = %image, "image pulled");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let (soft, hard) = spec.ulimits;
        let ulimits = ["nofile", "nproc"]
            .iter()
            .map(|name| ResourcesUlimits {
                name: Some(name.to_string()),
                soft: Some(soft),
                hard: Some(hard),
            })
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: PortMap = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let devices: Vec<DeviceMapping> = spec
            .devices
            .iter()
            .map(|d| DeviceMapping {
                path_on_host: Some(d.clone()),
                path_in_container: Some(d.clone()),
                cgroup_permissions: Some("rwm".to_string()),
            })
            .collect();

        let host_config = if spec.privileged {
            HostConfig {
                memory: Some(spec.memory_bytes),
                privileged: Some(true),
                devices: Some(devices),
                port_bindings: Some(port_bindings),
                network_mode: Some(spec.network_mode.clone()),
                ..Default::default()
            }
        } else {
            HostConfig {
                memory: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                ulimits: Some(ulimits),
                network_mode: Some(spec.network_mode.clone()),
                devices: Some(devices),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }
        };

        let mut labels = spec.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let config = Config::<String> {
            image: Some(spec.image.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            env: Some(spec.env.clone()),
            user: spec.user.clone(),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| classify("create", &spec.name, e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "runtime warning on create");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(classify("start", id, e)),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(classify("stop", id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify("remove", id, e))
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<AttachedExec> {
        let created = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(request.cmd),
                    attach_stdin: Some(request.tty),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(request.tty),
                    user: request.user,
                    env: if request.env.is_empty() {
                        None
                    } else {
                        Some(request.env)
                    },
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify("create exec", id, e))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: request.tty,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| classify("start exec", id, e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let exec_id = created.id.clone();
                let output = output
                    .map(move |chunk| {
                        chunk
                            .map(|log| log.into_bytes())
                            .map_err(|e| classify("read exec output", &exec_id, e))
                    })
                    .boxed();
                Ok(AttachedExec {
                    exec_id: created.id,
                    output,
                    input: if request.tty { Some(input) } else { None },
                })
            }
            StartExecResults::Detached => Err(Error::runtime(
                "start exec",
                format!("{}: exec started detached", id),
            )),
        }
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| classify("resize exec", exec_id, e))
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let info = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| classify("inspect exec", exec_id, e))?;
        Ok(info.exit_code)
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| classify("list", "managed", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    name: c
                        .names
                        .and_then(|n| n.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                    image: c.image,
                    published: BTreeMap::new(),
                })
            })
            .collect())
    }
}
