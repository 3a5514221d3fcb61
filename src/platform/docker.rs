//! Docker-backed sandbox platform.
//!
//! Each sandbox is one container. Namespaces are modelled as a label, and a
//! container whose namespace label does not match is treated as absent.
//! Docker has no native lifetime bound, so every created container gets a
//! deadline task that kills it once its lifetime elapses.
//!
//! Container creation runs on a tracked task, so a caller that gives up
//! mid-launch never orphans a container: the task removes what it created.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig};
use futures::TryStreamExt;
use tokio::sync::{RwLock, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::PlatformError;
use crate::platform::{ImagePullPolicy, SandboxPlatform, SandboxSpec, SandboxStatus};

/// Label carrying the namespace a container belongs to.
const NAMESPACE_LABEL: &str = "runguard.namespace";

/// Manages sandbox containers through the Docker Engine API.
pub struct DockerPlatform {
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<Docker>>>,
    /// Containers killed because their lifetime ran out.
    expired: Arc<Mutex<HashSet<String>>>,
    deadlines: TaskTracker,
    shutdown: CancellationToken,
}

impl Default for DockerPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerPlatform {
    pub fn new() -> Self {
        Self {
            docker: Arc::new(RwLock::new(None)),
            expired: Arc::new(Mutex::new(HashSet::new())),
            deadlines: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<Docker, PlatformError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            PlatformError::Unavailable {
                reason: format!("failed to connect to Docker: {e}"),
            }
        })?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    /// Abandon outstanding lifetime deadlines and wait for launch and deadline
    /// tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.deadlines.close();
        self.deadlines.wait().await;
    }

    async fn ensure_image(&self, docker: &Docker, spec: &SandboxSpec) -> Result<(), PlatformError> {
        let pull = match spec.image_pull_policy {
            ImagePullPolicy::Always => true,
            ImagePullPolicy::IfNotPresent => docker.inspect_image(&spec.image).await.is_err(),
            ImagePullPolicy::Never => false,
        };
        if !pull {
            return Ok(());
        }

        tracing::info!(image = %spec.image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: spec.image.clone(),
            ..Default::default()
        };
        docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| PlatformError::CreationFailed {
                reason: format!("failed to pull image {}: {}", spec.image, e),
            })?;
        Ok(())
    }

    /// Inspect a container, mapping "absent" and "wrong namespace" to `None`.
    async fn inspect(
        &self,
        namespace: &str,
        sandbox_id: &str,
    ) -> Result<Option<ContainerInspectResponse>, PlatformError> {
        let docker = self.docker().await?;
        match docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let in_namespace = info
                    .config
                    .as_ref()
                    .and_then(|c| c.labels.as_ref())
                    .and_then(|labels| labels.get(NAMESPACE_LABEL))
                    .is_some_and(|ns| ns == namespace);
                Ok(in_namespace.then_some(info))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(PlatformError::Unavailable {
                reason: e.to_string(),
            }),
        }
    }

    fn spawn_deadline(&self, docker: Docker, container_id: String, spec: &SandboxSpec) {
        let lifetime = spec.lifetime;
        let shutdown = self.shutdown.clone();
        let expired = Arc::clone(&self.expired);
        let run_id = spec.run_id.clone();

        self.deadlines.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(lifetime) => {
                    if let Ok(mut set) = expired.lock() {
                        set.insert(container_id.clone());
                    }
                    match docker
                        .kill_container(&container_id, None::<KillContainerOptions<String>>)
                        .await
                    {
                        Ok(()) => tracing::info!(run_id = %run_id, "Sandbox lifetime exceeded, killed container"),
                        Err(e) => {
                            // Already stopped or deleted.
                            if let Ok(mut set) = expired.lock() {
                                set.remove(&container_id);
                            }
                            tracing::debug!(run_id = %run_id, error = %e, "Deadline kill skipped");
                        }
                    }
                }
            }
        });
    }

    fn was_expired(&self, container_id: &str) -> bool {
        self.expired
            .lock()
            .map(|set| set.contains(container_id))
            .unwrap_or(false)
    }

    fn forget_expired(&self, container_id: &str) {
        if let Ok(mut set) = self.expired.lock() {
            set.remove(container_id);
        }
    }
}

#[async_trait]
impl SandboxPlatform for DockerPlatform {
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<String, PlatformError> {
        let host_config = host_config(&spec)?;
        let docker = self.docker().await?;
        self.ensure_image(&docker, &spec).await?;

        let mut labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
        labels.insert(NAMESPACE_LABEL.to_string(), spec.namespace.clone());

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let container_config = Config {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.command.is_empty()).then(|| spec.command.clone()),
            cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
            env: Some(env),
            labels: Some(labels),
            user: Some(spec.security.run_as_user.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let launcher = docker.clone();
        let remover = docker.clone();
        let run_id = spec.run_id.clone();
        let container_id = complete_detached(
            &self.deadlines,
            async move { launch(&launcher, options, container_config).await },
            move |container_id| async move {
                tracing::warn!(
                    run_id = %run_id,
                    container_id = %container_id,
                    "Create request abandoned, removing its container"
                );
                if let Err(e) = force_remove(&remover, &container_id).await {
                    tracing::error!(container_id = %container_id, error = %e, "Failed to remove abandoned container");
                }
            },
        )
        .await?;

        self.spawn_deadline(docker, container_id.clone(), &spec);

        tracing::info!(
            run_id = %spec.run_id,
            sandbox = %spec.name,
            "Created and started sandbox container"
        );
        Ok(container_id)
    }

    async fn status(
        &self,
        namespace: &str,
        sandbox_id: &str,
    ) -> Result<SandboxStatus, PlatformError> {
        let Some(info) = self.inspect(namespace, sandbox_id).await? else {
            return Ok(SandboxStatus::not_found());
        };
        Ok(phase_of(&info, self.was_expired(sandbox_id)))
    }

    async fn address(&self, namespace: &str, sandbox_id: &str) -> Result<String, PlatformError> {
        let info = self
            .inspect(namespace, sandbox_id)
            .await?
            .ok_or_else(|| PlatformError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            })?;
        let settings = info.network_settings.unwrap_or_default();
        let primary = settings.ip_address.filter(|ip| !ip.is_empty());
        let address = primary.or_else(|| {
            settings.networks.and_then(|networks| {
                networks
                    .into_values()
                    .filter_map(|endpoint| endpoint.ip_address)
                    .find(|ip| !ip.is_empty())
            })
        });
        Ok(address.unwrap_or_default())
    }

    async fn logs(&self, namespace: &str, sandbox_id: &str) -> Result<String, PlatformError> {
        if self.inspect(namespace, sandbox_id).await?.is_none() {
            return Err(PlatformError::NotFound {
                sandbox_id: sandbox_id.to_string(),
            });
        }
        let docker = self.docker().await?;
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let chunks: Vec<_> = docker
            .logs(sandbox_id, Some(options))
            .try_collect()
            .await
            .map_err(|e| PlatformError::Unavailable {
                reason: e.to_string(),
            })?;

        let mut text = String::new();
        for chunk in chunks {
            text.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(text)
    }

    async fn delete(&self, namespace: &str, sandbox_id: &str) -> Result<(), PlatformError> {
        if self.inspect(namespace, sandbox_id).await?.is_none() {
            self.forget_expired(sandbox_id);
            return Ok(());
        }
        let docker = self.docker().await?;
        match force_remove(&docker, sandbox_id).await {
            // Not found means we lost a race with another deletion.
            Ok(()) => {
                self.forget_expired(sandbox_id);
                Ok(())
            }
            Err(e) => Err(PlatformError::Unavailable {
                reason: e.to_string(),
            }),
        }
    }
}

/// Build the resource and isolation settings for a sandbox container.
fn host_config(spec: &SandboxSpec) -> Result<HostConfig, PlatformError> {
    if spec.security.mount_platform_credentials {
        return Err(PlatformError::CreationFailed {
            reason: "mounting platform credentials into a sandbox is not supported".to_string(),
        });
    }

    let nano_cpus = spec
        .cpu_millis
        .checked_mul(1_000_000)
        .and_then(|n| i64::try_from(n).ok())
        .ok_or_else(|| PlatformError::CreationFailed {
            reason: format!("cpu limit {}m is out of range", spec.cpu_millis),
        })?;
    let memory = i64::try_from(spec.memory_bytes).map_err(|_| PlatformError::CreationFailed {
        reason: format!("memory limit {} bytes is out of range", spec.memory_bytes),
    })?;

    let mut security_opt = Vec::new();
    if spec.security.no_new_privileges {
        security_opt.push("no-new-privileges:true".to_string());
    }
    if !spec.security.default_seccomp {
        security_opt.push("seccomp=unconfined".to_string());
    }

    Ok(HostConfig {
        memory: Some(memory),
        nano_cpus: Some(nano_cpus),
        network_mode: Some("bridge".to_string()),
        cap_drop: spec
            .security
            .drop_all_capabilities
            .then(|| vec!["ALL".to_string()]),
        security_opt: Some(security_opt),
        readonly_rootfs: Some(spec.security.read_only_root_fs),
        runtime: (!spec.runtime_class.is_empty()).then(|| spec.runtime_class.clone()),
        // A read-only root still needs somewhere to write scratch files.
        tmpfs: Some(
            [("/tmp".to_string(), "size=64M,noexec".to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    })
}

/// Create and start a container, removing it again if it fails to start.
async fn launch(
    docker: &Docker,
    options: CreateContainerOptions<String>,
    config: Config<String>,
) -> Result<String, PlatformError> {
    let response = docker
        .create_container(Some(options), config)
        .await
        .map_err(|e| PlatformError::CreationFailed {
            reason: e.to_string(),
        })?;
    let container_id = response.id;

    if let Err(e) = docker.start_container::<String>(&container_id, None).await {
        // Don't leave a created-but-never-started container behind.
        let _ = force_remove(docker, &container_id).await;
        return Err(PlatformError::CreationFailed {
            reason: format!("failed to start container: {e}"),
        });
    }
    Ok(container_id)
}

/// Force-remove a container. A container that is already gone counts as removed.
async fn force_remove(docker: &Docker, container_id: &str) -> Result<(), bollard::errors::Error> {
    match docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        Err(e) if is_not_found(&e) => Ok(()),
        other => other,
    }
}

/// Run `launch` on `tracker` so that it finishes even if the caller is
/// dropped. If nobody is waiting when it succeeds, its output goes to
/// `abandon` instead.
async fn complete_detached<T, L, A, F>(
    tracker: &TaskTracker,
    launch: L,
    abandon: A,
) -> Result<T, PlatformError>
where
    T: Send + 'static,
    L: Future<Output = Result<T, PlatformError>> + Send + 'static,
    A: FnOnce(T) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tracker.spawn(async move {
        if let Err(Ok(value)) = tx.send(launch.await) {
            abandon(value).await;
        }
    });
    rx.await.map_err(|_| PlatformError::CreationFailed {
        reason: "sandbox launch task ended without a result".to_string(),
    })?
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Translate Docker container state into a platform phase and reason.
fn phase_of(info: &ContainerInspectResponse, expired: bool) -> SandboxStatus {
    let state = info.state.clone().unwrap_or_default();
    let (phase, reason) = match state.status {
        Some(ContainerStateStatusEnum::CREATED) => ("Pending", "ContainerCreating".to_string()),
        Some(ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING) => {
            ("Running", String::new())
        }
        Some(ContainerStateStatusEnum::PAUSED) => ("Running", "Paused".to_string()),
        Some(ContainerStateStatusEnum::EXITED) => {
            if expired {
                ("Failed", "DeadlineExceeded".to_string())
            } else if state.oom_killed.unwrap_or(false) {
                ("Failed", "OOMKilled".to_string())
            } else if state.exit_code == Some(0) {
                ("Succeeded", "Completed".to_string())
            } else {
                let reason = state
                    .error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "Error".to_string());
                ("Failed", reason)
            }
        }
        Some(ContainerStateStatusEnum::DEAD) => ("Failed", "Dead".to_string()),
        Some(ContainerStateStatusEnum::REMOVING) => ("Unknown", "Removing".to_string()),
        _ => ("Unknown", String::new()),
    };
    SandboxStatus {
        phase: phase.to_string(),
        reason,
    }
}
