// src/sandbox/docker.rs
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, ContainerStatsResponse, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions as BollardStartContainerOptionsQuery, StatsOptionsBuilder,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::{StreamExt, TryStreamExt};
use std::sync::Arc;

use super::telemetry::{self, TelemetryRecorder};
use super::{ContainerEngine, LaunchRequest, SandboxHandle};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::logging::{component, EngineLogger};

pub const CONTAINER_WORKDIR: &str = "/app";
const CPU_PERIOD_MICROS: i64 = 100_000;
// Docker rejects quotas below one millisecond.
const MIN_CPU_QUOTA_MICROS: i64 = 1_000;

/// Shared Docker client plus the sandbox hardening settings.
///
/// Both docker-backed variants go through this type; they differ only in the
/// low-level runtime they ask for.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    sandbox: SandboxConfig,
    logger: Arc<dyn EngineLogger>,
}

impl DockerEngine {
    pub fn new(docker: Docker, sandbox: SandboxConfig, logger: Arc<dyn EngineLogger>) -> Self {
        Self {
            docker,
            sandbox,
            logger,
        }
    }

    pub fn connect(sandbox: SandboxConfig, logger: Arc<dyn EngineLogger>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, sandbox, logger))
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    pub async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn remove(&self, id: &str) -> Result<(), BollardError> {
        match self
            .docker
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn spawn_stats_sampler(&self, handle: &SandboxHandle) {
        let docker = self.docker.clone();
        let id = handle.id.clone();
        let cancel = handle.cancel.clone();
        let recorder = handle.telemetry.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            let mut stream = Box::pin(docker.stats(
                &id,
                Some(StatsOptionsBuilder::new().stream(true).one_shot(false).build()),
            ));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sample = stream.next() => match sample {
                        Some(Ok(stats)) => record_sample(&recorder, &stats),
                        Some(Err(e)) => {
                            logger.debug(
                                component::DOCKER,
                                &format!("Stats stream for {} ended: {}", id, e),
                            );
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn logger(&self) -> &dyn EngineLogger {
        self.logger.as_ref()
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_reference(image);
        self.logger.info(
            component::DOCKER,
            &format!("Pulling image {}:{}", from_image, tag),
        );

        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    async fn runtime_installed(&self, name: &str) -> Result<bool, SandboxError> {
        let info = self.docker.info().await?;
        Ok(info
            .runtimes
            .map(|runtimes| runtimes.contains_key(name))
            .unwrap_or(false))
    }

    async fn launch(
        &self,
        request: &LaunchRequest,
        runtime: Option<&str>,
    ) -> Result<SandboxHandle, SandboxError> {
        let name = container_name(&request.execution_id);
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(name.clone()),
            ..Default::default()
        });
        let body = container_body(request, runtime, &self.sandbox);

        let container = self.docker.create_container(options, body).await?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            if let Err(remove_error) = self.remove(&container.id).await {
                self.logger.warn(
                    component::DOCKER,
                    &format!(
                        "Failed to remove container {} after start failure: {}",
                        name, remove_error
                    ),
                );
            }
            return Err(SandboxError::Launch(format!(
                "Failed to start container {}: {}",
                name, e
            )));
        }

        self.logger.debug(
            component::DOCKER,
            &format!(
                "Started container {} ({}) for {} with runtime {}",
                name,
                container.id,
                request.execution_id,
                runtime.unwrap_or("default")
            ),
        );

        let handle = SandboxHandle::new(container.id, request);
        self.spawn_stats_sampler(&handle);
        Ok(handle)
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        let mut wait_stream = self
            .docker
            .wait_container(&handle.id, None::<BollardWaitContainerOptionsQuery>);

        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::BollardError(e)),
            None => Err(SandboxError::WaitInterrupted {
                id: handle.id.clone(),
            }),
        };

        handle.cancel.cancel();
        if let Err(e) = self.remove(&handle.id).await {
            self.logger.warn(
                component::DOCKER,
                &format!("Failed to remove container {}: {}", handle.id, e),
            );
        }
        exit_code
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.cancel.cancel();
        self.remove(&handle.id)
            .await
            .map_err(|e| SandboxError::Terminate {
                id: handle.id.clone(),
                message: e.to_string(),
            })
    }
}

/// Container configuration for one sandbox.
pub fn container_body(
    request: &LaunchRequest,
    runtime: Option<&str>,
    sandbox: &SandboxConfig,
) -> ContainerCreateBody {
    let memory_bytes = i64::from(request.memory_mb) * 1024 * 1024;
    let cpu_quota = ((CPU_PERIOD_MICROS as f64) * request.cpu_share.clamp(0.0, 1.0)).round() as i64;

    let mut security_opt = Vec::new();
    if sandbox.no_new_privileges {
        security_opt.push("no-new-privileges".to_string());
    }

    let env: Vec<String> = request
        .env
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    ContainerCreateBody {
        image: Some(request.image.clone()),
        cmd: Some(vec![format!("{}/{}", CONTAINER_WORKDIR, crate::workspace::artifacts::LAUNCHER)]),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        env: if env.is_empty() { None } else { Some(env) },
        user: sandbox.container_user.clone(),
        network_disabled: if sandbox.network_disabled { Some(true) } else { None },
        host_config: Some(HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                request.workspace.display(),
                CONTAINER_WORKDIR
            )]),
            memory: Some(memory_bytes),
            // Equal to memory: no swap on top of the hard cap.
            memory_swap: Some(memory_bytes),
            cpu_period: Some(CPU_PERIOD_MICROS),
            cpu_quota: Some(cpu_quota.max(MIN_CPU_QUOTA_MICROS)),
            pids_limit: Some(sandbox.pids_limit),
            security_opt: if security_opt.is_empty() { None } else { Some(security_opt) },
            network_mode: if sandbox.network_disabled { Some("none".to_string()) } else { None },
            runtime: runtime.map(str::to_string),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn container_name(execution_id: &str) -> String {
    format!("polyrun-{}", execution_id)
}

/// `repo[:tag]` split, tolerating registry ports (`host:5000/repo`).
fn split_image_reference(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

fn is_gone(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => {
            *status_code == 404 || *status_code == 409
        }
        _ => false,
    }
}

fn record_sample(recorder: &TelemetryRecorder, stats: &ContainerStatsResponse) {
    let memory = stats.memory_stats.as_ref();
    let usage = memory.and_then(|m| m.usage).unwrap_or(0);
    let inactive_file = memory
        .and_then(|m| m.stats.as_ref())
        .and_then(|s| s.get("inactive_file").copied());

    let cpu = stats.cpu_stats.as_ref();
    let precpu = stats.precpu_stats.as_ref();
    let cpu_percent = match (cpu, precpu) {
        (Some(cpu), Some(precpu)) => telemetry::cpu_percent(
            cpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0),
            precpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0),
            cpu.system_cpu_usage.unwrap_or(0),
            precpu.system_cpu_usage.unwrap_or(0),
            cpu.online_cpus.map(u64::from).unwrap_or(1),
        ),
        _ => None,
    };

    if usage > 0 {
        recorder.record(telemetry::working_set_bytes(usage, inactive_file), cpu_percent);
    }
}
