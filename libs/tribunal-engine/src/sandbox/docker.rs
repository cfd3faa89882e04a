/// Docker backend: one container per run, never reused.
///
/// The container gets no network, a read-only root filesystem, no
/// capabilities, a pids cap, memory and CPU limits, and runs as nobody.
/// The envelope is streamed over the attached stdin; the report comes back
/// on the attached stdout.
use super::protocol::{Envelope, ExitKind, RunnerExit, TailBuffer, RUNNER_SCRIPT, STDERR_CAP, STDOUT_CAP};
use super::{ResourceLimits, RunnerBackend};
use crate::error::SandboxError;
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, KillContainerOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tribunal_common::config::LanguageConfig;

const SANDBOX_USER: &str = "65534:65534";

/// Removes the container when dropped, whichever way the run ended
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);

        // Drop cannot await; hand the removal to the runtime
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove sandbox container");
            }
        });
    }
}

pub struct DockerBackend {
    docker: Docker,
    image: String,
    interpreter: String,
    image_ready: AtomicBool,
}

impl DockerBackend {
    pub fn new(config: &LanguageConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            image: config.image.clone(),
            interpreter: config.interpreter.clone(),
            image_ready: AtomicBool::new(false),
        })
    }

    /// Inspect once, pull on a cache miss
    async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.image_ready.load(Ordering::Relaxed) {
            return Ok(());
        }

        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Image cache hit");
            self.image_ready.store(true, Ordering::Relaxed);
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }

        info!(image = %self.image, "Image pulled");
        self.image_ready.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn container_config(&self, limits: &ResourceLimits) -> Config<String> {
        let memory = i64::try_from(limits.memory_bytes).unwrap_or(i64::MAX);

        Config {
            image: Some(self.image.clone()),
            entrypoint: Some(vec![self.interpreter.clone()]),
            cmd: Some(
                ["-I", "-S", "-B", "-c", RUNNER_SCRIPT]
                    .iter()
                    .map(|arg| arg.to_string())
                    .collect(),
            ),
            env: Some(vec!["PYTHONIOENCODING=utf-8".to_string()]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some("/tmp".to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((f64::from(limits.cpu_limit) * 1_000_000_000.0) as i64),
                pids_limit: Some(limits.max_processes),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,noexec,nosuid,size=16m".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RunnerBackend for DockerBackend {
    async fn execute(
        &self,
        envelope: &Envelope,
        limits: &ResourceLimits,
        deadline: Duration,
    ) -> Result<RunnerExit, SandboxError> {
        let payload = envelope.to_bytes()?;
        self.ensure_image().await?;

        let container_name = format!("tribunal-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(limits))
            .await?;
        let container_id = container.id.clone();
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        // Attach before start so no output is missed
        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await?;

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;

        let docker = &self.docker;
        let id = container_id.as_str();
        let execution = async move {
            if let Err(e) = input.write_all(&payload).await {
                debug!(error = %e, "Sandbox container closed stdin early");
            }
            let _ = input.shutdown().await;

            let mut stdout = TailBuffer::new(STDOUT_CAP);
            let mut stderr = TailBuffer::new(STDERR_CAP);
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.push(&message);
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push(&message);
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading sandbox output");
                        break;
                    }
                }
            }

            let mut wait_stream = docker.wait_container(
                id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            // Non-zero exits surface as DockerContainerWaitError
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(SandboxError::from(e)),
                None => -1,
            };

            Ok(RunnerExit::from_streams(stdout, stderr, ExitKind::Exited(exit_code)))
        };

        match tokio::time::timeout(deadline, execution).await {
            Ok(result) => {
                debug!(
                    container = %container_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sandbox container finished"
                );
                result
            }
            Err(_) => {
                debug!(container = %container_name, "Sandbox container exceeded deadline, killing");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container = %container_name, error = %e, "Failed to kill timed-out container");
                }
                Ok(RunnerExit::deadline_elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_config() -> LanguageConfig {
        LanguageConfig {
            name: "python".into(),
            version: "3.11".into(),
            image: "tribunal-python:latest".into(),
            interpreter: "python3".into(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            max_processes: 16,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_container_config_is_locked_down() {
        let backend = DockerBackend::new(&python_config()).expect("docker available");
        let limits = ResourceLimits::from_config(&python_config());
        let config = backend.container_config(&limits);
        let host = config.host_config.expect("host config");

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.user.as_deref(), Some(SANDBOX_USER));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.pids_limit, Some(16));
    }
}
