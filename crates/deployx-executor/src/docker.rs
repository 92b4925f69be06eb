//! Docker executor.
//!
//! Each job runs in a fresh container created from the configured image, with
//! the materialized workspace bind-mounted at `/workspace`. The container is
//! removed when the run finishes or is abandoned.

use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use deployx_core::executor::{CommandExecutor, ExecOutcome, ExecRequest, OutputSink};
use deployx_core::{JobId, Result};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

pub struct DockerExecutor {
    docker: Docker,
    image: String,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new(image: impl Into<String>) -> ExecutorResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, image))
    }

    pub fn with_client(docker: Docker, image: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
        }
    }

    /// Retried jobs get a new container, so the name carries a random suffix.
    fn container_name(job_id: JobId) -> String {
        format!("deployx-job-{}-{}", job_id, uuid::Uuid::new_v4().simple())
    }

    fn workspace_bind(working_dir: &Path) -> String {
        format!("{}:{}:rw", working_dir.display(), CONTAINER_WORKSPACE)
    }

    async fn pull_image(&self) {
        info!(image = %self.image, "Pulling image");
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };

        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                // a locally built image cannot be pulled; creation reports the real error
                Err(e) => warn!(image = %self.image, error = %e, "Pull warning"),
            }
        }
    }

    fn container_config(&self, request: &ExecRequest) -> Config<String> {
        let env = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                request.command.clone(),
            ]),
            env: Some(env),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![Self::workspace_bind(&request.working_dir)]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn follow_logs(&self, name: &str, output: &OutputSink) {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut logs = self.docker.logs(name, Some(options));
        while let Some(result) = logs.next().await {
            match result {
                Ok(chunk) => {
                    let message = match chunk {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => message,
                    };
                    let text = String::from_utf8_lossy(&message).into_owned();
                    if output.send(text).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "Log stream error");
                    break;
                }
            }
        }
    }

    async fn wait_exit(&self, name: &str) -> ExecutorResult<Option<i32>> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait = self.docker.wait_container(name, Some(options));
        match wait.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code as i32)),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(Some(code as i32))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CommandExecutor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, request: ExecRequest, output: OutputSink) -> Result<ExecOutcome> {
        tokio::fs::create_dir_all(&request.working_dir)
            .await
            .map_err(ExecutorError::from)?;
        self.pull_image().await;

        let name = Self::container_name(request.job_id);
        let config = self.container_config(&request);
        let create_options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        info!(job_id = %request.job_id, container = %name, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(ExecutorError::from)?;
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            name: name.clone(),
        };

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(ExecutorError::from)?;

        self.follow_logs(&name, &output).await;
        let exit_code = self.wait_exit(&name).await?;
        drop(guard);

        debug!(job_id = %request.job_id, container = %name, ?exit_code, "Container exited");
        Ok(ExecOutcome { exit_code })
    }
}

/// Force-removes the container when dropped, including when the run future
/// is abandoned mid-flight.
struct ContainerGuard {
    docker: Docker,
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "No runtime to remove container");
            return;
        };
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match docker.remove_container(&name, Some(options)).await {
                Ok(()) => debug!(container = %name, "Container removed"),
                Err(e) => warn!(container = %name, error = %e, "Failed to remove container"),
            }
        });
    }
}
