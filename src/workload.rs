use crate::config::{Workload, WorkloadMode};
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, NetworkingConfig,
        PruneContainersOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions, WaitContainerOptions,
    },
    image::{CreateImageOptions, PruneImagesOptions},
    models::{EndpointSettings, HealthStatusEnum, HostConfig},
    network::CreateNetworkOptions,
    Docker,
};
use chrono::Utc;
use futures_util::stream::{StreamExt, TryStreamExt};
use std::{collections::HashMap, error::Error, fmt, fs, path::Path, path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NETWORK_NAME: &str = "fsbench-net";
const APP_ALIAS: &str = "app";
const SETTLE_DELAY: Duration = Duration::from_secs(3);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Network placement of a created container. Multi workloads get a private
/// bridge network so the generator can reach the app by its alias.
#[derive(Clone, Copy)]
enum NetworkMembership {
    Default,
    Member,
    Aliased(&'static str),
}

#[derive(Debug)]
pub enum WorkloadError {
    /// The app container of a multi workload never reported ready within
    /// its timeout. The iteration is aborted; the campaign continues.
    AppNotReady(String),
    /// The campaign was externally aborted mid-run.
    Aborted,
    Docker(bollard::errors::Error),
    Io(std::io::Error),
}
impl fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkloadError::AppNotReady(msg) => write!(f, "App not ready: {}", msg),
            WorkloadError::Aborted => write!(f, "Workload aborted"),
            WorkloadError::Docker(e) => write!(f, "Docker error: {}", e),
            WorkloadError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}
impl Error for WorkloadError {}
impl From<bollard::errors::Error> for WorkloadError {
    fn from(value: bollard::errors::Error) -> Self {
        WorkloadError::Docker(value)
    }
}
impl From<std::io::Error> for WorkloadError {
    fn from(value: std::io::Error) -> Self {
        WorkloadError::Io(value)
    }
}

/// Outcome of one workload execution. A non-zero exit is recorded here and
/// surfaced in the report; it is not itself fatal to the campaign.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub duration_ms: i64,
    pub output_dir: PathBuf,
}
impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one benchmark iteration inside the container runtime: a single
/// container to completion, or an app plus load generator with a defined
/// startup order.
pub struct WorkloadExecutor {
    docker: Docker,
    data_dir: PathBuf,
    cancel: CancellationToken,
}
impl WorkloadExecutor {
    pub fn new(data_dir: PathBuf, cancel: CancellationToken) -> Result<Self, WorkloadError> {
        let docker = Docker::connect_with_defaults()?;
        Ok(Self {
            docker,
            data_dir,
            cancel,
        })
    }

    /// Pre-run reset: prune unused runtime objects and drop the OS page and
    /// inode caches so every iteration starts cold. The cache drop is best
    /// effort; a failure is logged as a warning.
    pub async fn pre_run_reset(&self) -> Result<(), WorkloadError> {
        self.docker
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await?;
        self.docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await?;

        if let Err(e) = drop_caches().await {
            warn!("failed to drop OS caches, iterations may not be cold: {}", e);
        }

        Ok(())
    }

    pub async fn run(
        &self,
        workload: &Workload,
        out_dir: &Path,
    ) -> Result<ExecOutcome, WorkloadError> {
        match &workload.mode {
            WorkloadMode::Single => self.run_single(workload, out_dir).await,
            WorkloadMode::Multi {
                generator_image,
                generator_command,
                ready_timeout,
            } => {
                self.run_multi(
                    workload,
                    generator_image,
                    generator_command,
                    *ready_timeout,
                    out_dir,
                )
                .await
            }
        }
    }

    /// Launches the workload container, waits for it to run to completion
    /// and captures its output into the run's output directory.
    pub async fn run_single(
        &self,
        workload: &Workload,
        out_dir: &Path,
    ) -> Result<ExecOutcome, WorkloadError> {
        let container_name = format!("fsbench-{}", workload.name);
        let start = Utc::now().timestamp_millis();

        self.ensure_image(&workload.image).await?;
        self.remove_if_exists(&container_name).await?;
        self.create_container(
            &container_name,
            &workload.image,
            workload.command.as_deref(),
            NetworkMembership::Default,
        )
        .await?;
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await?;
        info!("workload {} started", workload.name);

        let result = self.wait_for_exit(&container_name).await;
        match &result {
            Ok(_) => {
                self.capture_logs(&container_name, out_dir, &workload.output)
                    .await?
            }
            Err(_) => {
                self.capture_logs(&container_name, out_dir, &workload.output)
                    .await
                    .ok();
            }
        }
        self.remove_if_exists(&container_name).await?;
        let exit_code = result?;

        let stop = Utc::now().timestamp_millis();
        Ok(ExecOutcome {
            exit_code,
            duration_ms: stop - start,
            output_dir: out_dir.to_path_buf(),
        })
    }

    /// Starts the app container, waits until it is ready, runs the load
    /// generator to completion, then stops the app. The app container never
    /// outlives this call, ready or not.
    pub async fn run_multi(
        &self,
        workload: &Workload,
        generator_image: &str,
        generator_command: &str,
        ready_timeout: u64,
        out_dir: &Path,
    ) -> Result<ExecOutcome, WorkloadError> {
        let app_name = format!("fsbench-{}-app", workload.name);
        let generator_name = format!("fsbench-{}-gen", workload.name);
        let start = Utc::now().timestamp_millis();

        self.ensure_image(&workload.image).await?;
        self.ensure_image(generator_image).await?;
        self.remove_if_exists(&app_name).await?;
        self.remove_if_exists(&generator_name).await?;
        self.ensure_network().await?;

        self.create_container(
            &app_name,
            &workload.image,
            workload.command.as_deref(),
            NetworkMembership::Aliased(APP_ALIAS),
        )
        .await?;
        self.docker
            .start_container(&app_name, None::<StartContainerOptions<String>>)
            .await?;

        if let Err(e) = self.wait_for_ready(&app_name, ready_timeout).await {
            // no leaked app container on the abort path
            self.stop_and_remove(&app_name).await;
            self.remove_network().await;
            return Err(e);
        }
        info!("workload {} app ready, starting generator", workload.name);

        let result = async {
            self.create_container(
                &generator_name,
                generator_image,
                Some(generator_command),
                NetworkMembership::Member,
            )
            .await?;
            self.docker
                .start_container(&generator_name, None::<StartContainerOptions<String>>)
                .await?;

            // the generator's natural completion bounds the benchmark
            self.wait_for_exit(&generator_name).await
        }
        .await;

        // capture before cleanup, but never leak containers over a failed
        // capture
        let capture_result = match &result {
            Ok(_) => {
                self.capture_logs(&generator_name, out_dir, &workload.output)
                    .await
            }
            Err(_) => Ok(()),
        };
        self.capture_logs(&app_name, out_dir, "app.log").await.ok();

        self.stop_and_remove(&app_name).await;
        self.stop_and_remove(&generator_name).await;
        self.remove_network().await;
        let exit_code = result?;
        capture_result?;

        let stop = Utc::now().timestamp_millis();
        Ok(ExecOutcome {
            exit_code,
            duration_ms: stop - start,
            output_dir: out_dir.to_path_buf(),
        })
    }

    /// Pulls the image if it is not already present. The benchmark device is
    /// reformatted between filesystems, which wipes the image store, so this
    /// runs before every container creation.
    async fn ensure_image(&self, image: &str) -> Result<(), WorkloadError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(info) = stream.next().await {
            info?;
        }
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        command: Option<&str>,
        network: NetworkMembership,
    ) -> Result<(), WorkloadError> {
        let cmd = command.map(|command| {
            shlex::split(command)
                .unwrap_or_else(|| vec!["sh".to_string(), "-c".to_string(), command.to_string()])
        });

        let networking_config = match network {
            NetworkMembership::Default => None,
            NetworkMembership::Member => Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    NETWORK_NAME.to_string(),
                    EndpointSettings::default(),
                )]),
            }),
            NetworkMembership::Aliased(alias) => Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    NETWORK_NAME.to_string(),
                    EndpointSettings {
                        aliases: Some(vec![alias.to_string()]),
                        ..Default::default()
                    },
                )]),
            }),
        };

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/data", self.data_dir.to_string_lossy())]),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            cmd,
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    ..Default::default()
                }),
                config,
            )
            .await?;
        Ok(())
    }

    /// Waits for the container to exit and returns its exit code. A non-zero
    /// exit is a value here, not an error. An external abort stops the
    /// container and surfaces as `Aborted`.
    async fn wait_for_exit(&self, name: &str) -> Result<i64, WorkloadError> {
        let mut stream = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);

        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!("abort requested, stopping container {}", name);
                self.docker
                    .stop_container(name, Some(StopContainerOptions { t: 5 }))
                    .await
                    .ok();
                Err(WorkloadError::Aborted)
            }
            res = stream.try_next() => match res {
                Ok(Some(response)) => Ok(response.status_code),
                Ok(None) => Ok(0),
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => Ok(code),
                Err(e) => Err(WorkloadError::Docker(e)),
            }
        }
    }

    async fn wait_for_ready(&self, name: &str, timeout_secs: u64) -> Result<(), WorkloadError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        loop {
            if self.cancel.is_cancelled() {
                return Err(WorkloadError::Aborted);
            }

            let inspect = self.docker.inspect_container(name, None).await?;
            let state = inspect.state.unwrap_or_default();
            let health = state.health.as_ref().and_then(|h| h.status);

            match health {
                Some(HealthStatusEnum::HEALTHY) => return Ok(()),
                // no healthcheck on the image, settle once it is running
                Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None
                    if state.running == Some(true) =>
                {
                    tokio::time::sleep(SETTLE_DELAY).await;
                    return Ok(());
                }
                _ => debug!("container {} not ready yet ({:?})", name, health),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(WorkloadError::AppNotReady(format!(
                    "container {} not ready within {}s",
                    name, timeout_secs
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Writes the container's stdout to `output_name` in the run directory
    /// and its stderr to stderr.log alongside it.
    async fn capture_logs(
        &self,
        name: &str,
        out_dir: &Path,
        output_name: &str,
    ) -> Result<(), WorkloadError> {
        let mut stdout: Vec<u8> = vec![];
        let mut stderr: Vec<u8> = vec![];

        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.extend_from_slice(&message)
                }
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }

        fs::write(out_dir.join(output_name), &stdout)?;
        if !stderr.is_empty() {
            fs::write(out_dir.join("stderr.log"), &stderr)?;
        }
        Ok(())
    }

    async fn stop_and_remove(&self, name: &str) {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
            .ok();
        if let Err(e) = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!("failed to remove container {}: {}", name, e);
        }
    }

    async fn remove_if_exists(&self, name: &str) -> Result<(), WorkloadError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(WorkloadError::Docker(e)),
        }
    }

    async fn ensure_network(&self) -> Result<(), WorkloadError> {
        match self
            .docker
            .create_network(CreateNetworkOptions {
                name: NETWORK_NAME.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            // an existing network from an interrupted run is fine
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(WorkloadError::Docker(e)),
        }
    }

    async fn remove_network(&self) {
        if let Err(e) = self.docker.remove_network(NETWORK_NAME).await {
            debug!("failed to remove network {}: {}", NETWORK_NAME, e);
        }
    }
}

/// Flushes dirty pages and asks the kernel to drop page, dentry and inode
/// caches so iterations start from comparable cold-cache conditions.
async fn drop_caches() -> anyhow::Result<()> {
    crate::run_command_checked("sync").await?;
    fs::write("/proc/sys/vm/drop_caches", "3")?;
    Ok(())
}
