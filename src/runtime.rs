use crate::{config::Filesystem, run_command};
use bollard::Docker;
use serde::{Deserialize, Serialize};
use std::{error::Error, fmt, fs, path::PathBuf, time::Duration};
use tracing::{debug, info};

const HEALTH_ATTEMPTS: u32 = 10;
const HEALTH_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum RuntimeError {
    /// The runtime did not answer its health check within the bounded
    /// number of retries after a restart.
    RuntimeUnhealthy(String),
    /// A service control command exited non-zero.
    CommandFailed(String),
    /// The daemon configuration could not be written.
    ConfigWrite(String),
}
impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuntimeError::RuntimeUnhealthy(msg) => write!(f, "Runtime unhealthy: {}", msg),
            RuntimeError::CommandFailed(msg) => write!(f, "Command failed: {}", msg),
            RuntimeError::ConfigWrite(msg) => {
                write!(f, "Failed to write daemon config: {}", msg)
            }
        }
    }
}
impl Error for RuntimeError {}

/// On-disk shape of /etc/docker/daemon.json. Field names are the daemon's
/// own, so the struct round-trips through serde_json untouched.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct DaemonConfig {
    #[serde(rename = "storage-driver")]
    pub storage_driver: String,
    #[serde(rename = "data-root")]
    pub data_root: String,
}

/// Owns the container runtime for the duration of a campaign: stop, storage
/// driver reconfiguration, start and health verification. The campaign
/// controller is the only caller, which keeps runtime transitions serial.
pub struct RuntimeManager {
    daemon_config_path: PathBuf,
    data_root: PathBuf,
}
impl RuntimeManager {
    pub fn new(data_root: PathBuf) -> Self {
        Self {
            daemon_config_path: PathBuf::from("/etc/docker/daemon.json"),
            data_root,
        }
    }

    #[cfg(test)]
    fn with_config_path(daemon_config_path: PathBuf, data_root: PathBuf) -> Self {
        Self {
            daemon_config_path,
            data_root,
        }
    }

    /// Stops the runtime service. Also invoked before any storage cleanup or
    /// format so the daemon releases its storage-path locks.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        // the socket unit would re-activate the service on the next API call
        self.systemctl("stop docker.socket").await?;
        self.systemctl("stop docker.service").await?;
        info!("runtime stopped");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.systemctl("start docker.service").await?;
        info!("runtime started");
        Ok(())
    }

    async fn systemctl(&self, action: &str) -> Result<(), RuntimeError> {
        let command = format!("systemctl {}", action);
        let output = run_command(&command)
            .await
            .map_err(|e| RuntimeError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed(format!(
                "{}: {}",
                command,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Rewrites the daemon configuration for the given filesystem's storage
    /// driver. Only valid while the runtime is stopped and the benchmark
    /// filesystem is mounted; the campaign controller enforces that order.
    pub fn apply_driver(&self, fs: &Filesystem) -> Result<(), RuntimeError> {
        let daemon_config = DaemonConfig {
            storage_driver: fs.storage_driver.clone(),
            data_root: self.data_root.to_string_lossy().to_string(),
        };

        let json = serde_json::to_string_pretty(&daemon_config)
            .map_err(|e| RuntimeError::ConfigWrite(e.to_string()))?;

        if let Some(parent) = self.daemon_config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| RuntimeError::ConfigWrite(e.to_string()))?;
        }
        fs::write(&self.daemon_config_path, json)
            .map_err(|e| RuntimeError::ConfigWrite(e.to_string()))?;

        info!(
            "runtime configured: storage-driver {} data-root {}",
            fs.storage_driver,
            self.data_root.display()
        );
        Ok(())
    }

    /// Polls the runtime with bounded retries until it answers a ping.
    pub async fn wait_healthy(&self) -> Result<(), RuntimeError> {
        for attempt in 1..=HEALTH_ATTEMPTS {
            if self.is_healthy().await {
                info!("runtime healthy after {} attempt(s)", attempt);
                return Ok(());
            }

            debug!(
                "runtime health check attempt {}/{} failed",
                attempt, HEALTH_ATTEMPTS
            );
            tokio::time::sleep(HEALTH_INTERVAL).await;
        }

        Err(RuntimeError::RuntimeUnhealthy(format!(
            "runtime did not answer after {} attempts",
            HEALTH_ATTEMPTS
        )))
    }

    /// One-shot health probe, used to classify workload failures as
    /// environment-fatal.
    pub async fn is_healthy(&self) -> bool {
        match Docker::connect_with_defaults() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }
}
