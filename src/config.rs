use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

static EXAMPLE_CONFIG: &str = include_str!("templates/fsbench.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Target block device, reformatted for every filesystem in the campaign.
    pub device: String,

    /// Where the active filesystem is mounted. The Docker data-root and the
    /// workload data directory both live below this path.
    pub mountpoint: String,

    /// Root directory for per-run artifacts and the final report.
    pub output_dir: String,

    #[serde(rename(serialize = "filesystem", deserialize = "filesystem"))]
    pub filesystems: Vec<Filesystem>,
    #[serde(rename(serialize = "workload", deserialize = "workload"))]
    pub workloads: Vec<Workload>,
    #[serde(rename(serialize = "monitor", deserialize = "monitor"), default)]
    pub monitors: Vec<Monitor>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.filesystems.is_empty() {
            anyhow::bail!("Config must declare at least one [[filesystem]]");
        }
        if self.workloads.is_empty() {
            anyhow::bail!("Config must declare at least one [[workload]]");
        }
        for workload in self.workloads.iter() {
            if workload.iterations < 1 {
                anyhow::bail!(
                    "Workload {} must have at least 1 iteration",
                    workload.name
                );
            }
        }
        Ok(())
    }

    pub fn mountpoint(&self) -> PathBuf {
        PathBuf::from(&self.mountpoint)
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    /// Host directory bind-mounted into workload containers.
    pub fn data_dir(&self) -> PathBuf {
        self.mountpoint().join("data")
    }

    /// Docker data-root while a benchmark filesystem is active.
    pub fn docker_data_root(&self) -> PathBuf {
        self.mountpoint().join("docker")
    }

    pub fn find_filesystem(&self, fs_name: &str) -> anyhow::Result<&Filesystem> {
        self.filesystems
            .iter()
            .find(|fs| fs.name == fs_name)
            .context(format!("Unable to find filesystem with name {}", fs_name))
    }

    pub fn find_workload(&self, workload_name: &str) -> anyhow::Result<&Workload> {
        self.workloads
            .iter()
            .find(|workload| workload.name == workload_name)
            .context(format!(
                "Unable to find workload with name {}",
                workload_name
            ))
    }

    /// Returns the configured filesystems, restricted to `names` when the
    /// subset filter is non-empty. Unknown names are an error rather than
    /// being silently ignored.
    pub fn filter_filesystems(&self, names: &[String]) -> anyhow::Result<Vec<&Filesystem>> {
        if names.is_empty() {
            return Ok(self.filesystems.iter().collect());
        }

        let mut filesystems = vec![];
        for name in names {
            filesystems.push(self.find_filesystem(name)?);
        }
        Ok(filesystems)
    }

    /// Returns the configured workloads, restricted to `names` when the
    /// subset filter is non-empty.
    pub fn filter_workloads(&self, names: &[String]) -> anyhow::Result<Vec<&Workload>> {
        if names.is_empty() {
            return Ok(self.workloads.iter().collect());
        }

        let mut workloads = vec![];
        for name in names {
            workloads.push(self.find_workload(name)?);
        }
        Ok(workloads)
    }

    /// Pool names across all configured filesystems. Cleanup destroys any of
    /// these it finds so no pool metadata leaks between campaign phases.
    pub fn pool_names(&self) -> Vec<&str> {
        self.filesystems
            .iter()
            .filter_map(|fs| fs.pool.as_deref())
            .collect()
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Filesystem {
    pub name: String,

    /// Docker storage driver to configure while this filesystem is active,
    /// e.g. overlay2, btrfs or zfs.
    pub storage_driver: String,

    /// Format command template. `{device}` is substituted before execution.
    pub format_command: String,

    /// Explicit mount command template (`{device}`, `{mountpoint}`). Pool
    /// based filesystems mount themselves during format, in which case this
    /// stays unset and mounting is a verification-only step.
    pub mount_command: Option<String>,

    /// Options passed to `mount -o` when no mount_command is given.
    pub mount_options: Option<String>,

    /// Storage-pool name to destroy during cleanup (zfs).
    pub pool: Option<String>,

    /// Filesystem type the OS is expected to report once mounted. Defaults
    /// to the filesystem name.
    pub fstype: Option<String>,
}
impl Filesystem {
    pub fn fstype(&self) -> &str {
        self.fstype.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Workload {
    pub name: String,

    /// Tool whose extractor parses the captured output (fio, sysbench,
    /// pgbench, wrk).
    pub tool: String,

    pub image: String,

    /// Command run inside the container. Unset means the image default.
    pub command: Option<String>,

    /// File name the container output is captured to inside the run's
    /// output directory.
    pub output: String,

    pub iterations: i32,

    #[serde(flatten)]
    pub mode: WorkloadMode,
}

fn default_ready_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum WorkloadMode {
    /// One container run to completion.
    Single,

    /// An app container plus a load-generator container. The app must be
    /// ready before the generator starts.
    Multi {
        generator_image: String,
        generator_command: String,
        #[serde(default = "default_ready_timeout")]
        ready_timeout: u64,
    },
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Monitor {
    pub name: String,

    /// Sampling command template (`{device}`, `{interval}`), launched as a
    /// detached process for the duration of each iteration.
    pub command: String,

    /// Sampling interval in seconds.
    pub interval: u64,

    /// File name the monitor output is redirected to inside the run's
    /// output directory.
    pub output: String,

    /// Extractor for the monitor output (iostat, docker-stats). Unset means
    /// the raw artifact is kept but not aggregated.
    pub tool: Option<String>,
}
