use crate::{
    config::{Config, Filesystem, Monitor, Workload},
    monitor::{self, MonitorHandle},
    runtime::RuntimeManager,
    storage::StorageManager,
    workload::{ExecOutcome, WorkloadError, WorkloadExecutor},
};
use anyhow::Context;
use chrono::Utc;
use colored::Colorize;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Terminal state of one planned (filesystem, workload, iteration) tuple.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    NotAttempted,
}

/// One (filesystem, workload, iteration) tuple of the campaign plan. The
/// plan is built up front so the final report always covers every tuple,
/// attempted or not.
#[derive(Debug)]
pub struct PlannedRun {
    pub filesystem: String,
    pub workload: String,
    pub iteration: i32,
    pub out_dir: PathBuf,
    pub status: RunStatus,
}
impl PlannedRun {
    fn matches(&self, filesystem: &str, workload: &str, iteration: i32) -> bool {
        self.filesystem == filesystem && self.workload == workload && self.iteration == iteration
    }
}

/// Builds the full campaign plan. Artifacts for workload W on filesystem F,
/// iteration I live in `<output_dir>/W/F/run_I`.
pub fn build_plan(
    output_dir: &Path,
    filesystems: &[&Filesystem],
    workloads: &[&Workload],
) -> Vec<PlannedRun> {
    let mut plan = vec![];
    for (filesystem, workload) in filesystems.iter().cartesian_product(workloads.iter()) {
        for iteration in 1..=workload.iterations {
            plan.push(PlannedRun {
                filesystem: filesystem.name.clone(),
                workload: workload.name.clone(),
                iteration,
                out_dir: output_dir
                    .join(&workload.name)
                    .join(&filesystem.name)
                    .join(format!("run_{}", iteration)),
                status: RunStatus::NotAttempted,
            });
        }
    }
    plan
}

/// On-disk record of one executed iteration, written as outcome.json in the
/// run's output directory so re-aggregation works without the campaign in
/// memory.
#[derive(Debug, Deserialize, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}
impl RunOutcome {
    pub fn load(out_dir: &Path) -> Option<RunOutcome> {
        let content = fs::read_to_string(out_dir.join("outcome.json")).ok()?;
        serde_json::from_str(&content).ok()
    }
}

/// Ephemeral state for one (filesystem, workload, iteration) execution:
/// output directory and the monitor processes sampling alongside it. The
/// monitors are stopped and the outcome flushed before the context goes
/// away, on every exit path.
pub struct RunContext {
    pub filesystem: String,
    pub workload: String,
    pub iteration: i32,
    pub out_dir: PathBuf,
    monitors: Option<MonitorHandle>,
}
impl RunContext {
    pub fn create(
        filesystem: &str,
        workload: &str,
        iteration: i32,
        out_dir: &Path,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(out_dir).context(format!(
            "Failed to create run output directory {}",
            out_dir.display()
        ))?;

        Ok(Self {
            filesystem: filesystem.to_string(),
            workload: workload.to_string(),
            iteration,
            out_dir: out_dir.to_path_buf(),
            monitors: None,
        })
    }

    pub fn start_monitors(&mut self, monitors: &[Monitor], device: &str) {
        self.stop_monitors();
        self.monitors = Some(monitor::start(monitors, device, &self.out_dir));
    }

    /// Stops the monitors of this run. Leaks are logged by the supervisor
    /// and never fail the run.
    pub fn stop_monitors(&mut self) {
        if let Some(handle) = self.monitors.take() {
            handle.stop();
        }
    }

    /// Stops any remaining monitors and writes the run outcome next to the
    /// artifacts.
    pub fn flush(mut self, outcome: &RunOutcome) -> anyhow::Result<()> {
        self.stop_monitors();
        let json = serde_json::to_string_pretty(outcome)?;
        fs::write(self.out_dir.join("outcome.json"), json)?;
        Ok(())
    }
}
impl Drop for RunContext {
    // monitors are never orphaned, whatever path drops the context
    fn drop(&mut self) {
        self.stop_monitors();
    }
}

#[derive(Debug)]
pub struct PhaseFailure {
    pub filesystem: String,
    pub error: String,
}

/// What a finished campaign leaves behind, besides the artifacts on disk.
#[derive(Debug)]
pub struct CampaignOutcome {
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub plan: Vec<PlannedRun>,
    pub failed_phases: Vec<PhaseFailure>,
    pub aborted: bool,
    /// Set when the device could not be returned to a clean state; the
    /// campaign stops rather than risk corrupting the next phase.
    pub fatal: Option<String>,
}
impl CampaignOutcome {
    /// True when no filesystem phase aborted. Recorded per-iteration
    /// failures do not flip the process exit code; phase aborts do.
    pub fn fully_successful(&self) -> bool {
        self.failed_phases.is_empty() && self.fatal.is_none() && !self.aborted
    }
}

/// The top-level state machine. Owns the device and the runtime for the
/// whole campaign; all lifecycle transitions go through this one instance,
/// strictly sequentially.
pub struct Campaign<'a> {
    config: &'a Config,
    filesystems: Vec<&'a Filesystem>,
    workloads: Vec<&'a Workload>,
    storage: StorageManager,
    runtime: RuntimeManager,
    cancel: CancellationToken,
    pub run_id: String,
}
impl<'a> Campaign<'a> {
    pub fn new(
        config: &'a Config,
        filesystems: Vec<&'a Filesystem>,
        workloads: Vec<&'a Workload>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            storage: StorageManager::new(&config.device, config.mountpoint()),
            runtime: RuntimeManager::new(config.docker_data_root()),
            config,
            filesystems,
            workloads,
            cancel,
            run_id: nanoid::nanoid!(5, &nanoid::alphabet::SAFE),
        }
    }

    /// Runs every filesystem phase in order. A fatal error in one phase is
    /// contained to it; results from the other filesystems survive.
    pub async fn run(self) -> anyhow::Result<CampaignOutcome> {
        let started_at = Utc::now().timestamp_millis();
        let output_dir = self.config.output_dir();
        fs::create_dir_all(&output_dir)?;

        let mut plan = build_plan(&output_dir, &self.filesystems, &self.workloads);
        let mut failed_phases = vec![];
        let mut fatal = None;

        info!(
            "campaign {} starting: {} filesystems x {} workloads",
            self.run_id,
            self.filesystems.len(),
            self.workloads.len()
        );

        for filesystem in self.filesystems.iter() {
            if self.cancel.is_cancelled() {
                warn!("abort requested, skipping remaining filesystems");
                break;
            }

            println!("\n{}", format!(" {} ", filesystem.name).reversed().green());

            let phase_result = self.run_phase(filesystem, &mut plan).await;

            if let Err(e) = phase_result {
                error!("filesystem phase {} aborted: {:#}", filesystem.name, e);
                println!("> phase {} aborted: {:#}", filesystem.name.red(), e);
                failed_phases.push(PhaseFailure {
                    filesystem: filesystem.name.clone(),
                    error: format!("{:#}", e),
                });
            }

            // teardown runs whether the phase succeeded or not; the device
            // must be clean before the next filesystem touches it
            if let Err(e) = self.teardown().await {
                error!("teardown after {} failed: {:#}", filesystem.name, e);
                fatal = Some(format!(
                    "device could not be returned to a clean state after {}: {:#}",
                    filesystem.name, e
                ));
                break;
            }
        }

        Ok(CampaignOutcome {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now().timestamp_millis(),
            plan,
            failed_phases,
            aborted: self.cancel.is_cancelled(),
            fatal,
        })
    }

    /// One filesystem phase. The transition order below is the system's
    /// principal correctness invariant: stop -> cleanup -> format -> mount
    /// -> reconfigure -> start -> health-check.
    async fn run_phase(
        &self,
        filesystem: &Filesystem,
        plan: &mut [PlannedRun],
    ) -> anyhow::Result<()> {
        let pools = self.config.pool_names();

        self.runtime.stop().await?;
        self.storage.cleanup(&pools).await?;
        self.storage.format(filesystem).await?;
        self.storage.mount(filesystem).await?;
        self.runtime.apply_driver(filesystem)?;
        self.runtime.start().await?;
        self.runtime.wait_healthy().await?;

        fs::create_dir_all(self.config.data_dir())?;
        let executor = WorkloadExecutor::new(self.config.data_dir(), self.cancel.clone())?;

        for workload in self.workloads.iter() {
            if self.cancel.is_cancelled() {
                break;
            }
            self.run_workload(filesystem, workload, &executor, plan)
                .await?;
        }

        Ok(())
    }

    /// Runs every iteration of one workload sequentially. Iterations are
    /// independent: a failed iteration is recorded and the next one still
    /// runs, unless the failure turns out to be environment-fatal.
    async fn run_workload(
        &self,
        filesystem: &Filesystem,
        workload: &Workload,
        executor: &WorkloadExecutor,
        plan: &mut [PlannedRun],
    ) -> anyhow::Result<()> {
        for iteration in 1..=workload.iterations {
            if self.cancel.is_cancelled() {
                break;
            }

            println!(
                "> running {} on {} - iteration {}/{}",
                workload.name.green(),
                filesystem.name.green(),
                iteration,
                workload.iterations
            );

            let planned = plan
                .iter_mut()
                .find(|p| p.matches(&filesystem.name, &workload.name, iteration))
                .context("iteration missing from campaign plan")?;

            let mut ctx = RunContext::create(
                &filesystem.name,
                &workload.name,
                iteration,
                &planned.out_dir,
            )?;

            let result = self.run_iteration(workload, &mut ctx, executor).await;

            match &result {
                Ok(outcome) => {
                    planned.status = if outcome.success() {
                        RunStatus::Success
                    } else {
                        warn!(
                            "{} iteration {} exited non-zero ({})",
                            workload.name, iteration, outcome.exit_code
                        );
                        RunStatus::Failed
                    };
                    ctx.flush(&RunOutcome {
                        status: planned.status,
                        exit_code: Some(outcome.exit_code),
                        duration_ms: Some(outcome.duration_ms),
                        error: None,
                    })?;
                }
                Err(e) => {
                    planned.status = RunStatus::Failed;
                    ctx.flush(&RunOutcome {
                        status: RunStatus::Failed,
                        exit_code: None,
                        duration_ms: None,
                        error: Some(e.to_string()),
                    })?;
                }
            }

            if let Err(e) = result {
                match e {
                    // the abort is handled by the cancellation checks above
                    WorkloadError::Aborted => break,

                    // only this iteration is lost
                    WorkloadError::AppNotReady(msg) => {
                        warn!(
                            "{} iteration {} failed: app not ready: {}",
                            workload.name, iteration, msg
                        );
                        continue;
                    }

                    e => {
                        // a dead runtime poisons everything that would
                        // follow on this filesystem
                        if !self.runtime.is_healthy().await {
                            return Err(anyhow::anyhow!(e)
                                .context("runtime became unhealthy during workload execution"));
                        }
                        warn!(
                            "{} iteration {} failed: {}",
                            workload.name, iteration, e
                        );
                        continue;
                    }
                }
            }
        }

        Ok(())
    }

    /// One iteration: reset, monitor, execute, collect.
    async fn run_iteration(
        &self,
        workload: &Workload,
        ctx: &mut RunContext,
        executor: &WorkloadExecutor,
    ) -> Result<ExecOutcome, WorkloadError> {
        executor.pre_run_reset().await?;

        ctx.start_monitors(&self.config.monitors, self.storage.device());
        let result = executor.run(workload, &ctx.out_dir).await;
        ctx.stop_monitors();

        result
    }

    /// Stops the runtime and returns the device to an unmounted, wiped
    /// state. A cleanup failure here is the one campaign-fatal condition.
    async fn teardown(&self) -> anyhow::Result<()> {
        if let Err(e) = self.runtime.stop().await {
            warn!("failed to stop runtime during teardown: {}", e);
        }
        self.storage
            .cleanup(&self.config.pool_names())
            .await
            .context("post-phase device cleanup failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::Path;

    fn load_config() -> Config {
        Config::try_from_path(Path::new("./fixtures/fsbench.success.toml"))
            .expect("fixture config should load")
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fsbench-{}", nanoid::nanoid!(5)));
        fs::create_dir_all(&dir).expect("failed to create scratch dir");
        dir
    }

    #[test]
    fn plan_covers_every_tuple() -> anyhow::Result<()> {
        let config = load_config();
        let filesystems = config.filter_filesystems(&[])?;
        let workloads = config.filter_workloads(&[])?;

        let plan = build_plan(Path::new("results"), &filesystems, &workloads);

        // 2 filesystems x 2 workloads x 2 iterations
        assert_eq!(plan.len(), 8);
        assert!(plan
            .iter()
            .all(|planned| planned.status == RunStatus::NotAttempted));
        Ok(())
    }

    #[test]
    fn plan_out_dirs_follow_workload_filesystem_run_layout() -> anyhow::Result<()> {
        let config = load_config();
        let filesystems = config.filter_filesystems(&[])?;
        let workloads = config.filter_workloads(&[])?;

        let plan = build_plan(Path::new("results"), &filesystems, &workloads);
        let planned = plan
            .iter()
            .find(|p| p.matches("ext4", "fio-randwrite", 2))
            .expect("planned run should exist");

        assert_eq!(
            planned.out_dir,
            Path::new("results/fio-randwrite/ext4/run_2")
        );
        Ok(())
    }

    #[test]
    fn run_outcome_round_trips_through_outcome_json() -> anyhow::Result<()> {
        let dir = scratch_dir();

        let ctx = RunContext::create("ext4", "fio-randwrite", 1, &dir.join("run_1"))?;
        ctx.flush(&RunOutcome {
            status: RunStatus::Success,
            exit_code: Some(0),
            duration_ms: Some(61234),
            error: None,
        })?;

        let loaded = RunOutcome::load(&dir.join("run_1")).expect("outcome.json should load");
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(loaded.exit_code, Some(0));

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn missing_outcome_file_loads_as_none() {
        let dir = scratch_dir();
        assert!(RunOutcome::load(&dir.join("run_1")).is_none());
        fs::remove_dir_all(&dir).ok();
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn flush_stops_monitors_and_writes_outcome() -> anyhow::Result<()> {
        let dir = scratch_dir();
        let monitors = vec![Monitor {
            name: "ticker".to_string(),
            command: "sh -c 'while true; do echo tick; sleep 0.2; done'".to_string(),
            interval: 1,
            output: "ticker.log".to_string(),
            tool: None,
        }];

        let run_dir = dir.join("run_1");
        let mut ctx = RunContext::create("ext4", "fio-randwrite", 1, &run_dir)?;
        ctx.start_monitors(&monitors, "/dev/null");
        std::thread::sleep(std::time::Duration::from_millis(500));

        ctx.flush(&RunOutcome {
            status: RunStatus::Failed,
            exit_code: Some(1),
            duration_ms: Some(100),
            error: None,
        })?;

        assert!(run_dir.join("outcome.json").exists());
        let ticker = fs::read_to_string(run_dir.join("ticker.log"))?;
        assert!(ticker.contains("tick"));

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn campaign_outcome_with_failed_phase_is_not_fully_successful() {
        let outcome = CampaignOutcome {
            run_id: "abc12".to_string(),
            started_at: 0,
            finished_at: 1,
            plan: vec![],
            failed_phases: vec![PhaseFailure {
                filesystem: "btrfs".to_string(),
                error: "Precondition failed: mounted".to_string(),
            }],
            aborted: false,
            fatal: None,
        };
        assert!(!outcome.fully_successful());
    }
}
