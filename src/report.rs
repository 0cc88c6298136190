use crate::{
    campaign::{CampaignOutcome, PlannedRun, RunOutcome, RunStatus},
    config::Config,
    extract::{self, MetricRecord},
};
use anyhow::Context;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tracing::warn;

const REPORT_FILE: &str = "report.json";
const META_FILE: &str = "campaign_meta.json";
const CONFIG_SNAPSHOT_FILE: &str = "config_snapshot.toml";

/// Terminal status of a report entry. `Missing` covers both never-attempted
/// tuples and attempted tuples whose workload artifact is absent or corrupt.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Success,
    Failed,
    Missing,
}

/// One (filesystem, workload, iteration) tuple of the final report.
#[derive(Debug, Deserialize, Serialize)]
pub struct ReportEntry {
    pub filesystem: String,
    pub workload: String,
    pub iteration: i32,
    pub status: EntryStatus,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub records: Vec<MetricRecord>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub cpu: String,
    pub cpu_cores: usize,
    pub total_memory_bytes: u64,
}
impl HostInfo {
    pub fn collect() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        Self {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            kernel: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            cpu: sys
                .cpus()
                .first()
                .map(|cpu| cpu.brand().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            cpu_cores: sys.cpus().len(),
            total_memory_bytes: sys.total_memory(),
        }
    }
}

/// Campaign-level metadata, persisted as campaign_meta.json in the output
/// directory so `fsbench aggregate` can rebuild the report later.
#[derive(Debug, Deserialize, Serialize)]
pub struct CampaignMeta {
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub device: String,
}
impl CampaignMeta {
    pub fn from_outcome(outcome: &CampaignOutcome, config: &Config) -> Self {
        Self {
            run_id: outcome.run_id.clone(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            device: config.device.clone(),
        }
    }

    pub fn write(&self, output_dir: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(output_dir.join(META_FILE), json)?;
        Ok(())
    }

    /// Loads the metadata a previous `run` left behind, or synthesizes one
    /// when aggregating a results tree without it.
    pub fn load_or_default(output_dir: &Path, config: &Config) -> Self {
        fs::read_to_string(output_dir.join(META_FILE))
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| Self {
                run_id: "unknown".to_string(),
                started_at: 0,
                finished_at: 0,
                device: config.device.clone(),
            })
    }
}

/// The final, derived artifact of a campaign. Written exactly once; always
/// contains one entry per planned tuple, real or placeholder.
#[derive(Debug, Deserialize, Serialize)]
pub struct AggregatedReport {
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub device: String,
    pub host: HostInfo,
    pub entries: Vec<ReportEntry>,
}
impl AggregatedReport {
    pub fn write(&self, output_dir: &Path) -> anyhow::Result<PathBuf> {
        let path = output_dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).context(format!("Failed to write report to {}", path.display()))?;
        Ok(path)
    }

    pub fn find_entry(
        &self,
        filesystem: &str,
        workload: &str,
        iteration: i32,
    ) -> Option<&ReportEntry> {
        self.entries.iter().find(|entry| {
            entry.filesystem == filesystem
                && entry.workload == workload
                && entry.iteration == iteration
        })
    }
}

/// Walks every planned run's artifacts and folds the extracted metrics into
/// one report. Missing or corrupt artifacts become `missing` placeholders
/// rather than being skipped, so the report shape is complete for every
/// planned tuple.
pub fn aggregate(config: &Config, plan: &[PlannedRun], meta: &CampaignMeta) -> AggregatedReport {
    let mut entries = vec![];

    for planned in plan {
        entries.push(aggregate_run(config, planned));
    }

    AggregatedReport {
        run_id: meta.run_id.clone(),
        started_at: meta.started_at,
        finished_at: meta.finished_at,
        device: meta.device.clone(),
        host: HostInfo::collect(),
        entries,
    }
}

fn aggregate_run(config: &Config, planned: &PlannedRun) -> ReportEntry {
    let mut entry = ReportEntry {
        filesystem: planned.filesystem.clone(),
        workload: planned.workload.clone(),
        iteration: planned.iteration,
        status: EntryStatus::Missing,
        exit_code: None,
        duration_ms: None,
        records: vec![],
    };

    // never attempted, keep the placeholder
    let Some(outcome) = RunOutcome::load(&planned.out_dir) else {
        return entry;
    };
    entry.exit_code = outcome.exit_code;
    entry.duration_ms = outcome.duration_ms;

    let Ok(workload) = config.find_workload(&planned.workload) else {
        warn!(
            "workload {} is not in the configuration, leaving {} as missing",
            planned.workload,
            planned.out_dir.display()
        );
        return entry;
    };

    entry.status = match extract::extract(&workload.tool, &planned.out_dir.join(&workload.output)) {
        Ok(mut records) => {
            entry.records.append(&mut records);
            match outcome.status {
                RunStatus::Success => EntryStatus::Success,
                _ => EntryStatus::Failed,
            }
        }
        Err(e) => {
            warn!(
                "workload artifact for {}/{}/run_{} not usable: {}",
                planned.workload, planned.filesystem, planned.iteration, e
            );
            // a failed run keeps its failure status; a run that claimed
            // success but left no usable artifact is missing
            match outcome.status {
                RunStatus::Failed => EntryStatus::Failed,
                _ => EntryStatus::Missing,
            }
        }
    };

    // monitor artifacts are best-effort additions to the entry
    for monitor in config.monitors.iter() {
        let Some(tool) = &monitor.tool else {
            continue;
        };
        match extract::extract(tool, &planned.out_dir.join(&monitor.output)) {
            Ok(mut records) => entry.records.append(&mut records),
            Err(e) => warn!(
                "monitor artifact {} for {}/{}/run_{} not usable: {}",
                monitor.name, planned.workload, planned.filesystem, planned.iteration, e
            ),
        }
    }

    entry
}

/// Copies the active configuration next to the report, verbatim, so the
/// uploader ships exactly what produced these numbers.
pub fn snapshot_config(config_path: &Path, output_dir: &Path) -> anyhow::Result<PathBuf> {
    let snapshot_path = output_dir.join(CONFIG_SNAPSHOT_FILE);
    fs::copy(config_path, &snapshot_path).context(format!(
        "Failed to snapshot config {} to {}",
        config_path.display(),
        snapshot_path.display()
    ))?;
    Ok(snapshot_path)
}

/// Renders the per-tuple status summary printed at the end of a campaign.
pub fn render_summary(report: &AggregatedReport) -> String {
    let mut rows = rows![row![
        TableCell::builder("Filesystem".bold()).build(),
        TableCell::builder("Workload".bold()).build(),
        TableCell::builder("Iteration".bold()).build(),
        TableCell::builder("Status".bold()).build(),
        TableCell::builder("Exit".bold()).build(),
        TableCell::builder("Duration (s)".bold()).build(),
        TableCell::builder("Metrics".bold()).build()
    ]];

    for entry in report.entries.iter() {
        let status = match entry.status {
            EntryStatus::Success => "success".green(),
            EntryStatus::Failed => "failed".red(),
            EntryStatus::Missing => "missing".yellow(),
        };

        rows.push(row![
            TableCell::new(&entry.filesystem),
            TableCell::new(&entry.workload),
            TableCell::new(entry.iteration),
            TableCell::new(status),
            TableCell::new(
                entry
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or("--".to_string())
            ),
            TableCell::new(
                entry
                    .duration_ms
                    .map(|ms| format!("{:.3}", ms as f64 / 1000.0))
                    .unwrap_or("--".to_string())
            ),
            TableCell::new(entry.records.len())
        ]);
    }

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::build_plan;

    fn load_config() -> Config {
        Config::try_from_path(Path::new("./fixtures/fsbench.success.toml"))
            .expect("fixture config should load")
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fsbench-{}", nanoid::nanoid!(5)));
        fs::create_dir_all(&dir).expect("failed to create scratch dir");
        dir
    }

    fn meta() -> CampaignMeta {
        CampaignMeta {
            run_id: "test1".to_string(),
            started_at: 1722945600000,
            finished_at: 1722949200000,
            device: "/dev/vdb".to_string(),
        }
    }

    #[test]
    fn unattempted_runs_become_missing_placeholders() -> anyhow::Result<()> {
        let config = load_config();
        let dir = scratch_dir();
        let plan = build_plan(
            &dir,
            &config.filter_filesystems(&[])?,
            &config.filter_workloads(&[])?,
        );

        let report = aggregate(&config, &plan, &meta());

        assert_eq!(report.entries.len(), plan.len());
        assert!(report
            .entries
            .iter()
            .all(|entry| entry.status == EntryStatus::Missing && entry.records.is_empty()));

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn successful_run_aggregates_workload_and_monitor_records() -> anyhow::Result<()> {
        let config = load_config();
        let dir = scratch_dir();
        let plan = build_plan(
            &dir,
            &config.filter_filesystems(&["ext4".to_string()])?,
            &config.filter_workloads(&["fio-randwrite".to_string()])?,
        );

        // simulate one executed iteration
        let run_dir = &plan[0].out_dir;
        fs::create_dir_all(run_dir)?;
        fs::copy("./fixtures/fio.json", run_dir.join("result.json"))?;
        fs::copy("./fixtures/iostat.json", run_dir.join("iostat.json"))?;
        fs::copy("./fixtures/docker_stats.jsonl", run_dir.join("docker_stats.jsonl"))?;
        fs::write(
            run_dir.join("outcome.json"),
            r#"{"status": "success", "exit_code": 0, "duration_ms": 61234, "error": null}"#,
        )?;

        let report = aggregate(&config, &plan, &meta());

        let entry = report
            .find_entry("ext4", "fio-randwrite", 1)
            .expect("entry should exist");
        assert_eq!(entry.status, EntryStatus::Success);
        assert!(entry.records.iter().any(|r| r.tool == "fio"));
        assert!(entry.records.iter().any(|r| r.tool == "iostat"));
        assert!(entry.records.iter().any(|r| r.tool == "docker-stats"));

        // the second iteration never ran
        let entry = report
            .find_entry("ext4", "fio-randwrite", 2)
            .expect("entry should exist");
        assert_eq!(entry.status, EntryStatus::Missing);

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn corrupt_workload_artifact_downgrades_success_to_missing() -> anyhow::Result<()> {
        let config = load_config();
        let dir = scratch_dir();
        let plan = build_plan(
            &dir,
            &config.filter_filesystems(&["ext4".to_string()])?,
            &config.filter_workloads(&["fio-randwrite".to_string()])?,
        );

        let run_dir = &plan[0].out_dir;
        fs::create_dir_all(run_dir)?;
        fs::write(run_dir.join("result.json"), "not json at all")?;
        fs::write(
            run_dir.join("outcome.json"),
            r#"{"status": "success", "exit_code": 0, "duration_ms": 61234, "error": null}"#,
        )?;

        let report = aggregate(&config, &plan, &meta());
        let entry = report
            .find_entry("ext4", "fio-randwrite", 1)
            .expect("entry should exist");
        assert_eq!(entry.status, EntryStatus::Missing);
        // the recorded exit status survives the placeholder
        assert_eq!(entry.exit_code, Some(0));

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn report_write_and_reload_round_trips() -> anyhow::Result<()> {
        let config = load_config();
        let dir = scratch_dir();
        let plan = build_plan(
            &dir,
            &config.filter_filesystems(&["ext4".to_string()])?,
            &config.filter_workloads(&["fio-randwrite".to_string()])?,
        );

        let report = aggregate(&config, &plan, &meta());
        let path = report.write(&dir)?;

        let reloaded: AggregatedReport = serde_json::from_str(&fs::read_to_string(path)?)?;
        assert_eq!(reloaded.run_id, "test1");
        assert_eq!(reloaded.entries.len(), report.entries.len());

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn summary_lists_every_entry() -> anyhow::Result<()> {
        let config = load_config();
        let dir = scratch_dir();
        let plan = build_plan(
            &dir,
            &config.filter_filesystems(&[])?,
            &config.filter_workloads(&[])?,
        );

        let report = aggregate(&config, &plan, &meta());
        let summary = render_summary(&report);

        assert!(summary.contains("ext4"));
        assert!(summary.contains("zfs"));
        assert!(summary.contains("fio-randwrite"));
        assert!(summary.contains("webserver-bench"));

        fs::remove_dir_all(&dir).ok();
        Ok(())
    }
}
