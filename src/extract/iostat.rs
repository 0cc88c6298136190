use super::{read_artifact, ExtractError, MetricRecord};
use serde::Deserialize;
use std::path::Path;

const TOOL: &str = "iostat";

// iostat -o JSON: {"sysstat": {"hosts": [{"statistics": [...]}]}}
#[derive(Debug, Deserialize)]
struct IostatOutput {
    sysstat: Sysstat,
}

#[derive(Debug, Deserialize)]
struct Sysstat {
    #[serde(default)]
    hosts: Vec<IostatHost>,
}

#[derive(Debug, Deserialize)]
struct IostatHost {
    #[serde(default)]
    statistics: Vec<IostatSample>,
}

#[derive(Debug, Deserialize)]
struct IostatSample {
    #[serde(rename = "avg-cpu", default)]
    avg_cpu: Option<CpuSample>,
    #[serde(default)]
    disk: Vec<DiskSample>,
}

#[derive(Debug, Default, Deserialize)]
struct CpuSample {
    #[serde(default)]
    user: f64,
    #[serde(default)]
    system: f64,
    #[serde(default)]
    iowait: f64,
    #[serde(default)]
    idle: f64,
}

#[derive(Debug, Deserialize)]
struct DiskSample {
    disk_device: String,
    #[serde(rename = "r/s", default)]
    read_iops: f64,
    #[serde(rename = "w/s", default)]
    write_iops: f64,
    #[serde(rename = "rkB/s", default)]
    read_kbps: f64,
    #[serde(rename = "wkB/s", default)]
    write_kbps: f64,
    #[serde(default)]
    r_await: f64,
    #[serde(default)]
    w_await: f64,
    #[serde(default)]
    util: f64,
}

/// Extracts per-campaign averages of CPU and main-device disk activity from
/// iostat's JSON output. Some filesystems create partitions on the device
/// (zfs), so samples list several devices; only the base device without a
/// partition-number suffix is aggregated.
pub fn extract(path: &Path) -> Result<Vec<MetricRecord>, ExtractError> {
    let content = read_artifact(path)?;
    parse(&content).map_err(|msg| ExtractError::Malformed(format!("{}: {}", path.display(), msg)))
}

fn parse(content: &str) -> Result<Vec<MetricRecord>, String> {
    let output: IostatOutput = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let host = output.sysstat.hosts.first().ok_or("no hosts in output")?;
    if host.statistics.is_empty() {
        return Err("no samples in output".to_string());
    }

    let mut cpu = Averager::default();
    let mut disk = DiskAverager::default();

    for sample in host.statistics.iter() {
        if let Some(avg_cpu) = &sample.avg_cpu {
            cpu.push(avg_cpu);
        }
        if let Some(main_disk) = sample
            .disk
            .iter()
            .find(|d| !d.disk_device.ends_with(|c: char| c.is_ascii_digit()))
        {
            disk.push(main_disk);
        }
    }

    let mut records = vec![];
    records.extend(cpu.records());
    records.extend(disk.records());
    if records.is_empty() {
        return Err("no usable samples in output".to_string());
    }
    Ok(records)
}

#[derive(Default)]
struct Averager {
    user: f64,
    system: f64,
    iowait: f64,
    idle: f64,
    count: usize,
}
impl Averager {
    fn push(&mut self, sample: &CpuSample) {
        self.user += sample.user;
        self.system += sample.system;
        self.iowait += sample.iowait;
        self.idle += sample.idle;
        self.count += 1;
    }

    fn records(&self) -> Vec<MetricRecord> {
        if self.count == 0 {
            return vec![];
        }
        let n = self.count as f64;
        vec![
            MetricRecord::new(TOOL, "cpu_user_avg", self.user / n, "%"),
            MetricRecord::new(TOOL, "cpu_system_avg", self.system / n, "%"),
            MetricRecord::new(TOOL, "cpu_iowait_avg", self.iowait / n, "%"),
            MetricRecord::new(TOOL, "cpu_idle_avg", self.idle / n, "%"),
        ]
    }
}

#[derive(Default)]
struct DiskAverager {
    read_iops: f64,
    write_iops: f64,
    read_kbps: f64,
    write_kbps: f64,
    read_await: f64,
    write_await: f64,
    util: f64,
    count: usize,
}
impl DiskAverager {
    fn push(&mut self, sample: &DiskSample) {
        self.read_iops += sample.read_iops;
        self.write_iops += sample.write_iops;
        self.read_kbps += sample.read_kbps;
        self.write_kbps += sample.write_kbps;
        self.read_await += sample.r_await;
        self.write_await += sample.w_await;
        self.util += sample.util;
        self.count += 1;
    }

    fn records(&self) -> Vec<MetricRecord> {
        if self.count == 0 {
            return vec![];
        }
        let n = self.count as f64;
        vec![
            MetricRecord::new(TOOL, "read_iops_avg", self.read_iops / n, "iops"),
            MetricRecord::new(TOOL, "write_iops_avg", self.write_iops / n, "iops"),
            MetricRecord::new(TOOL, "read_kbps_avg", self.read_kbps / n, "kB/s"),
            MetricRecord::new(TOOL, "write_kbps_avg", self.write_kbps / n, "kB/s"),
            MetricRecord::new(TOOL, "read_await_avg", self.read_await / n, "ms"),
            MetricRecord::new(TOOL, "write_await_avg", self.write_await / n, "ms"),
            MetricRecord::new(TOOL, "util_avg", self.util / n, "%"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_iostat_json() -> anyhow::Result<()> {
        let records = extract(Path::new("./fixtures/iostat.json"))
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let iowait = records
            .iter()
            .find(|r| r.metric == "cpu_iowait_avg")
            .expect("cpu_iowait_avg record");
        assert!(iowait.value > 0.0);

        let util = records
            .iter()
            .find(|r| r.metric == "util_avg")
            .expect("util_avg record");
        assert_eq!(util.unit, "%");
        Ok(())
    }

    #[test]
    fn partitions_are_not_the_main_device() -> anyhow::Result<()> {
        // vdb1 and vdb9 are partitions, only vdb counts
        let content = r#"{"sysstat": {"hosts": [{"statistics": [
            {"avg-cpu": {"user": 1.0, "system": 2.0, "iowait": 3.0, "idle": 94.0},
             "disk": [
                {"disk_device": "vdb1", "r/s": 100.0, "w/s": 100.0},
                {"disk_device": "vdb", "r/s": 10.0, "w/s": 20.0}
             ]}
        ]}]}}"#;
        let records = parse(content).map_err(|e| anyhow::anyhow!(e))?;

        let write_iops = records
            .iter()
            .find(|r| r.metric == "write_iops_avg")
            .expect("write_iops_avg record");
        assert_eq!(write_iops.value, 20.0);
        Ok(())
    }

    #[test]
    fn truncated_json_is_malformed() {
        // a SIGTERM'd iostat can leave the trailing brackets unwritten
        let res = parse(r#"{"sysstat": {"hosts": [{"statistics": ["#);
        assert!(res.is_err());
    }
}
