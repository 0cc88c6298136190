use super::{read_artifact, ExtractError, MetricRecord};
use serde::Deserialize;
use std::{collections::HashMap, path::Path};

const TOOL: &str = "fio";

#[derive(Debug, Deserialize)]
struct FioOutput {
    #[serde(default)]
    jobs: Vec<FioJob>,
}

#[derive(Debug, Deserialize)]
struct FioJob {
    #[serde(default)]
    read: FioDirection,
    #[serde(default)]
    write: FioDirection,
}

#[derive(Debug, Default, Deserialize)]
struct FioDirection {
    #[serde(default)]
    io_bytes: u64,
    #[serde(default)]
    iops: f64,
    #[serde(default)]
    bw_bytes: f64,
    #[serde(default)]
    lat_ns: FioLatency,
    #[serde(default)]
    clat_ns: FioCompletionLatency,
}

#[derive(Debug, Default, Deserialize)]
struct FioLatency {
    #[serde(default)]
    min: f64,
    #[serde(default)]
    max: f64,
    #[serde(default)]
    mean: f64,
}

#[derive(Debug, Default, Deserialize)]
struct FioCompletionLatency {
    #[serde(default)]
    percentile: HashMap<String, f64>,
}

/// Extracts iops, bandwidth and latency metrics from fio's JSON output
/// (`--output-format=json`). The first job is taken as representative;
/// directions without any io are skipped.
pub fn extract(path: &Path) -> Result<Vec<MetricRecord>, ExtractError> {
    let content = read_artifact(path)?;
    parse(&content).map_err(|msg| ExtractError::Malformed(format!("{}: {}", path.display(), msg)))
}

fn parse(content: &str) -> Result<Vec<MetricRecord>, String> {
    let output: FioOutput = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let job = output.jobs.first().ok_or("no jobs in fio output")?;

    let mut records = vec![];
    push_direction(&mut records, "read", &job.read);
    push_direction(&mut records, "write", &job.write);

    if records.is_empty() {
        return Err("fio output recorded no io".to_string());
    }
    Ok(records)
}

fn push_direction(records: &mut Vec<MetricRecord>, direction: &str, stats: &FioDirection) {
    if stats.io_bytes == 0 {
        return;
    }

    records.push(MetricRecord::new(
        TOOL,
        &format!("{}_iops", direction),
        stats.iops,
        "iops",
    ));
    records.push(MetricRecord::new(
        TOOL,
        &format!("{}_bw_bytes", direction),
        stats.bw_bytes,
        "B/s",
    ));
    records.push(MetricRecord::new(
        TOOL,
        &format!("{}_io_bytes", direction),
        stats.io_bytes as f64,
        "B",
    ));
    records.push(MetricRecord::new(
        TOOL,
        &format!("{}_lat_ns_mean", direction),
        stats.lat_ns.mean,
        "ns",
    ));
    records.push(MetricRecord::new(
        TOOL,
        &format!("{}_lat_ns_min", direction),
        stats.lat_ns.min,
        "ns",
    ));
    records.push(MetricRecord::new(
        TOOL,
        &format!("{}_lat_ns_max", direction),
        stats.lat_ns.max,
        "ns",
    ));

    // completion latency percentiles, keyed the way fio emits them
    for (key, metric) in [("95.000000", "p95"), ("99.000000", "p99")] {
        if let Some(value) = stats.clat_ns.percentile.get(key) {
            records.push(MetricRecord::new(
                TOOL,
                &format!("{}_lat_ns_{}", direction, metric),
                *value,
                "ns",
            ));
        }
    }
}
