use super::{read_artifact, ExtractError, MetricRecord};
use regex::Regex;
use std::path::Path;

const TOOL: &str = "sysbench";

/// Extracts throughput and latency metrics from sysbench's textual report.
pub fn extract(path: &Path) -> Result<Vec<MetricRecord>, ExtractError> {
    let content = read_artifact(path)?;
    parse(&content).map_err(|msg| ExtractError::Malformed(format!("{}: {}", path.display(), msg)))
}

fn parse(content: &str) -> Result<Vec<MetricRecord>, String> {
    let mut records = vec![];

    if let Some((total, rate)) =
        capture_pair(content, r"transactions:\s+(\d+)\s+\(([\d.]+) per sec\.\)")
    {
        records.push(MetricRecord::new(TOOL, "total_transactions", total, "count"));
        records.push(MetricRecord::new(TOOL, "tps", rate, "1/s"));
    }

    if let Some((total, rate)) = capture_pair(content, r"queries:\s+(\d+)\s+\(([\d.]+) per sec\.\)")
    {
        records.push(MetricRecord::new(TOOL, "total_queries", total, "count"));
        records.push(MetricRecord::new(TOOL, "qps", rate, "1/s"));
    }

    if let Some(errors) = capture(content, r"ignored errors:\s+(\d+)") {
        records.push(MetricRecord::new(TOOL, "ignored_errors", errors, "count"));
    }
    if let Some(reconnects) = capture(content, r"reconnects:\s+(\d+)") {
        records.push(MetricRecord::new(TOOL, "reconnects", reconnects, "count"));
    }

    // the latency block, falling back to individual lines when the layout
    // differs between sysbench versions
    let latency = capture_quad(
        content,
        r"Latency \(ms\):\s+min:\s+([\d.]+)\s+avg:\s+([\d.]+)\s+max:\s+([\d.]+)\s+95th percentile:\s+([\d.]+)",
    );
    match latency {
        Some((min, avg, max, p95)) => {
            records.push(MetricRecord::new(TOOL, "latency_min", min, "ms"));
            records.push(MetricRecord::new(TOOL, "latency_avg", avg, "ms"));
            records.push(MetricRecord::new(TOOL, "latency_max", max, "ms"));
            records.push(MetricRecord::new(TOOL, "latency_p95", p95, "ms"));
        }
        None => {
            if let Some(min) = capture(content, r"min:\s+([\d.]+)") {
                records.push(MetricRecord::new(TOOL, "latency_min", min, "ms"));
            }
            if let Some(avg) = capture(content, r"avg:\s+([\d.]+)") {
                records.push(MetricRecord::new(TOOL, "latency_avg", avg, "ms"));
            }
            if let Some(max) = capture(content, r"max:\s+([\d.]+)") {
                records.push(MetricRecord::new(TOOL, "latency_max", max, "ms"));
            }
            if let Some(p95) = capture(content, r"95th percentile:\s+([\d.]+)") {
                records.push(MetricRecord::new(TOOL, "latency_p95", p95, "ms"));
            }
        }
    }

    if let Some(total_time) = capture(content, r"total time:\s+([\d.]+)s") {
        records.push(MetricRecord::new(TOOL, "total_time", total_time, "s"));
    }

    if records.is_empty() {
        return Err("no sysbench metrics found".to_string());
    }
    Ok(records)
}

fn capture(content: &str, pattern: &str) -> Option<f64> {
    let captures = Regex::new(pattern).ok()?.captures(content)?;
    captures.get(1)?.as_str().parse().ok()
}

fn capture_pair(content: &str, pattern: &str) -> Option<(f64, f64)> {
    let captures = Regex::new(pattern).ok()?.captures(content)?;
    let first = captures.get(1)?.as_str().parse().ok()?;
    let second = captures.get(2)?.as_str().parse().ok()?;
    Some((first, second))
}

fn capture_quad(content: &str, pattern: &str) -> Option<(f64, f64, f64, f64)> {
    let captures = Regex::new(pattern).ok()?.captures(content)?;
    let a = captures.get(1)?.as_str().parse().ok()?;
    let b = captures.get(2)?.as_str().parse().ok()?;
    let c = captures.get(3)?.as_str().parse().ok()?;
    let d = captures.get(4)?.as_str().parse().ok()?;
    Some((a, b, c, d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_sysbench_output() -> anyhow::Result<()> {
        let records = extract(Path::new("./fixtures/sysbench.txt"))
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let tps = records
            .iter()
            .find(|r| r.metric == "tps")
            .expect("tps record");
        assert!((tps.value - 1549.06).abs() < 0.01);

        let p95 = records
            .iter()
            .find(|r| r.metric == "latency_p95")
            .expect("latency_p95 record");
        assert_eq!(p95.unit, "ms");
        Ok(())
    }

    #[test]
    fn unrelated_text_is_malformed() {
        let res = parse("error: connection refused");
        assert!(res.is_err());
    }
}
