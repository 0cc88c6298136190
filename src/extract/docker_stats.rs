use super::{read_artifact, ExtractError, MetricRecord};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

const TOOL: &str = "docker-stats";

// one line of `docker stats --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "BlockIO", default)]
    block_io: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
}

/// Extracts container resource usage from a docker-stats JSONL capture:
/// mean CPU and memory across samples, cumulative block and network IO from
/// the final sample. Malformed lines are skipped; a capture without a single
/// parseable line is malformed as a whole.
pub fn extract(path: &Path) -> Result<Vec<MetricRecord>, ExtractError> {
    let content = read_artifact(path)?;
    parse(&content).map_err(|msg| ExtractError::Malformed(format!("{}: {}", path.display(), msg)))
}

fn parse(content: &str) -> Result<Vec<MetricRecord>, String> {
    let mut cpu_perc = vec![];
    let mut mem_usage = vec![];
    let mut block_read = vec![];
    let mut block_write = vec![];
    let mut net_rx = vec![];
    let mut net_tx = vec![];

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: StatsLine = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        cpu_perc.push(
            entry
                .cpu_perc
                .trim_end_matches('%')
                .parse::<f64>()
                .unwrap_or(0.0),
        );

        let (used, _limit) = split_pair(&entry.mem_usage);
        mem_usage.push(used);

        let (read, write) = split_pair(&entry.block_io);
        block_read.push(read);
        block_write.push(write);

        let (rx, tx) = split_pair(&entry.net_io);
        net_rx.push(rx);
        net_tx.push(tx);
    }

    if cpu_perc.is_empty() {
        return Err("no parseable samples in docker stats capture".to_string());
    }

    let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
    let last = |values: &[f64]| values.last().copied().unwrap_or(0.0);

    Ok(vec![
        MetricRecord::new(TOOL, "cpu_perc_avg", mean(&cpu_perc), "%"),
        MetricRecord::new(TOOL, "mem_usage_bytes_avg", mean(&mem_usage), "B"),
        MetricRecord::new(TOOL, "block_read_bytes", last(&block_read), "B"),
        MetricRecord::new(TOOL, "block_write_bytes", last(&block_write), "B"),
        MetricRecord::new(TOOL, "net_rx_bytes", last(&net_rx), "B"),
        MetricRecord::new(TOOL, "net_tx_bytes", last(&net_tx), "B"),
    ])
}

/// Splits a docker-stats pair like `"72.1MB / 252MB"` into two byte counts.
fn split_pair(pair: &str) -> (f64, f64) {
    match pair.split_once(" / ") {
        Some((first, second)) => (parse_size_bytes(first), parse_size_bytes(second)),
        None => (parse_size_bytes(pair), 0.0),
    }
}

/// Parses a docker size string (`420.9MiB`, `5.33kB`, `126B`) into bytes.
/// Docker mixes decimal and binary prefixes depending on the column.
fn parse_size_bytes(size: &str) -> f64 {
    let size = size.trim();
    if size.is_empty() || size == "--" {
        return 0.0;
    }

    let captures = Regex::new(r"^([\d.]+)([a-zA-Z]+)$")
        .ok()
        .and_then(|re| re.captures(size));
    let Some(captures) = captures else {
        return size.parse().unwrap_or(0.0);
    };

    let value: f64 = captures
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);
    let factor = match captures.get(2).map(|m| m.as_str()) {
        Some("B") => 1.0,
        Some("kB") | Some("KB") => 1e3,
        Some("MB") => 1e6,
        Some("GB") => 1e9,
        Some("TB") => 1e12,
        Some("KiB") => 1024.0,
        Some("MiB") => 1024.0 * 1024.0,
        Some("GiB") => 1024.0 * 1024.0 * 1024.0,
        Some("TiB") => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    value * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_docker_stats_jsonl() -> anyhow::Result<()> {
        let records = extract(Path::new("./fixtures/docker_stats.jsonl"))
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let cpu = records
            .iter()
            .find(|r| r.metric == "cpu_perc_avg")
            .expect("cpu_perc_avg record");
        assert!(cpu.value > 0.0);

        let block_write = records
            .iter()
            .find(|r| r.metric == "block_write_bytes")
            .expect("block_write_bytes record");
        // the final cumulative sample wins
        assert_eq!(block_write.value, 252e6);
        Ok(())
    }

    #[test]
    fn can_parse_size_strings() {
        assert_eq!(parse_size_bytes("126B"), 126.0);
        assert_eq!(parse_size_bytes("5.33kB"), 5330.0);
        assert_eq!(parse_size_bytes("1MiB"), 1048576.0);
        assert_eq!(parse_size_bytes("--"), 0.0);
    }

    #[test]
    fn malformed_lines_are_skipped() -> anyhow::Result<()> {
        let content = r#"not json
{"CPUPerc": "10.0%", "MemUsage": "100MiB / 1GiB", "BlockIO": "1MB / 2MB", "NetIO": "1kB / 2kB"}
"#;
        let records = parse(content).map_err(|e| anyhow::anyhow!(e))?;
        let cpu = records
            .iter()
            .find(|r| r.metric == "cpu_perc_avg")
            .expect("cpu_perc_avg record");
        assert_eq!(cpu.value, 10.0);
        Ok(())
    }

    #[test]
    fn capture_without_samples_is_malformed() {
        assert!(parse("").is_err());
        assert!(parse("garbage\nmore garbage\n").is_err());
    }
}
