use super::{read_artifact, ExtractError, MetricRecord};
use regex::Regex;
use std::path::Path;

const TOOL: &str = "pgbench";

/// Extracts throughput and latency metrics from pgbench's textual report.
pub fn extract(path: &Path) -> Result<Vec<MetricRecord>, ExtractError> {
    let content = read_artifact(path)?;
    parse(&content).map_err(|msg| ExtractError::Malformed(format!("{}: {}", path.display(), msg)))
}

fn parse(content: &str) -> Result<Vec<MetricRecord>, String> {
    let mut records = vec![];

    if let Some(tps) = capture(content, r"tps = ([\d.]+)") {
        records.push(MetricRecord::new(TOOL, "tps", tps, "1/s"));
    }
    if let Some(latency) = capture(content, r"latency average = ([\d.]+) ms") {
        records.push(MetricRecord::new(TOOL, "latency_avg", latency, "ms"));
    }
    if let Some(processed) = capture(
        content,
        r"number of transactions actually processed: (\d+)",
    ) {
        records.push(MetricRecord::new(
            TOOL,
            "transactions_processed",
            processed,
            "count",
        ));
    }
    if let Some(failed) = capture(content, r"number of failed transactions: (\d+)") {
        records.push(MetricRecord::new(
            TOOL,
            "failed_transactions",
            failed,
            "count",
        ));
    }
    if let Some(clients) = capture(content, r"number of clients: (\d+)") {
        records.push(MetricRecord::new(TOOL, "clients", clients, "count"));
    }
    if let Some(threads) = capture(content, r"number of threads: (\d+)") {
        records.push(MetricRecord::new(TOOL, "threads", threads, "count"));
    }
    if let Some(scale) = capture(content, r"scaling factor: (\d+)") {
        records.push(MetricRecord::new(TOOL, "scaling_factor", scale, "count"));
    }

    if records.is_empty() {
        return Err("no pgbench metrics found".to_string());
    }
    Ok(records)
}

fn capture(content: &str, pattern: &str) -> Option<f64> {
    let captures = Regex::new(pattern).ok()?.captures(content)?;
    captures.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_pgbench_output() -> anyhow::Result<()> {
        let records = extract(Path::new("./fixtures/pgbench.txt"))
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let tps = records
            .iter()
            .find(|r| r.metric == "tps")
            .expect("tps record");
        assert!(tps.value > 0.0);

        assert!(records.iter().any(|r| r.metric == "transactions_processed"));
        assert!(records.iter().any(|r| r.metric == "clients"));
        Ok(())
    }

    #[test]
    fn unrelated_text_is_malformed() {
        let res = parse("pgbench: fatal: connection failed");
        assert!(res.is_err());
    }
}
