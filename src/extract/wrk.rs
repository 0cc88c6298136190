use super::{read_artifact, ExtractError, MetricRecord};
use regex::Regex;
use std::path::Path;

const TOOL: &str = "wrk";

/// Extracts latency and throughput metrics from wrk's textual report.
pub fn extract(path: &Path) -> Result<Vec<MetricRecord>, ExtractError> {
    let content = read_artifact(path)?;
    parse(&content).map_err(|msg| ExtractError::Malformed(format!("{}: {}", path.display(), msg)))
}

fn parse(content: &str) -> Result<Vec<MetricRecord>, String> {
    let mut records = vec![];

    if let Some(captures) = captures(content, r"(\d+) threads and (\d+) connections") {
        if let (Some(threads), Some(connections)) =
            (parse_f64(&captures, 1), parse_f64(&captures, 2))
        {
            records.push(MetricRecord::new(TOOL, "threads", threads, "count"));
            records.push(MetricRecord::new(TOOL, "connections", connections, "count"));
        }
    }

    // Thread Stats:   Latency     2.28ms    1.51ms  28.90ms   74.61%
    if let Some(captures) = captures(
        content,
        r"Latency\s+([\d.]+[a-z]+)\s+([\d.]+[a-z]+)\s+([\d.]+[a-z]+)",
    ) {
        for (group, metric) in [(1, "latency_avg"), (2, "latency_stdev"), (3, "latency_max")] {
            if let Some(ms) = captures.get(group).and_then(|m| parse_time_ms(m.as_str())) {
                records.push(MetricRecord::new(TOOL, metric, ms, "ms"));
            }
        }
    }

    // 1355387 requests in 30.06s, 1.08GB read
    if let Some(captures) = captures(
        content,
        r"(\d+) requests in ([\d.]+[a-z]+), ([\d.]+[a-zA-Z]+) read",
    ) {
        if let Some(total) = parse_f64(&captures, 1) {
            records.push(MetricRecord::new(TOOL, "total_requests", total, "count"));
        }
        if let Some(duration) = captures.get(2).and_then(|m| parse_time_ms(m.as_str())) {
            records.push(MetricRecord::new(TOOL, "total_duration", duration, "ms"));
        }
        if let Some(bytes) = captures.get(3).and_then(|m| parse_size_bytes(m.as_str())) {
            records.push(MetricRecord::new(TOOL, "total_read_bytes", bytes, "B"));
        }
    }

    if let Some(captures) = captures(content, r"Requests/sec:\s+([\d.]+)") {
        if let Some(rps) = parse_f64(&captures, 1) {
            records.push(MetricRecord::new(TOOL, "requests_per_sec", rps, "1/s"));
        }
    }

    // Socket errors: connect 0, read 0, write 0, timeout 0
    if let Some(captures) = captures(
        content,
        r"Socket errors: connect (\d+), read (\d+), write (\d+), timeout (\d+)",
    ) {
        for (group, metric) in [
            (1, "errors_connect"),
            (2, "errors_read"),
            (3, "errors_write"),
            (4, "errors_timeout"),
        ] {
            if let Some(count) = parse_f64(&captures, group) {
                records.push(MetricRecord::new(TOOL, metric, count, "count"));
            }
        }
    }

    if records.is_empty() {
        return Err("no wrk metrics found".to_string());
    }
    Ok(records)
}

fn captures<'a>(content: &'a str, pattern: &str) -> Option<regex::Captures<'a>> {
    Regex::new(pattern).ok()?.captures(content)
}

fn parse_f64(captures: &regex::Captures, group: usize) -> Option<f64> {
    captures.get(group)?.as_str().parse().ok()
}

/// Parses a wrk time string like `2.28ms` or `30.06s` into milliseconds.
fn parse_time_ms(time: &str) -> Option<f64> {
    let captures = Regex::new(r"^([\d.]+)([a-z]+)$").ok()?.captures(time.trim())?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let factor = match captures.get(2)?.as_str() {
        "us" => 0.001,
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60.0 * 1000.0,
        "h" => 60.0 * 60.0 * 1000.0,
        _ => return None,
    };
    Some(value * factor)
}

/// Parses a wrk size string like `1.08GB` into bytes. wrk prints decimal
/// prefixes but computes with binary units.
fn parse_size_bytes(size: &str) -> Option<f64> {
    let captures = Regex::new(r"^([\d.]+)([a-zA-Z]+)$")
        .ok()?
        .captures(size.trim())?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let factor = match captures.get(2)?.as_str().to_uppercase().as_str() {
        "B" => 1.0,
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_wrk_output() -> anyhow::Result<()> {
        let records =
            extract(Path::new("./fixtures/wrk.txt")).map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let latency = records
            .iter()
            .find(|r| r.metric == "latency_avg")
            .expect("latency_avg record");
        assert!((latency.value - 2.28).abs() < 0.01);

        let requests = records
            .iter()
            .find(|r| r.metric == "total_requests")
            .expect("total_requests record");
        assert_eq!(requests.value, 1355387.0);
        Ok(())
    }

    #[test]
    fn can_parse_time_suffixes() {
        assert_eq!(parse_time_ms("2.28ms"), Some(2.28));
        assert_eq!(parse_time_ms("30s"), Some(30000.0));
        assert_eq!(parse_time_ms("150us"), Some(0.15));
        assert_eq!(parse_time_ms("nonsense"), None);
    }

    #[test]
    fn can_parse_size_suffixes() {
        assert_eq!(parse_size_bytes("126B"), Some(126.0));
        assert_eq!(parse_size_bytes("1.5KB"), Some(1536.0));
        assert_eq!(parse_size_bytes("1GB"), Some(1073741824.0));
    }

    #[test]
    fn unrelated_text_is_malformed() {
        let res = parse("unable to connect to host");
        assert!(res.is_err());
    }
}
