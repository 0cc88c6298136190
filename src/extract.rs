pub mod docker_stats;
pub mod fio;
pub mod iostat;
pub mod pgbench;
pub mod sysbench;
pub mod wrk;

use serde::{Deserialize, Serialize};
use std::{error::Error, fmt, path::Path};

/// One normalized measurement extracted from raw tool output. The
/// (filesystem, workload, iteration) coordinates live on the report entry
/// that carries the record.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MetricRecord {
    pub tool: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
}
impl MetricRecord {
    pub fn new(tool: &str, metric: &str, value: f64, unit: &str) -> Self {
        Self {
            tool: tool.to_string(),
            metric: metric.to_string(),
            value,
            unit: unit.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ExtractError {
    /// The artifact file is missing or unreadable.
    Unreadable(String),
    /// The artifact exists but the tool output in it cannot be parsed.
    Malformed(String),
    /// No extractor exists for the named tool.
    UnknownTool(String),
}
impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExtractError::Unreadable(msg) => write!(f, "Unreadable artifact: {}", msg),
            ExtractError::Malformed(msg) => write!(f, "Malformed tool output: {}", msg),
            ExtractError::UnknownTool(tool) => write!(f, "No extractor for tool: {}", tool),
        }
    }
}
impl Error for ExtractError {}

/// Applies the named tool's extractor to a raw output file.
pub fn extract(tool: &str, path: &Path) -> Result<Vec<MetricRecord>, ExtractError> {
    match tool {
        "fio" => fio::extract(path),
        "sysbench" => sysbench::extract(path),
        "pgbench" => pgbench::extract(path),
        "wrk" => wrk::extract(path),
        "iostat" => iostat::extract(path),
        "docker-stats" => docker_stats::extract(path),
        other => Err(ExtractError::UnknownTool(other.to_string())),
    }
}

fn read_artifact(path: &Path) -> Result<String, ExtractError> {
    std::fs::read_to_string(path)
        .map_err(|e| ExtractError::Unreadable(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tool_is_an_error() {
        let res = extract("perf", Path::new("/nonexistent"));
        assert!(matches!(res, Err(ExtractError::UnknownTool(_))));
    }

    #[test]
    fn missing_artifact_is_unreadable() {
        let res = extract("fio", Path::new("/nonexistent/result.json"));
        assert!(matches!(res, Err(ExtractError::Unreadable(_))));
    }
}
