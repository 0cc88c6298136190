use crate::{config::Monitor, render_template, run_command_detached};
use std::{error::Error, fmt, fs, path::Path, path::PathBuf, time::Duration};
use subprocess::Popen;
use tracing::{info, warn};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum MonitorError {
    /// A monitor process did not terminate cleanly or left no output behind.
    /// Monitoring is best-effort relative to the workload result, so leaks
    /// are reported but never fatal.
    MonitorLeak(String),
}
impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MonitorError::MonitorLeak(msg) => write!(f, "Monitor leak: {}", msg),
        }
    }
}
impl Error for MonitorError {}

struct MonitorProc {
    name: String,
    popen: Popen,
    output_path: PathBuf,
}

/// Handle over the background sampling processes of one iteration. Every
/// `start` is paired with a `stop` on all exit paths; the campaign never
/// drops a handle without an attempted stop.
pub struct MonitorHandle {
    procs: Vec<MonitorProc>,
}
impl MonitorHandle {
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Signals termination to every monitor, waits a bounded grace period,
    /// escalates to a kill, and confirms the output files are non-empty.
    pub fn stop(mut self) -> Vec<MonitorError> {
        let mut leaks = vec![];

        for proc in self.procs.iter_mut() {
            if let Err(e) = proc.popen.terminate() {
                warn!("failed to signal monitor {}: {}", proc.name, e);
            }

            match proc.popen.wait_timeout(STOP_GRACE) {
                Ok(Some(_)) => info!("monitor {} stopped", proc.name),
                _ => {
                    // unresponsive, escalate
                    let leak = MonitorError::MonitorLeak(format!(
                        "monitor {} did not terminate within {:?}, killed",
                        proc.name, STOP_GRACE
                    ));
                    warn!("{}", leak);
                    leaks.push(leak);

                    if let Err(e) = proc.popen.kill() {
                        warn!("failed to kill monitor {}: {}", proc.name, e);
                    }
                    proc.popen.wait().ok();
                }
            }

            // a monitor that wrote nothing produced no usable samples
            let flushed = fs::metadata(&proc.output_path)
                .map(|meta| meta.len() > 0)
                .unwrap_or(false);
            if !flushed {
                let leak = MonitorError::MonitorLeak(format!(
                    "monitor {} left no output at {}",
                    proc.name,
                    proc.output_path.display()
                ));
                warn!("{}", leak);
                leaks.push(leak);
            }
        }

        leaks
    }
}

/// Launches every configured monitor as a detached background process with
/// its output redirected into `out_dir`. A monitor that fails to spawn is
/// skipped with a warning; the workload run proceeds without it.
pub fn start(monitors: &[Monitor], device: &str, out_dir: &Path) -> MonitorHandle {
    let mut procs = vec![];

    for monitor in monitors {
        let interval = monitor.interval.to_string();
        let command = render_template(
            &monitor.command,
            &[("device", device), ("interval", interval.as_str())],
        );
        let output_path = out_dir.join(&monitor.output);

        match run_command_detached(&command, &output_path) {
            Ok(popen) => {
                info!(
                    "monitor {} started (pid {:?}): {}",
                    monitor.name,
                    popen.pid(),
                    command
                );
                procs.push(MonitorProc {
                    name: monitor.name.clone(),
                    popen,
                    output_path,
                });
            }
            Err(e) => warn!("failed to start monitor {}: {}", monitor.name, e),
        }
    }

    MonitorHandle { procs }
}
