pub mod campaign;
pub mod clap_args;
pub mod config;
pub mod extract;
pub mod monitor;
pub mod report;
pub mod runtime;
pub mod storage;
pub mod workload;

use anyhow::{anyhow, Context};
use std::{fs::File, path::Path, process::Output};
use subprocess::{Exec, Popen, Redirection};

/// Substitutes `{name}` placeholders in a command template.
///
/// # Arguments
///
/// * template - The command template, e.g. `"mkfs.ext4 -F {device}"`
/// * vars - Pairs of placeholder name and replacement value
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in vars {
        rendered = rendered.replace(&format!("{{{}}}", name), value);
    }
    rendered
}

/// Runs the given command to completion and captures its output. The exit
/// status is returned as-is; callers decide whether non-zero is an error.
///
/// # Arguments
///
/// * command - The command to run.
///
/// # Returns
///
/// The captured output of the command.
pub async fn run_command(command: &str) -> anyhow::Result<Output> {
    // break command string into POSIX words
    let words = shlex::split(command)
        .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {}", command))?;

    match &words[..] {
        [program, args @ ..] => tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .context(format!("Failed to run command: {}", command)),

        _ => Err(anyhow!("Empty command")),
    }
}

/// Runs the given command to completion and treats a non-zero exit status as
/// an error carrying the command's stderr.
pub async fn run_command_checked(command: &str) -> anyhow::Result<Output> {
    let output = run_command(command).await?;
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(anyhow!(
            "Command failed with status {}: {}\n{}",
            output.status,
            command,
            stderr.trim()
        ))
    }
}

/// Runs the given command as a detached process with stdout and stderr
/// redirected to a file. This function does not block; the returned `Popen`
/// handle is kept so the process can be signalled and reaped later.
///
/// # Arguments
///
/// * command - The command to run.
/// * stdout_path - File the process output is redirected to.
///
/// # Returns
///
/// The handle of the detached process.
pub fn run_command_detached(command: &str, stdout_path: &Path) -> anyhow::Result<Popen> {
    // break command string into POSIX words
    let words = shlex::split(command)
        .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {}", command))?;

    match &words[..] {
        [program, args @ ..] => {
            let out_file = File::create(stdout_path).context(format!(
                "Failed to create output file {}",
                stdout_path.display()
            ))?;

            Exec::cmd(program)
                .args(args)
                .stdout(Redirection::File(out_file))
                .stderr(Redirection::Merge)
                .detached()
                .popen()
                .context(format!(
                    "Failed to spawn detached process, command: {}",
                    command
                ))
        }

        _ => Err(anyhow!("Empty command")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_render_template_placeholders() {
        let rendered = render_template(
            "mount -o noatime {device} {mountpoint}",
            &[("device", "/dev/vdb"), ("mountpoint", "/mnt/fsbench")],
        );
        assert_eq!(rendered, "mount -o noatime /dev/vdb /mnt/fsbench");
    }

    #[test]
    fn render_template_leaves_unknown_placeholders() {
        let rendered = render_template("iostat -x {device} {interval}", &[("device", "/dev/vdb")]);
        assert_eq!(rendered, "iostat -x /dev/vdb {interval}");
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;
        use std::time::Duration;

        #[tokio::test]
        async fn run_command_captures_output() -> anyhow::Result<()> {
            let output = run_command("echo hello").await?;
            assert!(output.status.success());
            assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
            Ok(())
        }

        #[tokio::test]
        async fn run_command_checked_fails_on_non_zero_exit() {
            let res = run_command_checked("false").await;
            assert!(res.is_err());
        }

        #[test]
        fn can_run_a_detached_process() -> anyhow::Result<()> {
            let out_path = std::env::temp_dir().join(format!("fsbench-{}.out", nanoid::nanoid!(5)));
            let mut popen = run_command_detached("sleep 10", &out_path)?;

            assert!(popen.pid().is_some());

            popen.kill()?;
            popen.wait_timeout(Duration::from_secs(5))?;
            std::fs::remove_file(&out_path).ok();
            Ok(())
        }
    }
}
