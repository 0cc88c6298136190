use crate::{config::Filesystem, render_template, run_command};
use std::{error::Error, fmt, fs, path::PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub enum StorageError {
    /// The device could not be unmounted because something still holds it.
    DeviceBusy(String),
    /// An operation was attempted in a state it does not allow, e.g.
    /// formatting a mounted device.
    PreconditionFailed(String),
    /// The post-mount check found a different filesystem than requested.
    VerificationFailed(String),
    /// A lifecycle command exited non-zero.
    CommandFailed(String),
    Io(std::io::Error),
}
impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::DeviceBusy(msg) => write!(f, "Device busy: {}", msg),
            StorageError::PreconditionFailed(msg) => write!(f, "Precondition failed: {}", msg),
            StorageError::VerificationFailed(msg) => write!(f, "Verification failed: {}", msg),
            StorageError::CommandFailed(msg) => write!(f, "Command failed: {}", msg),
            StorageError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}
impl Error for StorageError {}
impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value)
    }
}

/// Returns the mountpoint of `device` if it appears in the given
/// `/proc/mounts` content.
fn mounted_at<'a>(mounts: &'a str, device: &str) -> Option<&'a str> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(source), Some(target)) if source == device => Some(target),
            _ => None,
        }
    })
}

/// Returns true if anything is mounted at `target`.
fn is_mount_target(mounts: &str, target: &str) -> bool {
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next();
        fields.next() == Some(target)
    })
}

/// Owns the lifecycle of the target block device. The campaign controller
/// holds the single instance; no other component touches the device.
pub struct StorageManager {
    device: String,
    mountpoint: PathBuf,
}
impl StorageManager {
    pub fn new(device: &str, mountpoint: PathBuf) -> Self {
        Self {
            device: device.to_string(),
            mountpoint,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn mountpoint(&self) -> &PathBuf {
        &self.mountpoint
    }

    fn read_mounts(&self) -> Result<String, StorageError> {
        Ok(fs::read_to_string("/proc/mounts")?)
    }

    /// Returns the device to an unmounted, signature-wiped state. Idempotent:
    /// running it on an already-clean device succeeds. A device that cannot
    /// be unmounted is fatal to the current filesystem phase.
    pub async fn cleanup(&self, pools: &[&str]) -> Result<(), StorageError> {
        // unmount wherever the device is mounted
        let mounts = self.read_mounts()?;
        if let Some(target) = mounted_at(&mounts, &self.device) {
            self.unmount(target).await?;
        }

        // pool filesystems are not mounted from the raw device, destroy any
        // configured pool that exists before touching signatures
        for pool in pools {
            self.destroy_pool(pool).await?;
        }

        // a pool dataset can leave the mountpoint held even after the raw
        // device has no mount entry
        let mounts = self.read_mounts()?;
        if is_mount_target(&mounts, &self.mountpoint.to_string_lossy()) {
            self.unmount(&self.mountpoint.to_string_lossy()).await?;
        }

        let command = format!("wipefs -a {}", self.device);
        let output = run_command(&command)
            .await
            .map_err(|e| StorageError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StorageError::CommandFailed(format!(
                "{}: {}",
                command,
                stderr.trim()
            )));
        }

        info!("cleanup: {} unmounted and signature-wiped", self.device);
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), StorageError> {
        let command = format!("umount {}", target);
        let output = run_command(&command)
            .await
            .map_err(|e| StorageError::CommandFailed(e.to_string()))?;

        if output.status.success() {
            info!("cleanup: unmounted {}", target);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // an already-unmounted target is a success for an idempotent cleanup
        if stderr.contains("not mounted") {
            info!("cleanup: {} already unmounted", target);
            return Ok(());
        }

        if stderr.contains("busy") {
            return Err(StorageError::DeviceBusy(format!(
                "{}: {}",
                target,
                stderr.trim()
            )));
        }

        Err(StorageError::CommandFailed(format!(
            "{}: {}",
            command,
            stderr.trim()
        )))
    }

    async fn destroy_pool(&self, pool: &str) -> Result<(), StorageError> {
        let output = run_command("zpool list -H -o name")
            .await
            .map_err(|e| StorageError::CommandFailed(e.to_string()))?;

        // no zpool tooling or no pools at all is a clean state
        if !output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !stdout.lines().any(|name| name.trim() == pool) {
            return Ok(());
        }

        let command = format!("zpool destroy -f {}", pool);
        let output = run_command(&command)
            .await
            .map_err(|e| StorageError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StorageError::CommandFailed(format!(
                "{}: {}",
                command,
                stderr.trim()
            )));
        }

        info!("cleanup: destroyed pool {}", pool);
        Ok(())
    }

    /// Formats the device for the given filesystem. The device must be
    /// unmounted; a format command that exits non-zero is never a success.
    pub async fn format(&self, fs: &Filesystem) -> Result<(), StorageError> {
        let mounts = self.read_mounts()?;
        if let Some(target) = mounted_at(&mounts, &self.device) {
            return Err(StorageError::PreconditionFailed(format!(
                "{} is mounted at {}, refusing to format",
                self.device, target
            )));
        }

        fs::create_dir_all(&self.mountpoint)?;

        let command = render_template(
            &fs.format_command,
            &[
                ("device", self.device.as_str()),
                ("mountpoint", &self.mountpoint.to_string_lossy()),
            ],
        );
        info!("format: running {} on {}", command, self.device);

        let output = run_command(&command)
            .await
            .map_err(|e| StorageError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StorageError::CommandFailed(format!(
                "{}: {}",
                command,
                stderr.trim()
            )));
        }

        info!("format: {} formatted as {}", self.device, fs.name);
        Ok(())
    }

    /// Mounts the device and verifies the OS reports the expected filesystem
    /// type at the mountpoint.
    pub async fn mount(&self, fs: &Filesystem) -> Result<(), StorageError> {
        fs::create_dir_all(&self.mountpoint)?;
        let mountpoint = self.mountpoint.to_string_lossy().to_string();

        let command = match &fs.mount_command {
            Some(template) => Some(render_template(
                template,
                &[("device", self.device.as_str()), ("mountpoint", &mountpoint)],
            )),
            // pool filesystems mount themselves during format
            None if fs.pool.is_some() => None,
            None => {
                let options = fs
                    .mount_options
                    .as_ref()
                    .map(|opts| format!("-o {} ", opts))
                    .unwrap_or_default();
                Some(format!("mount {}{} {}", options, self.device, mountpoint))
            }
        };

        if let Some(command) = command {
            info!("mount: running {}", command);
            let output = run_command(&command)
                .await
                .map_err(|e| StorageError::CommandFailed(e.to_string()))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(StorageError::CommandFailed(format!(
                    "{}: {}",
                    command,
                    stderr.trim()
                )));
            }
        }

        self.verify_mounted(fs).await?;

        info!(
            "mount: {} mounted at {} as {}",
            self.device,
            self.mountpoint.display(),
            fs.fstype()
        );
        Ok(())
    }

    async fn verify_mounted(&self, fs: &Filesystem) -> Result<(), StorageError> {
        // the mountpoint must be accessible at all
        if let Err(e) = std::fs::read_dir(&self.mountpoint) {
            return Err(StorageError::VerificationFailed(format!(
                "mountpoint {} is not accessible: {}",
                self.mountpoint.display(),
                e
            )));
        }

        let command = format!(
            "findmnt -n -o FSTYPE --target {}",
            self.mountpoint.to_string_lossy()
        );
        let output = run_command(&command)
            .await
            .map_err(|e| StorageError::CommandFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(StorageError::VerificationFailed(format!(
                "nothing mounted at {}",
                self.mountpoint.display()
            )));
        }

        let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reported != fs.fstype() {
            warn!(
                "mount verification failed on {}: expected {}, OS reports {}",
                self.mountpoint.display(),
                fs.fstype(),
                reported
            );
            return Err(StorageError::VerificationFailed(format!(
                "expected {} at {}, OS reports {}",
                fs.fstype(),
                self.mountpoint.display(),
                reported
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/vda1 / ext4 rw,relatime 0 0
/dev/vdb /mnt/fsbench ext4 rw,noatime 0 0
benchpool /mnt/zpool zfs rw,xattr,noacl 0 0
";

    #[test]
    fn can_find_device_mountpoint() {
        assert_eq!(mounted_at(MOUNTS, "/dev/vdb"), Some("/mnt/fsbench"));
        assert_eq!(mounted_at(MOUNTS, "/dev/vdc"), None);
    }

    #[test]
    fn device_prefix_does_not_match() {
        // /dev/vd must not match /dev/vdb's entry
        assert_eq!(mounted_at(MOUNTS, "/dev/vd"), None);
    }

    #[test]
    fn can_check_mount_target() {
        assert!(is_mount_target(MOUNTS, "/mnt/fsbench"));
        assert!(is_mount_target(MOUNTS, "/mnt/zpool"));
        assert!(!is_mount_target(MOUNTS, "/mnt/other"));
    }

    #[tokio::test]
    async fn format_refuses_mounted_device() -> anyhow::Result<()> {
        // find a /dev-backed mount; containerized roots may not have one
        let mounts = fs::read_to_string("/proc/mounts")?;
        let Some(root_device) = mounts.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(source), Some(_)) if source.starts_with("/dev/") => {
                    Some(source.to_string())
                }
                _ => None,
            }
        }) else {
            return Ok(());
        };

        let manager = StorageManager::new(&root_device, PathBuf::from("/mnt/fsbench-test"));
        let fs_spec = Filesystem {
            name: "ext4".to_string(),
            storage_driver: "overlay2".to_string(),
            format_command: "mkfs.ext4 -F {device}".to_string(),
            mount_command: None,
            mount_options: None,
            pool: None,
            fstype: None,
        };

        match manager.format(&fs_spec).await {
            Err(StorageError::PreconditionFailed(_)) => Ok(()),
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }
    }
}
