//! Device selection
//!
//! Picks the CPU or one GPU for the engine. GPUs are claimed through lock
//! files in a shared directory so two processes never share a device; the
//! claim is held by a `DeviceLease` and released when it is dropped. Each
//! lock file records its owner's pid; a file whose owner has died (killed,
//! out of memory) is removed by the next process that wants the GPU.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

const LOCK_PREFIX: &str = "nmt_rpc.gpu";

/// Device the engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu({})", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub use_cpu: bool,
    /// Requested GPU ids; a negative id means "any free GPU"
    pub device_ids: Vec<i32>,
    pub disable_device_locking: bool,
    pub lock_dir: PathBuf,
    pub lock_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            use_cpu: false,
            device_ids: vec![-1],
            disable_device_locking: false,
            lock_dir: std::env::temp_dir(),
            lock_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(
        "No GPUs found, consider running on the CPU with --use-cpu \
         (the check uses nvidia-smi, which may also be missing from PATH)"
    )]
    NoGpus,

    #[error("Cannot run on multiple devices for now (got {0} device ids)")]
    MultipleDevices(usize),

    #[error("GPU {id} requested but only {available} available")]
    InvalidDeviceId { id: i32, available: usize },

    #[error("Could not acquire any of GPUs {candidates:?} within {waited:?}")]
    LockTimeout { candidates: Vec<u32>, waited: Duration },

    #[error("Lock file {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive claim on one GPU, released on drop
#[derive(Debug)]
pub struct DeviceLease {
    gpu_id: u32,
    path: PathBuf,
}

impl DeviceLease {
    /// Claim the first free GPU among `candidates`, retrying until
    /// `timeout` has passed
    pub fn acquire(
        lock_dir: &Path,
        candidates: &[u32],
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self, DeviceError> {
        fs::create_dir_all(lock_dir).map_err(|source| DeviceError::Lock {
            path: lock_dir.to_path_buf(),
            source,
        })?;

        let start = Instant::now();
        loop {
            for &gpu_id in candidates {
                if let Some(lease) = Self::try_acquire(lock_dir, gpu_id)? {
                    log::info!("Acquired GPU {} ({})", gpu_id, lease.path.display());
                    return Ok(lease);
                }
                log::debug!("GPU {} is locked by another process", gpu_id);
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(DeviceError::LockTimeout { candidates: candidates.to_vec(), waited });
            }
            log::info!("Could not acquire any of GPUs {:?}, retrying", candidates);
            thread::sleep(retry_interval.min(timeout - waited));
        }
    }

    fn try_acquire(lock_dir: &Path, gpu_id: u32) -> Result<Option<Self>, DeviceError> {
        let path = lock_dir.join(format!("{}{}.lock", LOCK_PREFIX, gpu_id));

        // Second attempt only after a dead owner's file was removed
        for _ in 0..2 {
            // create_new is atomic: exactly one process wins the file
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lease = Self { gpu_id, path };
                    writeln!(file, "{}", std::process::id()).map_err(|source| DeviceError::Lock {
                        path: lease.path.clone(),
                        source,
                    })?;
                    return Ok(Some(lease));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !reclaim_stale_lock(&path)? {
                        return Ok(None);
                    }
                }
                Err(source) => return Err(DeviceError::Lock { path, source }),
            }
        }
        Ok(None)
    }

    pub fn gpu_id(&self) -> u32 {
        self.gpu_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::info!("Released GPU {}", self.gpu_id),
            Err(e) => log::warn!("Failed to remove lock file {}: {}", self.path.display(), e),
        }
    }
}

/// Remove a lock file whose owner process no longer exists. Returns true
/// when the file is gone.
fn reclaim_stale_lock(path: &Path) -> Result<bool, DeviceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(source) => return Err(DeviceError::Lock { path: path.to_path_buf(), source }),
    };

    // An empty file is still being written by its owner
    let Ok(pid) = content.trim().parse::<u32>() else {
        return Ok(false);
    };
    if process_alive(pid) {
        return Ok(false);
    }

    log::warn!("Removing stale lock {} left by process {}", path.display(), pid);
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(source) => Err(DeviceError::Lock { path: path.to_path_buf(), source }),
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 checks existence only; EPERM still means the process is there
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Chosen device plus the lease that keeps it ours
#[derive(Debug)]
pub struct SelectedDevice {
    device: Device,
    lease: Option<DeviceLease>,
}

impl SelectedDevice {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn lease(&self) -> Option<&DeviceLease> {
        self.lease.as_ref()
    }
}

/// Count visible GPUs via `nvidia-smi -L`; 0 when the tool is missing
pub fn get_num_gpus() -> usize {
    match Command::new("nvidia-smi").arg("-L").output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| line.starts_with("GPU "))
            .count(),
        Ok(output) => {
            log::debug!("nvidia-smi exited with {}", output.status);
            0
        }
        Err(e) => {
            log::debug!("Couldn't run nvidia-smi: {}", e);
            0
        }
    }
}

/// Decide the device given `num_gpus` visible GPUs
pub fn select_device(config: &DeviceConfig, num_gpus: usize) -> Result<SelectedDevice, DeviceError> {
    if config.use_cpu {
        return Ok(SelectedDevice { device: Device::Cpu, lease: None });
    }

    if num_gpus == 0 {
        return Err(DeviceError::NoGpus);
    }
    if config.device_ids.len() != 1 {
        return Err(DeviceError::MultipleDevices(config.device_ids.len()));
    }

    let requested = config.device_ids[0];
    if requested >= 0 && requested as usize >= num_gpus {
        return Err(DeviceError::InvalidDeviceId { id: requested, available: num_gpus });
    }

    if config.disable_device_locking {
        // Without locking a negative id just takes the first device
        let gpu_id = requested.max(0) as u32;
        return Ok(SelectedDevice { device: Device::Gpu(gpu_id), lease: None });
    }

    let candidates: Vec<u32> = if requested < 0 {
        (0..num_gpus as u32).collect()
    } else {
        vec![requested as u32]
    };
    let lease = DeviceLease::acquire(
        &config.lock_dir,
        &candidates,
        config.lock_timeout,
        config.retry_interval,
    )?;

    Ok(SelectedDevice { device: Device::Gpu(lease.gpu_id()), lease: Some(lease) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn locking_config(dir: &TempDir, ids: Vec<i32>) -> DeviceConfig {
        DeviceConfig {
            device_ids: ids,
            lock_dir: dir.path().to_path_buf(),
            lock_timeout: Duration::ZERO,
            retry_interval: Duration::from_millis(1),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_cpu_needs_no_gpu() {
        let config = DeviceConfig { use_cpu: true, ..DeviceConfig::default() };
        let selected = select_device(&config, 0).unwrap();
        assert_eq!(selected.device(), &Device::Cpu);
        assert!(selected.lease().is_none());
    }

    #[test]
    fn test_no_gpu_is_fatal() {
        let err = select_device(&DeviceConfig::default(), 0).unwrap_err();
        assert!(matches!(err, DeviceError::NoGpus));
    }

    #[test]
    fn test_multiple_devices_rejected() {
        let config = DeviceConfig { device_ids: vec![0, 1], ..DeviceConfig::default() };
        assert!(matches!(select_device(&config, 2), Err(DeviceError::MultipleDevices(2))));
    }

    #[test]
    fn test_unlocked_negative_id_takes_first_gpu() {
        let config = DeviceConfig { disable_device_locking: true, ..DeviceConfig::default() };
        let selected = select_device(&config, 4).unwrap();
        assert_eq!(selected.device(), &Device::Gpu(0));
    }

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let config = locking_config(&dir, vec![1]);

        let first = select_device(&config, 2).unwrap();
        assert_eq!(first.device(), &Device::Gpu(1));
        let lock_path = first.lease().unwrap().path().to_path_buf();
        assert!(lock_path.exists());

        match select_device(&config, 2) {
            Err(DeviceError::LockTimeout { candidates, .. }) => assert_eq!(candidates, vec![1]),
            other => panic!("Expected LockTimeout, got {:?}", other),
        }

        drop(first);
        assert!(!lock_path.exists());
        assert_eq!(select_device(&config, 2).unwrap().device(), &Device::Gpu(1));
    }

    #[test]
    fn test_any_free_gpu() {
        let dir = TempDir::new().unwrap();
        let config = locking_config(&dir, vec![-1]);

        let a = select_device(&config, 2).unwrap();
        let b = select_device(&config, 2).unwrap();
        assert_eq!(a.device(), &Device::Gpu(0));
        assert_eq!(b.device(), &Device::Gpu(1));
        assert!(select_device(&config, 2).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_of_dead_process_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let config = locking_config(&dir, vec![0]);

        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let lock_path = dir.path().join(format!("{}0.lock", LOCK_PREFIX));
        fs::write(&lock_path, format!("{}\n", dead_pid)).unwrap();

        let selected = select_device(&config, 1).unwrap();
        assert_eq!(selected.device(), &Device::Gpu(0));
        let owner = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_lock_of_live_process_is_kept() {
        let dir = TempDir::new().unwrap();
        let config = locking_config(&dir, vec![0]);
        let lock_path = dir.path().join(format!("{}0.lock", LOCK_PREFIX));

        fs::write(&lock_path, format!("{}\n", std::process::id())).unwrap();
        assert!(matches!(select_device(&config, 1), Err(DeviceError::LockTimeout { .. })));

        // Unreadable owner is treated as held too
        fs::write(&lock_path, "").unwrap();
        assert!(matches!(select_device(&config, 1), Err(DeviceError::LockTimeout { .. })));
        assert!(lock_path.exists());
    }

    #[test]
    fn test_device_id_out_of_range() {
        let config = DeviceConfig { device_ids: vec![3], ..DeviceConfig::default() };
        assert!(matches!(
            select_device(&config, 2),
            Err(DeviceError::InvalidDeviceId { id: 3, available: 2 })
        ));
    }
}
