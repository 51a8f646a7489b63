use std::fs;
use std::path::PathBuf;

use crate::errors::BridgeError;

use super::MemoryProfile;

/// Source of device memory figures. Sampled on every query.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Result<MemoryProfile, BridgeError>;
}

/// Best-effort "give unused pages back" call made before sampling.
pub trait AllocatorHint: Send + Sync {
    fn release_unused(&self) {}
}

pub struct NoopAllocatorHint;

impl AllocatorHint for NoopAllocatorHint {}

/// Reads `/proc/meminfo` and the cgroup v2 ceiling of the current process.
///
/// The heap limit is, in order: the configured override, the cgroup
/// `memory.max` value (when it is a number), the total device memory.
#[derive(Debug, Clone)]
pub struct SystemMemoryProbe {
    meminfo_path: PathBuf,
    cgroup_limit_path: PathBuf,
    heap_limit_override_mb: Option<u64>,
    large_heap: bool,
}

impl SystemMemoryProbe {
    pub fn new(heap_limit_override_mb: Option<u64>, large_heap: bool) -> Self {
        Self {
            meminfo_path: PathBuf::from("/proc/meminfo"),
            cgroup_limit_path: PathBuf::from("/sys/fs/cgroup/memory.max"),
            heap_limit_override_mb,
            large_heap,
        }
    }

    pub fn with_paths(mut self, meminfo: impl Into<PathBuf>, cgroup_limit: impl Into<PathBuf>) -> Self {
        self.meminfo_path = meminfo.into();
        self.cgroup_limit_path = cgroup_limit.into();
        self
    }

    fn cgroup_limit_mb(&self) -> Option<u64> {
        let raw = fs::read_to_string(&self.cgroup_limit_path).ok()?;
        let bytes = raw.trim().parse::<u64>().ok()?;
        Some(bytes / (1024 * 1024))
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> Result<MemoryProfile, BridgeError> {
        let text = fs::read_to_string(&self.meminfo_path).map_err(|e| {
            BridgeError::MemoryProbe(format!(
                "cannot read {}: {}",
                self.meminfo_path.display(),
                e
            ))
        })?;
        let (total_kb, available_kb) = parse_meminfo(&text).ok_or_else(|| {
            BridgeError::MemoryProbe(format!(
                "no MemTotal in {}",
                self.meminfo_path.display()
            ))
        })?;

        let total_mb = total_kb / 1024;
        let available_mb = available_kb / 1024;
        let heap_limit_mb = match self.heap_limit_override_mb {
            Some(mb) => mb,
            None => self
                .cgroup_limit_mb()
                .map(|limit| limit.min(total_mb))
                .unwrap_or(total_mb),
        };

        Ok(MemoryProfile {
            total_device_memory_mb: total_mb,
            available_memory_mb: available_mb,
            heap_limit_mb,
            is_large_heap_enabled: self.large_heap,
        })
    }
}

/// Returns `(MemTotal, MemAvailable)` in kB. Kernels without
/// `MemAvailable` fall back to `MemFree`.
pub fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or("");
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            _ => {}
        }
    }

    let total = total?;
    Some((total, available.or(free).unwrap_or(0)))
}

/// Always reports the same profile.
#[derive(Debug, Clone)]
pub struct FixedMemoryProbe {
    profile: MemoryProfile,
}

impl FixedMemoryProbe {
    pub fn new(profile: MemoryProfile) -> Self {
        Self { profile }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn sample(&self) -> Result<MemoryProfile, BridgeError> {
        Ok(self.profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    const MEMINFO: &str = "MemTotal:        8048640 kB\nMemFree:          512000 kB\nMemAvailable:    2097152 kB\nBuffers:          102400 kB\n";

    fn scratch_dir(tag: &str) -> PathBuf {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("mpllm_{}_{}", tag, now_ns));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn parse_meminfo_reads_total_and_available() {
        assert_eq!(parse_meminfo(MEMINFO), Some((8048640, 2097152)));
        assert_eq!(
            parse_meminfo("MemTotal: 1024 kB\nMemFree: 256 kB\n"),
            Some((1024, 256))
        );
        assert_eq!(parse_meminfo("Buffers: 1 kB\n"), None);
    }

    #[test]
    fn system_probe_uses_cgroup_ceiling_as_heap() {
        let dir = scratch_dir("probe_cgroup");
        fs::write(dir.join("meminfo"), MEMINFO).expect("write meminfo");
        fs::write(dir.join("memory.max"), format!("{}\n", 512u64 * 1024 * 1024)).expect("write limit");

        let probe = SystemMemoryProbe::new(None, false)
            .with_paths(dir.join("meminfo"), dir.join("memory.max"));
        let profile = probe.sample().expect("sample");
        assert_eq!(profile.total_device_memory_mb, 7860);
        assert_eq!(profile.available_memory_mb, 2048);
        assert_eq!(profile.heap_limit_mb, 512);
        assert!(!profile.is_large_heap_enabled);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unlimited_cgroup_falls_back_to_total() {
        let dir = scratch_dir("probe_max");
        fs::write(dir.join("meminfo"), MEMINFO).expect("write meminfo");
        fs::write(dir.join("memory.max"), "max\n").expect("write limit");

        let probe = SystemMemoryProbe::new(None, true)
            .with_paths(dir.join("meminfo"), dir.join("memory.max"));
        let profile = probe.sample().expect("sample");
        assert_eq!(profile.heap_limit_mb, profile.total_device_memory_mb);
        assert!(profile.is_large_heap_enabled);

        let pinned = SystemMemoryProbe::new(Some(900), false)
            .with_paths(dir.join("meminfo"), dir.join("memory.max"));
        assert_eq!(pinned.sample().expect("sample").heap_limit_mb, 900);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_meminfo_is_a_probe_error() {
        let probe = SystemMemoryProbe::new(None, false)
            .with_paths("/nonexistent/meminfo", "/nonexistent/memory.max");
        assert!(matches!(probe.sample(), Err(BridgeError::MemoryProbe(_))));
    }
}
