use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Raw CPU counters as sampled from the runtime. All values are cumulative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Nanoseconds of CPU time consumed by the container.
    pub total_usage: u64,
    /// Nanoseconds of CPU time consumed by the whole host.
    pub system_usage: u64,
    pub online_cpus: u32,
    #[serde(default)]
    pub percpu_usage: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub usage: u64,
    pub limit: u64,
    /// Key/value pairs from the cgroup memory statistics file.
    #[serde(default)]
    pub stats: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One raw sample of a running container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub network: NetworkUsage,
}

/// Point-in-time figures reported for a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Usage with reclaimable page cache removed, see [`ResourceUsage::adjusted_memory`].
    #[serde(rename = "memory_bytes")]
    pub memory: u64,
    #[serde(rename = "memory_limit_bytes")]
    pub memory_limit: u64,
    /// CPU relative to the whole host, ignoring any limit on the container.
    pub cpu_absolute: f64,
    /// Size of the data directory. Kept while the server is stopped.
    #[serde(rename = "disk_bytes")]
    pub disk: u64,
    pub network: NetworkUsage,
}

/// Current resource usage of one server.
///
/// Written by the stats poller as a unit, read by anyone reporting status.
/// Memory, CPU and network are zeroed when the server leaves the running
/// state; disk usage survives since it does not depend on the process.
#[derive(Debug, Default)]
pub struct ResourceUsage {
    inner: RwLock<ResourceSnapshot>,
}

impl ResourceUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.inner.read().clone()
    }

    /// Applies `f` under the exclusive lock so readers never see a partial update.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ResourceSnapshot),
    {
        let mut guard = self.inner.write();
        f(&mut guard);
    }

    pub fn set_disk(&self, bytes: u64) {
        self.inner.write().disk = bytes;
    }

    pub fn reset(&self) {
        let mut guard = self.inner.write();
        guard.memory = 0;
        guard.cpu_absolute = 0.0;
        guard.network = NetworkUsage::default();
    }

    /// Memory usage minus inactive file-backed pages.
    ///
    /// The raw counter includes page cache the kernel can drop at any time,
    /// which makes it look much larger than what `docker stats` and friends
    /// show. `total_inactive_file` (cgroup v1) wins over `inactive_file`
    /// (cgroup v2); neither is subtracted unless it is below the usage.
    pub fn adjusted_memory(stats: &MemoryStats) -> u64 {
        if let Some(&inactive) = stats.stats.get("total_inactive_file") {
            if inactive < stats.usage {
                return stats.usage - inactive;
            }
        }

        let inactive = stats.stats.get("inactive_file").copied().unwrap_or(0);
        if inactive < stats.usage {
            return stats.usage - inactive;
        }

        stats.usage
    }

    /// CPU usage between two samples as a percentage of one core, summed
    /// across cores, rounded to three decimals.
    pub fn absolute_cpu(previous: &CpuStats, current: &CpuStats) -> f64 {
        let cpu_delta = current.total_usage as f64 - previous.total_usage as f64;
        let system_delta = current.system_usage as f64 - previous.system_usage as f64;

        let mut cpus = current.online_cpus as f64;
        if cpus == 0.0 {
            cpus = current.percpu_usage.len() as f64;
        }

        let mut percent = 0.0;
        if cpu_delta > 0.0 && system_delta > 0.0 {
            percent = (cpu_delta / system_delta) * cpus * 100.0;
        }

        (percent * 1000.0).round() / 1000.0
    }
}
