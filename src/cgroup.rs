//! Raw counter sampling for containers on a cgroup v2 host.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{sysconf, SysconfVar};

use crate::errors::{AgentError, AgentResult};
use crate::resources::{CpuStats, MemoryStats, NetworkUsage, StatsSample};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Reads one sample for the cgroup that `pid` lives in.
pub fn sample(pid: u32) -> AgentResult<StatsSample> {
    let cgroup_dir = cgroup_dir_for_pid(pid)?;

    let cpu_stat = read_to_string_opt(&cgroup_dir.join("cpu.stat"))?
        .map(|s| parse_kv_u64_lines(&s))
        .unwrap_or_default();
    let (system_usage, percpu_usage) =
        parse_proc_stat(&fs::read_to_string("/proc/stat")?, clock_ticks()).ok_or_else(|| {
            AgentError::ContainerError("Unreadable /proc/stat".to_string())
        })?;

    let usage = read_u64_opt(&cgroup_dir.join("memory.current"))?.unwrap_or(0);
    let limit = match read_u64_opt(&cgroup_dir.join("memory.max")) {
        Ok(Some(limit)) => limit,
        // "max" means unlimited, report the host total instead.
        _ => host_memory_bytes().unwrap_or(0),
    };
    let memory_stat = read_to_string_opt(&cgroup_dir.join("memory.stat"))?
        .map(|s| parse_kv_u64_lines(&s))
        .unwrap_or_default();

    let network = read_to_string_opt(Path::new(&format!("/proc/{}/net/dev", pid)))?
        .map(|s| parse_net_dev(&s))
        .unwrap_or_default();

    Ok(StatsSample {
        cpu: CpuStats {
            total_usage: cpu_stat.get("usage_usec").copied().unwrap_or(0) * 1_000,
            system_usage,
            online_cpus: online_cpus(),
            percpu_usage,
        },
        memory: MemoryStats {
            usage,
            limit,
            stats: memory_stat,
        },
        network,
    })
}

fn cgroup_dir_for_pid(pid: u32) -> AgentResult<PathBuf> {
    let content = fs::read_to_string(format!("/proc/{}/cgroup", pid))?;
    let relative = parse_unified_cgroup(&content).ok_or_else(|| {
        AgentError::ContainerError(format!("No cgroup v2 hierarchy for pid {}", pid))
    })?;
    Ok(Path::new(CGROUP_ROOT).join(relative.trim_start_matches('/')))
}

fn parse_unified_cgroup(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
}

fn clock_ticks() -> u64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => 100,
    }
}

fn online_cpus() -> u32 {
    match sysconf(SysconfVar::_NPROCESSORS_ONLN) {
        Ok(Some(cpus)) if cpus > 0 => cpus as u32,
        _ => 0,
    }
}

fn host_memory_bytes() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn read_to_string_opt(path: &Path) -> AgentResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AgentError::IoError(format!("read {}: {}", path.display(), e))),
    }
}

fn read_u64_opt(path: &Path) -> AgentResult<Option<u64>> {
    let Some(s) = read_to_string_opt(path)? else {
        return Ok(None);
    };
    Ok(s.trim().parse::<u64>().ok())
}

fn parse_kv_u64_lines(s: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for line in s.lines() {
        let mut it = line.split_whitespace();
        let Some(k) = it.next() else { continue };
        let Some(vs) = it.next() else { continue };
        if let Ok(v) = vs.parse::<u64>() {
            out.insert(k.to_string(), v);
        }
    }
    out
}

/// Host CPU time in nanoseconds plus per-core totals, from `/proc/stat`.
///
/// Sums user, nice, system, idle, iowait, irq and softirq like the docker
/// daemon does for `system_cpu_usage`.
fn parse_proc_stat(content: &str, ticks: u64) -> Option<(u64, Vec<u64>)> {
    let to_nanos = |fields: std::str::SplitWhitespace<'_>| -> u64 {
        let jiffies: u64 = fields.take(7).filter_map(|f| f.parse::<u64>().ok()).sum();
        let nanos = u128::from(jiffies) * u128::from(NANOS_PER_SECOND) / u128::from(ticks.max(1));
        u64::try_from(nanos).unwrap_or(u64::MAX)
    };

    let mut total = None;
    let mut per_core = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("cpu") => total = Some(to_nanos(fields)),
            Some(name) if name.starts_with("cpu") => per_core.push(to_nanos(fields)),
            _ => {}
        }
    }

    total.map(|total| (total, per_core))
}

/// Sums receive/transmit bytes over every interface except loopback.
fn parse_net_dev(content: &str) -> NetworkUsage {
    let mut usage = NetworkUsage::default();
    for line in content.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|f| f.parse::<u64>().ok())
            .collect();
        if fields.len() < 9 {
            continue;
        }
        usage.rx_bytes += fields[0];
        usage.tx_bytes += fields[8];
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unified_cgroup() {
        let content = "12:cpuset:/\n0::/system.slice/nerdctl-abc.scope\n";
        assert_eq!(
            parse_unified_cgroup(content),
            Some("/system.slice/nerdctl-abc.scope")
        );
        assert_eq!(parse_unified_cgroup("4:memory:/docker/abc\n"), None);
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = "\
cpu  100 0 50 800 50 0 0 0 0 0
cpu0 50 0 25 400 25 0 0 0 0 0
cpu1 50 0 25 400 25 0 0 0 0 0
intr 12345 0 0
ctxt 999
";
        let (total, per_core) = parse_proc_stat(content, 100).unwrap();
        // 1000 jiffies at 100Hz
        assert_eq!(total, 10 * NANOS_PER_SECOND);
        assert_eq!(per_core, vec![5 * NANOS_PER_SECOND, 5 * NANOS_PER_SECOND]);
        assert!(parse_proc_stat("intr 1\n", 100).is_none());
    }

    #[test]
    fn test_parse_proc_stat_long_uptime() {
        // ~2e11 jiffies: a year or more of uptime on a many-core host
        let content = "cpu  40000000000 0 40000000000 120000000000 0 0 0 0 0 0\n";
        let (total, _) = parse_proc_stat(content, 100).unwrap();
        assert_eq!(total, 2_000_000_000 * NANOS_PER_SECOND);
    }

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let content = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    5000      10    0    0    0     0          0         0     5000      10    0    0    0     0       0          0
  eth0:   12000      30    0    0    0     0          0         0     3400      20    0    0    0     0       0          0
  eth1:     100       1    0    0    0     0          0         0       50       1    0    0    0     0       0          0
";
        let usage = parse_net_dev(content);
        assert_eq!(usage.rx_bytes, 12100);
        assert_eq!(usage.tx_bytes, 3450);
    }

    #[test]
    fn test_parse_kv_lines() {
        let stats = parse_kv_u64_lines("anon 4096\ninactive_file 1024\nbroken\nweird x\n");
        assert_eq!(stats.get("inactive_file"), Some(&1024));
        assert_eq!(stats.get("anon"), Some(&4096));
        assert_eq!(stats.len(), 2);
    }
}
