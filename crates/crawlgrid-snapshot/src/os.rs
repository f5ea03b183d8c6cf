//! Default OS-backed probes.
//!
//! Memory comes from `sysinfo` (this process plus its descendants);
//! CPU ticks come from `/proc/stat` on Linux and are unsupported elsewhere.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sysinfo::{Pid, System};

use crate::provider::{CpuInfoProvider, CpuTicks, MemoryInfo, MemoryInfoProvider, SamplingError};

/// Probes the local host for memory and CPU figures.
pub struct OsProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl OsProbe {
    pub fn new() -> Result<Self, SamplingError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| SamplingError::Unsupported(e.to_string()))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

impl MemoryInfoProvider for OsProbe {
    fn memory_info(&self) -> Result<MemoryInfo, SamplingError> {
        let mut system = self.system.lock().expect("sysinfo lock");
        system.refresh_memory();
        system.refresh_processes();

        let main_process_bytes = system
            .process(self.pid)
            .map(|p| p.memory())
            .ok_or_else(|| SamplingError::Memory(format!("process {} not found", self.pid)))?;

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut seen = HashSet::from([self.pid]);
        let mut stack = vec![self.pid];
        let mut child_processes_bytes = 0u64;
        while let Some(pid) = stack.pop() {
            for child in children.get(&pid).into_iter().flatten() {
                if seen.insert(*child) {
                    if let Some(process) = system.process(*child) {
                        child_processes_bytes =
                            child_processes_bytes.saturating_add(process.memory());
                    }
                    stack.push(*child);
                }
            }
        }

        Ok(MemoryInfo {
            main_process_bytes,
            child_processes_bytes,
            total_bytes: system.total_memory(),
        })
    }
}

impl CpuInfoProvider for OsProbe {
    fn cpu_ticks(&self) -> Result<CpuTicks, SamplingError> {
        read_cpu_ticks()
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Result<CpuTicks, SamplingError> {
    let content = std::fs::read_to_string("/proc/stat")
        .map_err(|e| SamplingError::Cpu(format!("reading /proc/stat: {e}")))?;
    parse_proc_stat(&content)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks() -> Result<CpuTicks, SamplingError> {
    Err(SamplingError::Unsupported(
        "cpu tick counters are only read on linux".to_string(),
    ))
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// Idle time is `idle + iowait`; total is the sum of the first eight
/// columns (guest time is already folded into user time).
pub(crate) fn parse_proc_stat(content: &str) -> Result<CpuTicks, SamplingError> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| SamplingError::Cpu("no aggregate cpu line".to_string()))?;

    let fields = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SamplingError::Cpu(format!("bad tick counter: {e}")))?;

    if fields.len() < 4 {
        return Err(SamplingError::Cpu(format!(
            "expected at least 4 tick columns, got {}",
            fields.len()
        )));
    }

    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();
    Ok(CpuTicks { idle, total })
}
