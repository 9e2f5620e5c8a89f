//! CPU topology and affinity sets.
//!
//! Reads the kernel CPU list format (`"0-3,6,8-9"`) from sysfs so affinity
//! requests can be validated before any thread is created.

use crate::error::ConfigurationError;
use lockstep_common::consts::{SYSFS_CPU_ISOLATED, SYSFS_CPU_ONLINE};
use std::fmt;
use std::fs;
use std::path::Path;

/// A set of CPU indices. Sorted, without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CpuAffinity {
    cpus: Vec<usize>,
}

impl CpuAffinity {
    pub fn new(cpus: impl IntoIterator<Item = usize>) -> Self {
        let mut cpus: Vec<usize> = cpus.into_iter().collect();
        cpus.sort_unstable();
        cpus.dedup();
        Self { cpus }
    }

    /// Pin to exactly one CPU.
    pub fn single(cpu: usize) -> Self {
        Self { cpus: vec![cpu] }
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.binary_search(&cpu).is_ok()
    }
}

impl fmt::Display for CpuAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_cpu_list(&self.cpus))
    }
}

/// Parse the kernel CPU list format. Whitespace-only input is an empty list.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, ConfigurationError> {
    let bad = |item: &str| ConfigurationError::Topology(format!("invalid CPU list item '{item}'"));
    let mut cpus = Vec::new();
    for item in list.trim().split(',').filter(|s| !s.trim().is_empty()) {
        let item = item.trim();
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().map_err(|_| bad(item))?;
                let hi: usize = hi.parse().map_err(|_| bad(item))?;
                if lo > hi {
                    return Err(bad(item));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(item.parse().map_err(|_| bad(item))?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Inverse of [`parse_cpu_list`]; collapses consecutive runs into ranges.
pub fn format_cpu_list(cpus: &[usize]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < cpus.len() {
        let start = cpus[i];
        let mut end = start;
        while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
            i += 1;
            end = cpus[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{end}"));
        }
        i += 1;
    }
    out
}

fn read_cpu_list(path: &Path) -> Result<Vec<usize>, ConfigurationError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ConfigurationError::Topology(format!("{}: {e}", path.display())))?;
    parse_cpu_list(&content)
}

/// Online and isolated CPUs of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    online: Vec<usize>,
    isolated: Vec<usize>,
}

impl CpuTopology {
    /// Read from sysfs. A missing `isolated` file means no isolated CPUs.
    pub fn detect() -> Result<Self, ConfigurationError> {
        let online = read_cpu_list(Path::new(SYSFS_CPU_ONLINE))?;
        let isolated = read_cpu_list(Path::new(SYSFS_CPU_ISOLATED)).unwrap_or_default();
        Ok(Self::from_lists(online, isolated))
    }

    /// Build from explicit lists; isolated CPUs that are not online are dropped.
    pub fn from_lists(online: Vec<usize>, isolated: Vec<usize>) -> Self {
        let online = CpuAffinity::new(online).cpus;
        let isolated = CpuAffinity::new(isolated)
            .cpus
            .into_iter()
            .filter(|c| online.binary_search(c).is_ok())
            .collect();
        Self { online, isolated }
    }

    pub fn online(&self) -> &[usize] {
        &self.online
    }

    pub fn isolated(&self) -> &[usize] {
        &self.isolated
    }

    pub fn is_online(&self, cpu: usize) -> bool {
        self.online.binary_search(&cpu).is_ok()
    }

    /// CPUs preferred for real-time threads: the isolated set if any,
    /// otherwise every online CPU.
    pub fn rt_candidates(&self) -> &[usize] {
        if self.isolated.is_empty() {
            &self.online
        } else {
            &self.isolated
        }
    }
}
