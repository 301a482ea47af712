//! CPU / NUMA topology and the NUMA placement strategies built on it.
//!
//! A [`Topology`] is an ordinary value: detect it once at startup (or build
//! one by hand) and hand it to the pool. Nothing here is process-global.

use crate::affinity::{CpuMask, PlatformOps};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sysinfo::{CpuRefreshKind, System};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub core_to_node: HashMap<usize, usize>,
    pub node_cores: HashMap<usize, Vec<usize>>,
    pub num_nodes: usize,
    /// Node the detecting thread was running on.
    pub current_node: usize,
}

/// How worker threads are placed across NUMA nodes.
///
/// Only consulted when the topology has more than one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NumaStrategy {
    /// Leave placement to the per-worker CPU masks.
    #[default]
    Disabled,
    /// Worker `i` runs on node `i % num_nodes`.
    Distribute,
    /// Every worker runs on the node the pool was created from.
    Isolate,
    /// Every worker runs inside an externally supplied mask (e.g. from numactl).
    External(CpuMask),
}

impl Topology {
    /// Discovers the host topology.
    ///
    /// On Linux the node layout comes from sysfs. Elsewhere, or when sysfs is
    /// unavailable, every CPU reported by `sysinfo` is placed on node 0, since
    /// a wrong NUMA split costs more than a uniform one.
    pub fn detect_with(platform: &dyn PlatformOps) -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(nodes) = linux_nodes() {
                let mut topology = Topology::from_nodes(nodes);
                topology.current_node = platform
                    .current_cpu()
                    .and_then(|cpu| topology.core_to_node.get(&cpu).copied())
                    .unwrap_or(0);
                return topology;
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = platform;

        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        let n_cpus = system.cpus().len().max(1);
        Topology::uniform(n_cpus)
    }

    pub fn detect() -> Self {
        let platform = crate::affinity::default_platform();
        Self::detect_with(platform.as_ref())
    }

    /// A single node holding CPUs `0..n_cpus`.
    pub fn uniform(n_cpus: usize) -> Self {
        Topology::from_nodes(vec![(0, (0..n_cpus).collect())])
    }

    /// Builds a topology from `(node_id, cpus)` pairs.
    pub fn from_nodes(nodes: Vec<(usize, Vec<usize>)>) -> Self {
        let mut core_to_node = HashMap::new();
        let mut node_cores = HashMap::new();
        for (node, cpus) in nodes {
            for &cpu in &cpus {
                core_to_node.insert(cpu, node);
            }
            node_cores.insert(node, cpus);
        }
        let num_nodes = node_cores.len().max(1);
        Topology {
            core_to_node,
            node_cores,
            num_nodes,
            current_node: 0,
        }
    }

    pub fn is_numa(&self) -> bool {
        self.num_nodes > 1
    }

    pub fn n_cpus(&self) -> usize {
        self.core_to_node.len()
    }

    /// Every known CPU.
    pub fn all_cpus(&self) -> CpuMask {
        self.core_to_node.keys().copied().collect()
    }

    fn sorted_nodes(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.node_cores.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The memory/CPU placement for worker `ith`, or `None` when the
    /// strategy leaves this worker alone.
    pub fn numa_mask(&self, strategy: &NumaStrategy, ith: usize) -> Option<CpuMask> {
        if !self.is_numa() {
            return None;
        }
        let node = match strategy {
            NumaStrategy::Disabled => return None,
            NumaStrategy::External(mask) => return Some(*mask),
            NumaStrategy::Distribute => {
                let ids = self.sorted_nodes();
                ids[ith % ids.len()]
            }
            NumaStrategy::Isolate => self.current_node,
        };
        self.node_cores
            .get(&node)
            .map(|cpus| cpus.iter().copied().collect())
    }
}

#[cfg(target_os = "linux")]
fn linux_nodes() -> Option<Vec<(usize, Vec<usize>)>> {
    let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
    let mut nodes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let list = std::fs::read_to_string(entry.path().join("cpulist")).ok()?;
        let cpus = parse_cpulist(list.trim());
        if !cpus.is_empty() {
            nodes.push((id, cpus));
        }
    }
    if nodes.is_empty() { None } else { Some(nodes) }
}

/// Parses the kernel's `0-3,8,10-11` list format.
pub fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_nodes() -> Topology {
        Topology::from_nodes(vec![(0, vec![0, 1, 2, 3]), (1, vec![4, 5, 6, 7])])
    }

    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-3,8,10-11"), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
        assert_eq!(parse_cpulist("5"), vec![5]);
    }

    #[test]
    fn test_uniform_is_not_numa() {
        let topo = Topology::uniform(8);
        assert!(!topo.is_numa());
        assert_eq!(topo.n_cpus(), 8);
        assert_eq!(topo.numa_mask(&NumaStrategy::Distribute, 3), None);
    }

    #[test]
    fn test_distribute_round_robins_nodes() {
        let topo = two_nodes();
        let node0: CpuMask = (0..4).collect();
        let node1: CpuMask = (4..8).collect();
        assert_eq!(topo.numa_mask(&NumaStrategy::Distribute, 0), Some(node0));
        assert_eq!(topo.numa_mask(&NumaStrategy::Distribute, 1), Some(node1));
        assert_eq!(topo.numa_mask(&NumaStrategy::Distribute, 2), Some(node0));
    }

    #[test]
    fn test_isolate_uses_current_node() {
        let mut topo = two_nodes();
        topo.current_node = 1;
        let node1: CpuMask = (4..8).collect();
        for ith in 0..4 {
            assert_eq!(topo.numa_mask(&NumaStrategy::Isolate, ith), Some(node1));
        }
    }

    #[test]
    fn test_external_and_disabled() {
        let topo = two_nodes();
        let mask = CpuMask::from_cpus([2, 6]);
        assert_eq!(topo.numa_mask(&NumaStrategy::External(mask), 9), Some(mask));
        assert_eq!(topo.numa_mask(&NumaStrategy::Disabled, 0), None);
    }
}
