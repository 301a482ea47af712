//! CPU affinity and scheduling priority.
//!
//! Everything here is best-effort: a failure to apply a mask or a priority is
//! returned as a [`PlatformError`] and the pool logs it and carries on.

use crate::error::PlatformError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Highest CPU index a mask can represent, plus one.
pub const MAX_CPUS: usize = 512;

const WORDS: usize = MAX_CPUS / 64;

/// A fixed-size set of logical CPU indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    pub const fn empty() -> Self {
        CpuMask { bits: [0; WORDS] }
    }

    /// A mask with CPUs `0..n` set.
    pub fn first_n(n: usize) -> Self {
        (0..n.min(MAX_CPUS)).collect()
    }

    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        cpus.into_iter().collect()
    }

    /// Sets `cpu`. Indices at or above [`MAX_CPUS`] are ignored.
    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] &= !(1 << (cpu % 64));
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPUS).filter(move |&cpu| self.contains(cpu))
    }

    /// Returns the first set CPU at or after `start`, wrapping around once.
    pub fn next_set_from(&self, start: usize) -> Option<usize> {
        (0..MAX_CPUS)
            .map(|offset| (start + offset) % MAX_CPUS)
            .find(|&cpu| self.contains(cpu))
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = CpuMask::empty();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Hands out the CPU mask for the next worker.
///
/// Non-strict placement gives every worker the whole global mask and lets the
/// OS move threads around inside it. Strict placement gives each worker a
/// single CPU: the next set bit after `cursor`, wrapping around when the
/// global mask is exhausted, so workers share CPUs only when there are more
/// workers than CPUs.
pub fn next_cpumask(global: &CpuMask, strict: bool, cursor: &mut usize) -> CpuMask {
    if !strict {
        return *global;
    }
    let mut local = CpuMask::empty();
    if let Some(cpu) = global.next_set_from(*cursor) {
        local.set(cpu);
        *cursor = cpu + 1;
    }
    local
}

/// Scheduling priority for pool threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Background work (`SCHED_BATCH` on Linux).
    Low,
    /// Inherit whatever the spawning thread has.
    #[default]
    Normal,
    Medium,
    High,
    Realtime,
}

/// Platform hooks for thread placement.
///
/// Both calls act on the calling thread. Implementations must be cheap enough
/// to call once per worker per epoch.
pub trait PlatformOps: Send + Sync {
    fn apply_priority(&self, priority: Priority) -> Result<(), PlatformError>;

    fn apply_affinity(&self, mask: &CpuMask) -> Result<(), PlatformError>;

    /// The CPU the calling thread is running on, if the platform can tell.
    fn current_cpu(&self) -> Option<usize> {
        None
    }
}

/// Does nothing and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOps;

impl PlatformOps for NoopOps {
    fn apply_priority(&self, _priority: Priority) -> Result<(), PlatformError> {
        Ok(())
    }

    fn apply_affinity(&self, _mask: &CpuMask) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Portable fallback built on `core_affinity`.
///
/// `core_affinity` can only pin to a single core, so the thread is pinned to
/// the lowest CPU in the mask. Priorities other than `Normal` are unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableOps;

impl PlatformOps for PortableOps {
    fn apply_priority(&self, priority: Priority) -> Result<(), PlatformError> {
        match priority {
            Priority::Normal => Ok(()),
            _ => Err(PlatformError::Unsupported("thread priority")),
        }
    }

    fn apply_affinity(&self, mask: &CpuMask) -> Result<(), PlatformError> {
        let first = mask.iter().next().ok_or(PlatformError::EmptyMask)?;
        let core = core_affinity::get_core_ids()
            .and_then(|ids| ids.into_iter().find(|core| core.id == first))
            .ok_or(PlatformError::Unsupported("core pinning"))?;
        if core_affinity::set_for_current(core) {
            Ok(())
        } else {
            Err(PlatformError::Os {
                call: "core_affinity::set_for_current",
                code: -1,
            })
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxOps;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::mem;

    /// `sched_setaffinity` / `pthread_setschedparam` on the calling thread.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LinuxOps;

    impl PlatformOps for LinuxOps {
        fn apply_priority(&self, priority: Priority) -> Result<(), PlatformError> {
            let (policy, level) = match priority {
                // Keep the inherited policy.
                Priority::Normal => return Ok(()),
                Priority::Low => (libc::SCHED_BATCH, 0),
                Priority::Medium => (libc::SCHED_FIFO, 40),
                Priority::High => (libc::SCHED_FIFO, 80),
                Priority::Realtime => (libc::SCHED_FIFO, 90),
            };
            let rc = unsafe {
                let mut param: libc::sched_param = mem::zeroed();
                param.sched_priority = level;
                libc::pthread_setschedparam(libc::pthread_self(), policy, &param)
            };
            if rc == 0 {
                Ok(())
            } else {
                Err(PlatformError::Os {
                    call: "pthread_setschedparam",
                    code: rc,
                })
            }
        }

        fn apply_affinity(&self, mask: &CpuMask) -> Result<(), PlatformError> {
            if mask.is_empty() {
                return Err(PlatformError::EmptyMask);
            }
            let rc = unsafe {
                let mut cpuset: libc::cpu_set_t = mem::zeroed();
                libc::CPU_ZERO(&mut cpuset);
                for cpu in mask.iter() {
                    libc::CPU_SET(cpu, &mut cpuset);
                }
                libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset)
            };
            if rc == 0 {
                Ok(())
            } else {
                Err(PlatformError::Os {
                    call: "sched_setaffinity",
                    code: std::io::Error::last_os_error().raw_os_error().unwrap_or(rc),
                })
            }
        }

        fn current_cpu(&self) -> Option<usize> {
            let cpu = unsafe { libc::sched_getcpu() };
            usize::try_from(cpu).ok()
        }
    }
}

/// The platform implementation for the build target.
pub fn default_platform() -> Arc<dyn PlatformOps> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxOps)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(PortableOps)
    }
}
