/// Logical Core ID
pub type CoreId = usize;

/// CPU Topology Manager
pub struct CpuTopology {
    physical_cores: usize,
    logical_cores: usize,
}

impl CpuTopology {
    pub fn detect() -> Self {
        Self {
            physical_cores: num_cpus::get_physical(),
            logical_cores: num_cpus::get(),
        }
    }

    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    pub fn physical_cores(&self) -> usize {
        self.physical_cores
    }
}

/// Pin the current thread to a core, wrapping shard ids past the core count.
/// Returns false when pinning is unsupported or rejected.
pub fn pin_to_core(core_id: CoreId) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
        use std::mem;

        let core = core_id % CpuTopology::detect().logical_cores().max(1);
        // SAFETY: cpu_set_t is plain data, zeroed is a valid empty set
        unsafe {
            let mut set: cpu_set_t = mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core, &mut set);

            // 0 = current thread
            let ret = sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &set);
            if ret != 0 {
                tracing::warn!("Failed to pin shard {} to core {}", core_id, core);
                return false;
            }
        }
        true
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
        false
    }
}
