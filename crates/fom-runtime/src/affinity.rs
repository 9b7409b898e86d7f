//! Binding handler threads to CPUs

/// Number of CPUs available to this process
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use nix::sched::{sched_setaffinity, CpuSet};
        use nix::unistd::Pid;

        /// Pin the calling thread to `cpu`; false when the kernel refuses
        pub fn bind_current_thread(cpu: usize) -> bool {
            let mut set = CpuSet::new();
            if set.set(cpu).is_err() {
                return false;
            }
            sched_setaffinity(Pid::from_raw(0), &set).is_ok()
        }
    } else {
        /// Thread affinity is not supported on this platform
        pub fn bind_current_thread(_cpu: usize) -> bool {
            false
        }
    }
}
