//! CPU and NUMA placement helpers for the send and receive threads.
//!
//! All of these are Linux-only; elsewhere they return a `System` error so
//! callers can decide whether pinning is mandatory.

use crate::error::Result;

#[cfg(target_os = "linux")]
use crate::error::E2sarError;

/// Restrict the whole process to the given cores.
#[cfg(target_os = "linux")]
pub fn set_process(cores: &[usize]) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        for &core in cores {
            if core >= libc::CPU_SETSIZE as usize {
                return Err(E2sarError::OutOfRange(format!("invalid core number {}", core)));
            }
            libc::CPU_SET(core, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == -1 {
            return Err(E2sarError::System(format!(
                "sched_setaffinity: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_process(_cores: &[usize]) -> Result<()> {
    Err(crate::error::E2sarError::System(
        "setting process affinity not available on this system".to_string(),
    ))
}

/// Pin the calling thread to a single core.
#[cfg(target_os = "linux")]
pub fn set_thread(core: usize) -> Result<()> {
    unsafe {
        if core >= libc::CPU_SETSIZE as usize {
            return Err(E2sarError::OutOfRange(format!("invalid core number {}", core)));
        }
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        let err = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if err != 0 {
            return Err(E2sarError::System(format!(
                "pthread_setaffinity_np: {}",
                std::io::Error::from_raw_os_error(err)
            )));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread(_core: usize) -> Result<()> {
    Err(crate::error::E2sarError::System(
        "setting thread affinity not available on this system".to_string(),
    ))
}

/// Bind future memory allocations of this process to one NUMA node
/// (`set_mempolicy` with MPOL_BIND).
#[cfg(target_os = "linux")]
pub fn set_numa_node(node: usize) -> Result<()> {
    const MPOL_BIND: libc::c_long = 2;
    if node >= 64 {
        return Err(E2sarError::Parameter(format!("requested NUMA node {} not valid", node)));
    }
    let mask: u64 = 1 << node;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_BIND,
            &mask as *const u64,
            64usize,
        )
    };
    if ret != 0 {
        return Err(E2sarError::System(format!(
            "set_mempolicy: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_numa_node(_node: usize) -> Result<()> {
    Err(crate::error::E2sarError::System(
        "NUMA management not available on this system".to_string(),
    ))
}
