//! Per-process resource limits, scheduling priority and CPU affinity.
use crate::config::types::{JailError, LimitResource, LimitValue, Result};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::Pid;

fn resource_of(resource: LimitResource) -> Resource {
    match resource {
        LimitResource::CpuTime => Resource::RLIMIT_CPU,
        LimitResource::AddressSpace => Resource::RLIMIT_AS,
        LimitResource::FileSize => Resource::RLIMIT_FSIZE,
        LimitResource::Processes => Resource::RLIMIT_NPROC,
        LimitResource::OpenFiles => Resource::RLIMIT_NOFILE,
        LimitResource::Stack => Resource::RLIMIT_STACK,
        LimitResource::Core => Resource::RLIMIT_CORE,
        LimitResource::Memlock => Resource::RLIMIT_MEMLOCK,
        LimitResource::Rtprio => Resource::RLIMIT_RTPRIO,
        LimitResource::Msgqueue => Resource::RLIMIT_MSGQUEUE,
    }
}

/// Soft and hard limits a configured value stands for.
///
/// Symbolic values are resolved against the limits currently in force. The
/// CPU hard limit sits one second above the soft one so the kernel delivers
/// SIGXCPU before SIGKILL.
pub fn resolve(resource: LimitResource, value: LimitValue) -> Result<(u64, u64)> {
    let (soft, hard) = getrlimit(resource_of(resource))
        .map_err(|e| JailError::Limit(format!("getrlimit({}) failed: {}", resource, e)))?;

    Ok(match value {
        LimitValue::Value(v) if resource == LimitResource::CpuTime => (v, v.saturating_add(1)),
        LimitValue::Value(v) => (v, v),
        LimitValue::CurrentMax => (hard, hard),
        LimitValue::CurrentSoft => (soft, soft),
        LimitValue::Unbounded => (libc::RLIM_INFINITY, libc::RLIM_INFINITY),
    })
}

pub fn apply_rlimit(resource: LimitResource, value: LimitValue, strict_mode: bool) -> Result<()> {
    let (soft, hard) = resolve(resource, value)?;
    match setrlimit(resource_of(resource), soft, hard) {
        Ok(()) => {
            log::debug!("{} set to soft={} hard={}", resource, soft, hard);
            Ok(())
        }
        Err(e) => {
            let msg = format!(
                "Failed to apply {}={} (hard={}): {}",
                resource, soft, hard, e
            );
            if strict_mode {
                Err(JailError::Limit(msg))
            } else {
                log::warn!("{} (permissive mode)", msg);
                Ok(())
            }
        }
    }
}

pub fn apply_nice(level: i32, strict_mode: bool) -> Result<()> {
    // SAFETY: setpriority on the calling process only.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, level) };
    if rc == 0 {
        log::debug!("Nice level set to {}", level);
        return Ok(());
    }

    let msg = format!(
        "Failed to set nice level {}: {}",
        level,
        std::io::Error::last_os_error()
    );
    if strict_mode {
        Err(JailError::Limit(msg))
    } else {
        log::warn!("{} (permissive mode)", msg);
        Ok(())
    }
}

/// The first `max_cpus` CPUs set in `current`, lowest numbers first.
fn first_cpus(current: &CpuSet, max_cpus: u32) -> Result<CpuSet> {
    let mut chosen = CpuSet::new();
    let mut taken = 0;
    for cpu in 0..CpuSet::count() {
        if taken == max_cpus {
            break;
        }
        let allowed = current
            .is_set(cpu)
            .map_err(|e| JailError::Limit(format!("cpu {} out of range: {}", cpu, e)))?;
        if allowed {
            chosen
                .set(cpu)
                .map_err(|e| JailError::Limit(format!("cpu {} out of range: {}", cpu, e)))?;
            taken += 1;
        }
    }
    Ok(chosen)
}

/// Restrict the calling process to at most `max_cpus` of its current CPUs.
pub fn apply_cpu_affinity(max_cpus: u32, strict_mode: bool) -> Result<()> {
    let result = sched_getaffinity(Pid::from_raw(0))
        .map_err(|e| JailError::Limit(format!("sched_getaffinity failed: {}", e)))
        .and_then(|current| first_cpus(&current, max_cpus))
        .and_then(|chosen| {
            sched_setaffinity(Pid::from_raw(0), &chosen)
                .map_err(|e| JailError::Limit(format!("sched_setaffinity failed: {}", e)))
        });
    match result {
        Ok(()) => {
            log::debug!("CPU affinity limited to {} cpus", max_cpus);
            Ok(())
        }
        Err(e) if !strict_mode => {
            log::warn!("{} (permissive mode)", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
