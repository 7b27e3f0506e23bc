//! Linux capability management for privilege minimization.
//!
//! Capability sets are read and written through raw capget/capset; the
//! bounding and ambient sets through prctl.

mod drop;

pub use drop::{check_no_new_privs, reduce_capabilities, set_keep_caps, set_no_new_privs};

use crate::config::types::{Capability, JailError, Result};

pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Effective, permitted and inheritable sets of the calling thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityState {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
}

impl CapabilityState {
    pub fn has_permitted(&self, cap: u32) -> bool {
        self.permitted & (1u64 << cap) != 0
    }

    pub fn has_effective(&self, cap: u32) -> bool {
        self.effective & (1u64 << cap) != 0
    }
}

/// Bit mask for a list of capabilities
pub fn capability_mask(caps: &[Capability]) -> u64 {
    caps.iter().fold(0u64, |mask, cap| mask | (1u64 << cap.number()))
}

pub fn read_capabilities() -> Result<CapabilityState> {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];

    // SAFETY: version 3 header with pid 0 (self) and two data slots.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(JailError::Privilege(format!(
            "capget failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let join = |lo: u32, hi: u32| (lo as u64) | ((hi as u64) << 32);
    Ok(CapabilityState {
        effective: join(data[0].effective, data[1].effective),
        permitted: join(data[0].permitted, data[1].permitted),
        inheritable: join(data[0].inheritable, data[1].inheritable),
    })
}

pub fn write_capabilities(state: &CapabilityState) -> Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let split = |v: u64| (v as u32, (v >> 32) as u32);
    let (eff_lo, eff_hi) = split(state.effective);
    let (prm_lo, prm_hi) = split(state.permitted);
    let (inh_lo, inh_hi) = split(state.inheritable);
    let data = [
        CapUserData {
            effective: eff_lo,
            permitted: prm_lo,
            inheritable: inh_lo,
        },
        CapUserData {
            effective: eff_hi,
            permitted: prm_hi,
            inheritable: inh_hi,
        },
    ];

    // SAFETY: properly initialised version 3 header and two data entries.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(JailError::Privilege(format!(
            "capset failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Capabilities currently in the bounding set
pub fn bounding_set() -> Vec<u32> {
    (0..=Capability::LAST)
        .filter(|cap| {
            // SAFETY: PR_CAPBSET_READ only inspects the calling thread.
            unsafe { libc::prctl(libc::PR_CAPBSET_READ, *cap as libc::c_ulong, 0, 0, 0) == 1 }
        })
        .collect()
}
