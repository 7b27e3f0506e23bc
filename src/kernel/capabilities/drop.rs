//! Capability reduction to a retained allow-list.
use super::{capability_mask, read_capabilities, write_capabilities, CapabilityState};
use crate::config::types::{Capability, JailError, Result};

const CAP_SETPCAP: u32 = 8;

/// Reduce every capability set to `retain`.
///
/// Must run after the uid switch (with keep-caps set beforehand), so that
/// retained capabilities survive into the final identity. Retained
/// capabilities are also raised into the ambient set so they survive execve
/// for a non-root uid.
pub fn reduce_capabilities(retain: &[Capability], strict: bool) -> Result<()> {
    let keep = capability_mask(retain);
    let mut state = read_capabilities()?;

    // Effective may have been cleared by the uid switch; permitted has not.
    if state.effective != state.permitted {
        state.effective = state.permitted;
        write_capabilities(&state)?;
    }

    if state.has_effective(CAP_SETPCAP) {
        drop_bounding_except(keep)?;
    } else {
        log::debug!("CAP_SETPCAP not held; bounding set left unchanged");
    }
    clear_ambient();

    let missing = keep & !state.permitted;
    if missing != 0 {
        let names: Vec<&str> = retain
            .iter()
            .filter(|cap| missing & (1u64 << cap.number()) != 0)
            .map(Capability::name)
            .collect();
        if strict {
            return Err(JailError::Privilege(format!(
                "Cannot retain capabilities not held by the sandbox: {}",
                names.join(", ")
            )));
        }
        log::warn!(
            "Capabilities {} not held; continuing without them (permissive mode)",
            names.join(", ")
        );
    }

    let kept = keep & state.permitted;
    write_capabilities(&CapabilityState {
        effective: kept,
        permitted: kept,
        inheritable: kept,
    })?;

    for cap in retain.iter().filter(|cap| kept & (1u64 << cap.number()) != 0) {
        if let Err(e) = raise_ambient(cap.number()) {
            if strict {
                return Err(e);
            }
            log::warn!("{} (permissive mode)", e);
        }
    }

    let after = read_capabilities()?;
    if after.permitted & !kept != 0 {
        return Err(JailError::Privilege(format!(
            "Permitted set still holds {:#x} after reduction",
            after.permitted & !kept
        )));
    }

    log::debug!("Capabilities reduced to {:#x}", kept);
    Ok(())
}

fn drop_bounding_except(keep: u64) -> Result<()> {
    for cap in super::bounding_set() {
        if keep & (1u64 << cap) != 0 {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP on a capability present in the bounding set.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            return Err(JailError::Privilege(format!(
                "Failed to drop capability {} from bounding set: {}",
                cap,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

fn clear_ambient() {
    // SAFETY: clearing the ambient set is always permitted.
    let rc = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
            0,
            0,
            0,
        )
    };
    if rc != 0 {
        log::warn!("Failed to clear ambient capabilities (may not be supported)");
    }
}

fn raise_ambient(cap: u32) -> Result<()> {
    // SAFETY: the capability is already in permitted and inheritable.
    let rc = unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
            cap as libc::c_ulong,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(JailError::Privilege(format!(
            "Failed to raise ambient capability {}: {}",
            cap,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Keep permitted capabilities across the setresuid to a non-root uid.
pub fn set_keep_caps() -> Result<()> {
    // SAFETY: PR_SET_KEEPCAPS only toggles a per-thread flag.
    let rc = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(JailError::Privilege(format!(
            "Failed to set PR_SET_KEEPCAPS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Prevent privilege escalation via execve (setuid, file capabilities).
/// Idempotent and irreversible once set.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is safe and idempotent.
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(JailError::Privilege(
            "Failed to set PR_SET_NO_NEW_PRIVS".to_string(),
        ));
    }
    log::debug!("Set PR_SET_NO_NEW_PRIVS");
    Ok(())
}

pub fn check_no_new_privs() -> bool {
    // SAFETY: read-only query of the calling thread's flag.
    unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) == 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_no_new_privs_is_idempotent() {
        let first = set_no_new_privs();
        let second = set_no_new_privs();
        assert_eq!(first.is_ok(), second.is_ok());
        assert!(check_no_new_privs());
    }

    #[test]
    fn clear_ambient_is_idempotent() {
        clear_ambient();
        clear_ambient();
    }
}
