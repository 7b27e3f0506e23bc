//! Credential transition: clear groups -> setresgid -> setresuid -> verify.

use crate::config::types::{JailError, Result};
use crate::kernel::namespace::setgroups_denied;

pub fn switch_identity(uid: u32, gid: u32, strict_mode: bool) -> Result<()> {
    clear_supplementary_groups(strict_mode)?;
    // GID before UID
    set_gid(gid, strict_mode)?;
    set_uid(uid, strict_mode)?;
    verify_transition(uid, gid, strict_mode)?;

    log::debug!("Switched to UID={}, GID={}", uid, gid);
    Ok(())
}

fn permissive_or(strict_mode: bool, msg: String) -> Result<()> {
    if strict_mode {
        Err(JailError::Privilege(msg))
    } else {
        log::warn!("{} (permissive mode)", msg);
        Ok(())
    }
}

fn clear_supplementary_groups(strict_mode: bool) -> Result<()> {
    // An unprivileged id map denies setgroups for the whole namespace; the
    // group list is already fixed to the mapped gid there.
    if setgroups_denied() {
        log::debug!("setgroups denied in this user namespace; keeping group list");
        return Ok(());
    }

    match nix::unistd::setgroups(&[]) {
        Ok(()) => Ok(()),
        Err(e) => permissive_or(
            strict_mode,
            format!("Failed to clear supplementary groups: {}", e),
        ),
    }
}

fn set_gid(gid: u32, strict_mode: bool) -> Result<()> {
    let gid = nix::unistd::Gid::from_raw(gid);
    match nix::unistd::setresgid(gid, gid, gid) {
        Ok(()) => Ok(()),
        Err(e) => permissive_or(strict_mode, format!("Failed to setresgid({}): {}", gid, e)),
    }
}

fn set_uid(uid: u32, strict_mode: bool) -> Result<()> {
    let uid = nix::unistd::Uid::from_raw(uid);
    match nix::unistd::setresuid(uid, uid, uid) {
        Ok(()) => Ok(()),
        Err(e) => permissive_or(strict_mode, format!("Failed to setresuid({}): {}", uid, e)),
    }
}

fn verify_transition(expected_uid: u32, expected_gid: u32, strict_mode: bool) -> Result<()> {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    let real_uid = getuid().as_raw();
    let effective_uid = geteuid().as_raw();
    if real_uid != expected_uid || effective_uid != expected_uid {
        permissive_or(
            strict_mode,
            format!(
                "UID verification failed: expected {}, got real={}, effective={}",
                expected_uid, real_uid, effective_uid
            ),
        )?;
    }

    let real_gid = getgid().as_raw();
    let effective_gid = getegid().as_raw();
    if real_gid != expected_gid || effective_gid != expected_gid {
        permissive_or(
            strict_mode,
            format!(
                "GID verification failed: expected {}, got real={}, effective={}",
                expected_gid, real_gid, effective_gid
            ),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switching_to_current_identity_is_a_no_op() {
        // setresuid/setresgid to the ids already held needs no privilege.
        // setgroups may still fail for unprivileged users, so use permissive mode.
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        if uid == 0 {
            return;
        }
        assert!(switch_identity(uid, gid, false).is_ok());
        assert_eq!(nix::unistd::geteuid().as_raw(), uid);
    }

    #[test]
    fn verify_reports_mismatch_in_strict_mode() {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        assert!(verify_transition(uid, gid, true).is_ok());
        assert!(verify_transition(uid.wrapping_add(1), gid, true).is_err());
        assert!(verify_transition(uid.wrapping_add(1), gid, false).is_ok());
    }
}
