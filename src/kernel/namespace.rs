/// Namespace setup performed inside and around the sandbox child
use crate::config::types::{JailError, Result};
use std::fs::{self, File};
use std::os::unix::io::AsRawFd;

/// Set the UTS hostname. Only meaningful inside a private UTS namespace.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname)
        .map_err(|e| JailError::Namespace(format!("Failed to set hostname {}: {}", hostname, e)))?;
    log::debug!("Hostname set to {}", hostname);
    Ok(())
}

/// Enter a fresh time namespace.
///
/// unshare(CLONE_NEWTIME) only affects future children, so the caller then
/// joins the namespace through `time_for_children`. The caller must be
/// single-threaded.
pub fn enter_time_namespace() -> Result<()> {
    let rc = unsafe { libc::unshare(libc::CLONE_NEWTIME) };
    if rc != 0 {
        return Err(JailError::Namespace(format!(
            "Failed to unshare time namespace: {}",
            std::io::Error::last_os_error()
        )));
    }

    let ns = File::open("/proc/self/ns/time_for_children").map_err(|e| {
        JailError::Namespace(format!("Failed to open time_for_children: {}", e))
    })?;
    let rc = unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWTIME) };
    if rc != 0 {
        return Err(JailError::Namespace(format!(
            "Failed to join time namespace: {}",
            std::io::Error::last_os_error()
        )));
    }

    log::debug!("Joined new time namespace");
    Ok(())
}

/// Set IFF_UP on the loopback interface of the current network namespace
pub fn bring_up_loopback() -> Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(JailError::Namespace(format!(
            "Failed to open socket for loopback setup: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (idx, b) in b"lo\0".iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }

    let get_flags_rc = unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr) };
    if get_flags_rc != 0 {
        let err = std::io::Error::last_os_error();
        let _ = unsafe { libc::close(sock) };
        return Err(JailError::Namespace(format!(
            "Failed to query loopback flags: {}",
            err
        )));
    }

    let current_flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int;
    ifr.ifr_ifru.ifru_flags = (current_flags | libc::IFF_UP) as libc::c_short;

    let set_flags_rc = unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr) };
    let set_err = std::io::Error::last_os_error();
    let _ = unsafe { libc::close(sock) };

    if set_flags_rc != 0 {
        return Err(JailError::Namespace(format!(
            "Failed to bring up loopback interface: {}",
            set_err
        )));
    }

    log::debug!("Loopback interface up");
    Ok(())
}

/// Make every mount below / private so nothing propagates back to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        JailError::Namespace(format!(
            "Failed to set / to MS_PRIVATE|MS_REC: {}",
            e
        ))
    })?;

    log::debug!("Mount propagation hardened: / set to MS_PRIVATE|MS_REC");
    Ok(())
}

/// Single-entry uid/gid mapping for a child's user namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdMapping {
    pub inside_uid: u32,
    pub outside_uid: u32,
    pub inside_gid: u32,
    pub outside_gid: u32,
}

impl IdMapping {
    pub fn uid_map_line(&self) -> String {
        format!("{} {} 1\n", self.inside_uid, self.outside_uid)
    }

    pub fn gid_map_line(&self) -> String {
        format!("{} {} 1\n", self.inside_gid, self.outside_gid)
    }
}

/// Write uid_map/gid_map for `pid` from the parent user namespace.
///
/// Unprivileged writers must deny setgroups before gid_map is accepted.
pub fn write_id_maps(pid: i32, mapping: &IdMapping) -> Result<()> {
    let proc_dir = format!("/proc/{}", pid);
    let privileged = nix::unistd::geteuid().is_root();

    if !privileged {
        fs::write(format!("{}/setgroups", proc_dir), "deny").map_err(|e| {
            JailError::Namespace(format!("Failed to deny setgroups for pid {}: {}", pid, e))
        })?;
    }

    fs::write(format!("{}/uid_map", proc_dir), mapping.uid_map_line())
        .map_err(|e| JailError::Namespace(format!("Failed to write uid_map: {}", e)))?;
    fs::write(format!("{}/gid_map", proc_dir), mapping.gid_map_line())
        .map_err(|e| JailError::Namespace(format!("Failed to write gid_map: {}", e)))?;

    log::debug!(
        "Wrote id maps for pid {}: uid {} gid {}",
        pid,
        mapping.uid_map_line().trim(),
        mapping.gid_map_line().trim()
    );
    Ok(())
}

/// Whether setgroups(2) has been denied for the current user namespace
pub fn setgroups_denied() -> bool {
    fs::read_to_string("/proc/self/setgroups")
        .map(|s| s.trim() == "deny")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_map_lines() {
        let mapping = IdMapping {
            inside_uid: 0,
            outside_uid: 1000,
            inside_gid: 65534,
            outside_gid: 100,
        };
        assert_eq!(mapping.uid_map_line(), "0 1000 1\n");
        assert_eq!(mapping.gid_map_line(), "65534 100 1\n");
    }
}
