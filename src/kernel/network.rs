//! Host-side network plumbing for the sandbox network namespace.
//!
//! MACVLAN interfaces are created in the host namespace, moved into the
//! child's namespace and configured there through `ip` and `nsenter`.
use crate::config::types::{JailError, MacvlanSpec, Result};
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Interface name seen inside the sandbox
pub const SANDBOX_IFACE: &str = "vs";
const DEFAULT_NETMASK: &str = "255.255.255.0";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_POLL: Duration = Duration::from_millis(10);

/// Host-side name for the interface before it moves, unique per execution
pub fn host_iface_name(instance_id: &str) -> String {
    let suffix: String = instance_id
        .chars()
        .filter(char::is_ascii_hexdigit)
        .take(8)
        .collect();
    format!("jb{}", suffix)
}

/// Prefix length of a dotted-quad netmask
pub fn prefix_len(netmask: &str) -> Result<u32> {
    let mask: Ipv4Addr = netmask
        .parse()
        .map_err(|_| JailError::Namespace(format!("Invalid netmask: {}", netmask)))?;
    let bits = u32::from(mask);
    // Contiguous masks only
    if bits.leading_ones() != bits.count_ones() {
        return Err(JailError::Namespace(format!(
            "Netmask is not contiguous: {}",
            netmask
        )));
    }
    Ok(bits.count_ones())
}

fn run(program: &str, args: &[&str]) -> Result<()> {
    run_with_timeout(program, args, COMMAND_TIMEOUT)
}

/// Run a helper command, killing it if it outlives `timeout`.
fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<()> {
    let describe = || format!("{} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| JailError::Namespace(format!("Failed to run {}: {}", describe(), e)))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_) => break,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(JailError::Namespace(format!(
                    "{} did not finish within {:?}",
                    describe(),
                    timeout
                )));
            }
            None => thread::sleep(COMMAND_POLL),
        }
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(JailError::Namespace(format!(
            "{} failed ({}): {}",
            describe(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn run_in_netns(pid: i32, args: &[&str]) -> Result<()> {
    let target = pid.to_string();
    let mut full = vec!["-t", target.as_str(), "-n", "ip"];
    full.extend_from_slice(args);
    run("nsenter", &full)
}

/// Clone `spec.interface` into the network namespace of `pid`.
pub fn clone_macvlan(spec: &MacvlanSpec, pid: i32, instance_id: &str) -> Result<()> {
    let name = host_iface_name(instance_id);
    let pid_arg = pid.to_string();

    let mut add = vec!["link", "add", "link", spec.interface.as_str(), "name", name.as_str()];
    if let Some(mac) = &spec.mac {
        add.extend_from_slice(&["address", mac.as_str()]);
    }
    add.extend_from_slice(&["type", "macvlan", "mode", spec.mode.as_str()]);
    run("ip", &add)?;

    if let Err(e) = run("ip", &["link", "set", name.as_str(), "netns", pid_arg.as_str()]) {
        let _ = run("ip", &["link", "delete", name.as_str()]);
        return Err(e);
    }

    run_in_netns(pid, &["link", "set", name.as_str(), "name", SANDBOX_IFACE])?;

    if let Some(ip) = &spec.ip {
        let prefix = prefix_len(spec.netmask.as_deref().unwrap_or(DEFAULT_NETMASK))?;
        let address = format!("{}/{}", ip, prefix);
        run_in_netns(pid, &["addr", "add", address.as_str(), "dev", SANDBOX_IFACE])?;
    }
    run_in_netns(pid, &["link", "set", SANDBOX_IFACE, "up"])?;

    if let Some(gateway) = &spec.gateway {
        run_in_netns(pid, &["route", "add", "default", "via", gateway.as_str()])?;
    }

    log::info!(
        "Cloned {} into netns of pid {} as {} (mode {})",
        spec.interface,
        pid,
        SANDBOX_IFACE,
        spec.mode.as_str()
    );
    Ok(())
}
