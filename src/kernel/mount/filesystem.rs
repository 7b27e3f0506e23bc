/// Root filesystem assembly inside the sandbox mount namespace
use crate::config::types::{JailError, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Builds the new root under a staging directory, then switches into it.
///
/// Read-only remounts are deferred until every mount is in place so later
/// mountpoints can still be created beneath read-only destinations.
#[derive(Debug)]
pub struct FilesystemSetup {
    staging: PathBuf,
    strict_mode: bool,
    pending_read_only: Vec<PathBuf>,
    root_read_only: bool,
}

impl FilesystemSetup {
    pub fn new(staging: PathBuf, strict_mode: bool) -> Self {
        Self {
            staging,
            strict_mode,
            pending_read_only: Vec::new(),
            root_read_only: false,
        }
    }

    /// Host path of a sandbox destination
    pub fn target_for(&self, destination: &Path) -> PathBuf {
        self.staging
            .join(destination.strip_prefix("/").unwrap_or(destination))
    }

    /// Mount the new root: a bind of `source`, or an empty tmpfs.
    pub fn mount_root(&mut self, source: Option<&Path>, writable: bool) -> Result<()> {
        fs::create_dir_all(&self.staging).map_err(|e| {
            JailError::Mount(format!(
                "Failed to create staging root {}: {}",
                self.staging.display(),
                e
            ))
        })?;

        match source {
            Some(dir) => mount(
                Some(dir),
                &self.staging,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| {
                JailError::Mount(format!("Failed to bind root {}: {}", dir.display(), e))
            })?,
            None => mount(
                Some("tmpfs"),
                &self.staging,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some("mode=0755"),
            )
            .map_err(|e| JailError::Mount(format!("Failed to mount tmpfs root: {}", e)))?,
        }

        self.root_read_only = !writable;
        log::debug!(
            "Root mounted at {} from {:?} (writable={})",
            self.staging.display(),
            source,
            writable
        );
        Ok(())
    }

    pub fn bind(&mut self, source: &Path, destination: &Path, read_only: bool) -> Result<()> {
        let target = self.target_for(destination);
        create_mountpoint(&target, source.is_dir())?;

        mount(
            Some(source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| {
            JailError::Mount(format!(
                "Failed to bind {} to {}: {}",
                source.display(),
                destination.display(),
                e
            ))
        })?;

        if read_only {
            self.pending_read_only.push(target);
        }
        log::debug!(
            "Bound {} -> {} (ro={})",
            source.display(),
            destination.display(),
            read_only
        );
        Ok(())
    }

    pub fn tmpfs(
        &mut self,
        destination: &Path,
        options: Option<&str>,
        read_only: bool,
    ) -> Result<()> {
        let target = self.target_for(destination);
        create_mountpoint(&target, true)?;

        mount(
            Some("tmpfs"),
            &target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            options,
        )
        .map_err(|e| {
            JailError::Mount(format!(
                "Failed to mount tmpfs at {}: {}",
                destination.display(),
                e
            ))
        })?;

        if read_only {
            self.pending_read_only.push(target);
        }
        log::debug!(
            "Mounted tmpfs at {} (ro={})",
            destination.display(),
            read_only
        );
        Ok(())
    }

    pub fn typed(
        &mut self,
        source: Option<&Path>,
        destination: &Path,
        fs_type: &str,
        options: Option<&str>,
        read_only: bool,
    ) -> Result<()> {
        let target = self.target_for(destination);
        create_mountpoint(&target, true)?;

        let source = source.map(Path::as_os_str).unwrap_or_else(|| "none".as_ref());
        mount(
            Some(source),
            &target,
            Some(fs_type),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            options,
        )
        .map_err(|e| {
            JailError::Mount(format!(
                "Failed to mount {} at {}: {}",
                fs_type,
                destination.display(),
                e
            ))
        })?;

        if read_only {
            self.pending_read_only.push(target);
        }
        log::debug!("Mounted {} at {}", fs_type, destination.display());
        Ok(())
    }

    pub fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        let link_path = self.target_for(link);
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                JailError::Mount(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        match std::os::unix::fs::symlink(target, &link_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && !self.strict_mode => {
                log::warn!("Symlink {} already exists (permissive mode)", link.display());
            }
            Err(e) => {
                return Err(JailError::Mount(format!(
                    "Failed to create symlink {} -> {}: {}",
                    link.display(),
                    target.display(),
                    e
                )))
            }
        }
        Ok(())
    }

    /// Mount a proc instance for the current pid namespace
    pub fn proc(&mut self, path: &Path, read_write: bool) -> Result<()> {
        let target = self.target_for(path);
        create_mountpoint(&target, true)?;

        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        if !read_write {
            flags |= MsFlags::MS_RDONLY;
        }

        mount(Some("proc"), &target, Some("proc"), flags, None::<&str>).map_err(|e| {
            JailError::Mount(format!("Failed to mount proc at {}: {}", path.display(), e))
        })?;

        log::debug!("Mounted proc at {} (rw={})", path.display(), read_write);
        Ok(())
    }

    /// Apply deferred read-only remounts and switch root.
    pub fn enter_root(self, pivot: bool, working_dir: &Path) -> Result<()> {
        for target in &self.pending_read_only {
            remount_read_only(target)?;
        }
        if self.root_read_only {
            remount_read_only(&self.staging)?;
        }

        nix::unistd::chdir(&self.staging).map_err(|e| {
            JailError::Mount(format!(
                "Failed to chdir into {}: {}",
                self.staging.display(),
                e
            ))
        })?;

        if pivot {
            // Old root is stacked under the new one and detached right away
            nix::unistd::pivot_root(".", ".")
                .map_err(|e| JailError::Mount(format!("pivot_root failed: {}", e)))?;
            umount2(".", MntFlags::MNT_DETACH)
                .map_err(|e| JailError::Mount(format!("Failed to detach old root: {}", e)))?;
        } else {
            nix::unistd::chroot(".")
                .map_err(|e| JailError::Mount(format!("chroot failed: {}", e)))?;
        }

        nix::unistd::chdir("/")
            .map_err(|e| JailError::Mount(format!("Failed to chdir to new root: {}", e)))?;
        nix::unistd::chdir(working_dir).map_err(|e| {
            JailError::Mount(format!(
                "Failed to chdir to working directory {}: {}",
                working_dir.display(),
                e
            ))
        })?;

        log::debug!("Entered new root (pivot={})", pivot);
        Ok(())
    }
}

fn create_mountpoint(target: &Path, directory: bool) -> Result<()> {
    if target.exists() {
        return Ok(());
    }

    let result = if directory {
        fs::create_dir_all(target)
    } else {
        target
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fs::File::create(target).map(|_| ()))
    };

    result.map_err(|e| {
        JailError::Mount(format!(
            "Failed to create mountpoint {}: {}",
            target.display(),
            e
        ))
    })
}

/// Flags that must be carried over when remounting a mount that may
/// belong to a more privileged mount namespace.
pub fn locked_mount_flags(target: &Path) -> Result<MsFlags> {
    let path = CString::new(target.as_os_str().as_bytes())
        .map_err(|_| JailError::Mount(format!("Path contains NUL: {}", target.display())))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(JailError::Mount(format!(
            "statvfs({}) failed: {}",
            target.display(),
            std::io::Error::last_os_error()
        )));
    }

    let table = [
        (libc::ST_NOSUID, MsFlags::MS_NOSUID),
        (libc::ST_NODEV, MsFlags::MS_NODEV),
        (libc::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (libc::ST_NOATIME, MsFlags::MS_NOATIME),
        (libc::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (libc::ST_RELATIME, MsFlags::MS_RELATIME),
    ];
    Ok(table
        .iter()
        .filter(|(st, _)| stat.f_flag & *st != 0)
        .fold(MsFlags::empty(), |acc, (_, ms)| acc | *ms))
}

fn remount_read_only(target: &Path) -> Result<()> {
    let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY
        | locked_mount_flags(target)?;
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        JailError::Mount(format!(
            "Failed to remount {} read-only: {}",
            target.display(),
            e
        ))
    })?;
    log::debug!("Remounted {} read-only", target.display());
    Ok(())
}
