//! Mounting the guest filesystems of a disk image on the host.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::disk::DiskFormat;
use crate::preflight::IsolationContext;
use crate::task::Task;

/// How long to wait for the FUSE daemon to exit after unmounting.
const DAEMON_EXIT_TIMEOUT: Duration = Duration::from_secs(60);
const DAEMON_EXIT_POLL: Duration = Duration::from_millis(100);

/// How to present the guest's filesystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Partition-to-mountpoint mapping, as `guestmount` arguments,
    /// e.g. `["-m", "/dev/atomicos/root", "-m", "/dev/sda1:/boot"]`.
    pub partition_opts: Vec<String>,
    /// Format of the image.
    pub format: DiskFormat,
    /// Mount writable.
    pub read_write: bool,
}

/// Default guest layout: the root volume, with the first partition on `/boot`.
pub fn default_partition_opts() -> Vec<String> {
    ["-m", "/dev/atomicos/root", "-m", "/dev/sda1:/boot"]
        .into_iter()
        .map(ToOwned::to_owned)
        .collect()
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            partition_opts: default_partition_opts(),
            format: DiskFormat::default(),
            read_write: true,
        }
    }
}

/// An active mount, as returned by [`GuestMounter::mount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    /// Where the guest root is visible.
    pub mount_dir: Utf8PathBuf,
    /// Process serving the mount, if any.
    pub pid: Option<u32>,
}

/// Mounts a disk image's partitions onto a host directory.
pub trait GuestMounter: Debug {
    /// Mount `image` at `mount_dir`.  Only valid inside the isolation
    /// established by [`crate::preflight::validate`].
    fn mount(
        &self,
        isolation: &IsolationContext,
        image: &Utf8Path,
        mount_dir: &Utf8Path,
        opts: &MountOptions,
        cancel: &CancellationToken,
    ) -> Result<MountHandle>;

    /// Tear down a mount.  This must not be interrupted by cancellation.
    fn unmount(&self, handle: &MountHandle) -> Result<()>;
}

/// A live mount, unmounted on drop.
///
/// Use [`Self::close`] on the success path so an unmount failure is reported;
/// on drop it is only logged.
#[derive(Debug)]
pub struct GuestMountSession<'a> {
    mounter: &'a dyn GuestMounter,
    mount_dir: Utf8PathBuf,
    handle: Option<MountHandle>,
}

impl<'a> GuestMountSession<'a> {
    /// Mount `image` at `mount_dir` via `mounter`.
    pub fn mount(
        mounter: &'a dyn GuestMounter,
        isolation: &IsolationContext,
        image: &Utf8Path,
        mount_dir: &Utf8Path,
        opts: &MountOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let handle = mounter.mount(isolation, image, mount_dir, opts, cancel)?;
        Ok(Self {
            mounter,
            mount_dir: handle.mount_dir.clone(),
            handle: Some(handle),
        })
    }

    /// The directory the guest root is mounted on.
    pub fn mount_dir(&self) -> &Utf8Path {
        &self.mount_dir
    }

    /// Unmount, returning any error.
    pub fn close(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.mounter.unmount(&handle),
            None => Ok(()),
        }
    }
}

impl Drop for GuestMountSession<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.mounter.unmount(&handle) {
                tracing::warn!("Failed to unmount {}: {e:#}", handle.mount_dir);
            }
        }
    }
}

/// Mounts via libguestfs' `guestmount` FUSE daemon.
#[derive(Debug, Default)]
pub struct GuestMount;

impl GuestMount {
    fn pidfile_for(mount_dir: &Utf8Path) -> Result<Utf8PathBuf> {
        let name = mount_dir
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Invalid mount directory {mount_dir}"))?;
        Ok(mount_dir.with_file_name(format!("{name}.pid")))
    }

    fn args(
        image: &Utf8Path,
        mount_dir: &Utf8Path,
        opts: &MountOptions,
        pidfile: &Utf8Path,
    ) -> Vec<String> {
        let mut args = vec![
            format!("--format={}", opts.format),
            "-a".to_string(),
            image.to_string(),
        ];
        args.extend(opts.partition_opts.iter().cloned());
        args.push(if opts.read_write { "--rw" } else { "--ro" }.to_string());
        args.extend(["--pid-file".to_string(), pidfile.to_string()]);
        args.push(mount_dir.to_string());
        args
    }
}

impl GuestMounter for GuestMount {
    #[context("Mounting {image} at {mount_dir}")]
    fn mount(
        &self,
        isolation: &IsolationContext,
        image: &Utf8Path,
        mount_dir: &Utf8Path,
        opts: &MountOptions,
        cancel: &CancellationToken,
    ) -> Result<MountHandle> {
        if *isolation != IsolationContext::PrivateMountNamespace {
            tracing::warn!("Mounting {mount_dir} outside a private mount namespace");
        }
        let pidfile = Self::pidfile_for(mount_dir)?;
        Task::new(format!("Mounting {image}"), "guestmount")
            .args(Self::args(image, mount_dir, opts, &pidfile))
            .run_cancellable(cancel)?;
        let pid = match std::fs::read_to_string(&pidfile) {
            Ok(s) => Some(
                s.trim()
                    .parse::<u32>()
                    .with_context(|| format!("Parsing {pidfile}"))?,
            ),
            Err(e) => {
                tracing::debug!("No pid for {mount_dir}: {e}");
                None
            }
        };
        Ok(MountHandle {
            mount_dir: mount_dir.to_owned(),
            pid,
        })
    }

    #[context("Unmounting {}", handle.mount_dir)]
    fn unmount(&self, handle: &MountHandle) -> Result<()> {
        Task::new(format!("Unmounting {}", handle.mount_dir), "guestunmount")
            .quiet()
            .args([handle.mount_dir.as_str()])
            .run()?;
        // guestunmount returns before the daemon has flushed and closed the image.
        if let Some(pid) = handle.pid {
            wait_for_exit(pid, DAEMON_EXIT_TIMEOUT)?;
        }
        Ok(())
    }
}

#[context("Waiting for process {pid} to exit")]
fn wait_for_exit(pid: u32, timeout: Duration) -> Result<()> {
    let procdir = Utf8PathBuf::from(format!("/proc/{pid}"));
    let start = Instant::now();
    while procdir.try_exists()? {
        if start.elapsed() > timeout {
            anyhow::bail!("Timed out after {}s", timeout.as_secs());
        }
        std::thread::sleep(DAEMON_EXIT_POLL);
    }
    Ok(())
}
