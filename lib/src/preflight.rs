//! Host checks that must pass before anything is written, and entry
//! into a private mount namespace.

use std::fmt::Debug;

use anyhow::{Context, Result};
use fn_error_context::context;
use rustix::mount::MountPropagationFlags;
use tokio_util::sync::CancellationToken;

use crate::error::ProvisionError;
use crate::task::Task;

/// The only SELinux status under which we build images.
const SELINUX_DISABLED: &str = "Disabled";
/// Operators hitting the SELinux check should read this.
const SELINUX_REMEDIATION: &str = "https://bugzilla.redhat.com/show_bug.cgi?id=1060423";
/// Set in the environment of the re-executed process.
const UNSHARED_GUARDENV: &str = "_ostree_toolbox_unshared";

/// Proof that the process-wide mount isolation state was set up.
///
/// This is acquired once by [`validate`] and passed by reference to
/// anything that creates mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationContext {
    /// We are in a private mount namespace with `/` recursively private;
    /// mounts we create are invisible to the host.
    PrivateMountNamespace,
    /// No isolation was performed.  Only suitable when nothing real is mounted,
    /// e.g. with test doubles.
    Inherited,
}

/// Access to the ambient host state the workflow depends on.
pub trait HostEnvironment: Debug {
    /// Return the SELinux status as reported by `getenforce`, e.g. `Enforcing`.
    fn selinux_status(&self, cancel: &CancellationToken) -> Result<String>;
    /// Put the process into a private mount namespace.
    fn enter_isolation(&self) -> Result<IsolationContext>;
}

/// Verify that the host permits safe image construction, then enter isolation.
///
/// SELinux must be disabled: we write raw content and labels into a mounted
/// image, and a host policy would mislabel it.
pub fn validate(
    host: &dyn HostEnvironment,
    cancel: &CancellationToken,
) -> Result<IsolationContext, ProvisionError> {
    let status = host
        .selinux_status(cancel)
        .map_err(ProvisionError::Environment)?;
    let status = status.trim();
    if status != SELINUX_DISABLED {
        return Err(ProvisionError::Environment(anyhow::anyhow!(
            "SELinux must be disabled (found {status}); see {SELINUX_REMEDIATION}"
        )));
    }
    let isolation = host
        .enter_isolation()
        .map_err(ProvisionError::Environment)?;
    tracing::debug!("Isolation: {isolation:?}");
    Ok(isolation)
}

/// The real host.
#[derive(Debug, Default)]
pub struct HostSystem;

impl HostEnvironment for HostSystem {
    #[context("Querying SELinux status")]
    fn selinux_status(&self, cancel: &CancellationToken) -> Result<String> {
        if !selinux_enabled()? {
            tracing::debug!("No selinuxfs support in kernel");
            return Ok(SELINUX_DISABLED.to_string());
        }
        let status = Task::new("Querying SELinux status", "getenforce")
            .quiet()
            .read(cancel)?;
        Ok(status.trim().to_string())
    }

    #[context("Entering private mount namespace")]
    fn enter_isolation(&self) -> Result<IsolationContext> {
        require_root()?;
        ensure_self_unshared_mount_namespace()?;
        rustix::mount::mount_change(
            "/",
            MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
        )
        .context("Making / private")?;
        Ok(IsolationContext::PrivateMountNamespace)
    }
}

#[context("Querying selinux availability")]
fn selinux_enabled() -> Result<bool> {
    let filesystems = std::fs::read_to_string("/proc/filesystems")?;
    Ok(filesystems.contains("selinuxfs\n"))
}

#[context("Querying root privilege")]
fn require_root() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        anyhow::bail!("This command requires root privileges");
    }
    if !rustix::thread::capability_is_in_bounding_set(rustix::thread::Capability::SystemAdmin)? {
        anyhow::bail!("This command requires full root privileges (CAP_SYS_ADMIN)");
    }
    Ok(())
}

/// Ensure we've entered a mount namespace distinct from PID 1's, re-executing
/// ourselves under `unshare -m` if necessary.
#[context("Ensuring mountns")]
fn ensure_self_unshared_mount_namespace() -> Result<()> {
    let ns_pid1 = std::fs::read_link("/proc/1/ns/mnt").context("Reading /proc/1/ns/mnt")?;
    let ns_self = std::fs::read_link("/proc/self/ns/mnt").context("Reading /proc/self/ns/mnt")?;
    // If we already appear to be in a mount namespace, or we're already pid1, we're done
    if ns_pid1 != ns_self {
        tracing::debug!("Already in a mount namespace");
        return Ok(());
    }
    if std::env::var_os(UNSHARED_GUARDENV).is_some() {
        if rustix::process::getpid().is_init() {
            tracing::debug!("We are pid 1");
            return Ok(());
        }
        anyhow::bail!("Failed to unshare mount namespace");
    }
    crate::reexec::reexec_with_guardenv(UNSHARED_GUARDENV, &["unshare", "-m", "--"])
}
