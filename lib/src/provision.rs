//! The `create-vm-disk` pipeline: from a ref in a repository to a bootable
//! disk image at a fresh path.
//!
//! Steps run strictly in order:
//!
//! 1. host checks and mount isolation ([`crate::preflight`])
//! 2. refusing an occupied target
//! 3. resolving the ref
//! 4. the temporary workspace ([`crate::workspace`])
//! 5. creating the disk ([`crate::disk`])
//! 6. mounting it ([`crate::mount`]), then within the mount: deploying,
//!    labeling ([`crate::deploy`]) and customizing ([`crate::customize`])
//! 7. unmounting, and publishing the image to the target path
//!
//! Any failure after the mount is established still unmounts before the
//! error is returned; any failure before publication removes the workspace
//! and temporary image.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::customize::{customize_storage, StorageCustomization};
use crate::deploy::{DeployOptions, DeploySource, Deployer, ResolvedRevision, RevisionResolver};
use crate::disk::DiskCreator;
use crate::error::ProvisionError;
use crate::mount::{GuestMountSession, GuestMounter, MountOptions};
use crate::preflight::{self, HostEnvironment};
use crate::workspace::{self, Workspace};

/// One image to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Source repository
    pub repo: Utf8PathBuf,
    /// Stateroot name
    pub osname: String,
    /// Ref to deploy
    pub ostree_ref: String,
    /// Final image path; must not exist
    pub disk_path: Utf8PathBuf,
    /// Origin remote URL recorded in the deployment
    pub origin_url: Option<String>,
    /// Warning recorded in the deployment's origin
    pub unconfigured_state: Option<String>,
    /// Additional kernel arguments
    pub add_kargs: Vec<String>,
}

/// Site policy that is not part of an individual request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionSettings {
    /// Guest mount layout
    pub mount: MountOptions,
    /// Storage configuration rewrite
    pub storage: StorageCustomization,
    /// Parent of the temporary workspace; defaults to the system temporary directory.
    pub workdir: Option<Utf8PathBuf>,
}

/// The external capabilities the pipeline depends on.
#[derive(Debug, Clone, Copy)]
pub struct Collaborators<'a> {
    /// Host checks and isolation
    pub host: &'a dyn HostEnvironment,
    /// Ref resolution
    pub resolver: &'a dyn RevisionResolver,
    /// Disk creation
    pub disk: &'a dyn DiskCreator,
    /// Guest mounting
    pub mounter: &'a dyn GuestMounter,
    /// Deployment, labeling and deployment lookup
    pub deployer: &'a dyn Deployer,
}

/// Builds disk images.
#[derive(Debug)]
pub struct Provisioner<'a> {
    collaborators: Collaborators<'a>,
    settings: ProvisionSettings,
}

/// Map a failed step to its error kind, unless the failure was caused by
/// cancellation.
fn step<T>(
    cancel: &CancellationToken,
    r: Result<T>,
    kind: impl FnOnce(anyhow::Error) -> ProvisionError,
) -> Result<T, ProvisionError> {
    r.map_err(|e| {
        if cancel.is_cancelled() {
            tracing::debug!("Interrupted: {e:#}");
            ProvisionError::Cancelled
        } else {
            kind(e)
        }
    })
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }
    Ok(())
}

impl<'a> Provisioner<'a> {
    /// Create a provisioner.
    pub fn new(collaborators: Collaborators<'a>, settings: ProvisionSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }

    /// Build the image for `req`, returning the published path.
    pub fn provision(
        &self,
        req: &ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, ProvisionError> {
        let c = &self.collaborators;
        let isolation = preflight::validate(c.host, cancel)?;
        workspace::guard_target(&req.disk_path)?;
        ensure_not_cancelled(cancel)?;
        let revision = step(
            cancel,
            c.resolver.resolve(&req.repo, &req.ostree_ref, cancel),
            |source| ProvisionError::Resolve {
                ostree_ref: req.ostree_ref.clone(),
                source,
            },
        )?;
        tracing::debug!("Resolved {} to {revision}", req.ostree_ref);

        ensure_not_cancelled(cancel)?;
        let ws = Workspace::create(&req.disk_path, self.settings.workdir.as_deref())
            .map_err(ProvisionError::Workspace)?;
        let tmp_disk = ws.tmp_disk().to_owned();
        step(cancel, c.disk.create_disk(&tmp_disk, cancel), |e| {
            ProvisionError::DiskCreation(tmp_disk.clone(), e)
        })?;

        ensure_not_cancelled(cancel)?;
        let session = step(
            cancel,
            GuestMountSession::mount(
                c.mounter,
                &isolation,
                &tmp_disk,
                ws.mount_dir(),
                &self.settings.mount,
                cancel,
            ),
            |e| ProvisionError::Mount(tmp_disk.clone(), e),
        )?;
        // Errors from here drop the session, unmounting before the workspace goes.
        let mount_dir = session.mount_dir().to_owned();
        self.populate(&mount_dir, req, &revision, cancel)?;
        session
            .close()
            .map_err(|e| ProvisionError::Unmount(mount_dir, e))?;

        ws.publish(&req.disk_path)
    }

    /// Deploy, label and customize inside the mounted image.
    fn populate(
        &self,
        mount_dir: &Utf8Path,
        req: &ProvisionRequest,
        revision: &ResolvedRevision,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let deployer = self.collaborators.deployer;
        let source = DeploySource {
            repo: &req.repo,
            osname: &req.osname,
            ostree_ref: &req.ostree_ref,
            revision,
            origin_url: req.origin_url.as_deref(),
        };
        let options = DeployOptions {
            add_kargs: req.add_kargs.clone(),
            unconfigured_state: req.unconfigured_state.clone(),
        };
        let refspec = format!("{}:{}", req.osname, req.ostree_ref);
        step(
            cancel,
            deployer.pull_deploy(mount_dir, &source, &options, cancel),
            |e| ProvisionError::Deployment(refspec, e),
        )?;
        ensure_not_cancelled(cancel)?;
        step(
            cancel,
            deployer.ensure_labeled(mount_dir, cancel),
            ProvisionError::Label,
        )?;
        ensure_not_cancelled(cancel)?;
        step(
            cancel,
            customize_storage(
                deployer,
                mount_dir,
                &req.osname,
                &self.settings.storage,
                cancel,
            ),
            ProvisionError::Customization,
        )?;
        Ok(())
    }
}
