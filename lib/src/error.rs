//! Errors returned by the disk provisioning workflow.

use camino::Utf8PathBuf;
use thiserror::Error;

/// A fatal error from [`crate::provision::Provisioner::provision`].
///
/// Every variant is unrecoverable at the workflow level; the variant
/// identifies the step that failed, and the source carries the detail.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The host does not permit building the image; nothing was mutated.
    #[error("Host environment check failed")]
    Environment(#[source] anyhow::Error),
    /// The target disk path is already occupied; nothing was mutated.
    #[error("{0} exists")]
    AlreadyExists(Utf8PathBuf),
    /// The ref could not be resolved in the source repository.
    #[error("Resolving {ostree_ref}")]
    Resolve {
        /// The ref that failed to resolve
        ostree_ref: String,
        /// Underlying error
        #[source]
        source: anyhow::Error,
    },
    /// The temporary workspace could not be set up.
    #[error("Creating temporary workspace")]
    Workspace(#[source] anyhow::Error),
    /// The disk image could not be created.
    #[error("Creating disk image {0}")]
    DiskCreation(Utf8PathBuf, #[source] anyhow::Error),
    /// The disk image could not be mounted.
    #[error("Mounting {0}")]
    Mount(Utf8PathBuf, #[source] anyhow::Error),
    /// Pulling or deploying the commit failed.
    #[error("Deploying {0}")]
    Deployment(String, #[source] anyhow::Error),
    /// Applying security labels to the deployment failed.
    #[error("Labeling deployment")]
    Label(#[source] anyhow::Error),
    /// Adjusting the deployment's configuration failed.
    #[error("Customizing deployment")]
    Customization(#[source] anyhow::Error),
    /// Unmounting failed after all other steps succeeded.
    #[error("Unmounting {0}")]
    Unmount(Utf8PathBuf, #[source] anyhow::Error),
    /// Moving the finished image into place failed.  The temporary image and
    /// workspace were left behind for inspection.
    #[error("Publishing {tmp_disk} (workspace preserved at {workdir})")]
    Publish {
        /// The finished but unpublished image
        tmp_disk: Utf8PathBuf,
        /// The preserved workspace directory
        workdir: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: anyhow::Error,
    },
    /// The operation was cancelled between steps.
    #[error("Operation was cancelled")]
    Cancelled,
}
