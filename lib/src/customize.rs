//! Adjusting the deployed system's configuration before first boot.

use std::io::{ErrorKind, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir, fs::OpenOptions};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::deploy::Deployer;

/// Directory (relative to the deployment root) holding the storage configuration.
const SYSCONFIG: &str = "etc/sysconfig";
/// Default storage configuration file name.
pub const DEFAULT_STORAGE_CONFIG: &str = "docker-storage";
/// Default storage configuration: devicemapper on the logical volumes created with the disk.
pub const DEFAULT_STORAGE_OPTIONS: &str = "DOCKER_STORAGE_OPTIONS=--storage-opt dm.fs=xfs --storage-opt dm.datadev=/dev/mapper/atomicos-docker--data --storage-opt dm.metadatadev=/dev/mapper/atomicos-docker--meta";

/// A configuration file to replace, if the deployment ships it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCustomization {
    /// File name under `etc/sysconfig`.
    pub config_name: String,
    /// Full replacement content, without the trailing newline.
    pub contents: String,
}

impl Default for StorageCustomization {
    fn default() -> Self {
        Self {
            config_name: DEFAULT_STORAGE_CONFIG.to_string(),
            contents: DEFAULT_STORAGE_OPTIONS.to_string(),
        }
    }
}

/// What [`customize_storage`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOutcome {
    /// The file was rewritten.
    Updated(Utf8PathBuf),
    /// The deployment has no such file; nothing was changed.
    NotPresent(Utf8PathBuf),
}

impl StorageCustomization {
    fn relpath(&self) -> Utf8PathBuf {
        Utf8Path::new(SYSCONFIG).join(&self.config_name)
    }

    /// Overwrite the file below `root` if it exists.  The file is truncated
    /// and rewritten in place, keeping its inode and labels.
    #[context("Customizing storage in {root}")]
    pub fn apply(&self, root: &Utf8Path) -> Result<StorageOutcome> {
        let relpath = self.relpath();
        let path = root.join(&relpath);
        let d = Dir::open_ambient_dir(root, cap_std::ambient_authority())
            .with_context(|| format!("Opening {root}"))?;
        let mut f = match d.open_with(&relpath, OpenOptions::new().write(true).truncate(true)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(StorageOutcome::NotPresent(path));
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Opening {path}"))),
        };
        f.write_all(self.contents.as_bytes())
            .and_then(|_| f.write_all(b"\n"))
            .and_then(|_| f.sync_all())
            .with_context(|| format!("Writing {path}"))?;
        Ok(StorageOutcome::Updated(path))
    }
}

/// Find the current deployment of `osname` in the sysroot at `mount_dir`
/// and apply `storage` to it.
pub fn customize_storage(
    deployer: &dyn Deployer,
    mount_dir: &Utf8Path,
    osname: &str,
    storage: &StorageCustomization,
    cancel: &CancellationToken,
) -> Result<StorageOutcome> {
    let deployment = deployer.current_deployment(mount_dir, osname, cancel)?;
    tracing::debug!("Current deployment: {}", deployment.deployment);
    let outcome = storage.apply(&deployment.directory)?;
    match &outcome {
        StorageOutcome::Updated(p) => println!("Updating storage configuration: {p}"),
        StorageOutcome::NotPresent(p) => println!("No storage configuration detected in {p}"),
    }
    Ok(outcome)
}
