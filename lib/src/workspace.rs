//! The temporary workspace an image is built in, and its publication
//! to the final path.

use std::io::ErrorKind;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::RenameFlags;

use crate::error::ProvisionError;

/// Appended to the target file name for the in-progress image.
const TMP_SUFFIX: &str = ".tmp";
/// Prefix for the private temporary directory.
const WORKDIR_PREFIX: &str = "ostree-toolbox.";
/// Mount point, beneath the temporary directory.
const MNT: &str = "mnt";

/// Fail if anything (including a dangling symlink) exists at `target`.
pub fn guard_target(target: &Utf8Path) -> Result<(), ProvisionError> {
    match target.symlink_metadata() {
        Ok(_) => Err(ProvisionError::AlreadyExists(target.to_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProvisionError::Workspace(
            anyhow::Error::new(e).context(format!("Querying {target}")),
        )),
    }
}

/// Split a target path into its parent directory and file name.
fn split_target(target: &Utf8Path) -> Result<(&Utf8Path, &str)> {
    let name = target
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid target path {target}"))?;
    let parent = target
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    Ok((parent, name))
}

/// The path of the in-progress image for `target`: a sibling, so that
/// publication is a same-filesystem rename.
pub fn tmp_disk_path(target: &Utf8Path) -> Result<Utf8PathBuf> {
    let (parent, name) = split_target(target)?;
    Ok(parent.join(format!("{name}{TMP_SUFFIX}")))
}

/// A private temporary directory (with a mount point) and the temporary
/// image path.
///
/// Dropping a workspace that was neither published nor preserved removes
/// the temporary image and the directory.
#[derive(Debug)]
pub struct Workspace {
    tmpdir: Option<tempfile::TempDir>,
    path: Utf8PathBuf,
    mount_dir: Utf8PathBuf,
    tmp_disk: Utf8PathBuf,
    /// Whether `tmp_disk` is still ours to remove.
    owns_disk: bool,
}

impl Workspace {
    /// Set up a workspace for building `target`, removing any temporary
    /// image left over from a previous run.  The private directory is
    /// created beneath `base`, or the default temporary directory.
    #[context("Creating workspace for {target}")]
    pub fn create(target: &Utf8Path, base: Option<&Utf8Path>) -> Result<Self> {
        let tmp_disk = tmp_disk_path(target)?;
        let (parent, name) = split_target(&tmp_disk)?;
        // Best effort; if this fails, creating the disk will too.
        match Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .and_then(|d| d.remove_all_optional(name))
        {
            Ok(true) => tracing::debug!("Removed stale {tmp_disk}"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to remove stale {tmp_disk}: {e}"),
        }

        let base = match base {
            Some(b) => b.to_owned(),
            None => Utf8PathBuf::try_from(std::env::temp_dir())?,
        };
        std::fs::create_dir_all(&base).with_context(|| format!("Creating {base}"))?;
        let tmpdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(&base)
            .with_context(|| format!("Creating temporary directory in {base}"))?;
        let path = Utf8PathBuf::try_from(tmpdir.path().to_path_buf())?;
        let mount_dir = path.join(MNT);
        std::fs::create_dir_all(&mount_dir).with_context(|| format!("Creating {mount_dir}"))?;
        tracing::debug!("Workspace: {path}");
        Ok(Self {
            tmpdir: Some(tmpdir),
            path,
            mount_dir,
            tmp_disk,
            owns_disk: true,
        })
    }

    /// The private temporary directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The directory the image gets mounted on.
    pub fn mount_dir(&self) -> &Utf8Path {
        &self.mount_dir
    }

    /// Where the image is built before publication.
    pub fn tmp_disk(&self) -> &Utf8Path {
        &self.tmp_disk
    }

    /// Recursively remove the temporary directory.  Safe to call more than once.
    ///
    /// The mount point is removed with a plain `rmdir` first; if that fails
    /// (e.g. something is still mounted there) the directory and the image
    /// are both left alone.
    pub fn teardown(&mut self) -> Result<()> {
        let Some(tmpdir) = self.tmpdir.take() else {
            return Ok(());
        };
        match std::fs::remove_dir(&self.mount_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                let _ = tmpdir.keep();
                self.owns_disk = false;
                return Err(
                    anyhow::Error::new(e).context(format!("Removing {}", self.mount_dir))
                );
            }
        }
        tmpdir.close()?;
        Ok(())
    }

    /// Keep the temporary directory and image on disk, returning the directory.
    fn preserve(&mut self) -> Utf8PathBuf {
        if let Some(tmpdir) = self.tmpdir.take() {
            let _ = tmpdir.keep();
        }
        self.owns_disk = false;
        self.path.clone()
    }

    /// Atomically move the finished image to `target` and remove the
    /// workspace.  The mount must already be released.
    ///
    /// On failure the image and workspace are kept for inspection.
    pub fn publish(mut self, target: &Utf8Path) -> Result<Utf8PathBuf, ProvisionError> {
        let tmp_disk = self.tmp_disk.clone();
        if let Err(source) = rename_noreplace(&tmp_disk, target) {
            let workdir = self.preserve();
            return Err(ProvisionError::Publish {
                tmp_disk,
                workdir,
                source,
            });
        }
        self.owns_disk = false;
        if let Err(source) = self.teardown() {
            let workdir = self.preserve();
            return Err(ProvisionError::Publish {
                tmp_disk: target.to_owned(),
                workdir,
                source,
            });
        }
        Ok(target.to_owned())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("{e:#}");
        }
        if self.owns_disk {
            match std::fs::remove_file(&self.tmp_disk) {
                Ok(()) => tracing::debug!("Removed {}", self.tmp_disk),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {}: {e}", self.tmp_disk),
            }
        }
    }
}

/// Rename `src` to its sibling `target`, refusing to replace an existing file.
#[context("Renaming {src} to {target}")]
fn rename_noreplace(src: &Utf8Path, target: &Utf8Path) -> Result<()> {
    let (parent, src_name) = split_target(src)?;
    let (target_parent, target_name) = split_target(target)?;
    anyhow::ensure!(
        parent == target_parent,
        "{src} and {target} are not in the same directory"
    );
    let d = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
        .with_context(|| format!("Opening {parent}"))?;
    match rustix::fs::renameat_with(&d, src_name, &d, target_name, RenameFlags::NOREPLACE) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::INVAL) => {
            tracing::debug!("RENAME_NOREPLACE unsupported, falling back");
            if d.symlink_metadata_optional(target_name)?.is_some() {
                anyhow::bail!("{target} exists");
            }
            d.rename(src_name, &d, target_name)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
