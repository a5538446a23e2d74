//! # ostree-toolbox command line
//!
//! Command line tool to build bootable disk images from ostree repositories.

use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::VmDiskConfig;
use crate::deploy::OstreeCli;
use crate::disk::{parse_size_mib, DiskFormat, GuestfishDiskCreator};
use crate::mount::GuestMount;
use crate::preflight::HostSystem;
use crate::provision::{Collaborators, ProvisionRequest, ProvisionSettings, Provisioner};

/// Create a bootable VM disk image from a commit in an ostree repository.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct CreateVmDiskOpts {
    /// Path to the source ostree repository
    pub(crate) repo: Utf8PathBuf,

    /// Name of the operating system (stateroot) to deploy
    pub(crate) osname: String,

    /// Ref to deploy
    #[clap(value_name = "REF")]
    pub(crate) ostree_ref: String,

    /// Path of the disk image to create; must not exist
    pub(crate) diskpath: Utf8PathBuf,

    /// Origin remote URL recorded in the deployment; defaults to the source repository
    #[clap(long)]
    pub(crate) origin_url: Option<String>,

    /// Warning recorded in the deployment for a system that needs further configuration
    #[clap(long)]
    pub(crate) unconfigured_state: Option<String>,

    /// Add a kernel argument (may be specified multiple times)
    #[clap(long = "karg")]
    pub(crate) kargs: Vec<String>,

    /// Disk size, e.g. `20G`; plain numbers are MiB
    #[clap(long, value_parser = parse_size_mib)]
    pub(crate) size: Option<u64>,

    /// Disk image format
    #[clap(long, value_enum)]
    pub(crate) format: Option<DiskFormat>,
}

impl CreateVmDiskOpts {
    fn request(&self) -> ProvisionRequest {
        ProvisionRequest {
            repo: self.repo.clone(),
            osname: self.osname.clone(),
            ostree_ref: self.ostree_ref.clone(),
            disk_path: self.diskpath.clone(),
            origin_url: self.origin_url.clone(),
            unconfigured_state: self.unconfigured_state.clone(),
            add_kargs: self.kargs.clone(),
        }
    }

    /// Combine configuration with command line overrides.
    fn settings(&self, config: &VmDiskConfig) -> Result<(ProvisionSettings, u64)> {
        let size_mib = match self.size {
            Some(v) => v,
            None => config.size_mib()?,
        };
        let mut mount = config.mount_options();
        if let Some(format) = self.format {
            mount.format = format;
        }
        let settings = ProvisionSettings {
            mount,
            storage: config.storage(),
            workdir: config.workdir().map(ToOwned::to_owned),
        };
        Ok((settings, size_mib))
    }
}

/// Tools for building ostree-based systems.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "ostree-toolbox")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Create a bootable VM disk image.
    ///
    /// The host must have SELinux disabled; the disk is created next to
    /// DISKPATH with a `.tmp` suffix and renamed into place once complete.
    CreateVmDisk(CreateVmDiskOpts),
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::CreateVmDisk(opts) => create_vm_disk(opts).await,
    }
}

async fn create_vm_disk(opts: CreateVmDiskOpts) -> Result<()> {
    let config = crate::config::load_config()?;
    let (settings, size_mib) = opts.settings(&config)?;
    let base_kargs = config.kargs();
    let format = settings.mount.format;
    let req = opts.request();
    let cancel = CancellationToken::new();

    let mut task = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        move || {
            let host = HostSystem;
            let ostree = OstreeCli::new(base_kargs);
            let disk = GuestfishDiskCreator::new(size_mib, format);
            let mounter = GuestMount;
            let collaborators = Collaborators {
                host: &host,
                resolver: &ostree,
                disk: &disk,
                mounter: &mounter,
                deployer: &ostree,
            };
            Provisioner::new(collaborators, settings).provision(&req, &cancel)
        }
    });
    let r = tokio::select! {
        r = &mut task => r,
        sig = tokio::signal::ctrl_c() => {
            match sig {
                Ok(()) => {
                    tracing::debug!("Interrupted, cancelling");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!("Failed to listen for interrupts: {e}"),
            }
            task.await
        }
    };
    let path = r.context("Joining provisioning task")??;
    println!("Created: {path}");
    Ok(())
}

#[test]
fn test_parse_create_vm_disk() {
    let o = Opt::try_parse_from([
        "ostree-toolbox",
        "create-vm-disk",
        "/srv/repo",
        "fedora-atomic",
        "fedora-atomic/f21/x86_64/docker-host",
        "/out/img.qcow2",
    ])
    .unwrap();
    let Opt::CreateVmDisk(opts) = o;
    let req = opts.request();
    assert_eq!(req.repo, "/srv/repo");
    assert_eq!(req.osname, "fedora-atomic");
    assert_eq!(req.ostree_ref, "fedora-atomic/f21/x86_64/docker-host");
    assert_eq!(req.disk_path, "/out/img.qcow2");
    assert!(req.origin_url.is_none());
    assert!(req.unconfigured_state.is_none());
    assert!(req.add_kargs.is_empty());

    let (settings, size) = opts.settings(&VmDiskConfig::default()).unwrap();
    assert_eq!(size, 8192);
    assert_eq!(settings, ProvisionSettings::default());

    let o = Opt::try_parse_from([
        "ostree-toolbox",
        "create-vm-disk",
        "--origin-url=https://example.com/repo",
        "--unconfigured-state",
        "Use rpm-ostree rebase to track a remote",
        "--karg=console=ttyS0",
        "--karg=quiet",
        "--size=20G",
        "--format=raw",
        "/srv/repo",
        "osA",
        "osA/1.0",
        "img.raw",
    ])
    .unwrap();
    let Opt::CreateVmDisk(opts) = o;
    let req = opts.request();
    assert_eq!(req.origin_url.as_deref(), Some("https://example.com/repo"));
    assert_eq!(
        req.unconfigured_state.as_deref(),
        Some("Use rpm-ostree rebase to track a remote")
    );
    assert_eq!(req.add_kargs, ["console=ttyS0", "quiet"]);
    let config = VmDiskConfig {
        size: Some("4G".into()),
        format: Some(DiskFormat::Qcow2),
        ..Default::default()
    };
    let (settings, size) = opts.settings(&config).unwrap();
    assert_eq!(size, 20 * 1024);
    assert_eq!(settings.mount.format, DiskFormat::Raw);

    let invalid: [&[&str]; 3] = [
        &["ostree-toolbox", "create-vm-disk", "/srv/repo", "osA", "osA/1.0"],
        &[
            "ostree-toolbox",
            "create-vm-disk",
            "--size=lots",
            "/srv/repo",
            "osA",
            "osA/1.0",
            "img",
        ],
        &[
            "ostree-toolbox",
            "create-vm-disk",
            "--format=vmdk",
            "/srv/repo",
            "osA",
            "osA/1.0",
            "img",
        ],
    ];
    for bad in invalid {
        assert!(Opt::try_parse_from(bad).is_err(), "{bad:?}");
    }
}
