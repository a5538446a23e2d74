//! Creating the (empty, partitioned) disk image.

use std::fmt::{Debug, Display};

use anyhow::Result;
use camino::Utf8Path;
use clap::ValueEnum;
use fn_error_context::context;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::task::Task;

/// Default disk size in MiB.
pub const DEFAULT_SIZE_MIB: u64 = 8 * 1024;
/// Size of the `/boot` partition, in 512-byte sectors (256 MiB).
const BOOT_SECTORS: u64 = 256 * 1024 * 2;
/// First usable sector, leaving 1 MiB for alignment.
const FIRST_SECTOR: u64 = 2048;
/// LVM volume group holding the root and container storage volumes.
pub const VOLUME_GROUP: &str = "atomicos";
/// Size of the container storage metadata volume.
const DOCKER_META_MIB: u64 = 64;

/// Supported disk image formats.
#[derive(ValueEnum, Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskFormat {
    /// Raw disk image
    Raw,
    /// QEMU copy-on-write v2
    #[default]
    Qcow2,
}

impl DiskFormat {
    /// The name used by qemu and libguestfs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

impl Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materializes a file-backed block device image.
pub trait DiskCreator: Debug {
    /// Create a new disk image at `path`.
    fn create_disk(&self, path: &Utf8Path, cancel: &CancellationToken) -> Result<()>;
}

/// Creates disks via `guestfish`, with a `/boot` partition and an LVM
/// volume group for the root filesystem and container storage.
#[derive(Debug, Clone)]
pub struct GuestfishDiskCreator {
    size_mib: u64,
    format: DiskFormat,
}

impl Default for GuestfishDiskCreator {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_MIB, DiskFormat::default())
    }
}

impl GuestfishDiskCreator {
    /// Create disks of `size_mib` in `format`.
    pub fn new(size_mib: u64, format: DiskFormat) -> Self {
        Self { size_mib, format }
    }

    /// The guestfish commands, separated by `:` as guestfish expects on its command line.
    fn script(&self, path: &Utf8Path) -> Vec<String> {
        let format = self.format.as_str();
        let vg = VOLUME_GROUP;
        let boot_end = FIRST_SECTOR + BOOT_SECTORS - 1;
        let rootfs_start = boot_end + 1;
        let commands = [
            format!("disk-create {path} {format} {}M", self.size_mib),
            format!("add-drive {path} format:{format}"),
            "run".to_string(),
            "part-init /dev/sda mbr".to_string(),
            format!("part-add /dev/sda p {FIRST_SECTOR} {boot_end}"),
            format!("part-add /dev/sda p {rootfs_start} -1"),
            "part-set-bootable /dev/sda 1 true".to_string(),
            "mkfs ext4 /dev/sda1 label:boot".to_string(),
            "pvcreate /dev/sda2".to_string(),
            format!("vgcreate {vg} /dev/sda2"),
            format!("lvcreate-free root {vg} 40"),
            format!("lvcreate docker-meta {vg} {DOCKER_META_MIB}"),
            format!("lvcreate-free docker-data {vg} 100"),
            format!("mkfs xfs /dev/{vg}/root label:root"),
        ];
        let mut args = vec!["--".to_string()];
        for (i, c) in commands.into_iter().enumerate() {
            if i > 0 {
                args.push(":".to_string());
            }
            args.extend(c.split(' ').map(ToOwned::to_owned));
        }
        args
    }
}

impl DiskCreator for GuestfishDiskCreator {
    #[context("Creating disk {path}")]
    fn create_disk(&self, path: &Utf8Path, cancel: &CancellationToken) -> Result<()> {
        let size = self.size_mib;
        Task::new(format!("Creating {size}M {} disk", self.format), "guestfish")
            .args(self.script(path))
            .run_cancellable(cancel)
    }
}

/// Parse a string into mebibytes.  A bare number is taken as mebibytes.
pub fn parse_size_mib(mut s: &str) -> Result<u64> {
    let suffixes = [
        ("MiB", 1u64),
        ("M", 1u64),
        ("GiB", 1024),
        ("G", 1024),
        ("TiB", 1024 * 1024),
        ("T", 1024 * 1024),
    ];
    let mut mul = 1u64;
    for (suffix, imul) in suffixes {
        if let Some((sv, rest)) = s.rsplit_once(suffix) {
            if !rest.is_empty() {
                anyhow::bail!("Trailing text after size: {rest}");
            }
            s = sv;
            mul = imul;
            break;
        }
    }
    let v = s.trim().parse::<u64>()?;
    let v = v
        .checked_mul(mul)
        .ok_or_else(|| anyhow::anyhow!("Size too large: {s}"))?;
    if v == 0 {
        anyhow::bail!("Invalid zero size");
    }
    Ok(v)
}
