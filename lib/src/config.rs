//! # Configuration for `create-vm-disk`
//!
//! Optional TOML fragments in `ostree-toolbox/vmdisk` (e.g.
//! `/etc/ostree-toolbox/vmdisk/05-custom.toml`) override the built-in
//! disk layout and deployment defaults.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use crate::customize::StorageCustomization;
use crate::disk::{parse_size_mib, DiskFormat, DEFAULT_SIZE_MIB};
use crate::mount::{default_partition_opts, MountOptions};

const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
const CONFIG_DIR: &str = "ostree-toolbox/vmdisk";
/// Kernel arguments every image boots with.
const DEFAULT_KARGS: &[&str] = &["root=/dev/atomicos/root"];

/// The toplevel config entry.
#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct ConfigToplevel {
    pub(crate) vmdisk: Option<VmDiskConfig>,
}

/// The serialized `[vmdisk]` section
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename = "vmdisk", rename_all = "kebab-case")]
pub struct VmDiskConfig {
    /// Disk size, e.g. `8G`
    pub size: Option<String>,
    /// Disk image format
    pub format: Option<DiskFormat>,
    /// `guestmount` partition mapping
    pub partition_opts: Option<Vec<String>>,
    /// Kernel arguments for the deployment; later fragments append
    pub kargs: Option<Vec<String>>,
    /// Storage configuration file name under `etc/sysconfig`
    pub storage_config: Option<String>,
    /// Replacement content for the storage configuration file
    pub storage_options: Option<String>,
    /// Parent directory for the temporary workspace
    pub workdir: Option<Utf8PathBuf>,
}

impl VmDiskConfig {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
            if let Some(o) = o {
                *s = Some(o);
            }
        }
        mergeopt(&mut self.size, other.size);
        mergeopt(&mut self.format, other.format);
        mergeopt(&mut self.partition_opts, other.partition_opts);
        mergeopt(&mut self.storage_config, other.storage_config);
        mergeopt(&mut self.storage_options, other.storage_options);
        mergeopt(&mut self.workdir, other.workdir);
        if let Some(other_kargs) = other.kargs {
            self.kargs
                .get_or_insert_with(Default::default)
                .extend(other_kargs)
        }
    }

    /// Disk size in MiB.
    pub fn size_mib(&self) -> Result<u64> {
        match self.size.as_deref() {
            Some(s) => parse_size_mib(s).with_context(|| format!("Parsing size {s:?}")),
            None => Ok(DEFAULT_SIZE_MIB),
        }
    }

    /// Disk image format.
    pub fn format(&self) -> DiskFormat {
        self.format.unwrap_or_default()
    }

    /// How to mount the guest for deployment.
    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            partition_opts: self
                .partition_opts
                .clone()
                .unwrap_or_else(default_partition_opts),
            format: self.format(),
            read_write: true,
        }
    }

    /// Base kernel arguments.
    pub fn kargs(&self) -> Vec<String> {
        self.kargs.clone().unwrap_or_else(|| {
            DEFAULT_KARGS.iter().map(|&k| k.to_owned()).collect()
        })
    }

    /// The storage configuration rewrite.
    pub fn storage(&self) -> StorageCustomization {
        let default = StorageCustomization::default();
        StorageCustomization {
            config_name: self.storage_config.clone().unwrap_or(default.config_name),
            contents: self.storage_options.clone().unwrap_or(default.contents),
        }
    }

    /// Parent directory for the workspace, if configured.
    pub fn workdir(&self) -> Option<&Utf8Path> {
        self.workdir.as_deref()
    }
}

/// Load the configuration, merging all found configuration files.  Missing
/// configuration is not an error.
pub fn load_config() -> Result<VmDiskConfig> {
    load_config_from(SYSTEMD_CONVENTIONAL_BASES)
}

#[context("Loading configuration")]
fn load_config_from(bases: &[&str]) -> Result<VmDiskConfig> {
    let fragments = liboverdrop::scan(bases, CONFIG_DIR, &["toml"], true);
    let mut config = VmDiskConfig::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path)?;
        let mut unused = std::collections::BTreeSet::new();
        let de = toml::Deserializer::new(&buf);
        let c: ConfigToplevel = serde_ignored::deserialize(de, |path| {
            unused.insert(path.to_string());
        })
        .with_context(|| format!("Parsing {path:?}"))?;
        for key in unused {
            tracing::warn!("{path:?}: Unknown key {key}");
        }
        if let Some(vmdisk) = c.vmdisk {
            tracing::debug!("Merging config: {vmdisk:?}");
            config.merge(vmdisk);
        }
    }
    Ok(config)
}
