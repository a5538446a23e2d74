//! Tests for the disk provisioning workflow, driven through test doubles.

use std::cell::RefCell;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use ostree_toolbox_lib::customize::DEFAULT_STORAGE_OPTIONS;
use ostree_toolbox_lib::deploy::{
    DeployOptions, DeploySource, Deployer, DeploymentHandle, ResolvedRevision, RevisionResolver,
};
use ostree_toolbox_lib::disk::DiskCreator;
use ostree_toolbox_lib::error::ProvisionError;
use ostree_toolbox_lib::mount::{GuestMounter, MountHandle, MountOptions};
use ostree_toolbox_lib::preflight::{HostEnvironment, IsolationContext};
use ostree_toolbox_lib::provision::{
    Collaborators, ProvisionRequest, ProvisionSettings, Provisioner,
};
use tokio_util::sync::CancellationToken;

const CSUM: &str = "0ef7461f9db15e1d8bd8921abf20694225fbaa4462cadf7deed8ea0e43162120";
const OSNAME: &str = "osA";
const REF: &str = "osA/1.0";
const DISK_CONTENT: &str = "disk image";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Resolve,
    CreateDisk,
    Mount,
    Pull,
    Label,
    CurrentDeployment,
    Unmount,
}

/// Every collaborator at once.  The "mounted filesystem" is just the
/// mount directory; unmounting empties it.
#[derive(Debug)]
struct Fake {
    selinux: &'static str,
    fail: Option<Step>,
    /// Additionally fail unmounting.
    fail_unmount: bool,
    /// Initial content of the deployment's storage configuration, if any.
    storage: Option<&'static str>,
    /// Cancel this token from within the pull, as an interrupt would.
    cancel_during_pull: Option<CancellationToken>,
    /// Create this file during labeling, racing publication.
    squat: Option<Utf8PathBuf>,
    events: RefCell<Vec<String>>,
    deployed: RefCell<Option<(String, Option<String>, DeployOptions)>>,
    /// Storage configuration as seen right before unmount.
    storage_at_unmount: RefCell<Option<String>>,
}

impl Fake {
    fn new() -> Self {
        Self {
            selinux: "Disabled",
            fail: None,
            fail_unmount: false,
            storage: Some("DOCKER_STORAGE_OPTIONS=\n"),
            cancel_during_pull: None,
            squat: None,
            events: Default::default(),
            deployed: Default::default(),
            storage_at_unmount: Default::default(),
        }
    }

    fn failing(step: Step) -> Self {
        Self {
            fail: Some(step),
            ..Self::new()
        }
    }

    fn record(&self, step: Step, event: &str) -> Result<()> {
        self.events.borrow_mut().push(event.to_string());
        if self.fail == Some(step) || (step == Step::Unmount && self.fail_unmount) {
            anyhow::bail!("injected {event} failure");
        }
        Ok(())
    }

    fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn deployment_dir(mount_dir: &Utf8Path) -> Utf8PathBuf {
        mount_dir.join(format!("ostree/deploy/{OSNAME}/deploy/{CSUM}.0"))
    }
}

impl HostEnvironment for Fake {
    fn selinux_status(&self, _cancel: &CancellationToken) -> Result<String> {
        self.events.borrow_mut().push("selinux".into());
        Ok(format!("{}\n", self.selinux))
    }

    fn enter_isolation(&self) -> Result<IsolationContext> {
        self.events.borrow_mut().push("isolate".into());
        Ok(IsolationContext::Inherited)
    }
}

impl RevisionResolver for Fake {
    fn resolve(
        &self,
        _repo: &Utf8Path,
        ostree_ref: &str,
        _cancel: &CancellationToken,
    ) -> Result<ResolvedRevision> {
        self.record(Step::Resolve, "resolve")?;
        assert_eq!(ostree_ref, REF);
        ResolvedRevision::new(CSUM)
    }
}

impl DiskCreator for Fake {
    fn create_disk(&self, path: &Utf8Path, _cancel: &CancellationToken) -> Result<()> {
        assert!(!path.exists(), "{path} was not cleaned up");
        // A failing creator may still leave a partial file behind.
        std::fs::write(path, DISK_CONTENT)?;
        self.record(Step::CreateDisk, "create-disk")
    }
}

impl GuestMounter for Fake {
    fn mount(
        &self,
        isolation: &IsolationContext,
        image: &Utf8Path,
        mount_dir: &Utf8Path,
        opts: &MountOptions,
        _cancel: &CancellationToken,
    ) -> Result<MountHandle> {
        self.record(Step::Mount, "mount")?;
        assert_eq!(*isolation, IsolationContext::Inherited);
        assert!(opts.read_write);
        assert_eq!(std::fs::read_to_string(image)?, DISK_CONTENT);
        assert_eq!(mount_dir.read_dir()?.count(), 0);
        Ok(MountHandle {
            mount_dir: mount_dir.to_owned(),
            pid: None,
        })
    }

    fn unmount(&self, handle: &MountHandle) -> Result<()> {
        let storage = Self::deployment_dir(&handle.mount_dir).join("etc/sysconfig/docker-storage");
        *self.storage_at_unmount.borrow_mut() = std::fs::read_to_string(storage).ok();
        // A failed unmount leaves the guest filesystem in place.
        self.record(Step::Unmount, "unmount")?;
        for entry in handle.mount_dir.read_dir_utf8()? {
            std::fs::remove_dir_all(entry?.path())?;
        }
        Ok(())
    }
}

impl Deployer for Fake {
    fn pull_deploy(
        &self,
        mount_dir: &Utf8Path,
        source: &DeploySource<'_>,
        options: &DeployOptions,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let etc = Self::deployment_dir(mount_dir).join("etc/sysconfig");
        std::fs::create_dir_all(&etc)?;
        if let Some(cancel) = self.cancel_during_pull.as_ref() {
            cancel.cancel();
            self.events.borrow_mut().push("pull".into());
            anyhow::bail!("Task Pulling {CSUM} was cancelled");
        }
        self.record(Step::Pull, "pull")?;
        if let Some(content) = self.storage {
            std::fs::write(etc.join("docker-storage"), content)?;
        }
        *self.deployed.borrow_mut() = Some((
            format!("{}:{}@{}", source.osname, source.ostree_ref, source.revision),
            source.origin_url.map(ToOwned::to_owned),
            options.clone(),
        ));
        Ok(())
    }

    fn ensure_labeled(&self, _mount_dir: &Utf8Path, _cancel: &CancellationToken) -> Result<()> {
        if let Some(squat) = self.squat.as_deref() {
            std::fs::write(squat, "someone else")?;
        }
        self.record(Step::Label, "label")
    }

    fn current_deployment(
        &self,
        mount_dir: &Utf8Path,
        osname: &str,
        _cancel: &CancellationToken,
    ) -> Result<DeploymentHandle> {
        self.record(Step::CurrentDeployment, "current-deployment")?;
        Ok(DeploymentHandle {
            osname: osname.to_string(),
            deployment: format!("{CSUM}.0"),
            directory: Self::deployment_dir(mount_dir),
        })
    }
}

struct Fixture {
    _td: tempfile::TempDir,
    workdir: Utf8PathBuf,
    target: Utf8PathBuf,
    req: ProvisionRequest,
}

impl Fixture {
    fn new() -> Self {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let workdir = root.join("work");
        let out = root.join("out");
        std::fs::create_dir(&out).unwrap();
        let target = out.join("img.qcow2");
        let req = ProvisionRequest {
            repo: root.join("repo"),
            osname: OSNAME.into(),
            ostree_ref: REF.into(),
            disk_path: target.clone(),
            origin_url: None,
            unconfigured_state: None,
            add_kargs: Vec::new(),
        };
        Self {
            _td: td,
            workdir,
            target,
            req,
        }
    }

    fn tmp_disk(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.tmp", self.target))
    }

    fn run(&self, fake: &Fake) -> Result<Utf8PathBuf, ProvisionError> {
        self.run_cancellable(fake, &CancellationToken::new())
    }

    fn run_cancellable(
        &self,
        fake: &Fake,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, ProvisionError> {
        let collaborators = Collaborators {
            host: fake,
            resolver: fake,
            disk: fake,
            mounter: fake,
            deployer: fake,
        };
        let settings = ProvisionSettings {
            workdir: Some(self.workdir.clone()),
            ..Default::default()
        };
        Provisioner::new(collaborators, settings).provision(&self.req, cancel)
    }

    /// Names in the workspace parent directory.
    fn workspaces(&self) -> Vec<String> {
        match self.workdir.read_dir_utf8() {
            Ok(d) => d.map(|e| e.unwrap().file_name().to_owned()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => panic!("{e}"),
        }
    }

    /// Names next to the target.
    fn outputs(&self) -> Vec<String> {
        let mut r = self
            .target
            .parent()
            .unwrap()
            .read_dir_utf8()
            .unwrap()
            .map(|e| e.unwrap().file_name().to_owned())
            .collect::<Vec<_>>();
        r.sort();
        r
    }

    /// Assert that nothing but (possibly) the published image remains.
    fn assert_clean(&self) {
        assert!(!self.tmp_disk().exists());
        assert_eq!(self.workspaces(), Vec::<String>::new());
    }
}

const FULL_RUN: &[&str] = &[
    "selinux",
    "isolate",
    "resolve",
    "create-disk",
    "mount",
    "pull",
    "label",
    "current-deployment",
    "unmount",
];

fn events_through(last: &str) -> Vec<String> {
    let n = FULL_RUN.iter().position(|&e| e == last).unwrap();
    FULL_RUN[..=n].iter().map(|&e| e.to_owned()).collect()
}

#[test]
fn test_success() {
    let fx = Fixture::new();
    let fake = Fake::new();
    let path = fx.run(&fake).unwrap();
    assert_eq!(path, fx.target);
    assert_eq!(fake.events(), FULL_RUN);
    assert_eq!(std::fs::read_to_string(&fx.target).unwrap(), DISK_CONTENT);
    assert_eq!(fx.outputs(), ["img.qcow2"]);
    fx.assert_clean();
    assert!(fx.workdir.exists());

    let (what, origin, options) = fake.deployed.borrow().clone().unwrap();
    assert_eq!(what, format!("{OSNAME}:{REF}@{CSUM}"));
    assert_eq!(origin, None);
    assert_eq!(options, DeployOptions::default());
}

#[test]
fn test_options_passed_through() {
    let mut fx = Fixture::new();
    fx.req.origin_url = Some("https://example.com/repo".into());
    fx.req.unconfigured_state = Some("Use rpm-ostree rebase".into());
    fx.req.add_kargs = vec!["console=ttyS0".into()];
    let fake = Fake::new();
    fx.run(&fake).unwrap();
    let (_, origin, options) = fake.deployed.borrow().clone().unwrap();
    assert_eq!(origin.as_deref(), Some("https://example.com/repo"));
    assert_eq!(
        options,
        DeployOptions {
            add_kargs: vec!["console=ttyS0".into()],
            unconfigured_state: Some("Use rpm-ostree rebase".into()),
        }
    );
}

#[test]
fn test_target_exists() {
    let fx = Fixture::new();
    std::fs::write(&fx.target, "precious").unwrap();
    let fake = Fake::new();
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::AlreadyExists(ref p) if *p == fx.target), "{e}");
    assert_eq!(std::fs::read_to_string(&fx.target).unwrap(), "precious");
    assert_eq!(fake.events(), ["selinux", "isolate"]);
    assert_eq!(fx.outputs(), ["img.qcow2"]);
    assert!(!fx.workdir.exists());
}

#[test]
fn test_selinux_enforcing() {
    let fx = Fixture::new();
    let fake = Fake {
        selinux: "Enforcing",
        ..Fake::new()
    };
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Environment(_)), "{e}");
    let msg = format!("{:#}", anyhow::Error::from(e));
    assert!(msg.contains("show_bug.cgi?id=1060423"), "{msg}");
    assert_eq!(fake.events(), ["selinux"]);
    assert_eq!(fx.outputs(), Vec::<String>::new());
    assert!(!fx.workdir.exists());
}

#[test]
fn test_unknown_ref() {
    let fx = Fixture::new();
    let fake = Fake::failing(Step::Resolve);
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Resolve { ref ostree_ref, .. } if ostree_ref == REF));
    assert_eq!(fake.events(), events_through("resolve"));
    assert!(!fx.workdir.exists());
}

#[test]
fn test_disk_creation_failure() {
    let fx = Fixture::new();
    let fake = Fake::failing(Step::CreateDisk);
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::DiskCreation(ref p, _) if *p == fx.tmp_disk()));
    assert_eq!(fake.events(), events_through("create-disk"));
    fx.assert_clean();
    assert_eq!(fx.outputs(), Vec::<String>::new());
}

#[test]
fn test_mount_failure() {
    let fx = Fixture::new();
    let fake = Fake::failing(Step::Mount);
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Mount(..)), "{e}");
    // Nothing was mounted, so nothing is unmounted.
    assert_eq!(fake.events(), events_through("mount"));
    fx.assert_clean();
}

#[test]
fn test_pull_failure_unmounts() {
    let fx = Fixture::new();
    let fake = Fake::failing(Step::Pull);
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Deployment(ref r, _) if r == "osA:osA/1.0"), "{e}");
    let mut expected = events_through("pull");
    expected.push("unmount".into());
    assert_eq!(fake.events(), expected);
    fx.assert_clean();
    assert_eq!(fx.outputs(), Vec::<String>::new());
}

#[test]
fn test_label_failure_unmounts() {
    let fx = Fixture::new();
    let fake = Fake::failing(Step::Label);
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Label(_)), "{e}");
    let mut expected = events_through("label");
    expected.push("unmount".into());
    assert_eq!(fake.events(), expected);
    fx.assert_clean();
}

#[test]
fn test_customization_failure_unmounts() {
    let fx = Fixture::new();
    let fake = Fake::failing(Step::CurrentDeployment);
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Customization(_)), "{e}");
    assert_eq!(fake.events(), FULL_RUN);
    fx.assert_clean();
}

#[test]
fn test_unmount_failure_is_fatal() {
    let fx = Fixture::new();
    let fake = Fake::failing(Step::Unmount);
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Unmount(..)), "{e}");
    // Unmount is attempted exactly once.
    assert_eq!(fake.events(), FULL_RUN);
    assert!(!fx.target.exists());
    // The guest filesystem is still "mounted"; neither the image nor the
    // workspace is removed.
    assert!(fx.tmp_disk().exists());
    let workspaces = fx.workspaces();
    assert_eq!(workspaces.len(), 1);
    let mnt = fx.workdir.join(&workspaces[0]).join("mnt");
    assert!(mnt.join("ostree/deploy").exists());
}

#[test]
fn test_unmount_failure_does_not_mask() {
    let fx = Fixture::new();
    let fake = Fake {
        fail: Some(Step::Pull),
        fail_unmount: true,
        ..Fake::new()
    };
    let e = fx.run(&fake).unwrap_err();
    assert!(matches!(e, ProvisionError::Deployment(..)), "{e}");
    let mut expected = events_through("pull");
    expected.push("unmount".into());
    assert_eq!(fake.events(), expected);
    assert!(fx.tmp_disk().exists());
    assert_eq!(fx.workspaces().len(), 1);
}

#[test]
fn test_stale_tmp_recovered() {
    let fx = Fixture::new();
    let stale = fx.tmp_disk();
    std::fs::create_dir_all(stale.join("leftover")).unwrap();
    std::fs::write(stale.join("leftover/data"), "crashed run").unwrap();
    let fake = Fake::new();
    fx.run(&fake).unwrap();
    assert_eq!(std::fs::read_to_string(&fx.target).unwrap(), DISK_CONTENT);
    fx.assert_clean();

    // The same again, with a stale plain file.
    let fx = Fixture::new();
    std::fs::write(fx.tmp_disk(), "partial").unwrap();
    fx.run(&Fake::new()).unwrap();
    assert_eq!(std::fs::read_to_string(&fx.target).unwrap(), DISK_CONTENT);
    fx.assert_clean();
}

#[test]
fn test_storage_overwritten() {
    let fx = Fixture::new();
    let fake = Fake {
        storage: Some("DOCKER_STORAGE_OPTIONS=--storage-driver overlay\n# comment\n# and more text, longer than the replacement so truncation matters.....................................................................................\n"),
        ..Fake::new()
    };
    fx.run(&fake).unwrap();
    let contents = fake.storage_at_unmount.borrow().clone().unwrap();
    similar_asserts::assert_eq!(contents, format!("{DEFAULT_STORAGE_OPTIONS}\n"));
}

#[test]
fn test_storage_absent() {
    let fx = Fixture::new();
    let fake = Fake {
        storage: None,
        ..Fake::new()
    };
    fx.run(&fake).unwrap();
    assert_eq!(fake.events(), FULL_RUN);
    assert!(fake.storage_at_unmount.borrow().is_none());
    assert!(fx.target.exists());
}

#[test]
fn test_publish_failure_preserves() {
    let fx = Fixture::new();
    let fake = Fake {
        squat: Some(fx.target.clone()),
        ..Fake::new()
    };
    let e = fx.run(&fake).unwrap_err();
    let (tmp_disk, workdir) = match e {
        ProvisionError::Publish {
            tmp_disk, workdir, ..
        } => (tmp_disk, workdir),
        e => panic!("Unexpected error {e}"),
    };
    assert_eq!(fake.events(), FULL_RUN);
    assert_eq!(tmp_disk, fx.tmp_disk());
    assert_eq!(std::fs::read_to_string(&tmp_disk).unwrap(), DISK_CONTENT);
    assert!(workdir.starts_with(&fx.workdir));
    assert!(workdir.join("mnt").exists());
    assert_eq!(std::fs::read_to_string(&fx.target).unwrap(), "someone else");
}

#[test]
fn test_cancelled_during_pull() {
    let fx = Fixture::new();
    let cancel = CancellationToken::new();
    let fake = Fake {
        cancel_during_pull: Some(cancel.clone()),
        ..Fake::new()
    };
    let e = fx.run_cancellable(&fake, &cancel).unwrap_err();
    assert!(matches!(e, ProvisionError::Cancelled), "{e}");
    let mut expected = events_through("pull");
    expected.push("unmount".into());
    assert_eq!(fake.events(), expected);
    fx.assert_clean();
    assert!(!fx.target.exists());
}

#[test]
fn test_cancelled_before_start() {
    let fx = Fixture::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let fake = Fake::new();
    let e = fx.run_cancellable(&fake, &cancel).unwrap_err();
    assert!(matches!(e, ProvisionError::Cancelled), "{e}");
    assert_eq!(fake.events(), ["selinux", "isolate"]);
    assert!(!fx.workdir.exists());
}
