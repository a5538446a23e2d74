//! Resolving a ref and deploying the commit into the mounted guest.

use std::fmt::{Debug, Display};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use ostree::{gio, glib};
use tokio_util::sync::CancellationToken;

use crate::task::{ensure_not_cancelled, Task};

/// Length of a hex SHA-256 commit checksum.
const CHECKSUM_LEN: usize = 64;

/// A commit checksum a ref resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRevision(String);

impl ResolvedRevision {
    /// Validate `s` (surrounding whitespace ignored) as a commit checksum.
    pub fn new(s: &str) -> Result<Self> {
        let s = s.trim();
        if !is_checksum(s) {
            anyhow::bail!("Invalid commit checksum: {s:?}");
        }
        Ok(Self(s.to_string()))
    }

    /// The checksum in hex.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResolvedRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_checksum(s: &str) -> bool {
    s.len() == CHECKSUM_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Looks up the commit a ref points to.
pub trait RevisionResolver: Debug {
    /// Resolve `ostree_ref` in `repo`; fails if the ref is unknown.
    fn resolve(
        &self,
        repo: &Utf8Path,
        ostree_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedRevision>;
}

/// Hints passed through to the deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Kernel arguments in addition to the deployer's defaults.
    pub add_kargs: Vec<String>,
    /// Warning recorded in the origin for an incompletely configured system.
    pub unconfigured_state: Option<String>,
}

/// What to deploy, and from where.
#[derive(Debug, Clone, Copy)]
pub struct DeploySource<'a> {
    /// Source repository
    pub repo: &'a Utf8Path,
    /// Stateroot name
    pub osname: &'a str,
    /// Symbolic ref
    pub ostree_ref: &'a str,
    /// The commit `ostree_ref` resolved to
    pub revision: &'a ResolvedRevision,
    /// Origin remote URL; defaults to the source repository.
    pub origin_url: Option<&'a str>,
}

/// The deployment created inside a sysroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentHandle {
    /// Stateroot the deployment belongs to.
    pub osname: String,
    /// Deployment identifier, `<checksum>.<serial>`.
    pub deployment: String,
    /// The deployment's root directory.
    pub directory: Utf8PathBuf,
}

/// Populates a sysroot with a bootable deployment.
pub trait Deployer: Debug {
    /// Initialize a sysroot at `mount_dir` and deploy `source` into it.
    fn pull_deploy(
        &self,
        mount_dir: &Utf8Path,
        source: &DeploySource<'_>,
        options: &DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Apply security labels to everything written into the sysroot.
    fn ensure_labeled(&self, mount_dir: &Utf8Path, cancel: &CancellationToken) -> Result<()>;

    /// Find the current deployment for `osname`.
    fn current_deployment(
        &self,
        mount_dir: &Utf8Path,
        osname: &str,
        cancel: &CancellationToken,
    ) -> Result<DeploymentHandle>;
}

/// A single `ostree` command line.
#[derive(Debug, PartialEq, Eq)]
struct Invocation {
    description: String,
    quiet: bool,
    args: Vec<String>,
}

impl Invocation {
    fn new<S: Into<String>>(
        description: impl Into<String>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            description: description.into(),
            quiet: false,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    fn run(self, cancel: &CancellationToken) -> Result<()> {
        let task = Task::new(self.description, "ostree").args(self.args);
        let task = if self.quiet { task.quiet() } else { task };
        task.run_cancellable(cancel)
    }
}

/// The URL recorded for the stateroot's remote; defaults to the source repository.
fn origin_url(source: &DeploySource<'_>) -> Result<String> {
    match source.origin_url {
        Some(u) => Ok(u.to_string()),
        None => {
            let repo = source
                .repo
                .canonicalize_utf8()
                .with_context(|| format!("Resolving {}", source.repo))?;
            Ok(format!("file://{repo}"))
        }
    }
}

/// The commands that initialize the sysroot at `mount_dir` and deploy `source`
/// into it, in order.
fn pull_deploy_commands(
    mount_dir: &Utf8Path,
    source: &DeploySource<'_>,
    origin_url: &str,
    origin_file: &Utf8Path,
    kargs: impl IntoIterator<Item = String>,
) -> Vec<Invocation> {
    let osname = source.osname;
    let rev = source.revision.as_str();
    let refspec = format!("{osname}:{}", source.ostree_ref);
    let sysroot_arg = format!("--sysroot={mount_dir}");
    let repo_arg = format!("--repo={mount_dir}/ostree/repo");

    let mut deploy = vec![
        "admin".to_string(),
        "deploy".to_string(),
        sysroot_arg.clone(),
        format!("--os={osname}"),
        format!("--origin-file={origin_file}"),
    ];
    deploy.extend(kargs);
    deploy.push(refspec.clone());

    vec![
        Invocation::new(
            "Initializing sysroot",
            ["admin", "init-fs", mount_dir.as_str()],
        ),
        Invocation::new(
            format!("Initializing stateroot {osname}"),
            ["admin", "os-init", osname, sysroot_arg.as_str()],
        ),
        Invocation::new(
            format!("Adding remote {osname}"),
            [
                repo_arg.as_str(),
                "remote",
                "add",
                "--set=gpg-verify=false",
                osname,
                origin_url,
            ],
        )
        .quiet(),
        Invocation::new(
            format!("Pulling {rev}"),
            [repo_arg.as_str(), "pull-local", source.repo.as_str(), rev],
        ),
        Invocation::new(
            format!("Creating ref {refspec}"),
            [
                repo_arg.as_str(),
                "refs",
                format!("--create={refspec}").as_str(),
                rev,
            ],
        )
        .quiet(),
        Invocation::new(format!("Deploying {refspec}"), deploy),
    ]
}

fn label_command(mount_dir: &Utf8Path) -> Invocation {
    Invocation::new(
        "Doing initial labeling",
        [
            "admin",
            format!("--sysroot={mount_dir}").as_str(),
            "instutil",
            "selinux-ensure-labeled",
            mount_dir.as_str(),
            "",
        ],
    )
}

#[context("Generating origin")]
fn origin_keyfile(refspec: &str, unconfigured_state: Option<&str>) -> Result<glib::KeyFile> {
    let origin = glib::KeyFile::new();
    origin.set_string("origin", "refspec", refspec);
    if let Some(msg) = unconfigured_state {
        origin.set_string("origin", "unconfigured-state", msg);
    }
    Ok(origin)
}

/// Drives `ostree` through its library for queries and its command line for
/// sysroot setup and deployment.
#[derive(Debug, Clone, Default)]
pub struct OstreeCli {
    base_kargs: Vec<String>,
}

impl OstreeCli {
    /// Deploy with `base_kargs` ahead of any per-request kernel arguments.
    pub fn new(base_kargs: Vec<String>) -> Self {
        Self { base_kargs }
    }

    fn kargs<'a>(&'a self, options: &'a DeployOptions) -> impl Iterator<Item = String> + 'a {
        self.base_kargs
            .iter()
            .chain(options.add_kargs.iter())
            .map(|k| format!("--karg={k}"))
    }
}

impl RevisionResolver for OstreeCli {
    #[context("Resolving {ostree_ref} in {repo}")]
    fn resolve(
        &self,
        repo: &Utf8Path,
        ostree_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedRevision> {
        ensure_not_cancelled(cancel)?;
        let repo = ostree::Repo::new_for_path(repo.as_std_path());
        repo.open(gio::Cancellable::NONE)?;
        let rev = repo
            .resolve_rev(ostree_ref, false)?
            .ok_or_else(|| anyhow::anyhow!("Ref {ostree_ref} not found"))?;
        ResolvedRevision::new(rev.as_str())
    }
}

impl Deployer for OstreeCli {
    #[context("Deploying {}:{} into {mount_dir}", source.osname, source.ostree_ref)]
    fn pull_deploy(
        &self,
        mount_dir: &Utf8Path,
        source: &DeploySource<'_>,
        options: &DeployOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let origin_url = origin_url(source)?;
        let refspec = format!("{}:{}", source.osname, source.ostree_ref);
        let origin = origin_keyfile(&refspec, options.unconfigured_state.as_deref())?;
        let origin_file = tempfile::Builder::new()
            .prefix("ostree-toolbox-origin.")
            .tempfile()
            .context("Creating origin file")?;
        let origin_path = Utf8Path::from_path(origin_file.path())
            .ok_or_else(|| anyhow::anyhow!("Non-UTF8 path {:?}", origin_file.path()))?;
        origin
            .save_to_file(origin_path)
            .context("Writing origin file")?;

        let commands = pull_deploy_commands(
            mount_dir,
            source,
            &origin_url,
            origin_path,
            self.kargs(options),
        );
        for cmd in commands {
            cmd.run(cancel)?;
        }
        Ok(())
    }

    #[context("Labeling {mount_dir}")]
    fn ensure_labeled(&self, mount_dir: &Utf8Path, cancel: &CancellationToken) -> Result<()> {
        label_command(mount_dir).run(cancel)
    }

    #[context("Finding current deployment of {osname}")]
    fn current_deployment(
        &self,
        mount_dir: &Utf8Path,
        osname: &str,
        cancel: &CancellationToken,
    ) -> Result<DeploymentHandle> {
        ensure_not_cancelled(cancel)?;
        let sysroot = ostree::Sysroot::new(Some(&gio::File::for_path(mount_dir)));
        sysroot.load(gio::Cancellable::NONE)?;
        // Deployments are in boot order, so the first one is the default.
        let deployment = sysroot
            .deployments()
            .into_iter()
            .find(|d| d.osname().as_str() == osname)
            .ok_or_else(|| anyhow::anyhow!("No deployment found for {osname}"))?;
        let dirpath = sysroot.deployment_dirpath(&deployment);
        Ok(DeploymentHandle {
            osname: osname.to_string(),
            deployment: format!("{}.{}", deployment.csum(), deployment.deployserial()),
            directory: mount_dir.join(dirpath.as_str()),
        })
    }
}
