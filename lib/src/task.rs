use std::{
    ffi::OsStr,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use ostree_toolbox_utils::command_line;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Return an error if `cancel` has fired.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!("Operation was cancelled");
    }
    Ok(())
}

pub(crate) struct Task {
    description: String,
    quiet: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    pub(crate) fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    fn announce(&self) {
        if !self.quiet {
            println!("{}", self.description);
        }
        tracing::debug!("exec: {}", command_line(&self.cmd));
    }

    /// Run the command to completion, returning an error if it does not exit successfully.
    ///
    /// This ignores cancellation; it is used for steps that must run regardless.
    pub(crate) fn run(self) -> Result<()> {
        self.announce();
        let description = self.description;
        let mut cmd = self.cmd;
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Like [`Self::run()`], but kill the child and return an error if `cancel` fires.
    pub(crate) fn run_cancellable(self, cancel: &CancellationToken) -> Result<()> {
        self.output_cancellable(cancel, false).map(|_| ())
    }

    /// Like [`Self::run_cancellable()`], but return stdout.
    pub(crate) fn read(self, cancel: &CancellationToken) -> Result<String> {
        let stdout = self.output_cancellable(cancel, true)?;
        Ok(String::from_utf8(stdout)?)
    }

    fn output_cancellable(self, cancel: &CancellationToken, capture: bool) -> Result<Vec<u8>> {
        ensure_not_cancelled(cancel)?;
        self.announce();
        let description = self.description;
        let mut cmd = tokio::process::Command::from(self.cmd);
        cmd.kill_on_drop(true);
        if capture {
            cmd.stdout(Stdio::piped());
        }
        // Callers are synchronous (often inside `spawn_blocking`), so drive the
        // child on a private runtime.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Creating runtime")?;
        rt.block_on(async {
            let mut child = cmd
                .spawn()
                .with_context(|| format!("Spawning {description} failed"))?;
            let mut stdout = child.stdout.take();
            let mut buf = Vec::new();
            let r = tokio::select! {
                _ = cancel.cancelled() => None,
                r = async {
                    if let Some(stdout) = stdout.as_mut() {
                        stdout.read_to_end(&mut buf).await?;
                    }
                    child.wait().await
                } => Some(r),
            };
            let Some(st) = r else {
                tracing::debug!("Killing {description}");
                // The child may have exited in the meantime.
                let _ = child.kill().await;
                anyhow::bail!("Task {description} was cancelled");
            };
            let st = st.with_context(|| format!("Executing {description} failed"))?;
            if !st.success() {
                anyhow::bail!("Task {description} failed: {st:?}");
            }
            Ok(buf)
        })
    }
}
