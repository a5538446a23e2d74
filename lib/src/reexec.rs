use std::os::unix::process::CommandExt;

use anyhow::Result;
use fn_error_context::context;

/// Re-execute the current process, prefixed by `wrapper` (e.g. `unshare -m --`),
/// if the provided environment variable is not set.
#[context("Reexec self")]
pub(crate) fn reexec_with_guardenv(k: &str, wrapper: &[&str]) -> Result<()> {
    if std::env::var_os(k).is_some() {
        return Ok(());
    }
    let (exe, wrapper_args) = wrapper
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Missing wrapper command"))?;
    let self_exe = std::fs::read_link("/proc/self/exe")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.env(k, "1");
    cmd.args(wrapper_args)
        .arg(self_exe)
        .args(std::env::args_os().skip(1));
    tracing::debug!("Re-executing via {exe}");
    Err(cmd.exec().into())
}
