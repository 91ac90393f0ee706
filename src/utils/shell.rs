//! One-shot external-process runner with captured output.
//!
//! The single point where OS utilities (`mkfs.*`, `mount`, `umount`,
//! `nbd-client`, `modprobe`, `chown`) are invoked.

use anyhow::{Context, Result, bail};
use std::io::Write;
use std::process::{Command, Stdio};

/// Run `argv`, capturing stdout and stderr. Returns trimmed stdout.
///
/// With `check`, a non-zero exit becomes an error carrying the command line
/// and captured stderr. Without it, stdout is returned best-effort and the
/// exit status is ignored (tear-down paths).
pub fn run(argv: &[&str], stdin: Option<&[u8]>, check: bool) -> Result<String> {
    let (prog, args) = argv
        .split_first()
        .context("empty command line")?;
    log::debug!("exec: {}", argv.join(" "));

    let mut cmd = Command::new(prog);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn '{prog}'"))?;

    if let Some(input) = stdin {
        child
            .stdin
            .take()
            .context("child stdin not piped")?
            .write_all(input)
            .with_context(|| format!("write stdin to '{prog}'"))?;
    }

    let out = child
        .wait_with_output()
        .with_context(|| format!("wait for '{prog}'"))?;

    if check && !out.status.success() {
        bail!(
            "'{}' failed ({}): {}",
            argv.join(" "),
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
