//! External program execution with captured, combined output.
//!
//! `list` and `sys` live here too: both only gather some host output and
//! relay it verbatim with the elapsed-time footer.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command as ProcessCommand;
use tracing::{debug, warn};

use crate::command::Command;
use crate::protocol_core::{normalize_under_root, with_elapsed};

/// Output of one finished external program.
#[derive(Debug)]
pub struct Captured {
    /// stdout and stderr interleaved in the order they arrived.
    pub output: Vec<u8>,
    pub success: bool,
    pub elapsed: Duration,
}

/// Run `cmd` to completion, collecting stdout and stderr into one buffer.
pub async fn capture(mut cmd: ProcessCommand) -> Result<Captured> {
    let start = Instant::now();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let program = format!("{:?}", cmd.as_std().get_program());
    let mut child = cmd.spawn().with_context(|| format!("spawn {}", program))?;
    let mut stdout = child.stdout.take().context("child stdout not captured")?;
    let mut stderr = child.stderr.take().context("child stderr not captured")?;

    let mut output = Vec::new();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);
    while out_open || err_open {
        tokio::select! {
            n = stdout.read(&mut out_buf), if out_open => {
                let n = n.context("read child stdout")?;
                if n == 0 { out_open = false } else { output.extend_from_slice(&out_buf[..n]) }
            }
            n = stderr.read(&mut err_buf), if err_open => {
                let n = n.context("read child stderr")?;
                if n == 0 { err_open = false } else { output.extend_from_slice(&err_buf[..n]) }
            }
        }
    }
    let status = child.wait().await.with_context(|| format!("wait for {}", program))?;
    debug!(%program, ?status, bytes = output.len(), "external program finished");
    Ok(Captured {
        output,
        success: status.success(),
        elapsed: start.elapsed(),
    })
}

/// Cut `output` to `limit` bytes, logging when anything is dropped.
pub fn cap_output(mut output: Vec<u8>, limit: usize, what: &str) -> Vec<u8> {
    if output.len() > limit {
        warn!(what, len = output.len(), limit, "reply output cut at reply limit");
        output.truncate(limit);
    }
    output
}

/// `list [-l] [dir]`: the output of `ls` run in the daemon root.
pub async fn list(root: &Path, command: &Command, reply_limit: usize) -> Vec<u8> {
    let start = Instant::now();
    let mut args: Vec<&str> = command.args.iter().map(String::as_str).collect();
    let long = args.first() == Some(&"-l");
    if long {
        args.remove(0);
    }
    for target in &args {
        if let Err(e) = normalize_under_root(root, Path::new(target)) {
            return with_elapsed(format!("ls: {}: {}\n", target, e).into_bytes(), start.elapsed());
        }
    }

    let mut ls = ProcessCommand::new("ls");
    ls.current_dir(root);
    if long {
        ls.arg("-l");
    }
    // Targets are never options, whatever they start with
    ls.arg("--");
    if args.is_empty() {
        ls.arg(".");
    } else {
        ls.args(&args);
    }
    let output = match capture(ls).await {
        Ok(captured) => captured.output,
        Err(e) => format!("list failed: {:#}\n", e).into_bytes(),
    };
    with_elapsed(cap_output(output, reply_limit, "list"), start.elapsed())
}

/// `sys`: host name, operating system and processor description.
pub async fn sys() -> Vec<u8> {
    let start = Instant::now();
    let report = tokio::task::spawn_blocking(host_report)
        .await
        .unwrap_or_else(|e| format!("sys failed: {}\n", e));
    with_elapsed(report.into_bytes(), start.elapsed())
}

fn host_report() -> String {
    use sysinfo::System;

    let sys = System::new_all();
    let unknown = || "unknown".to_string();
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| unknown());
    let brand = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_else(unknown);
    format!(
        "Host: {}\nOS: {} {}\nKernel: {}\nCPU: {}\nLogical cores: {}\n",
        host,
        System::name().unwrap_or_else(unknown),
        System::os_version().unwrap_or_else(unknown),
        System::kernel_version().unwrap_or_else(unknown),
        brand,
        sys.cpus().len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn capture_combines_both_streams() {
        let mut cmd = ProcessCommand::new("sh");
        cmd.arg("-c").arg("echo out; echo err 1>&2; exit 3");
        let captured = capture(cmd).await.unwrap();
        let text = String::from_utf8(captured.output).unwrap();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
        assert!(!captured.success);
    }

    #[tokio::test]
    async fn capture_reports_missing_program() {
        let cmd = ProcessCommand::new("/definitely/not/a/program");
        assert!(capture(cmd).await.is_err());
    }

    #[test]
    fn cap_output_cuts_long_output() {
        assert_eq!(cap_output(b"abcdef".to_vec(), 4, "t"), b"abcd");
        assert_eq!(cap_output(b"ab".to_vec(), 4, "t"), b"ab");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Command::parse("list ../").unwrap();
        let out = String::from_utf8(list(dir.path(), &cmd, 4096).await).unwrap();
        assert!(out.starts_with("ls: ../"));
        assert!(out.contains("Took: "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_targets_are_not_options() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.c"), "").unwrap();

        let cmd = Command::parse("list --help").unwrap();
        let out = String::from_utf8(list(dir.path(), &cmd, 4096).await).unwrap();
        assert!(out.contains("--help"), "{out}");
        assert!(!out.contains("Usage"), "{out}");

        let cmd = Command::parse("list -l").unwrap();
        let out = String::from_utf8(list(dir.path(), &cmd, 4096).await).unwrap();
        assert!(out.contains("a.c"), "{out}");
    }

    #[tokio::test]
    async fn sys_reports_host_fields() {
        let out = String::from_utf8(sys().await).unwrap();
        assert!(out.contains("Host: "));
        assert!(out.contains("Logical cores: "));
        assert!(out.contains("Took: "));
    }
}
