use std::io::{BufReader, Read};
use std::process::{Child, Command, Output, Stdio};
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;

pub(crate) fn run_command_output(cmd: &mut Command) -> Result<Output> {
    cmd.output()
        .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd)))
}

pub(crate) fn run_command_capture(mut cmd: Command) -> Result<()> {
    let out = run_command_output(&mut cmd)?;
    if out.status.success() {
        return Ok(());
    }
    let msg = command_summary(&out);
    Err(Error::msg(format!("command failed: {msg}")))
}

pub(crate) fn command_summary(out: &Output) -> String {
    let stderr = sanitize_log_line(String::from_utf8_lossy(&out.stderr).trim());
    let stdout = sanitize_log_line(String::from_utf8_lossy(&out.stdout).trim());
    if !stderr.is_empty() {
        return stderr;
    }
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}

/// Spawn `cmd` in its own process group with piped output.
///
/// Every output line is sanitized and logged at debug level under `label`.
/// The returned handles finish once the child's pipes close.
pub(crate) fn spawn_grouped(
    mut cmd: Command,
    label: &'static str,
) -> Result<(Child, Vec<JoinHandle<()>>)> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {:?}: {e}", cmd.get_program())))?;

    let mut drains = Vec::new();
    if let Some(out) = child.stdout.take() {
        drains.push(spawn_drain(out, label));
    }
    if let Some(err) = child.stderr.take() {
        drains.push(spawn_drain(err, label));
    }
    Ok((child, drains))
}

fn spawn_drain<R: Read + Send + 'static>(reader: R, label: &'static str) -> JoinHandle<()> {
    // Subscribers installed with `set_default` are thread-local; carry ours over.
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    std::thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || {
            read_output_stream(reader, |line| {
                let line = sanitize_log_line(&line);
                if !line.is_empty() {
                    debug!(source = label, "{line}");
                }
            })
        })
    })
}

fn read_output_stream<R: Read>(reader: R, mut on_line: impl FnMut(String)) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                on_line(String::from_utf8_lossy(&pending).into_owned());
                pending.clear();
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    on_line(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }

    if !pending.is_empty() {
        on_line(String::from_utf8_lossy(&pending).into_owned());
    }
}

pub(crate) fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_and_skips_blank_ones() {
        let mut lines = Vec::new();
        read_output_stream(&b"one\r\n\ntwo\nthree"[..], |l| lines.push(l));
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[cfg(unix)]
    #[test]
    fn capture_reports_stderr_on_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 3");
        let err = run_command_capture(cmd).unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn grouped_child_can_be_killed_by_group() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo started; sleep 30");
        let (mut child, drains) = spawn_grouped(cmd, "test").expect("spawn");
        kill_pgroup(child.id(), true);
        let status = child.wait().expect("wait");
        assert!(!status.success());
        for h in drains {
            h.join().expect("drain join");
        }
    }
}
