use anyhow::Result;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output readers may keep draining once the child is gone.
const READER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Puts the child in its own process group so signals reach anything it
/// forks as well.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

pub fn send_signal(child: &mut Child, signal: Signal) {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pgid = child.id() as libc::pid_t;
        // SAFETY: plain kill(2) on the group we created at spawn.
        let rc = unsafe { libc::kill(-pgid, sig) };
        if rc != 0 {
            let _ = unsafe { libc::kill(pgid, sig) };
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = child.kill();
    }
}

/// Signals every remaining member of a process group. Unlike `send_signal`
/// this never falls back to the bare pid, which may already be reaped.
pub fn signal_group(pgid: u32, signal: Signal) {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) on a negative pgid only targets that group.
        let _ = unsafe { libc::kill(-(pgid as libc::pid_t), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, signal);
    }
}

/// Polls until the child exits or `timeout` elapses. `Ok(None)` on timeout;
/// the child is left running.
pub fn wait_until(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

#[derive(Debug)]
pub struct BoundedOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
}

impl BoundedOutput {
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

/// Runs `cmd` to completion with a wall-clock ceiling, capturing both
/// streams. A timed-out child is killed and reaped before returning. Anything
/// left behind in the child's process group is killed once the child exits,
/// and output readers get at most a short drain window after the ceiling.
pub fn run_bounded(mut cmd: Command, timeout: Duration) -> Result<BoundedOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn()?;
    let pgid = child.id();
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let status = wait_until(&mut child, timeout)?;
    let timed_out = status.is_none();
    if timed_out {
        send_signal(&mut child, Signal::Kill);
        let _ = child.wait();
    }
    signal_group(pgid, Signal::Kill);

    let drain_until = deadline.max(Instant::now()) + READER_DRAIN;
    let stdout = collect_reader(stdout_reader, drain_until);
    let stderr = collect_reader(stderr_reader, drain_until);
    Ok(BoundedOutput {
        stdout,
        stderr,
        status,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// A reader still blocked at `until` (pipe held open by an escaped process)
/// is abandoned with empty output.
fn collect_reader(reader: Option<mpsc::Receiver<Vec<u8>>>, until: Instant) -> String {
    let bytes = reader
        .and_then(|rx| rx.recv_timeout(until.saturating_duration_since(Instant::now())).ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_bounded(sh("echo out; echo err 1>&2"), Duration::from_secs(10))
            .expect("run");
        assert!(!out.timed_out);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.combined(), "out\nerr\n");
        assert!(out.status.expect("status").success());
    }

    #[test]
    fn kills_on_timeout_including_forked_children() {
        let started = Instant::now();
        let out = run_bounded(sh("echo early; sleep 30; echo late"), Duration::from_millis(300))
            .expect("run");
        assert!(out.timed_out);
        assert!(out.status.is_none());
        assert_eq!(out.stdout, "early\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn background_leftovers_do_not_hold_the_call_past_its_ceiling() {
        let started = Instant::now();
        let out = run_bounded(sh("echo hi; sleep 8 &"), Duration::from_millis(500))
            .expect("run");
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
        assert!(!out.timed_out);
        assert_eq!(out.stdout, "hi\n");
        assert!(out.status.expect("status").success());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let cmd = Command::new("/nonexistent/servbench-binary");
        assert!(run_bounded(cmd, Duration::from_secs(1)).is_err());
    }
}
