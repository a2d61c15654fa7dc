use crate::plan::{CommandSpec, SessionConfig, Timings};
use crate::process::{isolate_process_group, send_signal, wait_until, Signal};
use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Starting,
    Probing,
    Ready,
    Failed,
    Terminating,
    Terminated,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to spawn server: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("server on port {port} exited before becoming ready ({status})")]
    ExitedEarly { port: u16, status: String },
    #[error("server on port {port} not ready within {waited:?}")]
    DeadlineExceeded { port: u16, waited: Duration },
    #[error("cannot start server from state {0:?}")]
    InvalidState(ServerState),
}

pub trait ReadinessProbe {
    fn is_ready(&self, port: u16) -> bool;
}

/// `GET http://127.0.0.1:<port>/health`, ready on 200.
pub struct HttpHealthProbe {
    client: reqwest::blocking::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            path: "/health".to_string(),
        })
    }
}

impl ReadinessProbe for HttpHealthProbe {
    fn is_ready(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}{}", port, self.path);
        match self.client.get(&url).send() {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(err) => {
                debug!(port, error = %err, "health probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerLaunch {
    pub command: CommandSpec,
    pub model_path: String,
    pub quantization: Option<String>,
    pub host: String,
    pub resource_env: String,
    pub resource_unit: u32,
    pub port: u16,
    pub log_path: Option<PathBuf>,
}

impl ServerLaunch {
    pub fn for_session(config: &SessionConfig, log_path: Option<PathBuf>) -> Self {
        Self {
            command: config.server.command.clone(),
            model_path: config.model.path.clone(),
            quantization: config.model.quantization.clone(),
            host: config.server.host.clone(),
            resource_env: config.server.resource_env.clone(),
            resource_unit: config.slot.resource_unit,
            port: config.slot.port,
            log_path,
        }
    }
}

/// One server process bound to a resource unit and port. Dropping the handle
/// tears the process down if `shutdown` was never called.
pub struct ServerHandle {
    launch: ServerLaunch,
    timings: Timings,
    child: Option<Child>,
    state: ServerState,
}

impl ServerHandle {
    pub fn new(launch: ServerLaunch, timings: Timings) -> Self {
        Self {
            launch,
            timings,
            child: None,
            state: ServerState::Idle,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn port(&self) -> u16 {
        self.launch.port
    }

    pub fn resource_unit(&self) -> u32 {
        self.launch.resource_unit
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.launch.port)
    }

    /// Starts the process and blocks until it is Ready or Failed.
    pub fn launch(&mut self, probe: &dyn ReadinessProbe) -> Result<(), StartupError> {
        self.start()?;
        self.wait_until_ready(probe)
    }

    pub fn start(&mut self) -> Result<(), StartupError> {
        if self.state != ServerState::Idle {
            return Err(StartupError::InvalidState(self.state));
        }
        let mut cmd = self.launch.command.to_command();
        cmd.arg("--model-path")
            .arg(&self.launch.model_path)
            .arg("--port")
            .arg(self.launch.port.to_string())
            .arg("--host")
            .arg(&self.launch.host)
            .arg("--tp")
            .arg("1");
        if let Some(q) = self.launch.quantization.as_deref() {
            cmd.arg("--quantization").arg(q);
        }
        cmd.env(&self.launch.resource_env, self.launch.resource_unit.to_string());
        cmd.stdin(Stdio::null());
        match self.launch.log_path.as_ref() {
            Some(path) => {
                let log = fs::File::create(path).map_err(StartupError::Spawn)?;
                let err_log = log.try_clone().map_err(StartupError::Spawn)?;
                cmd.stdout(log);
                cmd.stderr(err_log);
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }
        isolate_process_group(&mut cmd);

        self.state = ServerState::Starting;
        let child = cmd.spawn().map_err(|e| {
            self.state = ServerState::Failed;
            StartupError::Spawn(e)
        })?;
        info!(
            model_path = %self.launch.model_path,
            port = self.launch.port,
            resource_unit = self.launch.resource_unit,
            pid = child.id(),
            "server started"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Grace delay, then periodic probing until ready, exit, or deadline.
    pub fn wait_until_ready(&mut self, probe: &dyn ReadinessProbe) -> Result<(), StartupError> {
        if self.state != ServerState::Starting {
            return Err(StartupError::InvalidState(self.state));
        }
        let port = self.launch.port;
        if let Some(status) = self.wait_for_exit(self.timings.startup_grace) {
            return Err(self.fail_exited(status));
        }

        self.state = ServerState::Probing;
        let started = Instant::now();
        loop {
            if probe.is_ready(port) {
                self.state = ServerState::Ready;
                info!(port, waited = ?started.elapsed(), "server ready");
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timings.ready_deadline {
                self.state = ServerState::Failed;
                warn!(port, waited = ?elapsed, "server readiness deadline exceeded");
                return Err(StartupError::DeadlineExceeded {
                    port,
                    waited: elapsed,
                });
            }
            let pause = self
                .timings
                .probe_interval
                .min(self.timings.ready_deadline - elapsed);
            if let Some(status) = self.wait_for_exit(pause) {
                return Err(self.fail_exited(status));
            }
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<String> {
        match self.child.as_mut() {
            Some(child) => match wait_until(child, timeout) {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(err) => Some(format!("wait failed: {}", err)),
            },
            None => {
                thread::sleep(timeout);
                None
            }
        }
    }

    fn fail_exited(&mut self, status: String) -> StartupError {
        self.state = ServerState::Failed;
        warn!(port = self.launch.port, %status, "server exited before becoming ready");
        StartupError::ExitedEarly {
            port: self.launch.port,
            status,
        }
    }

    /// Graceful stop, forced after the grace window, then the settle delay.
    /// Safe to call from any state and more than once.
    pub fn shutdown(&mut self) {
        if self.state == ServerState::Terminated {
            return;
        }
        self.state = ServerState::Terminating;
        if let Some(mut child) = self.child.take() {
            let already_exited = matches!(child.try_wait(), Ok(Some(_)));
            if !already_exited {
                debug!(port = self.launch.port, pid = child.id(), "stopping server");
                send_signal(&mut child, Signal::Terminate);
                match wait_until(&mut child, self.timings.terminate_grace) {
                    Ok(Some(_)) => {}
                    _ => {
                        warn!(port = self.launch.port, "server ignored termination, killing");
                        send_signal(&mut child, Signal::Kill);
                    }
                }
            }
            let _ = child.wait();
            thread::sleep(self.timings.settle);
            info!(port = self.launch.port, "server stopped");
        }
        self.state = ServerState::Terminated;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpListener;

    fn fast_timings() -> Timings {
        Timings {
            startup_grace: Duration::from_millis(20),
            probe_interval: Duration::from_millis(20),
            ready_deadline: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(200),
            trial_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
            terminate_grace: Duration::from_millis(500),
            settle: Duration::from_millis(10),
            inter_trial_pause: Duration::from_millis(10),
        }
    }

    fn launch(script: &str, port: u16) -> ServerLaunch {
        ServerLaunch {
            command: CommandSpec::new("sh", &["-c", script, "server"]),
            model_path: "/models/m".to_string(),
            quantization: None,
            host: "127.0.0.1".to_string(),
            resource_env: "SERVBENCH_TEST_UNIT".to_string(),
            resource_unit: 3,
            port,
            log_path: None,
        }
    }

    struct CountingProbe {
        ready_after: usize,
        calls: Cell<usize>,
    }

    impl ReadinessProbe for CountingProbe {
        fn is_ready(&self, _port: u16) -> bool {
            self.calls.set(self.calls.get() + 1);
            self.calls.get() > self.ready_after
        }
    }

    fn process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn becomes_ready_after_probe_succeeds() {
        let probe = CountingProbe {
            ready_after: 2,
            calls: Cell::new(0),
        };
        let mut server = ServerHandle::new(launch("exec sleep 30", 0), fast_timings());
        assert_eq!(server.state(), ServerState::Idle);
        server.launch(&probe).expect("ready");
        assert_eq!(server.state(), ServerState::Ready);
        assert_eq!(probe.calls.get(), 3);
        let pid = server.pid().expect("pid");
        server.shutdown();
        assert_eq!(server.state(), ServerState::Terminated);
        assert!(server.pid().is_none());
        assert!(!process_alive(pid));
    }

    #[test]
    fn probe_that_never_succeeds_fails_at_deadline() {
        let probe = CountingProbe {
            ready_after: usize::MAX,
            calls: Cell::new(0),
        };
        let mut server = ServerHandle::new(launch("exec sleep 30", 0), fast_timings());
        let err = server.launch(&probe).expect_err("must fail");
        assert!(matches!(err, StartupError::DeadlineExceeded { .. }), "{}", err);
        assert_eq!(server.state(), ServerState::Failed);
        assert!(probe.calls.get() >= 2);
        server.shutdown();
        assert_eq!(server.state(), ServerState::Terminated);
    }

    #[test]
    fn early_exit_fails_without_waiting_for_deadline() {
        let probe = CountingProbe {
            ready_after: usize::MAX,
            calls: Cell::new(0),
        };
        let mut timings = fast_timings();
        timings.ready_deadline = Duration::from_secs(60);
        let mut server = ServerHandle::new(launch("exit 3", 0), timings);
        let started = Instant::now();
        let err = server.launch(&probe).expect_err("must fail");
        assert!(matches!(err, StartupError::ExitedEarly { .. }), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(server.state(), ServerState::Failed);
    }

    #[test]
    fn stubborn_server_is_force_killed() {
        let probe = CountingProbe {
            ready_after: 0,
            calls: Cell::new(0),
        };
        let mut server = ServerHandle::new(
            launch("trap '' TERM; while true; do sleep 0.05; done", 0),
            fast_timings(),
        );
        server.launch(&probe).expect("ready");
        let pid = server.pid().expect("pid");
        let started = Instant::now();
        server.shutdown();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!process_alive(pid));
        assert_eq!(server.state(), ServerState::Terminated);
    }

    #[test]
    fn drop_terminates_a_running_server() {
        let probe = CountingProbe {
            ready_after: 0,
            calls: Cell::new(0),
        };
        let pid = {
            let mut server = ServerHandle::new(launch("exec sleep 30", 0), fast_timings());
            server.launch(&probe).expect("ready");
            server.pid().expect("pid")
        };
        assert!(!process_alive(pid));
    }

    #[test]
    fn server_sees_flags_and_resource_unit() {
        let dir = std::env::temp_dir().join(format!(
            "servbench_server_env_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let log = dir.join("server.log");
        let mut cfg = launch("echo \"unit=$SERVBENCH_TEST_UNIT $*\"; exec sleep 30", 31234);
        cfg.quantization = Some("w8a8_int8".to_string());
        cfg.log_path = Some(log.clone());
        let probe = CountingProbe {
            ready_after: 0,
            calls: Cell::new(0),
        };
        let mut timings = fast_timings();
        timings.startup_grace = Duration::from_millis(200);
        let mut server = ServerHandle::new(cfg, timings);
        server.launch(&probe).expect("ready");
        server.shutdown();
        let text = fs::read_to_string(&log).expect("log");
        assert_eq!(
            text.trim(),
            "unit=3 --model-path /models/m --port 31234 --host 127.0.0.1 --tp 1 --quantization w8a8_int8"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn http_probe_reports_health_status() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("http server");
        let port = server.server_addr().to_ip().expect("ip addr").port();
        let worker = thread::spawn(move || {
            for (i, request) in server.incoming_requests().take(2).enumerate() {
                let code: u16 = if i == 0 { 503 } else { 200 };
                let _ = request.respond(tiny_http::Response::empty(code));
            }
        });
        let probe = HttpHealthProbe::new(Duration::from_secs(2)).expect("probe");
        assert!(!probe.is_ready(port));
        assert!(probe.is_ready(port));
        worker.join().expect("worker");

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let closed = listener.local_addr().expect("addr").port();
        drop(listener);
        assert!(!probe.is_ready(closed));
    }

    #[test]
    fn start_is_rejected_outside_idle() {
        let probe = CountingProbe {
            ready_after: 0,
            calls: Cell::new(0),
        };
        let mut server = ServerHandle::new(launch("exec sleep 30", 0), fast_timings());
        server.launch(&probe).expect("ready");
        assert!(matches!(
            server.start(),
            Err(StartupError::InvalidState(ServerState::Ready))
        ));
    }
}
