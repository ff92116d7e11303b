use std::{
    io,
    path::PathBuf,
    process::Stdio,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::{Instrument, Level, debug, enabled, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    application::render::{RenderError, Renderer},
    config::WorkerSettings,
    domain::{
        error::DomainError,
        render::{RenderRequest, RenderResponse, millis},
    },
};

use super::{
    bounded::{self, Cleanup},
    drain::StderrDrain,
    guard::{ExchangeGuard, KillSwitch, kill_and_reap, mutex_lock},
    locate,
    protocol::{self, WireResponse},
};

/// Lifecycle of the worker behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No worker yet, or the last one was torn down after a failure.
    NoProcess,
    Running,
    /// Explicitly shut down. The next render starts a fresh worker.
    Terminated,
}

/// The worker's pipes, only ever touched while holding the exchange guard.
///
/// The bookkeeping here survives a render future being dropped at any await
/// point, so the next exchange can tell what state the pipes were left in.
struct Channel {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Kill-switch generation of the process these pipes belong to.
    generation: u64,
    /// Bytes of a response line read before a deadline cut the read short.
    partial: Vec<u8>,
    /// Requests written whose responses have not been read yet. All but the
    /// newest belong to abandoned exchanges and are discarded on arrival.
    unanswered: usize,
    /// Set while a request line is being written. Still set at the start of
    /// an exchange means the worker may have received half a line.
    writing: bool,
}

impl Channel {
    async fn send(&mut self, line: &str) -> Result<(), RenderError> {
        self.writing = true;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| RenderError::transport("write request", err))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| RenderError::transport("flush request", err))?;
        self.writing = false;
        self.unanswered += 1;
        Ok(())
    }

    /// Read the response to the most recent request.
    /// Safe to cancel: partial reads are kept for the next call.
    async fn next_response(&mut self) -> io::Result<String> {
        loop {
            self.stdout.read_until(b'\n', &mut self.partial).await?;
            if self.partial.last() != Some(&b'\n') {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "worker closed its output stream",
                ));
            }

            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.unanswered = self.unanswered.saturating_sub(1);

            if self.unanswered > 0 {
                debug!(
                    target = "infra::worker::session",
                    op = "worker::read",
                    result = "stale_discarded",
                    remaining = self.unanswered,
                    "Discarded late response to an abandoned request"
                );
                continue;
            }

            return Ok(line);
        }
    }
}

#[derive(Default)]
struct Exchange {
    channel: Option<Channel>,
}

enum Outcome {
    Answered(RenderResponse),
    /// The worker's output stream can no longer be trusted.
    Corrupted(RenderResponse),
}

/// A long-lived worker process driven over its stdin/stdout.
///
/// The worker is started on the first render and reused afterwards. At most
/// one exchange is in flight at a time; concurrent callers queue on the
/// exchange guard. See [`WorkerSession::shutdown`] for teardown.
pub struct WorkerSession {
    settings: WorkerSettings,
    program: PathBuf,
    exchange: ExchangeGuard<Exchange>,
    kill_switch: KillSwitch,
    diagnostics: Mutex<Option<StderrDrain>>,
    terminated: AtomicBool,
}

impl WorkerSession {
    /// Validate prerequisites and build an idle session. No process is
    /// started until the first render.
    pub fn new(settings: WorkerSettings) -> Result<Self, RenderError> {
        let program = locate::which(&settings.executable).ok_or_else(|| {
            RenderError::configuration(format!(
                "can't locate worker executable: {}",
                settings.executable.display()
            ))
        })?;

        if !settings.script.is_file() {
            return Err(RenderError::configuration(format!(
                "can't locate worker script: {}",
                settings.script.display()
            )));
        }

        Ok(Self {
            settings,
            program,
            exchange: ExchangeGuard::new(Exchange::default()),
            kill_switch: KillSwitch::default(),
            diagnostics: Mutex::new(None),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        if self.kill_switch.is_armed() {
            SessionState::Running
        } else if self.terminated.load(Ordering::SeqCst) {
            SessionState::Terminated
        } else {
            SessionState::NoProcess
        }
    }

    /// PID of the running worker, if any.
    pub fn worker_pid(&self) -> Option<u32> {
        self.kill_switch.pid()
    }

    /// Render one page.
    ///
    /// Timeouts and unparseable worker output come back as `fail` responses.
    /// A timed-out worker is kept; a worker that produced garbage is torn
    /// down. I/O failures tear the worker down and are returned as errors.
    pub async fn render(&self, request: &RenderRequest) -> Result<RenderResponse, RenderError> {
        request.validate()?;

        let page_load = request
            .page_load_timeout
            .unwrap_or(self.settings.timeouts.page_load);
        let line = protocol::encode_request(request, page_load).map_err(|err| {
            RenderError::Validation(DomainError::validation(format!(
                "request could not be encoded: {err}"
            )))
        })?;

        let span = info_span!(
            "worker_render",
            request_id = %Uuid::new_v4(),
            url = request.target()
        );
        self.render_line(request, &line, page_load)
            .instrument(span)
            .await
    }

    /// Stop the worker.
    ///
    /// Waits up to `timeout` (`None` = indefinitely) for the exchange guard so
    /// an in-flight render can finish, then asks the worker to exit, allows
    /// the shutdown grace period, and terminates it if needed. When the guard
    /// cannot be acquired in time the worker is killed outright; the in-flight
    /// render then fails with a transport error. Idempotent.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        match self.exchange.acquire_within(timeout).await {
            Some(mut exchange) => self.close_locked(&mut exchange).await,
            None => {
                let killed = self.kill_switch.force_kill();
                warn!(
                    target = "infra::worker::session",
                    op = "worker::shutdown",
                    result = "forced",
                    timeout_ms = timeout.map(millis),
                    killed,
                    "Exchange guard unavailable; force-killed worker"
                );
                if killed {
                    counter!("pagesnap_worker_forced_kills_total").increment(1);
                }
                self.shutdown_drain();
            }
        }
        self.terminated.store(true, Ordering::SeqCst);
    }

    async fn render_line(
        &self,
        request: &RenderRequest,
        line: &str,
        page_load: Duration,
    ) -> Result<RenderResponse, RenderError> {
        let started_at = Instant::now();
        let mut exchange = self.exchange.acquire().await;

        let outcome = self
            .exchange_locked(&mut exchange, request, line, page_load)
            .await;
        self.log_diagnostics();

        let response = match outcome {
            Ok(Outcome::Answered(response)) => response,
            Ok(Outcome::Corrupted(response)) => {
                self.close_locked(&mut exchange).await;
                response
            }
            Err(err) => {
                error!(
                    target = "infra::worker::session",
                    op = "worker::render",
                    result = "error",
                    elapsed_ms = millis(started_at.elapsed()),
                    error = %err,
                    "Unexpected worker failure; terminating worker"
                );
                self.close_locked(&mut exchange).await;
                return Err(err);
            }
        };

        let elapsed_ms = millis(started_at.elapsed());
        counter!("pagesnap_render_total", "status" => response.status.to_string()).increment(1);
        histogram!("pagesnap_render_ms").record(elapsed_ms as f64);
        debug!(
            target = "infra::worker::session",
            op = "worker::render",
            result = %response.status,
            elapsed_ms,
            "Render exchange finished"
        );

        Ok(response)
    }

    async fn exchange_locked(
        &self,
        exchange: &mut Exchange,
        request: &RenderRequest,
        line: &str,
        page_load: Duration,
    ) -> Result<Outcome, RenderError> {
        if let Some(reason) = exchange
            .channel
            .as_ref()
            .and_then(|channel| self.unusable(channel))
        {
            warn!(
                target = "infra::worker::session",
                op = "worker::render",
                result = reason,
                "Worker pipes can't be reused; starting a fresh worker"
            );
            self.close_locked(exchange).await;
        }

        let (channel, first_render) = match exchange.channel.take() {
            Some(channel) => (channel, false),
            None => (self.start_worker().await?, true),
        };
        let channel = exchange.channel.insert(channel);

        debug!(
            target = "infra::worker::session",
            op = "worker::send",
            request = line.trim_end(),
            "Sending request to worker"
        );
        channel.send(line).await?;

        let timeouts = &self.settings.timeouts;
        let allowance = if first_render {
            timeouts.initial_render_response
        } else {
            timeouts.render_response
        };
        let deadline = page_load.saturating_add(allowance);
        let mut response = RenderResponse::for_request(request);

        let Some(read) = bounded::call(deadline, channel.next_response()).await else {
            counter!("pagesnap_render_timeouts_total").increment(1);
            warn!(
                target = "infra::worker::session",
                op = "worker::read",
                result = "timeout",
                deadline_ms = millis(deadline),
                first_render,
                "Worker did not answer in time; keeping it alive"
            );
            response.error = Some(protocol::TIMEOUT_MESSAGE.to_string());
            return Ok(Outcome::Answered(response));
        };
        let raw = read.map_err(|err| RenderError::transport("read response", err))?;

        match WireResponse::parse(&raw) {
            Ok(wire) => {
                if enabled!(Level::DEBUG) {
                    debug!(
                        target = "infra::worker::session",
                        op = "worker::read",
                        response = %wire.redacted(),
                        "Received response from worker"
                    );
                }
                wire.apply_to(&mut response);
                Ok(Outcome::Answered(response))
            }
            Err(err) => {
                let raw = raw.trim_end();
                error!(
                    target = "infra::worker::session",
                    op = "worker::read",
                    result = "malformed",
                    error = %err,
                    response = raw,
                    "Error parsing worker response; terminating worker"
                );
                response.error = Some(format!("{err}\nWorker response: {raw}"));
                Ok(Outcome::Corrupted(response))
            }
        }
    }

    /// Why `channel` must not carry another exchange, if it must not.
    fn unusable(&self, channel: &Channel) -> Option<&'static str> {
        if !self.kill_switch.is_current(channel.generation) {
            Some("worker_gone")
        } else if channel.writing {
            Some("interrupted_write")
        } else {
            None
        }
    }

    async fn start_worker(&self) -> Result<Channel, RenderError> {
        let started_at = Instant::now();
        let startup = self.settings.timeouts.process_startup;
        let mut command = self.launch_command();

        debug!(
            target = "infra::worker::session",
            op = "worker::start",
            command = %self.command_line(),
            "Starting worker process"
        );

        let spawned = bounded::call_blocking(startup, Cleanup::Join, move || command.spawn()).await;
        let mut child = match spawned {
            Some(Ok(child)) => child,
            Some(Err(err)) => return Err(RenderError::transport("spawn worker", err)),
            None => return Err(RenderError::StartupTimeout { timeout: startup }),
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            kill_and_reap(child);
            return Err(RenderError::transport(
                "attach pipes",
                io::Error::other("worker pipes unavailable"),
            ));
        };

        self.install_drain(StderrDrain::start(stderr));
        let pid = child.id();
        let generation = self.kill_switch.arm(child);
        self.terminated.store(false, Ordering::SeqCst);

        counter!("pagesnap_worker_starts_total").increment(1);
        info!(
            target = "infra::worker::session",
            op = "worker::start",
            result = "started",
            pid,
            elapsed_ms = millis(started_at.elapsed()),
            "Worker process started"
        );

        Ok(Channel {
            stdin,
            stdout: BufReader::new(stdout),
            generation,
            partial: Vec::new(),
            unanswered: 0,
            writing: false,
        })
    }

    fn launch_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.settings.args)
            .arg(&self.settings.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = self.settings.env.as_ref() {
            command.env_clear().envs(env);
        }
        command
    }

    fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.settings.args.iter().cloned());
        parts.push(self.settings.script.display().to_string());
        parts.join(" ")
    }

    /// Tear the worker down. Caller holds the exchange guard.
    async fn close_locked(&self, exchange: &mut Exchange) {
        let grace = self.settings.timeouts.shutdown_grace;

        if let Some(mut channel) = exchange.channel.take() {
            let sent = bounded::call(grace, async {
                channel.stdin.write_all(protocol::EXIT_COMMAND).await?;
                channel.stdin.flush().await
            })
            .await;
            if !matches!(sent, Some(Ok(()))) {
                debug!(
                    target = "infra::worker::session",
                    op = "worker::shutdown",
                    result = "exit_not_delivered",
                    "Worker did not accept the exit command"
                );
            }
        }

        if let Some(mut child) = self.kill_switch.take() {
            match bounded::call(grace, child.wait()).await {
                Some(Ok(status)) => info!(
                    target = "infra::worker::session",
                    op = "worker::shutdown",
                    result = "exited",
                    exit_code = status.code(),
                    "Worker exited"
                ),
                Some(Err(err)) => {
                    warn!(
                        target = "infra::worker::session",
                        op = "worker::shutdown",
                        result = "wait_failed",
                        error = %err,
                        "Waiting for worker exit failed; killing it"
                    );
                    kill_and_reap(child);
                }
                None => self.terminate(child).await,
            }
        }

        self.shutdown_drain();
    }

    /// Ask a worker that outlived the grace period to terminate, killing it
    /// if it ignores the request.
    async fn terminate(&self, mut child: Child) {
        if request_termination(&child)
            && let Some(Ok(status)) =
                bounded::call(self.settings.timeouts.shutdown_grace, child.wait()).await
        {
            info!(
                target = "infra::worker::session",
                op = "worker::shutdown",
                result = "terminated",
                exit_code = status.code(),
                "Worker terminated"
            );
            return;
        }

        warn!(
            target = "infra::worker::session",
            op = "worker::shutdown",
            result = "killed",
            pid = child.id(),
            "Worker ignored termination request; killing it"
        );
        kill_and_reap(child);
    }

    fn diagnostics(&self) -> MutexGuard<'_, Option<StderrDrain>> {
        mutex_lock(
            &self.diagnostics,
            "infra::worker::session",
            "worker::diagnostics",
        )
    }

    fn install_drain(&self, drain: StderrDrain) {
        if let Some(previous) = self.diagnostics().replace(drain) {
            previous.shutdown();
        }
    }

    fn shutdown_drain(&self) {
        let drain = self.diagnostics().take();
        if let Some(drain) = drain {
            drain.shutdown();
        }
    }

    fn log_diagnostics(&self) {
        let lines = match self.diagnostics().as_mut() {
            Some(drain) => drain.drain_all(),
            None => return,
        };
        if !lines.is_empty() {
            debug!(
                target = "infra::worker::session",
                op = "worker::stderr",
                lines = lines.len(),
                stderr = %lines.join("\n"),
                "Worker diagnostics"
            );
        }
    }
}

#[async_trait]
impl Renderer for WorkerSession {
    async fn render(&self, request: &RenderRequest) -> Result<RenderResponse, RenderError> {
        WorkerSession::render(self, request).await
    }

    async fn shutdown(&self, timeout: Option<Duration>) {
        WorkerSession::shutdown(self, timeout).await;
    }
}

#[cfg(unix)]
fn request_termination(child: &Child) -> bool {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(
                target = "infra::worker::session",
                op = "worker::terminate",
                pid,
                error = %err,
                "SIGTERM delivery failed"
            );
            false
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_fails_at_construction() {
        let settings = WorkerSettings::new("/nonexistent/worker-binary", "/bin/sh");
        let err = WorkerSession::new(settings).err().expect("construction must fail");
        assert!(matches!(err, RenderError::Configuration { .. }));
        assert!(err.to_string().contains("worker-binary"));
    }

    #[test]
    fn missing_script_fails_at_construction() {
        let settings = WorkerSettings::new("/bin/sh", "/nonexistent/render.js");
        let err = WorkerSession::new(settings).err().expect("construction must fail");
        assert!(err.to_string().contains("render.js"));
    }

    #[test]
    fn new_session_has_no_process() {
        let script = tempfile::NamedTempFile::new().expect("tmp script");
        let session =
            WorkerSession::new(WorkerSettings::new("/bin/sh", script.path())).expect("session");
        assert_eq!(session.state(), SessionState::NoProcess);
        assert_eq!(session.worker_pid(), None);
    }

    #[test]
    fn command_line_places_script_last() {
        let script = tempfile::NamedTempFile::new().expect("tmp script");
        let mut settings = WorkerSettings::new("/bin/sh", script.path());
        settings.args = vec!["-e".to_string()];
        let session = WorkerSession::new(settings).expect("session");

        let command = session.command_line();
        assert!(command.starts_with("/bin/sh -e "));
        assert!(command.ends_with(&script.path().display().to_string()));
    }

    #[tokio::test]
    async fn invalid_request_never_starts_worker() {
        let script = tempfile::NamedTempFile::new().expect("tmp script");
        let session =
            WorkerSession::new(WorkerSettings::new("/bin/sh", script.path())).expect("session");

        let err = session
            .render(&RenderRequest::new("not a url"))
            .await
            .expect_err("invalid request");
        assert!(matches!(err, RenderError::Validation(_)));
        assert_eq!(session.state(), SessionState::NoProcess);
    }

    #[tokio::test]
    async fn shutdown_without_process_marks_terminated() {
        let script = tempfile::NamedTempFile::new().expect("tmp script");
        let session =
            WorkerSession::new(WorkerSettings::new("/bin/sh", script.path())).expect("session");

        session.shutdown(None).await;
        session.shutdown(Some(Duration::ZERO)).await;
        assert_eq!(session.state(), SessionState::Terminated);
    }
}
