//! Session controller: one per connected client.
//!
//! The controller owns all per-connection state and runs on a single
//! task. Inbound frames, shell output and completions from spawned work
//! (provisioning, one-shot exec, validation timers, validation) are
//! multiplexed with `tokio::select!`, so a heartbeat is answered even
//! while a container is still being created.
//!
//! ```text
//! Connecting -> Provisioning -> Ready -> (Running <-> Ready)* -> Closed
//! ```
//!
//! Every command passes the [`CommandPolicy`] before anything else
//! happens. Events for one command are emitted in order: `command-start`,
//! `data`..., `command-end` (exec mode), then `validation`. A one-shot
//! command sent while another is running waits its turn.

pub mod ring;
pub mod timing;

pub use ring::{Mark, RingBuffer};
pub use timing::{TrailingWindow, ValidationTiming};

use crate::config::{now_millis, ContainerKind, ContainerRecord, RecordState, SandboxConfig, SessionSettings};
use crate::error::Error;
use crate::exec::{ExecBridge, ExecOutcome, InteractiveHandle, TerminalSignal};
use crate::os::{truncate_id, OsFlavor, ShellKind};
use crate::policy::{CommandPolicy, LineGate};
use crate::registry::ContainerRegistry;
use crate::retry::{retry_async, Exhausted, RetryPolicy};
use crate::stores::{PreferenceStore, ProgressStore};
use crate::telemetry::{AuditLogEntry, Telemetry};
use crate::validation::{ValidationRequest, ValidationRunner};
use sandboxd_protocol::{
    decode_client_message, notice, parse_step, ClientMessage, ServerEvent, SessionMode,
    ValidationResult,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Status line sent when a connection is accepted.
pub const CONNECTED_BANNER: &str = "[sandbox] connected";

/// Command used to check the denylist after the first `ready`.
const SELF_TEST_PROBE: &str = "rm -rf /";

/// Exit code reported for a one-shot command cancelled by `interrupt`.
///
/// The code is synthesized locally: the attached stream is dropped and the
/// command stops reporting, but a one-shot exec has no terminal to carry
/// the signal, so the process may still finish inside the container.
const INTERRUPTED_EXIT_CODE: i64 = 130;

/// One-shot commands waiting behind a running one.
const MAX_QUEUED_COMMANDS: usize = 32;

/// Everything a session needs from the rest of the server.
#[derive(Clone)]
pub struct SessionServices {
    /// Container registry.
    pub registry: ContainerRegistry,
    /// Exec bridge.
    pub exec: ExecBridge,
    /// Command policy.
    pub policy: Arc<CommandPolicy>,
    /// Validation runner.
    pub validation: ValidationRunner,
    /// Audit sink.
    pub telemetry: Arc<Telemetry>,
    /// Achievement store.
    pub progress: Arc<dyn ProgressStore>,
    /// Preferred flavor store.
    pub preferences: Arc<dyn PreferenceStore>,
    /// Interactive validation timing.
    pub timing: Arc<dyn ValidationTiming>,
    /// Retry policy for provisioning and exec.
    pub retry: RetryPolicy,
    /// Buffer sizes and limits.
    pub settings: SessionSettings,
    /// Leave containers running when the last session closes.
    pub keep_containers: bool,
    /// Run the denylist self-test after the first `ready`.
    pub self_test: bool,
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("registry", &self.registry)
            .field("timing", &self.timing)
            .field("keep_containers", &self.keep_containers)
            .finish_non_exhaustive()
    }
}

impl SessionServices {
    /// Default services built from configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        config: &SandboxConfig,
        registry: ContainerRegistry,
        policy: Arc<CommandPolicy>,
        validation: ValidationRunner,
        telemetry: Arc<Telemetry>,
        progress: Arc<dyn ProgressStore>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let exec = ExecBridge::new(registry.runtime(), config.timeouts.exec_start);
        Self {
            registry,
            exec,
            policy,
            validation,
            telemetry,
            progress,
            preferences,
            timing: Arc::new(TrailingWindow::new(config.session.validation_delay)),
            retry: RetryPolicy::for_session(),
            settings: config.session.clone(),
            keep_containers: config.keep_containers,
            self_test: config.self_test,
        }
    }
}

struct Provisioned {
    record: ContainerRecord,
    shell: Option<Result<InteractiveHandle, Exhausted<Error>>>,
}

struct ExecSuccess {
    outcome: ExecOutcome,
    output: String,
    reprovisioned: Option<ContainerRecord>,
}

/// Completions reported back to the session task.
enum Internal {
    Provisioned {
        generation: u64,
        requested: OsFlavor,
        result: Result<Provisioned, Exhausted<Error>>,
    },
    ShellStarted {
        generation: u64,
        result: Result<InteractiveHandle, Exhausted<Error>>,
    },
    ExecData {
        run: u64,
        data: String,
    },
    ExecDone {
        run: u64,
        result: Result<ExecSuccess, Exhausted<Error>>,
    },
    Settled {
        command: String,
        mark: Mark,
    },
    Validated {
        result: Option<ValidationResult>,
    },
}

struct RunningExec {
    run: u64,
    command: String,
    started: Instant,
    task: JoinHandle<()>,
}

/// Drives one client connection.
pub struct SessionController {
    services: SessionServices,
    username: String,
    initial_os: Option<OsFlavor>,
    requested_os: OsFlavor,
    resolved_os: Option<OsFlavor>,
    container: Option<ContainerRecord>,
    mode: SessionMode,
    activity: Option<String>,
    chapter: Option<String>,
    step: Option<u32>,
    ring: RingBuffer,
    history: VecDeque<String>,
    running: bool,
    shell: Option<Arc<InteractiveHandle>>,
    shell_rx: Option<mpsc::Receiver<String>>,
    gate: LineGate,
    generation: u64,
    lease: Option<OsFlavor>,
    telemetry_id: u64,
    ready_once: bool,
    next_run: u64,
    exec_task: Option<RunningExec>,
    queued: VecDeque<String>,
    outbound: mpsc::Sender<ServerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn recv_shell(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionController {
    /// Controller for `username`. `initial_os` overrides the stored preference.
    pub fn new(
        services: SessionServices,
        username: impl Into<String>,
        initial_os: Option<OsFlavor>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let ring = RingBuffer::new(services.settings.ring_capacity);
        Self {
            services,
            username: username.into(),
            initial_os,
            requested_os: OsFlavor::default(),
            resolved_os: None,
            container: None,
            mode: SessionMode::default(),
            activity: None,
            chapter: None,
            step: None,
            ring,
            history: VecDeque::new(),
            running: false,
            shell: None,
            shell_rx: None,
            gate: LineGate::default(),
            generation: 0,
            lease: None,
            telemetry_id: 0,
            ready_once: false,
            next_run: 0,
            exec_task: None,
            queued: VecDeque::new(),
            outbound,
            internal_tx,
            internal_rx,
        }
    }

    /// Run until the inbound channel closes or the client goes away.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<String>) {
        let initial = match self.initial_os {
            Some(os) => os,
            None => match self.services.preferences.preferred_os(&self.username) {
                Ok(os) => os.unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(user = %self.username, error = %e, "failed to read preferred flavor");
                    OsFlavor::default()
                }
            },
        };
        self.telemetry_id = self
            .services
            .telemetry
            .begin_session(&self.username, initial.as_str());
        tracing::info!(user = %self.username, os = %initial, "session opened");

        if self.emit(ServerEvent::text(CONNECTED_BANNER)).await {
            self.begin_provisioning(initial);

            loop {
                let keep_going = tokio::select! {
                    frame = inbound.recv() => match frame {
                        Some(frame) => self.handle_frame(&frame).await,
                        None => false,
                    },
                    Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
                    chunk = recv_shell(&mut self.shell_rx) => self.handle_shell_output(chunk).await,
                };
                if !keep_going {
                    break;
                }
            }
        }

        self.close().await;
    }

    async fn emit(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).await.is_ok()
    }

    async fn emit_error(&self, error: &Error, command: Option<&str>, attempt: u32) -> bool {
        self.emit(ServerEvent::Error {
            error: error.to_string(),
            command: command.map(str::to_string),
            attempt,
        })
        .await
    }

    fn audit(&self, command: &str, allowed: bool, exit_code: Option<i64>, duration_ms: Option<u64>) {
        self.services.telemetry.record(AuditLogEntry {
            user_id: self.username.clone(),
            os: self.resolved_os.unwrap_or(self.requested_os).as_str().to_string(),
            cmd: command.to_string(),
            allowed,
            timestamp: now_millis(),
            exit_code,
            duration_ms,
        });
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    async fn handle_frame(&mut self, frame: &str) -> bool {
        let message = match decode_client_message(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(user = %self.username, error = %e, "malformed frame");
                let err = Error::ProtocolMalformed(e.to_string());
                return self.emit_error(&err, None, 0).await;
            }
        };
        self.services.telemetry.touch(self.telemetry_id, None, None);

        match message {
            ClientMessage::NegotiateMode { mode } => self.negotiate_mode(&mode).await,
            ClientMessage::SetActivity { activity } => {
                self.activity = clean(activity);
                self.services.telemetry.touch(
                    self.telemetry_id,
                    None,
                    Some(self.activity.as_deref()),
                );
                self.emit(ServerEvent::ActivitySet {
                    value: self.activity.clone(),
                })
                .await
            }
            ClientMessage::SetChapter { chapter } => {
                self.chapter = clean(chapter);
                self.emit(ServerEvent::ChapterSet {
                    value: self.chapter.clone(),
                })
                .await
            }
            ClientMessage::SetStep { step } => {
                self.step = parse_step(step.as_ref());
                self.emit(ServerEvent::StepSet { value: self.step }).await
            }
            ClientMessage::SetOs { os } => {
                let os = OsFlavor::normalize(&os);
                if let Err(e) = self.services.preferences.set_preferred_os(&self.username, os) {
                    tracing::warn!(user = %self.username, error = %e, "failed to store preferred flavor");
                }
                self.begin_provisioning(os);
                true
            }
            ClientMessage::Heartbeat { .. } => self.emit(ServerEvent::Pong { ts: now_millis() }).await,
            ClientMessage::Stdin { data } => self.handle_stdin(&data).await,
            ClientMessage::Interrupt => self.handle_interrupt().await,
            ClientMessage::Resize { rows, cols } => {
                if let Some(shell) = self.shell.clone() {
                    tokio::spawn(async move {
                        if let Err(e) = shell.resize(rows, cols).await {
                            tracing::debug!(error = %e, "resize failed");
                        }
                    });
                }
                true
            }
            ClientMessage::Command { command } => self.handle_command(command).await,
        }
    }

    async fn negotiate_mode(&mut self, mode: &str) -> bool {
        self.mode = SessionMode::from_wire(mode);
        if !self.emit(ServerEvent::Mode { mode: self.mode }).await {
            return false;
        }
        match self.mode {
            SessionMode::Interactive => {
                if self.shell.is_none() {
                    if let Some(record) = self.container.clone().filter(|r| r.is_running()) {
                        self.begin_shell(record);
                    }
                }
            }
            SessionMode::Exec => self.drop_shell().await,
        }
        true
    }

    async fn handle_stdin(&mut self, data: &str) -> bool {
        let Some(shell) = self.shell.clone() else {
            return true;
        };
        let gated = self.gate.feed(&self.services.policy, data);
        if !gated.forward.is_empty() {
            if let Err(e) = shell.write(&gated.forward).await {
                tracing::debug!(user = %self.username, error = %e, "stdin dropped, shell gone");
            }
        }
        for command in gated.denied {
            if !self.deny(&command).await {
                return false;
            }
        }
        true
    }

    async fn handle_interrupt(&mut self) -> bool {
        if let Some(shell) = self.shell.clone() {
            tokio::spawn(async move {
                if let Err(e) = shell.send_signal(TerminalSignal::Interrupt).await {
                    tracing::debug!(error = %e, "interrupt not delivered");
                }
            });
        } else if let Some(running) = self.exec_task.take() {
            running.task.abort();
            self.running = false;
            tracing::info!(user = %self.username, cmd = %running.command, "command interrupted");
            self.audit(
                &running.command,
                true,
                Some(INTERRUPTED_EXIT_CODE),
                Some(running.started.elapsed().as_millis() as u64),
            );
            if !self
                .emit(ServerEvent::CommandEnd {
                    command: running.command,
                    exit_code: Some(INTERRUPTED_EXIT_CODE),
                })
                .await
            {
                return false;
            }
            if !self.emit(ServerEvent::InterruptAck).await {
                return false;
            }
            return self.run_queued().await;
        }
        self.emit(ServerEvent::InterruptAck).await
    }

    async fn deny(&self, command: &str) -> bool {
        tracing::info!(user = %self.username, cmd = %command, "command denied");
        self.audit(command, false, None, None);
        self.emit(ServerEvent::text(format!("[denied] {}", command)))
            .await
            && self
                .emit(ServerEvent::Denied {
                    command: command.to_string(),
                    ts: now_millis(),
                })
                .await
    }

    async fn handle_command(&mut self, command: String) -> bool {
        if command.trim().is_empty() {
            return true;
        }
        if !self.services.policy.is_allowed(&command) {
            return self.deny(&command).await;
        }

        self.history.push_front(command.clone());
        self.history.truncate(self.services.settings.history_limit);

        if self.exec_task.is_some() {
            if self.queued.len() >= MAX_QUEUED_COMMANDS {
                let err = Error::exec_transient("too many commands waiting, try again");
                return self.emit_error(&err, Some(&command), 0).await;
            }
            tracing::debug!(user = %self.username, cmd = %command, "command queued");
            self.queued.push_back(command);
            return true;
        }
        self.dispatch(command).await
    }

    /// Start an allowed command now.
    async fn dispatch(&mut self, command: String) -> bool {
        let Some(record) = self.container.clone().filter(|r| r.is_running()) else {
            let err = Error::exec_transient("sandbox is not ready yet");
            return self.emit_error(&err, Some(&command), 0).await;
        };

        self.running = true;
        if !self
            .emit(ServerEvent::CommandStart {
                command: command.clone(),
                mode: self.mode,
            })
            .await
        {
            return false;
        }

        if self.mode == SessionMode::Interactive {
            if let Some(shell) = self.shell.clone() {
                let mark = self.ring.mark();
                match shell.write(&format!("{}\n", command)).await {
                    Ok(()) => {
                        self.audit(&command, true, None, None);
                        self.schedule_settle(command, mark);
                        return true;
                    }
                    Err(e) => {
                        tracing::info!(user = %self.username, error = %e, "shell gone, running command once instead");
                        self.shell = None;
                        self.shell_rx = None;
                    }
                }
            }
        }

        self.begin_exec(record, command);
        true
    }

    // ========================================================================
    // Spawned work
    // ========================================================================

    fn begin_provisioning(&mut self, requested: OsFlavor) {
        self.generation += 1;
        self.requested_os = requested;
        let generation = self.generation;
        let services = self.services.clone();
        let owner = self.username.clone();
        let want_shell = self.mode == SessionMode::Interactive;
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let registry = services.registry.clone();
            let provisioned = retry_async(
                services.retry.clone(),
                "provision",
                |attempt| {
                    let registry = registry.clone();
                    let owner = owner.clone();
                    async move {
                        if attempt > 1 {
                            registry.forget(&owner, requested);
                        }
                        registry.ensure_container(&owner, requested).await
                    }
                },
                Error::is_provisioning_retryable,
            )
            .await;

            let result = match provisioned {
                Ok(record) => {
                    let shell = if want_shell && record.is_running() {
                        Some(start_shell(&services, &owner, requested, record.clone()).await)
                    } else {
                        None
                    };
                    Ok(Provisioned { record, shell })
                }
                Err(e) => Err(e),
            };
            let _ = tx.send(Internal::Provisioned {
                generation,
                requested,
                result,
            });
        });
    }

    fn begin_shell(&mut self, record: ContainerRecord) {
        let generation = self.generation;
        let services = self.services.clone();
        let owner = self.username.clone();
        let requested = self.requested_os;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = start_shell(&services, &owner, requested, record).await;
            let _ = tx.send(Internal::ShellStarted { generation, result });
        });
    }

    fn begin_exec(&mut self, record: ContainerRecord, command: String) {
        self.next_run += 1;
        let run = self.next_run;
        let services = self.services.clone();
        let owner = self.username.clone();
        let requested = self.requested_os;
        let tx = self.internal_tx.clone();
        let task_command = command.clone();

        let task = tokio::spawn(async move {
            let command = task_command;
            let result = retry_async(
                services.retry.clone(),
                "exec",
                |attempt| {
                    let services = services.clone();
                    let owner = owner.clone();
                    let record = record.clone();
                    let command = command.clone();
                    let tx = tx.clone();
                    async move {
                        let (target, reprovisioned) = if attempt > 1 {
                            services.registry.forget(&owner, requested);
                            let fresh = services
                                .registry
                                .ensure_container(&owner, requested)
                                .await?;
                            (fresh.clone(), Some(fresh))
                        } else {
                            (record, None)
                        };
                        let shell = ShellKind::for_image(&target.image);
                        // each attempt judges only its own output
                        let mut output = String::new();
                        let outcome = services
                            .exec
                            .run_once(&target.id, shell, &command, |data| {
                                output.push_str(data);
                                let _ = tx.send(Internal::ExecData {
                                    run,
                                    data: data.to_string(),
                                });
                            })
                            .await?;
                        Ok(ExecSuccess {
                            outcome,
                            output,
                            reprovisioned,
                        })
                    }
                },
                Error::is_exec_transient,
            )
            .await;
            let _ = tx.send(Internal::ExecDone { run, result });
        });

        self.exec_task = Some(RunningExec {
            run,
            command,
            started: Instant::now(),
            task,
        });
    }

    fn schedule_settle(&self, command: String, mark: Mark) {
        let delay = self.services.timing.settle_delay();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Settled { command, mark });
        });
    }

    fn begin_validation(&self, command: String, output: String) {
        let Some(activity) = self.activity.clone() else {
            return;
        };
        let request = ValidationRequest {
            activity,
            chapter: self.chapter.clone(),
            command,
            output,
            step: self.step,
            flag: None,
        };
        let validation = self.services.validation.clone();
        let progress = Arc::clone(&self.services.progress);
        let username = self.username.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = validation.validate(request).await;
            if let Some(achievements) = result
                .as_ref()
                .filter(|r| r.pass)
                .and_then(|r| r.achievements.as_ref())
                .filter(|a| !a.is_empty())
            {
                match progress.add_achievements(&username, achievements) {
                    Ok(added) if !added.is_empty() => {
                        tracing::info!(user = %username, achievements = ?added, "achievements earned")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(user = %username, error = %e, "failed to store achievements"),
                }
            }
            let _ = tx.send(Internal::Validated { result });
        });
    }

    // ========================================================================
    // Completions
    // ========================================================================

    async fn handle_internal(&mut self, event: Internal) -> bool {
        match event {
            Internal::Provisioned {
                generation,
                requested,
                result,
            } => {
                if generation != self.generation {
                    tracing::debug!(user = %self.username, os = %requested, "discarding stale provisioning result");
                    if let Ok(Provisioned { shell: Some(Ok(shell)), .. }) = result {
                        shell.close().await;
                    }
                    return true;
                }
                match result {
                    Ok(provisioned) => self.accept_container(requested, provisioned).await,
                    Err(e) => {
                        tracing::warn!(user = %self.username, os = %requested, error = %e, "provisioning failed");
                        self.emit_error(&e.error, None, e.attempts).await
                    }
                }
            }
            Internal::ShellStarted { generation, result } => {
                if generation != self.generation || self.mode != SessionMode::Interactive {
                    if let Ok(shell) = result {
                        shell.close().await;
                    }
                    return true;
                }
                match result {
                    Ok(shell) => {
                        self.install_shell(shell).await;
                        true
                    }
                    Err(e) => self.emit_error(&e.error, None, e.attempts).await,
                }
            }
            Internal::ExecData { run, data } => {
                if !self.is_current_run(run) {
                    return true;
                }
                self.ring.push(&data);
                self.emit(ServerEvent::Data { data }).await
            }
            Internal::ExecDone { run, result } => {
                if !self.is_current_run(run) {
                    return true;
                }
                let Some(finished) = self.exec_task.take() else {
                    return true;
                };
                self.running = false;
                let command = finished.command;
                let duration_ms = finished.started.elapsed().as_millis() as u64;
                let delivered = match result {
                    Ok(success) => {
                        if let Some(record) = success.reprovisioned {
                            self.container = Some(record);
                        }
                        let exit_code = success.outcome.exit_code;
                        self.audit(&command, true, Some(exit_code), Some(duration_ms));
                        if !self
                            .emit(ServerEvent::CommandEnd {
                                command: command.clone(),
                                exit_code: Some(exit_code),
                            })
                            .await
                        {
                            return false;
                        }
                        self.begin_validation(command, success.output);
                        true
                    }
                    Err(e) => {
                        self.audit(&command, true, None, Some(duration_ms));
                        self.emit_error(&e.error, Some(&command), e.attempts).await
                    }
                };
                delivered && self.run_queued().await
            }
            Internal::Settled { command, mark } => {
                self.running = false;
                let output = self.services.timing.attribute(&self.ring, mark);
                self.begin_validation(command, output);
                true
            }
            Internal::Validated { result } => match result {
                Some(data) => self.emit(ServerEvent::Validation { data }).await,
                None => true,
            },
        }
    }

    /// Dispatch queued commands until one of them is running.
    async fn run_queued(&mut self) -> bool {
        while self.exec_task.is_none() {
            let Some(command) = self.queued.pop_front() else {
                break;
            };
            if !self.dispatch(command).await {
                return false;
            }
        }
        true
    }

    fn is_current_run(&self, run: u64) -> bool {
        self.exec_task.as_ref().is_some_and(|r| r.run == run)
    }

    async fn accept_container(&mut self, requested: OsFlavor, provisioned: Provisioned) -> bool {
        let Provisioned { record, shell } = provisioned;

        if let Some(old) = self.lease.take() {
            if old != requested {
                self.services
                    .registry
                    .release(&self.username, old, true)
                    .await;
            } else {
                self.lease = Some(old);
            }
        }
        if self.lease.is_none() {
            self.services.registry.acquire(&self.username, requested);
            self.lease = Some(requested);
        }

        self.drop_shell().await;
        self.resolved_os = Some(record.os);
        self.container = Some(record.clone());
        self.services
            .telemetry
            .touch(self.telemetry_id, Some(record.os.as_str()), None);

        if record.state == RecordState::Unavailable {
            let err = Error::provisioning(
                &self.username,
                requested.as_str(),
                format!("{} is not available on this host", requested),
            );
            return self.emit_error(&err, None, 1).await;
        }

        if let Some(from) = record.fallback_from {
            let sent = self
                .emit(ServerEvent::Notice {
                    code: notice::OS_FALLBACK.to_string(),
                    from: Some(from.as_str().to_string()),
                    to: Some(record.os.as_str().to_string()),
                    ports: None,
                })
                .await;
            if !sent {
                return false;
            }
        }

        match shell {
            Some(Ok(shell)) => self.install_shell(shell).await,
            Some(Err(e)) => {
                if !self.emit_error(&e.error, None, e.attempts).await {
                    return false;
                }
            }
            None => {}
        }

        let ready = ServerEvent::Ready {
            os: record.os.as_str().to_string(),
            container: truncate_id(&record.id).to_string(),
        };
        if !self.emit(ready).await {
            return false;
        }

        if record.kind == ContainerKind::ProvisionedVm {
            let sent = self
                .emit(ServerEvent::Notice {
                    code: notice::OS_PROVISIONED.to_string(),
                    from: None,
                    to: Some(record.os.as_str().to_string()),
                    ports: Some(record.ports.clone()),
                })
                .await;
            if !sent {
                return false;
            }
        }

        if !self.ready_once {
            self.ready_once = true;
            if self.services.self_test {
                return self.run_self_test().await;
            }
        }
        true
    }

    async fn run_self_test(&self) -> bool {
        let line = if self.services.policy.is_allowed(SELF_TEST_PROBE) {
            tracing::error!("self-test: denylist allowed a destructive command");
            format!("[self-test] WARNING: {} was allowed", SELF_TEST_PROBE)
        } else {
            format!("[self-test] denylist active: {} denied", SELF_TEST_PROBE)
        };
        self.emit(ServerEvent::text(line)).await
    }

    async fn install_shell(&mut self, mut shell: InteractiveHandle) {
        self.drop_shell().await;
        self.shell_rx = shell.subscribe();
        self.gate = LineGate::default();
        self.shell = Some(Arc::new(shell));
    }

    async fn drop_shell(&mut self) {
        self.shell_rx = None;
        if let Some(shell) = self.shell.take() {
            shell.close().await;
        }
    }

    async fn handle_shell_output(&mut self, chunk: Option<String>) -> bool {
        match chunk {
            Some(data) => {
                self.ring.push(&data);
                self.emit(ServerEvent::Data { data }).await
            }
            None => {
                tracing::info!(user = %self.username, "interactive shell ended");
                self.shell_rx = None;
                self.shell = None;
                self.emit(ServerEvent::text("[sandbox] shell exited")).await
            }
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    async fn close(&mut self) {
        if !self.queued.is_empty() {
            tracing::debug!(user = %self.username, dropped = self.queued.len(), "dropping queued commands");
            self.queued.clear();
        }
        if let Some(running) = self.exec_task.take() {
            running.task.abort();
        }
        self.drop_shell().await;
        if let Some(os) = self.lease.take() {
            self.services
                .registry
                .release(&self.username, os, self.services.keep_containers)
                .await;
        }
        self.services.telemetry.end_session(self.telemetry_id);
        tracing::info!(
            user = %self.username,
            commands = self.history.len(),
            "session closed"
        );
    }
}

/// Attach a shell, re-provisioning once if the container turned out to be gone.
async fn start_shell(
    services: &SessionServices,
    owner: &str,
    requested: OsFlavor,
    record: ContainerRecord,
) -> Result<InteractiveHandle, Exhausted<Error>> {
    retry_async(
        services.retry.clone(),
        "interactive shell",
        |attempt| {
            let record = record.clone();
            async move {
                let target = if attempt > 1 {
                    services.registry.forget(owner, requested);
                    services.registry.ensure_container(owner, requested).await?
                } else {
                    record
                };
                services
                    .exec
                    .start_interactive(&target.id, ShellKind::for_image(&target.image))
                    .await
            }
        },
        Error::is_exec_transient,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SandboxDb;
    use crate::error::RuntimeErrorKind;
    use crate::registry::{HostCapabilities, RegistrySettings};
    use crate::runtime::fake::FakeRuntime;
    use std::time::Duration;

    struct Harness {
        runtime: Arc<FakeRuntime>,
        services: SessionServices,
        db: SandboxDb,
        _dir: tempfile::TempDir,
    }

    fn harness_with(configure: impl FnOnce(&mut RegistrySettings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = SandboxDb::open_at(&dir.path().join("db.redb")).unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let mut settings = RegistrySettings {
            bootstrap: None,
            host: HostCapabilities::default(),
            ..RegistrySettings::default()
        };
        configure(&mut settings);
        let registry = ContainerRegistry::new(runtime.clone(), settings, Some(db.clone()));

        let mut config = SandboxConfig::default();
        config.session.validation_delay = Duration::from_millis(30);
        let mut services = SessionServices::from_config(
            &config,
            registry,
            Arc::new(CommandPolicy::builtin()),
            ValidationRunner::default(),
            Arc::new(Telemetry::new(Some(db.clone()), 20)),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
        );
        services.retry.initial_delay = Duration::from_millis(1);
        services.retry.max_delay = Duration::from_millis(1);
        services.self_test = false;

        Harness {
            runtime,
            services,
            db,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    struct Client {
        tx: mpsc::Sender<String>,
        rx: mpsc::Receiver<ServerEvent>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn connect(services: &SessionServices, user: &str, os: Option<OsFlavor>) -> Self {
            let (tx, inbound) = mpsc::channel(32);
            let (outbound, rx) = mpsc::channel(256);
            let controller = SessionController::new(services.clone(), user, os, outbound);
            let task = tokio::spawn(controller.run(inbound));
            Self { tx, rx, task }
        }

        async fn send(&self, frame: &str) {
            self.tx.send(frame.to_string()).await.unwrap();
        }

        async fn next(&mut self) -> ServerEvent {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("session ended")
        }

        /// Next event that is not shell output.
        async fn next_control(&mut self) -> ServerEvent {
            loop {
                match self.next().await {
                    ServerEvent::Data { .. } => continue,
                    event => return event,
                }
            }
        }

        /// Collect events until one matches `done`, returning all of them.
        async fn until(&mut self, done: impl Fn(&ServerEvent) -> bool) -> Vec<ServerEvent> {
            let mut seen = Vec::new();
            loop {
                let event = self.next().await;
                let stop = done(&event);
                seen.push(event);
                if stop {
                    return seen;
                }
            }
        }

        async fn ready(&mut self) -> Vec<ServerEvent> {
            self.until(|e| matches!(e, ServerEvent::Ready { .. })).await
        }

        async fn close(self) {
            drop(self.tx);
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    fn is_validation(e: &ServerEvent) -> bool {
        matches!(e, ServerEvent::Validation { .. })
    }

    #[tokio::test]
    async fn test_connect_provisions_and_reports_ready() {
        let h = harness();
        let mut client = Client::connect(&h.services, "alice", None);

        assert_eq!(client.next().await, ServerEvent::text(CONNECTED_BANNER));
        let events = client.ready().await;
        let Some(ServerEvent::Ready { os, container }) = events.last() else {
            panic!("expected ready");
        };
        assert_eq!(os, "kali");

        let record = h.services.registry.get_record("alice", OsFlavor::Kali).unwrap();
        assert_eq!(container, truncate_id(&record.id));
        assert_eq!(h.services.telemetry.active_sessions().len(), 1);

        client.close().await;
        assert!(h.services.telemetry.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_denied_command_never_reaches_runtime() {
        let h = harness();
        let mut client = Client::connect(&h.services, "bob", None);
        client.ready().await;
        let execs_before = h.runtime.execs();

        client.send(r#"{"type":"command","command":"rm -rf /"}"#).await;
        let events = client
            .until(|e| matches!(e, ServerEvent::Denied { .. }))
            .await;
        assert!(events.contains(&ServerEvent::text("[denied] rm -rf /")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::CommandStart { .. })));
        assert_eq!(h.runtime.execs(), execs_before);

        let audit = h.db.recent_audit(1).unwrap();
        assert_eq!(audit[0].cmd, "rm -rf /");
        assert!(!audit[0].allowed);
        client.close().await;
    }

    #[tokio::test]
    async fn test_denied_before_provisioning_finishes() {
        let h = harness();
        h.runtime.set_create_delay(Duration::from_millis(300));
        let mut client = Client::connect(&h.services, "early", None);
        client.next().await;

        client.send(r#"{"type":"command","command":"shutdown now"}"#).await;
        client
            .until(|e| matches!(e, ServerEvent::Denied { .. }))
            .await;
        assert_eq!(h.runtime.execs(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_exec_mode_orders_end_before_validation() {
        let h = harness();
        h.services.validation.register(
            "lab",
            None,
            Arc::new(|req: &ValidationRequest| -> crate::error::Result<Option<ValidationResult>> {
                Ok(Some(if req.output.contains("marker-123") {
                    ValidationResult::passed()
                } else {
                    ValidationResult::failed("no marker")
                }))
            }),
        );
        let mut client = Client::connect(&h.services, "carol", None);
        client.ready().await;

        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.send(r#"{"type":"set-activity","activity":"lab"}"#).await;
        client.send(r#"{"type":"command","command":"echo marker-123"}"#).await;

        let events = client.until(is_validation).await;
        let start = events
            .iter()
            .position(|e| matches!(e, ServerEvent::CommandStart { mode: SessionMode::Exec, .. }))
            .unwrap();
        let data = events
            .iter()
            .position(|e| matches!(e, ServerEvent::Data { data } if data.contains("marker-123")))
            .unwrap();
        let end = events
            .iter()
            .position(|e| {
                matches!(e, ServerEvent::CommandEnd { exit_code: Some(0), .. })
            })
            .unwrap();
        let validation = events.len() - 1;
        assert!(start < data && data < end && end < validation);
        assert_eq!(
            events[validation],
            ServerEvent::Validation {
                data: ValidationResult::passed()
            }
        );

        let audit = h.db.recent_audit(1).unwrap();
        assert_eq!(audit[0].exit_code, Some(0));
        assert!(audit[0].duration_ms.is_some());
        client.close().await;
    }

    #[tokio::test]
    async fn test_no_validator_means_no_validation_event() {
        let h = harness();
        let mut client = Client::connect(&h.services, "dave", None);
        client.ready().await;

        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.send(r#"{"type":"set-activity","activity":"unknown"}"#).await;
        client.send(r#"{"type":"command","command":"exit 4"}"#).await;
        let events = client
            .until(|e| matches!(e, ServerEvent::CommandEnd { .. }))
            .await;
        assert!(matches!(
            events.last(),
            Some(ServerEvent::CommandEnd { exit_code: Some(4), .. })
        ));

        client.send(r#"{"type":"heartbeat"}"#).await;
        let next = client.next().await;
        assert!(matches!(next, ServerEvent::Pong { .. }), "got {:?}", next);
        client.close().await;
    }

    #[tokio::test]
    async fn test_exec_retries_transient_failure_once() {
        let h = harness();
        let mut client = Client::connect(&h.services, "erin", None);
        client.ready().await;
        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.until(|e| matches!(e, ServerEvent::Mode { .. })).await;

        h.runtime.fail_next_exec(Error::runtime_kind(
            "exec",
            "No such container",
            RuntimeErrorKind::NotFound,
        ));
        client.send(r#"{"type":"command","command":"echo again"}"#).await;
        let events = client
            .until(|e| matches!(e, ServerEvent::CommandEnd { .. } | ServerEvent::Error { .. }))
            .await;
        assert!(matches!(
            events.last(),
            Some(ServerEvent::CommandEnd { exit_code: Some(0), .. })
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn test_fatal_exec_error_is_reported_and_session_survives() {
        let h = harness();
        let mut client = Client::connect(&h.services, "fay", None);
        client.ready().await;
        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.until(|e| matches!(e, ServerEvent::Mode { .. })).await;

        h.runtime
            .fail_next_exec(Error::runtime("exec", "permission denied"));
        client.send(r#"{"type":"command","command":"id"}"#).await;
        let events = client
            .until(|e| matches!(e, ServerEvent::Error { .. }))
            .await;
        match events.last() {
            Some(ServerEvent::Error {
                command, attempt, ..
            }) => {
                assert_eq!(command.as_deref(), Some("id"));
                assert_eq!(*attempt, 1);
            }
            other => panic!("expected error, got {:?}", other),
        }

        client.send(r#"{"type":"heartbeat","ts":1}"#).await;
        assert!(matches!(client.next().await, ServerEvent::Pong { .. }));
        client.close().await;
    }

    fn output_judge(
        judge: fn(&str) -> bool,
    ) -> Arc<dyn crate::validation::Validator> {
        Arc::new(move |req: &ValidationRequest| -> crate::error::Result<Option<ValidationResult>> {
            Ok(Some(if judge(&req.output) {
                ValidationResult::passed()
            } else {
                ValidationResult::failed(format!("saw {} bytes", req.output.len()))
            }))
        })
    }

    #[tokio::test]
    async fn test_exec_validation_sees_output_beyond_ring() {
        let h = harness();
        let capacity = h.services.settings.ring_capacity;
        h.services.validation.register(
            "lab",
            None,
            output_judge(|out| out.starts_with("HEAD") && out.len() > 10_000),
        );
        let mut client = Client::connect(&h.services, "rae", None);
        client.ready().await;
        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.send(r#"{"type":"set-activity","activity":"lab"}"#).await;

        let long = format!("echo HEAD{}", "x".repeat(capacity + 2_000));
        let frame = serde_json::json!({"type": "command", "command": long}).to_string();
        client.send(&frame).await;

        let events = client.until(is_validation).await;
        assert_eq!(
            events.last(),
            Some(&ServerEvent::Validation {
                data: ValidationResult::passed()
            })
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_exec_retry_judges_only_final_attempt() {
        let h = harness();
        h.services
            .validation
            .register("lab", None, output_judge(|out| out == "again\n"));
        let mut client = Client::connect(&h.services, "sam", None);
        client.ready().await;
        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.send(r#"{"type":"set-activity","activity":"lab"}"#).await;
        client.until(|e| matches!(e, ServerEvent::ActivitySet { .. })).await;

        h.runtime.fail_next_stream(Error::runtime_kind(
            "exec output",
            "No such container",
            RuntimeErrorKind::NotFound,
        ));
        client.send(r#"{"type":"command","command":"echo again"}"#).await;
        let events = client.until(is_validation).await;
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::CommandEnd { exit_code: Some(0), .. }
        )));
        assert_eq!(
            events.last(),
            Some(&ServerEvent::Validation {
                data: ValidationResult::passed()
            })
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_back_to_back_exec_commands_each_complete() {
        let h = harness();
        let mut client = Client::connect(&h.services, "tao", None);
        client.ready().await;
        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.until(|e| matches!(e, ServerEvent::Mode { .. })).await;

        client.send(r#"{"type":"command","command":"sleep-ms 300"}"#).await;
        client.send(r#"{"type":"command","command":"echo second"}"#).await;

        let events = client
            .until(|e| matches!(e, ServerEvent::CommandEnd { command, .. } if command == "echo second"))
            .await;
        let lifecycle: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::CommandStart { command, .. } => Some(format!("start {}", command)),
                ServerEvent::CommandEnd { command, .. } => Some(format!("end {}", command)),
                _ => None,
            })
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                "start sleep-ms 300",
                "end sleep-ms 300",
                "start echo second",
                "end echo second"
            ]
        );

        let audited: Vec<String> = h
            .db
            .recent_audit(10)
            .unwrap()
            .into_iter()
            .map(|e| e.cmd)
            .collect();
        assert_eq!(audited, vec!["echo second", "sleep-ms 300"]);
        client.close().await;
    }

    #[tokio::test]
    async fn test_interrupt_ends_exec_and_runs_next() {
        let h = harness();
        let mut client = Client::connect(&h.services, "uma", None);
        client.ready().await;
        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.until(|e| matches!(e, ServerEvent::Mode { .. })).await;

        client.send(r#"{"type":"command","command":"sleep-ms 5000"}"#).await;
        client.send(r#"{"type":"command","command":"echo after"}"#).await;
        client
            .until(|e| matches!(e, ServerEvent::CommandStart { .. }))
            .await;
        client.send(r#"{"type":"interrupt"}"#).await;

        let events = client
            .until(|e| matches!(e, ServerEvent::CommandEnd { command, .. } if command == "echo after"))
            .await;
        let interrupted = events
            .iter()
            .position(|e| {
                *e == ServerEvent::CommandEnd {
                    command: "sleep-ms 5000".to_string(),
                    exit_code: Some(INTERRUPTED_EXIT_CODE),
                }
            })
            .unwrap();
        let ack = events
            .iter()
            .position(|e| *e == ServerEvent::InterruptAck)
            .unwrap();
        assert!(interrupted < ack);

        let audit = h.db.recent_audit(10).unwrap();
        let cancelled = audit.iter().find(|e| e.cmd == "sleep-ms 5000").unwrap();
        assert_eq!(cancelled.exit_code, Some(INTERRUPTED_EXIT_CODE));
        client.close().await;
    }

    #[tokio::test]
    async fn test_fallback_emits_single_notice() {
        let h = harness_with(|s| {
            s.images.windows = "mcr.microsoft.com/windows/nanoserver:ltsc2022".to_string()
        });
        let mut client = Client::connect(&h.services, "gus", None);
        client.ready().await;

        client.send(r#"{"type":"set-os","os":"windows"}"#).await;
        let events = client.ready().await;
        let notices: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::Notice { .. }))
            .collect();
        assert_eq!(
            notices,
            vec![&ServerEvent::Notice {
                code: notice::OS_FALLBACK.to_string(),
                from: Some("windows".to_string()),
                to: Some("kali".to_string()),
                ports: None,
            }]
        );
        assert!(matches!(
            events.last(),
            Some(ServerEvent::Ready { os, .. }) if os == "kali"
        ));

        let record = h.services.registry.get_record("gus", OsFlavor::Windows).unwrap();
        assert_eq!(record.kind, ContainerKind::Fallback);
        assert_eq!(
            PreferenceStore::preferred_os(&h.db, "gus").unwrap(),
            Some(OsFlavor::Windows)
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_heartbeat_answered_while_provisioning() {
        let h = harness();
        h.runtime.set_create_delay(Duration::from_millis(400));
        let mut client = Client::connect(&h.services, "hal", None);
        client.next().await;

        client.send(r#"{"type":"heartbeat","ts":5}"#).await;
        let first = client.next().await;
        assert!(matches!(first, ServerEvent::Pong { .. }), "got {:?}", first);
        client.ready().await;
        client.close().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_and_continues() {
        let h = harness();
        let mut client = Client::connect(&h.services, "ida", None);
        client.ready().await;

        client.send("{not json").await;
        match client.next_control().await {
            ServerEvent::Error { error, attempt, .. } => {
                assert!(error.starts_with("malformed message: "));
                assert_eq!(attempt, 0);
            }
            other => panic!("expected error, got {:?}", other),
        }
        client.send(r#"{"type":"teleport"}"#).await;
        assert!(matches!(client.next_control().await, ServerEvent::Error { .. }));

        client.send(r#"{"type":"set-step","step":"3"}"#).await;
        assert_eq!(client.next_control().await, ServerEvent::StepSet { value: Some(3) });
        client.send(r#"{"type":"set-step","step":"soon"}"#).await;
        assert_eq!(client.next_control().await, ServerEvent::StepSet { value: None });
        client.send(r#"{"type":"set-chapter","chapter":"   "}"#).await;
        assert_eq!(client.next_control().await, ServerEvent::ChapterSet { value: None });
        client.send(r#"{"type":"interrupt"}"#).await;
        assert_eq!(client.next_control().await, ServerEvent::InterruptAck);
        client.close().await;
    }

    #[tokio::test]
    async fn test_interactive_command_validates_after_settle() {
        let h = harness();
        h.services.validation.register(
            "lab",
            None,
            Arc::new(|req: &ValidationRequest| -> crate::error::Result<Option<ValidationResult>> {
                Ok(Some(if req.output.contains("hi-there") {
                    ValidationResult::passed()
                } else {
                    ValidationResult::failed(format!("saw {:?}", req.output))
                }))
            }),
        );
        let mut client = Client::connect(&h.services, "jo", None);
        client.ready().await;
        client.send(r#"{"type":"set-activity","activity":"lab"}"#).await;
        client.send(r#"{"type":"command","command":"echo hi-there"}"#).await;

        let events = client.until(is_validation).await;
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::CommandStart { mode: SessionMode::Interactive, .. }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::CommandEnd { .. })));
        assert_eq!(
            events.last(),
            Some(&ServerEvent::Validation {
                data: ValidationResult::passed()
            })
        );
        assert!(h.runtime.stdin_log().contains("echo hi-there\n"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_stdin_line_gate_blocks_denied_line() {
        let h = harness();
        let mut client = Client::connect(&h.services, "kai", None);
        client.ready().await;

        client.send(r#"{"type":"stdin","data":"rebo"}"#).await;
        client.send(r#"{"type":"stdin","data":"ot\r"}"#).await;
        client
            .until(|e| matches!(e, ServerEvent::Denied { command, .. } if command == "reboot"))
            .await;

        let typed = h.runtime.stdin_log();
        assert!(typed.contains("reboot\u{15}"), "got {:?}", typed);
        assert!(!typed.contains("reboot\r"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_achievements_are_stored_on_pass() {
        let h = harness();
        h.services.validation.register(
            "lab",
            None,
            Arc::new(|_: &ValidationRequest| -> crate::error::Result<Option<ValidationResult>> {
                Ok(Some(ValidationResult {
                    achievements: Some(["first-command".to_string()].into_iter().collect()),
                    ..ValidationResult::passed()
                }))
            }),
        );
        let mut client = Client::connect(&h.services, "lou", None);
        client.ready().await;
        client.send(r#"{"type":"negotiate-mode","mode":"exec"}"#).await;
        client.send(r#"{"type":"set-activity","activity":"lab"}"#).await;
        client.send(r#"{"type":"command","command":"ls"}"#).await;
        client.until(is_validation).await;

        assert!(ProgressStore::achievements(&h.db, "lou")
            .unwrap()
            .contains("first-command"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_tears_down_unless_keep() {
        let h = harness();
        let mut client = Client::connect(&h.services, "max", None);
        client.ready().await;
        client.close().await;
        assert!(h.services.registry.get_record("max", OsFlavor::Kali).is_none());
        assert_eq!(h.runtime.container_count(), 0);

        let mut h = harness();
        h.services.keep_containers = true;
        let mut client = Client::connect(&h.services, "ned", None);
        client.ready().await;
        client.close().await;
        assert!(h
            .services
            .registry
            .get_record("ned", OsFlavor::Kali)
            .unwrap()
            .is_running());
    }

    #[tokio::test]
    async fn test_second_session_keeps_shared_container() {
        let h = harness();
        let mut first = Client::connect(&h.services, "oli", None);
        first.ready().await;
        let mut second = Client::connect(&h.services, "oli", None);
        second.ready().await;
        assert_eq!(h.runtime.creates(), 1);

        first.close().await;
        assert!(h.services.registry.get_record("oli", OsFlavor::Kali).is_some());
        second.close().await;
        assert!(h.services.registry.get_record("oli", OsFlavor::Kali).is_none());
    }

    #[tokio::test]
    async fn test_self_test_reports_denial() {
        let mut h = harness();
        h.services.self_test = true;
        let mut client = Client::connect(&h.services, "pam", None);
        client.ready().await;
        assert_eq!(
            client.next_control().await,
            ServerEvent::text("[self-test] denylist active: rm -rf / denied")
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_unavailable_flavor_reports_error() {
        let h = harness_with(|s| {
            s.images.macos = "dockur/macos".to_string();
            s.host.kvm = true;
        });
        h.runtime.break_image("dockur/macos");
        let mut client = Client::connect(&h.services, "quin", Some(OsFlavor::Macos));
        client.next().await;
        match client.next().await {
            ServerEvent::Error { error, .. } => assert!(error.contains("not available")),
            other => panic!("expected error, got {:?}", other),
        }
        client.close().await;
    }
}
