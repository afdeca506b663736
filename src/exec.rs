//! Exec bridge: shells and one-shot commands inside sandbox containers.
//!
//! An interactive shell is a TTY exec whose output is pumped by a reader
//! task into a channel; input, signals and resizes go through the
//! [`InteractiveHandle`]. One-shot commands stream output through a
//! callback and report the exit code.

use crate::error::{Error, Result};
use crate::os::{truncate_id, ShellKind};
use crate::runtime::{ContainerRuntime, ExecRequest, InputSink};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Buffered output chunks per interactive shell.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Control sequences delivered to the terminal as bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    /// Ctrl-C
    Interrupt,
    /// Ctrl-\
    Quit,
    /// Ctrl-Z
    Suspend,
    /// Ctrl-D
    EndOfFile,
}

impl TerminalSignal {
    /// The byte written to the PTY.
    pub fn as_byte(&self) -> u8 {
        match self {
            TerminalSignal::Interrupt => 0x03,
            TerminalSignal::Quit => 0x1c,
            TerminalSignal::Suspend => 0x1a,
            TerminalSignal::EndOfFile => 0x04,
        }
    }
}

/// Interactive shell lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// Exec created, no output seen yet.
    Starting,
    /// Output has been received.
    Streaming,
    /// Output stream closed; the shell is gone.
    Ended,
}

/// Result of a one-shot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Exit code, `-1` when the runtime did not report one.
    pub exit_code: i64,
}

/// Incremental UTF-8 decoder that keeps split multi-byte sequences for the
/// next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode a chunk. Invalid bytes become U+FFFD.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(s) = std::str::from_utf8(&self.pending[..valid]) {
                        out.push_str(s);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left, lossily.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// A live interactive shell.
pub struct InteractiveHandle {
    exec_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    input: tokio::sync::Mutex<InputSink>,
    output: Option<mpsc::Receiver<String>>,
    state: watch::Receiver<ShellState>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for InteractiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveHandle")
            .field("exec_id", &self.exec_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl InteractiveHandle {
    /// Runtime exec id.
    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Take the output channel. Output is delivered once, so only the first
    /// call returns `Some`.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ShellState {
        *self.state.borrow()
    }

    /// Whether the shell has ended.
    pub fn is_ended(&self) -> bool {
        self.state() == ShellState::Ended
    }

    /// Wait until the shell ends.
    pub async fn ended(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ShellState::Ended).await;
    }

    /// Write raw input to the shell.
    pub async fn write(&self, data: &str) -> Result<()> {
        self.write_bytes(data.as_bytes()).await
    }

    /// Deliver a terminal control sequence.
    pub async fn send_signal(&self, signal: TerminalSignal) -> Result<()> {
        self.write_bytes(&[signal.as_byte()]).await
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if self.is_ended() {
            return Err(Error::ShellEnded);
        }
        let mut input = self.input.lock().await;
        input.write_all(bytes).await.map_err(|e| {
            tracing::debug!(exec = %self.exec_id, error = %e, "shell input closed");
            Error::ShellEnded
        })?;
        input.flush().await.map_err(|_| Error::ShellEnded)
    }

    /// Resize the TTY.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.runtime.resize_exec(&self.exec_id, rows, cols).await
    }

    /// Close stdin and stop pumping output.
    pub async fn close(&self) {
        let mut input = self.input.lock().await;
        if let Err(e) = input.shutdown().await {
            tracing::debug!(exec = %self.exec_id, error = %e, "shell input already closed");
        }
        self.reader.abort();
    }
}

impl Drop for InteractiveHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Starts shells and one-shot commands in containers.
#[derive(Clone)]
pub struct ExecBridge {
    runtime: Arc<dyn ContainerRuntime>,
    start_timeout: Duration,
}

impl std::fmt::Debug for ExecBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecBridge")
            .field("start_timeout", &self.start_timeout)
            .finish_non_exhaustive()
    }
}

impl ExecBridge {
    /// Create a bridge. `start_timeout` bounds exec creation.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, start_timeout: Duration) -> Self {
        Self {
            runtime,
            start_timeout,
        }
    }

    /// Make sure the container is running, starting it if it was stopped.
    async fn ensure_running(&self, container_id: &str, command: &str) -> Result<()> {
        let summary = self
            .runtime
            .inspect(container_id)
            .await
            .map_err(|e| e.into_exec(command))?;
        if !summary.running {
            tracing::info!(container = %truncate_id(container_id), "starting stopped container for exec");
            self.runtime
                .start(container_id)
                .await
                .map_err(|e| e.into_exec(command))?;
        }
        Ok(())
    }

    async fn create_exec(
        &self,
        container_id: &str,
        request: ExecRequest,
        command: &str,
    ) -> Result<crate::runtime::AttachedExec> {
        match tokio::time::timeout(self.start_timeout, self.runtime.exec(container_id, request)).await
        {
            Ok(result) => result.map_err(|e| e.into_exec(command)),
            Err(_) => Err(Error::timeout("exec start", self.start_timeout)),
        }
    }

    /// Attach an interactive login shell to the container.
    pub async fn start_interactive(
        &self,
        container_id: &str,
        shell: ShellKind,
    ) -> Result<InteractiveHandle> {
        const SHELL: &str = "interactive shell";
        self.ensure_running(container_id, SHELL).await?;

        let request = ExecRequest {
            cmd: shell.interactive_argv(),
            tty: true,
            user: None,
            env: vec!["TERM=xterm-256color".to_string()],
        };
        let exec = self.create_exec(container_id, request, SHELL).await?;
        let input = exec
            .input
            .ok_or_else(|| Error::exec_fatal(SHELL, "runtime returned no stdin for tty exec"))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ShellState::Starting);
        let exec_id = exec.exec_id.clone();
        let mut output = exec.output;

        let reader = tokio::spawn(async move {
            let mut decoder = Utf8Decoder::default();
            while let Some(chunk) = output.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::debug!(exec = %exec_id, error = %e, "shell output stream failed");
                        break;
                    }
                };
                state_tx.send_if_modified(|s| {
                    if *s == ShellState::Starting {
                        *s = ShellState::Streaming;
                        true
                    } else {
                        false
                    }
                });
                let text = decoder.push(&chunk);
                if !text.is_empty() && tx.send(text).await.is_err() {
                    break;
                }
            }
            let rest = decoder.finish();
            if !rest.is_empty() {
                let _ = tx.send(rest).await;
            }
            let _ = state_tx.send(ShellState::Ended);
            tracing::debug!(exec = %exec_id, "shell output ended");
        });

        tracing::debug!(
            container = %truncate_id(container_id),
            exec = %exec.exec_id,
            shell = ?shell,
            "interactive shell attached"
        );

        Ok(InteractiveHandle {
            exec_id: exec.exec_id,
            runtime: Arc::clone(&self.runtime),
            input: tokio::sync::Mutex::new(input),
            output: Some(rx),
            state: state_rx,
            reader,
        })
    }

    /// Run `command` once in a fresh shell, streaming output to `on_data`.
    pub async fn run_once<F>(
        &self,
        container_id: &str,
        shell: ShellKind,
        command: &str,
        mut on_data: F,
    ) -> Result<ExecOutcome>
    where
        F: FnMut(&str) + Send,
    {
        self.ensure_running(container_id, command).await?;

        let request = ExecRequest {
            cmd: shell.one_shot_argv(command),
            tty: false,
            user: None,
            env: Vec::new(),
        };
        let mut exec = self.create_exec(container_id, request, command).await?;

        let mut decoder = Utf8Decoder::default();
        while let Some(chunk) = exec.output.next().await {
            let chunk = chunk.map_err(|e| e.into_exec(command))?;
            let text = decoder.push(&chunk);
            if !text.is_empty() {
                on_data(&text);
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            on_data(&rest);
        }

        let exit_code = self
            .runtime
            .exec_exit_code(&exec.exec_id)
            .await
            .map_err(|e| e.into_exec(command))?
            .unwrap_or(-1);
        Ok(ExecOutcome { exit_code })
    }
}
