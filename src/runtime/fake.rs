//! In-memory container runtime for tests.
//!
//! Containers are map entries. Exec instances run a tiny command
//! evaluator: `echo X` prints `X`, `exit N` exits with `N`, `sleep-ms N`
//! waits, anything else prints `ran: <cmd>`.

use super::{AttachedExec, ContainerRuntime, ContainerSpec, ContainerSummary, ExecRequest};
use crate::error::{Error, Result, RuntimeErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub(crate) struct FakeContainer {
    pub name: String,
    pub image: String,
    pub running: bool,
    pub spec: ContainerSpec,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    creates: usize,
    execs: usize,
    removes: usize,
    exit_codes: HashMap<String, i64>,
    resizes: Vec<(String, u16, u16)>,
    exec_failures: VecDeque<Error>,
    stream_failures: VecDeque<Error>,
    broken_images: HashSet<String>,
    create_delay: Duration,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
    stdin_log: Arc<Mutex<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn creates(&self) -> usize {
        self.state.lock().creates
    }

    pub fn execs(&self) -> usize {
        self.state.lock().execs
    }

    pub fn removes(&self) -> usize {
        self.state.lock().removes
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.state.lock().resizes.clone()
    }

    /// Everything written to interactive shells, in order.
    pub fn stdin_log(&self) -> String {
        self.stdin_log.lock().clone()
    }

    /// Fail the next exec call with `err`.
    pub fn fail_next_exec(&self, err: Error) {
        self.state.lock().exec_failures.push_back(err);
    }

    /// Let the next one-shot exec print part of its output, then fail
    /// mid-stream with `err`.
    pub fn fail_next_stream(&self, err: Error) {
        self.state.lock().stream_failures.push_back(err);
    }

    /// Make creation with `image` fail.
    pub fn break_image(&self, image: &str) {
        self.state.lock().broken_images.insert(image.to_string());
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().create_delay = delay;
    }

    /// Insert a container directly, as if created by an earlier process.
    pub fn seed(&self, name: &str, image: &str, running: bool) -> String {
        let mut state = self.state.lock();
        let id = next_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                image: image.to_string(),
                running,
                spec: ContainerSpec {
                    name: name.to_string(),
                    image: image.to_string(),
                    ..Default::default()
                },
            },
        );
        id
    }

    pub fn set_running(&self, id: &str, running: bool) {
        if let Some(c) = self.state.lock().containers.get_mut(id) {
            c.running = running;
        }
    }

    /// Remove a container behind the registry's back.
    pub fn vanish(&self, id: &str) {
        self.state.lock().containers.remove(id);
    }

    fn summary(id: &str, c: &FakeContainer) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            name: c.name.clone(),
            running: c.running,
            image: Some(c.image.clone()),
            published: c
                .spec
                .ports
                .iter()
                .map(|p| (format!("{}/tcp", p.container_port), p.host_port))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

fn next_id(state: &mut FakeState) -> String {
    state.next_id += 1;
    format!("{:016x}{:048x}", 0xc0ffee_u64 + state.next_id, state.next_id)
}

fn not_found(id: &str) -> Error {
    Error::runtime_kind(
        "inspect",
        format!("No such container: {}", id),
        RuntimeErrorKind::NotFound,
    )
}

/// Output and exit code of one fake command.
async fn evaluate(command: &str) -> (String, i64) {
    let command = command.trim();
    if let Some(rest) = command.strip_prefix("echo ") {
        return (format!("{}\n", rest), 0);
    }
    if let Some(code) = command.strip_prefix("exit ") {
        return (String::new(), code.trim().parse().unwrap_or(1));
    }
    if let Some(ms) = command.strip_prefix("sleep-ms ") {
        let ms = ms.trim().parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        return (String::new(), 0);
    }
    (format!("ran: {}\n", command), 0)
}

fn channel_stream(rx: mpsc::UnboundedReceiver<Bytes>) -> super::OutputStream {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(chunk), rx))
    })
    .boxed()
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, c)| Self::summary(id, c)))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerSummary> {
        let state = self.state.lock();
        state
            .containers
            .get(id)
            .map(|c| Self::summary(id, c))
            .ok_or_else(|| not_found(id))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.state.lock().broken_images.contains(image) {
            return Err(Error::runtime("pull", format!("{}: manifest unknown", image)));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let delay = self.state.lock().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.broken_images.contains(&spec.image) {
            return Err(Error::runtime(
                "create",
                format!("{}: no such image: {}", spec.name, spec.image),
            ));
        }
        if let Some((id, _)) = state.containers.iter().find(|(_, c)| c.name == spec.name) {
            return Err(Error::runtime_kind(
                "create",
                format!(
                    "{}: Conflict. The container name \"/{}\" is already in use by container \"{}\". You have to remove (or rename) that container to be able to reuse that name.",
                    spec.name, spec.name, id
                ),
                RuntimeErrorKind::Conflict,
            ));
        }
        let id = next_id(&mut state);
        state.creates += 1;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: false,
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let c = state.containers.get_mut(id).ok_or_else(|| not_found(id))?;
        c.running = true;
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let c = state.containers.get_mut(id).ok_or_else(|| not_found(id))?;
        c.running = false;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.containers.remove(id).ok_or_else(|| not_found(id))?;
        state.removes += 1;
        Ok(())
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<AttachedExec> {
        let exec_id = {
            let mut state = self.state.lock();
            if let Some(err) = state.exec_failures.pop_front() {
                return Err(err);
            }
            let c = state.containers.get(id).ok_or_else(|| not_found(id))?;
            if !c.running {
                return Err(Error::runtime_kind(
                    "create exec",
                    format!("Container {} is not running", id),
                    RuntimeErrorKind::NotRunning,
                ));
            }
            state.execs += 1;
            format!("exec-{}", state.execs)
        };

        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

        if !request.tty {
            let command = request.cmd.last().cloned().unwrap_or_default();
            if let Some(err) = self.state.lock().stream_failures.pop_front() {
                let chunks: Vec<Result<Bytes>> =
                    vec![Ok(Bytes::from_static(b"partial-")), Err(err)];
                return Ok(AttachedExec {
                    exec_id,
                    output: futures_util::stream::iter(chunks).boxed(),
                    input: None,
                });
            }
            let (output, code) = evaluate(&command).await;
            if !output.is_empty() {
                let _ = tx.send(Bytes::from(output));
            }
            drop(tx);
            self.state.lock().exit_codes.insert(exec_id.clone(), code);
            return Ok(AttachedExec {
                exec_id,
                output: channel_stream(rx),
                input: None,
            });
        }

        let (client, mut server) = tokio::io::duplex(4096);
        let shell_log = Arc::clone(&self.stdin_log);
        tokio::spawn(async move {
            let _ = tx.send(Bytes::from_static(b"$ "));
            let mut line = String::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                shell_log.lock().push_str(&text);
                for c in text.chars() {
                    match c {
                        '\r' | '\n' => {
                            let command = std::mem::take(&mut line);
                            let (output, code) = evaluate(&command).await;
                            let _ = tx.send(Bytes::from(format!("{}$ ", output)));
                            if command.trim() == "exit 0" && code == 0 {
                                return;
                            }
                        }
                        '\u{3}' => {
                            line.clear();
                            let _ = tx.send(Bytes::from_static(b"^C\n$ "));
                        }
                        '\u{15}' => line.clear(),
                        c => line.push(c),
                    }
                }
            }
        });

        Ok(AttachedExec {
            exec_id,
            output: channel_stream(rx),
            input: Some(Box::pin(client)),
        })
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.state
            .lock()
            .resizes
            .push((exec_id.to_string(), rows, cols));
        Ok(())
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        Ok(self.state.lock().exit_codes.get(exec_id).copied())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .map(|(id, c)| Self::summary(id, c))
            .collect())
    }
}
