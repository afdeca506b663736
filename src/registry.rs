//! Container registry: one container per `(owner, flavor)`.
//!
//! The registry is the only state shared between sessions. It decides
//! which image backs a flavor on this host, derives deterministic names,
//! adopts containers left behind by earlier processes, and tears
//! containers down when their last session leaves.
//!
//! Concurrency: the record map is guarded by a `parking_lot` lock that is
//! never held across an await. Creation for one key is serialized by a
//! per-key async mutex, so concurrent `ensure_container` calls for the
//! same key create at most one container.

use crate::config::{
    now_secs, ContainerKind, ContainerLimits, ContainerRecord, ImageMap, Readiness, RecordState,
    SandboxConfig,
};
use crate::db::SandboxDb;
use crate::error::{Error, Result, RuntimeErrorKind};
use crate::os::{container_name, OsFlavor, SandboxKey, ShellKind};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerSummary, ExecRequest, PublishedPort, LABEL_OS,
    LABEL_OWNER,
};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Memory given to VM-backed flavors (4 GiB).
const VM_MEMORY_BYTES: i64 = 4 * 1024 * 1024 * 1024;

/// Grace period for VM-backed flavors, which need time to shut the guest down.
const VM_STOP_GRACE: Duration = Duration::from_secs(10);

/// Ports published by VM-backed flavors: (service, container port, host port).
const VM_PORTS: &[(&str, u16, u16)] = &[("ssh", 22, 10022), ("rdp", 3389, 3389), ("vnc", 5900, 5900)];

/// What the host can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    /// Windows-only images can run (Windows host with Windows containers).
    pub windows_containers: bool,
    /// Hardware virtualization is available (`/dev/kvm`).
    pub kvm: bool,
}

impl HostCapabilities {
    /// Probe the current host.
    pub fn detect() -> Self {
        Self {
            windows_containers: cfg!(windows),
            kvm: cfg!(target_os = "linux") && Path::new("/dev/kvm").exists(),
        }
    }
}

/// Registry settings, usually derived from [`SandboxConfig`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Image per flavor.
    pub images: ImageMap,
    /// Limits for created containers.
    pub limits: ContainerLimits,
    /// Container name prefix.
    pub name_prefix: String,
    /// Deadline for one provisioning attempt.
    pub provision_timeout: Duration,
    /// Grace period when stopping containers.
    pub stop_grace: Duration,
    /// How long a VM-backed flavor may take to answer on ssh.
    pub vm_readiness: Duration,
    /// Poll interval while waiting for a VM-backed flavor.
    pub vm_probe_interval: Duration,
    /// Script run once in native Kali containers.
    pub bootstrap: Option<String>,
    /// Host capabilities.
    pub host: HostCapabilities,
}

impl RegistrySettings {
    /// Settings from the server configuration and the detected host.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            images: config.images.clone(),
            limits: config.limits.clone(),
            name_prefix: config.name_prefix.clone(),
            provision_timeout: config.timeouts.provision,
            stop_grace: config.timeouts.stop_grace,
            vm_readiness: config.timeouts.vm_readiness,
            vm_probe_interval: config.timeouts.vm_probe_interval,
            bootstrap: config.bootstrap.clone(),
            host: HostCapabilities::detect(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// How a requested flavor will be provisioned on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionPlan {
    /// Flavor that will actually run.
    pub os: OsFlavor,
    /// Image to run.
    pub image: String,
    /// Provisioning kind.
    pub kind: ContainerKind,
    /// Requested flavor, when substituted.
    pub fallback_from: Option<OsFlavor>,
}

impl ProvisionPlan {
    fn is_vm(&self) -> bool {
        self.kind == ContainerKind::ProvisionedVm
    }
}

fn is_windows_only_image(image: &str) -> bool {
    let image = image.to_ascii_lowercase();
    ["mcr.microsoft.com/windows", "servercore", "nanoserver"]
        .iter()
        .any(|marker| image.contains(marker))
}

fn is_vm_image(image: &str) -> bool {
    image.to_ascii_lowercase().contains("dockur/macos")
}

/// Pull the conflicting container id out of a runtime "name in use" message.
fn conflicting_id(message: &str) -> Option<String> {
    let start = message.find("by container ")? + "by container ".len();
    let id: String = message[start..]
        .trim_start_matches(['"', '\\'])
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    (id.len() >= 12).then_some(id)
}

struct Entry {
    record: ContainerRecord,
    leases: u32,
}

struct RegistryInner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: RegistrySettings,
    db: Option<SandboxDb>,
    entries: RwLock<HashMap<SandboxKey, Entry>>,
    key_locks: Mutex<HashMap<SandboxKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Registry of sandbox containers keyed by `(owner, flavor)`.
#[derive(Clone)]
pub struct ContainerRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("entries", &self.inner.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl ContainerRegistry {
    /// Create a registry. Records are persisted to `db` when given.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: RegistrySettings,
        db: Option<SandboxDb>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                runtime,
                settings,
                db,
                entries: RwLock::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The runtime this registry provisions against.
    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.inner.runtime)
    }

    /// Decide how `requested` will be provisioned on this host.
    pub fn plan(&self, requested: OsFlavor) -> ProvisionPlan {
        let settings = &self.inner.settings;
        let image = settings.images.for_os(requested).to_string();
        let fallback = || ProvisionPlan {
            os: OsFlavor::Kali,
            image: settings.images.kali.clone(),
            kind: ContainerKind::Fallback,
            fallback_from: Some(requested),
        };

        match requested {
            OsFlavor::Kali => ProvisionPlan {
                os: OsFlavor::Kali,
                image,
                kind: ContainerKind::Native,
                fallback_from: None,
            },
            OsFlavor::Windows => {
                if is_windows_only_image(&image) && !settings.host.windows_containers {
                    fallback()
                } else {
                    ProvisionPlan {
                        os: OsFlavor::Windows,
                        image,
                        kind: ContainerKind::Native,
                        fallback_from: None,
                    }
                }
            }
            OsFlavor::Macos => {
                if is_vm_image(&image) {
                    if settings.host.kvm {
                        ProvisionPlan {
                            os: OsFlavor::Macos,
                            image,
                            kind: ContainerKind::ProvisionedVm,
                            fallback_from: None,
                        }
                    } else {
                        fallback()
                    }
                } else {
                    ProvisionPlan {
                        os: OsFlavor::Macos,
                        image,
                        kind: ContainerKind::Placeholder,
                        fallback_from: None,
                    }
                }
            }
        }
    }

    // ========================================================================
    // EnsureContainer
    // ========================================================================

    /// Return the live record for `(owner, os)`, creating or adopting a
    /// container if there is none.
    ///
    /// Not retried internally beyond name-conflict recovery; callers decide
    /// whether to try again.
    pub async fn ensure_container(&self, owner: &str, os: OsFlavor) -> Result<ContainerRecord> {
        let key = SandboxKey::new(owner, os);
        if let Some(record) = self.touch_live(&key) {
            return Ok(record);
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(record) = self.touch_live(&key) {
            return Ok(record);
        }

        let plan = self.plan(os);
        let timeout = self.inner.settings.provision_timeout;
        let record = match tokio::time::timeout(timeout, self.provision(&key, &plan)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::provisioning(
                    owner,
                    os.as_str(),
                    Error::timeout("provisioning", timeout).to_string(),
                ))
            }
        };

        tracing::info!(
            owner = %owner,
            requested = %os,
            os = %record.os,
            kind = %record.kind,
            container = %crate::os::truncate_id(&record.id),
            adopted = record.adopted,
            "sandbox container ready"
        );

        self.store(&key, record.clone());
        self.after_provision(&key, &record);
        Ok(record)
    }

    /// Drop the in-memory record for `(owner, os)` without touching the
    /// container, so the next `ensure_container` re-resolves it by name.
    pub fn forget(&self, owner: &str, os: OsFlavor) {
        let key = SandboxKey::new(owner, os);
        let removed = self.inner.entries.write().remove(&key);
        if removed.is_some() {
            tracing::debug!(sandbox = %key, "forgetting cached container record");
        }
    }

    /// Read-only lookup for status reporting. Never creates anything.
    pub fn get_record(&self, owner: &str, os: OsFlavor) -> Option<ContainerRecord> {
        let key = SandboxKey::new(owner, os);
        self.inner
            .entries
            .read()
            .get(&key)
            .map(|entry| entry.record.clone())
    }

    /// All records, sorted by owner then flavor.
    pub fn list(&self) -> Vec<ContainerRecord> {
        let entries = self.inner.entries.read();
        let mut keys: Vec<&SandboxKey> = entries.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| entries.get(k).map(|e| e.record.clone()))
            .collect()
    }

    fn touch_live(&self, key: &SandboxKey) -> Option<ContainerRecord> {
        let mut entries = self.inner.entries.write();
        let entry = entries.get_mut(key)?;
        match entry.record.state {
            RecordState::Running | RecordState::Unavailable => {
                entry.record.last_used_at = now_secs();
                Some(entry.record.clone())
            }
            _ => None,
        }
    }

    fn key_lock(&self, key: &SandboxKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.key_locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    async fn provision(&self, key: &SandboxKey, plan: &ProvisionPlan) -> Result<ContainerRecord> {
        let runtime = &self.inner.runtime;
        let name = container_name(&self.inner.settings.name_prefix, &key.owner, key.os);

        // Adopt a container left behind by an earlier process or restart.
        match runtime.find_by_name(&name).await {
            Ok(Some(existing)) => match self.adopt(key, plan, existing).await {
                Ok(record) => return Ok(record),
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "stale container could not be adopted, replacing it");
                    if let Err(e) = runtime.remove(&name).await {
                        tracing::warn!(container = %name, error = %e, "failed to remove stale container");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                return Err(Error::provisioning(&key.owner, key.os.as_str(), e.to_string()));
            }
        }

        if let Err(e) = runtime.pull_image(&plan.image).await {
            tracing::warn!(image = %plan.image, error = %e, "image pull failed, trying local image");
        }

        let spec = self.container_spec(key, plan, &name);
        let id = match runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) if e.runtime_error_kind() == Some(RuntimeErrorKind::Conflict) => {
                return self.recover_conflict(key, plan, &name, e).await;
            }
            Err(e) if plan.is_vm() => {
                tracing::warn!(container = %name, error = %e, "vm-backed flavor could not be created");
                return Ok(self.unavailable_record(key, plan, &name));
            }
            Err(e) => {
                return Err(Error::provisioning(&key.owner, key.os.as_str(), e.to_string()));
            }
        };

        if let Err(e) = runtime.start(&id).await {
            return Err(Error::provisioning(
                &key.owner,
                key.os.as_str(),
                format!("start {}: {}", name, e),
            ));
        }

        let summary = runtime
            .inspect(&id)
            .await
            .map_err(|e| Error::provisioning(&key.owner, key.os.as_str(), e.to_string()))?;
        Ok(self.record_for(key, plan, &name, summary, false))
    }

    async fn adopt(
        &self,
        key: &SandboxKey,
        plan: &ProvisionPlan,
        existing: ContainerSummary,
    ) -> Result<ContainerRecord> {
        let runtime = &self.inner.runtime;
        if !existing.running {
            tracing::info!(container = %existing.name, "starting stopped container before adopting it");
            runtime.start(&existing.id).await?;
        }
        let summary = runtime.inspect(&existing.id).await?;
        if !summary.running {
            return Err(Error::provisioning(
                &key.owner,
                key.os.as_str(),
                format!("{} did not stay running", existing.name),
            ));
        }
        let name = existing.name.clone();
        Ok(self.record_for(key, plan, &name, summary, true))
    }

    async fn recover_conflict(
        &self,
        key: &SandboxKey,
        plan: &ProvisionPlan,
        name: &str,
        conflict: Error,
    ) -> Result<ContainerRecord> {
        tracing::warn!(container = %name, error = %conflict, "name conflict on create, recovering");
        let runtime = &self.inner.runtime;

        if let Some(id) = conflicting_id(&conflict.to_string()) {
            match runtime.inspect(&id).await {
                Ok(existing) => return self.adopt(key, plan, existing).await,
                Err(e) => tracing::debug!(id = %id, error = %e, "conflicting id not inspectable"),
            }
        }

        if let Ok(Some(existing)) = runtime.find_by_name(name).await {
            return self.adopt(key, plan, existing).await;
        }

        Err(Error::provisioning(
            &key.owner,
            key.os.as_str(),
            conflict.to_string(),
        ))
    }

    fn container_spec(&self, key: &SandboxKey, plan: &ProvisionPlan, name: &str) -> ContainerSpec {
        let limits = &self.inner.settings.limits;
        let labels = HashMap::from([
            (LABEL_OWNER.to_string(), key.owner.clone()),
            (LABEL_OS.to_string(), key.os.as_str().to_string()),
        ]);
        let mut env = vec![format!("USER_NAME={}", key.owner)];

        if plan.is_vm() {
            env.push("RAM_SIZE=4G".to_string());
            env.push("CPU_CORES=2".to_string());
            return ContainerSpec {
                name: name.to_string(),
                image: plan.image.clone(),
                env,
                labels,
                user: None,
                memory_bytes: VM_MEMORY_BYTES,
                nano_cpus: 0,
                network_mode: limits.network_mode.clone(),
                ulimits: (limits.ulimit_soft, limits.ulimit_hard),
                privileged: true,
                devices: vec!["/dev/kvm".to_string()],
                ports: VM_PORTS
                    .iter()
                    .map(|(service, container_port, host_port)| PublishedPort {
                        service: service.to_string(),
                        container_port: *container_port,
                        host_port: *host_port,
                    })
                    .collect(),
            };
        }

        ContainerSpec {
            name: name.to_string(),
            image: plan.image.clone(),
            env,
            labels,
            user: Some(limits.user.clone()),
            memory_bytes: limits.memory_bytes,
            nano_cpus: limits.nano_cpus,
            network_mode: limits.network_mode.clone(),
            ulimits: (limits.ulimit_soft, limits.ulimit_hard),
            privileged: false,
            devices: Vec::new(),
            ports: Vec::new(),
        }
    }

    fn record_for(
        &self,
        key: &SandboxKey,
        plan: &ProvisionPlan,
        name: &str,
        summary: ContainerSummary,
        adopted: bool,
    ) -> ContainerRecord {
        let now = now_secs();
        let ports: BTreeMap<String, u16> = if plan.is_vm() {
            VM_PORTS
                .iter()
                .map(|(service, container_port, host_port)| {
                    let published = summary
                        .published
                        .get(&format!("{}/tcp", container_port))
                        .copied()
                        .unwrap_or(*host_port);
                    (service.to_string(), published)
                })
                .collect()
        } else {
            BTreeMap::new()
        };

        ContainerRecord {
            owner: key.owner.clone(),
            os: plan.os,
            id: summary.id,
            name: name.to_string(),
            image: summary.image.unwrap_or_else(|| plan.image.clone()),
            created_at: now,
            last_used_at: now,
            state: RecordState::Running,
            kind: plan.kind,
            fallback_from: plan.fallback_from,
            readiness: Readiness {
                shell: true,
                ssh: false,
                remote_desktop: ports.contains_key("rdp"),
            },
            ports,
            adopted,
        }
    }

    fn unavailable_record(&self, key: &SandboxKey, plan: &ProvisionPlan, name: &str) -> ContainerRecord {
        let now = now_secs();
        ContainerRecord {
            owner: key.owner.clone(),
            os: plan.os,
            id: String::new(),
            name: name.to_string(),
            image: plan.image.clone(),
            created_at: now,
            last_used_at: now,
            state: RecordState::Unavailable,
            kind: ContainerKind::Placeholder,
            fallback_from: plan.fallback_from,
            readiness: Readiness::default(),
            ports: BTreeMap::new(),
            adopted: false,
        }
    }

    fn store(&self, key: &SandboxKey, record: ContainerRecord) {
        self.persist_best_effort(key, &record);
        let mut entries = self.inner.entries.write();
        match entries.get_mut(key) {
            Some(entry) => entry.record = record,
            None => {
                entries.insert(key.clone(), Entry { record, leases: 0 });
            }
        }
    }

    fn update(&self, key: &SandboxKey, id: &str, f: impl FnOnce(&mut ContainerRecord)) {
        let updated = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(key) {
                Some(entry) if entry.record.id == id => {
                    f(&mut entry.record);
                    Some(entry.record.clone())
                }
                _ => None,
            }
        };
        if let Some(record) = updated {
            self.persist_best_effort(key, &record);
        }
    }

    fn persist_best_effort(&self, key: &SandboxKey, record: &ContainerRecord) {
        if let Some(db) = &self.inner.db {
            if let Err(e) = db.put_container(&key.storage_key(), record) {
                tracing::warn!(sandbox = %key, error = %e, "failed to persist container record");
            }
        }
    }

    fn unpersist_best_effort(&self, key: &SandboxKey) {
        if let Some(db) = &self.inner.db {
            if let Err(e) = db.remove_container(&key.storage_key()) {
                tracing::warn!(sandbox = %key, error = %e, "failed to remove container record");
            }
        }
    }

    // ========================================================================
    // Background provisioning work
    // ========================================================================

    fn after_provision(&self, key: &SandboxKey, record: &ContainerRecord) {
        if !record.is_running() {
            return;
        }
        match record.kind {
            ContainerKind::ProvisionedVm => {
                let registry = self.clone();
                let key = key.clone();
                let record = record.clone();
                tokio::spawn(async move { registry.probe_vm(key, record).await });
            }
            ContainerKind::Native if record.os == OsFlavor::Kali && !record.adopted => {
                if let Some(script) = self.inner.settings.bootstrap.clone() {
                    let runtime = self.runtime();
                    let id = record.id.clone();
                    tokio::spawn(async move { run_bootstrap(runtime, id, script).await });
                }
            }
            _ => {}
        }
    }

    async fn probe_vm(&self, key: SandboxKey, record: ContainerRecord) {
        let settings = &self.inner.settings;
        let Some(ssh_port) = record.ports.get("ssh").copied() else {
            return;
        };
        let deadline = tokio::time::Instant::now() + settings.vm_readiness;

        while tokio::time::Instant::now() < deadline {
            match self.inner.runtime.inspect(&record.id).await {
                Ok(summary) if summary.running => {
                    if ssh_banner(ssh_port).await {
                        tracing::info!(sandbox = %key, port = ssh_port, "vm answered on ssh");
                        self.update(&key, &record.id, |r| {
                            r.readiness.ssh = true;
                        });
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(sandbox = %key, error = %e, "vm probe stopped, container gone");
                    return;
                }
            }
            tokio::time::sleep(settings.vm_probe_interval).await;
        }
        tracing::warn!(
            sandbox = %key,
            after = %humantime::format_duration(settings.vm_readiness),
            "vm did not answer on ssh before the readiness deadline"
        );
    }

    // ========================================================================
    // Leases and teardown
    // ========================================================================

    /// Register a session's use of `(owner, os)`.
    pub fn acquire(&self, owner: &str, os: OsFlavor) {
        let key = SandboxKey::new(owner, os);
        if let Some(entry) = self.inner.entries.write().get_mut(&key) {
            entry.leases += 1;
            entry.record.last_used_at = now_secs();
        }
    }

    /// Release a session's use of `(owner, os)`. When the last lease goes
    /// away the container is torn down, unless `keep` is set.
    pub async fn release(&self, owner: &str, os: OsFlavor, keep: bool) {
        let key = SandboxKey::new(owner, os);
        let remaining = {
            let mut entries = self.inner.entries.write();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.leases = entry.leases.saturating_sub(1);
                    entry.record.last_used_at = now_secs();
                    entry.leases
                }
                None => return,
            }
        };
        if remaining == 0 {
            if keep {
                tracing::debug!(sandbox = %key, "keeping container after session close");
                return;
            }
            // a session may join while we wait for the key lock
            self.remove_if(&key, |entry| entry.leases == 0).await;
        } else {
            tracing::debug!(sandbox = %key, remaining, "container still in use by other sessions");
        }
    }

    /// Stop and force-remove the container for `(owner, os)` unless `keep`
    /// is set. Failures are logged, never returned.
    pub async fn teardown(&self, owner: &str, os: OsFlavor, keep: bool) {
        let key = SandboxKey::new(owner, os);
        if keep {
            tracing::debug!(sandbox = %key, "keeping container after session close");
            return;
        }

        self.remove_if(&key, |_| true).await;
    }

    /// Remove the container for `key` if `removable` still holds once the
    /// key lock is held. Returns whether it was removed.
    async fn remove_if(&self, key: &SandboxKey, removable: impl Fn(&Entry) -> bool) -> bool {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let entry = {
            let mut entries = self.inner.entries.write();
            match entries.get(key).map(&removable) {
                Some(true) => entries.remove(key),
                Some(false) => {
                    tracing::debug!(sandbox = %key, "container back in use, not removing");
                    None
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        self.unpersist_best_effort(key);

        let record = entry.record;
        if record.id.is_empty() {
            return true;
        }

        let grace = if record.kind == ContainerKind::ProvisionedVm {
            VM_STOP_GRACE
        } else {
            self.inner.settings.stop_grace
        };
        let runtime = &self.inner.runtime;
        if let Err(e) = runtime.stop(&record.id, grace).await {
            tracing::warn!(sandbox = %key, error = %e, "failed to stop container");
        }
        match runtime.remove(&record.id).await {
            Ok(()) => tracing::info!(
                sandbox = %key,
                container = %crate::os::truncate_id(&record.id),
                "container removed"
            ),
            Err(e) => tracing::warn!(sandbox = %key, error = %e, "failed to remove container"),
        }
        true
    }

    /// Tear down containers unused for at least `idle` with no active lease.
    /// Returns the keys that were reaped.
    pub async fn reap_idle(&self, idle: Duration) -> Vec<SandboxKey> {
        let idle_secs = idle.as_secs();
        let is_idle = |e: &Entry| {
            e.leases == 0 && now_secs().saturating_sub(e.record.last_used_at) >= idle_secs
        };
        let candidates: Vec<SandboxKey> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|&(_, e)| is_idle(e))
            .map(|(k, _)| k.clone())
            .collect();

        let mut reaped = Vec::new();
        for key in candidates {
            // checked again under the key lock, a session may have joined
            if self.remove_if(&key, &is_idle).await {
                tracing::info!(sandbox = %key, "reaped idle container");
                reaped.push(key);
            }
        }
        reaped
    }

    /// Tear down every container. Used at shutdown.
    pub async fn dispose_all(&self) {
        let keys: Vec<SandboxKey> = self.inner.entries.read().keys().cloned().collect();
        for key in keys {
            self.teardown(&key.owner, key.os, false).await;
        }
    }

    /// Re-register persisted records whose containers are still running.
    /// Records for vanished or stopped containers are dropped; a later
    /// `ensure_container` adopts stopped ones by name. Returns the number
    /// of records restored.
    pub async fn restore(&self) -> usize {
        let Some(db) = &self.inner.db else {
            return 0;
        };
        let persisted = match db.list_containers() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load container records");
                return 0;
            }
        };

        let mut restored = 0;
        for (storage_key, mut record) in persisted {
            let Some(key) = SandboxKey::from_storage_key(&storage_key) else {
                self.forget_persisted(&storage_key);
                continue;
            };
            let alive = !record.id.is_empty()
                && matches!(self.inner.runtime.inspect(&record.id).await, Ok(s) if s.running);
            if !alive {
                tracing::info!(sandbox = %key, "dropping record for container that is no longer running");
                self.forget_persisted(&storage_key);
                continue;
            }
            record.last_used_at = now_secs();
            record.adopted = true;
            self.inner
                .entries
                .write()
                .insert(key, Entry { record, leases: 0 });
            restored += 1;
        }
        restored
    }

    fn forget_persisted(&self, storage_key: &str) {
        if let Some(db) = &self.inner.db {
            if let Err(e) = db.remove_container(storage_key) {
                tracing::warn!(key = %storage_key, error = %e, "failed to remove container record");
            }
        }
    }
}

/// Run the bootstrap script as root and log the outcome.
async fn run_bootstrap(runtime: Arc<dyn ContainerRuntime>, id: String, script: String) {
    let request = ExecRequest {
        cmd: ShellKind::Bash.one_shot_argv(&script),
        tty: false,
        user: Some("0:0".to_string()),
        env: Vec::new(),
    };
    let mut exec = match runtime.exec(&id, request).await {
        Ok(exec) => exec,
        Err(e) => {
            tracing::warn!(container = %crate::os::truncate_id(&id), error = %e, "bootstrap could not start");
            return;
        }
    };
    while let Some(chunk) = exec.output.next().await {
        if let Err(e) = chunk {
            tracing::debug!(error = %e, "bootstrap output stream failed");
            break;
        }
    }
    match runtime.exec_exit_code(&exec.exec_id).await {
        Ok(Some(0)) => tracing::info!(container = %crate::os::truncate_id(&id), "bootstrap complete"),
        Ok(code) => tracing::warn!(container = %crate::os::truncate_id(&id), exit_code = ?code, "bootstrap exited abnormally"),
        Err(e) => tracing::debug!(error = %e, "bootstrap exit code unavailable"),
    }
}

/// Whether something on localhost `port` greets with an ssh banner.
async fn ssh_banner(port: u16) -> bool {
    const BANNER_TIMEOUT: Duration = Duration::from_secs(2);
    let attempt = async {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.ok()?;
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.ok()?;
        Some(buf[..n].starts_with(b"SSH-"))
    };
    matches!(tokio::time::timeout(BANNER_TIMEOUT, attempt).await, Ok(Some(true)))
}
