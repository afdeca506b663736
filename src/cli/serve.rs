//! HTTP API server command.

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use sandboxd::api::{self, state::ApiState, supervisor::Supervisor};
use sandboxd::config::SandboxConfig;
use sandboxd::db::SandboxDb;
use sandboxd::policy::CommandPolicy;
use sandboxd::registry::{ContainerRegistry, RegistrySettings};
use sandboxd::runtime::{ContainerRuntime, DockerRuntime};
use sandboxd::session::SessionServices;
use sandboxd::telemetry::Telemetry;
use sandboxd::validation::{DirectoryArchive, LessonArchive, PackagedArchive, ValidationRunner};
use sandboxd::Error;

use super::parsers::parse_duration;

/// Start the sandbox server.
#[derive(Args, Debug)]
pub struct ServeCmd {
    /// Address to listen on [default: 127.0.0.1:8080].
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// TOML configuration file.
    #[arg(short, long, value_name = "PATH", env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Leave containers running when sessions close and at shutdown.
    #[arg(long)]
    keep_containers: bool,

    /// Container runtime socket.
    #[arg(long, value_name = "PATH")]
    docker_socket: Option<PathBuf>,

    /// Allowed CORS origin (repeatable).
    #[arg(long = "cors-origin", value_name = "ORIGIN")]
    cors_origins: Vec<String>,

    /// Denylist file.
    #[arg(long, value_name = "PATH")]
    denylist: Option<PathBuf>,

    /// Root of loose lesson trees holding validators.
    #[arg(long, value_name = "DIR")]
    lessons_dir: Option<PathBuf>,

    /// Root of packaged lesson archives.
    #[arg(long, value_name = "DIR")]
    archive_dir: Option<PathBuf>,

    /// Remove containers unused for this long (e.g. "20m").
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    idle_timeout: Option<Duration>,

    /// Report the denylist self-test to each session.
    #[arg(long)]
    self_test: bool,
}

impl ServeCmd {
    /// Resolve configuration: file, then environment, then flags.
    fn resolve_config(&self) -> sandboxd::Result<SandboxConfig> {
        let mut config = SandboxConfig::load(self.config.as_deref())?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.keep_containers {
            config.keep_containers = true;
        }
        if let Some(socket) = &self.docker_socket {
            config.docker_socket = Some(socket.clone());
        }
        if !self.cors_origins.is_empty() {
            config.cors_origins = self.cors_origins.clone();
        }
        if let Some(denylist) = &self.denylist {
            config.denylist = Some(denylist.clone());
        }
        if let Some(dir) = &self.lessons_dir {
            config.lessons_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = Some(dir.clone());
        }
        if let Some(idle) = self.idle_timeout {
            config.timeouts.idle = idle;
        }
        if self.self_test {
            config.self_test = true;
        }
        Ok(config)
    }

    /// Run the server until interrupted.
    pub fn run(self) -> sandboxd::Result<()> {
        let config = self.resolve_config()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::config("start async runtime", e.to_string()))?;

        runtime.block_on(serve(config))
    }
}

async fn serve(config: SandboxConfig) -> sandboxd::Result<()> {
    let db = SandboxDb::open_at(&config.database_path()?)?;
    tracing::info!(path = %db.path().display(), "database opened");

    let policy = CommandPolicy::load(config.denylist.as_deref());
    match policy.load_failure() {
        Some(reason) => {
            tracing::error!(reason = %reason, "denylist unreadable, every command will be denied")
        }
        None => tracing::info!(rules = policy.rule_count(), "denylist loaded"),
    }

    let docker: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(config.docker_socket.as_deref())?);
    if let Err(e) = docker.ping().await {
        tracing::warn!(error = %e, "container runtime not reachable yet");
    }

    let registry = ContainerRegistry::new(
        docker,
        RegistrySettings::from_config(&config),
        Some(db.clone()),
    );
    let restored = registry.restore().await;
    if restored > 0 {
        tracing::info!(count = restored, "restored running containers");
    }

    let lessons = config
        .lessons_dir
        .clone()
        .map(|dir| Arc::new(DirectoryArchive::new(dir)) as Arc<dyn LessonArchive>);
    let packaged = config
        .archive_dir
        .clone()
        .map(|dir| Arc::new(PackagedArchive::new(dir)) as Arc<dyn LessonArchive>);

    let services = SessionServices::from_config(
        &config,
        registry.clone(),
        Arc::new(policy),
        ValidationRunner::new(lessons, packaged),
        Arc::new(Telemetry::new(Some(db.clone()), config.session.recent_commands)),
        Arc::new(db.clone()),
        Arc::new(db),
    );
    let state = Arc::new(ApiState::new(services, config.timeouts.idle));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(
        Supervisor::new(state.clone(), config.timeouts.reap_interval, shutdown_rx).run(),
    );

    let app = api::create_router(state, config.cors_origins.clone());
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .map_err(|e| Error::config("bind", format!("{}: {}", config.listen, e)))?;

    tracing::info!(
        listen = %config.listen,
        keep_containers = config.keep_containers,
        "sandboxd listening"
    );
    eprintln!("sandboxd listening on http://{}", config.listen);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    let _ = supervisor.await;

    if config.keep_containers {
        tracing::info!("keeping containers after shutdown");
    } else {
        registry.dispose_all().await;
    }

    served.map_err(Error::Io)
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
