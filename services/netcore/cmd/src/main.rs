//! Netcore service binary.
//!
//! Runs the configured TCP and UDP listeners with the signed echo protocol,
//! one liveness sweep per listener, a shared fault log and a key store for
//! the greeting keys, which are rotated in the background.

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use netcore_session::{
    fault_channel, ContextEvent, ContextRegistry, FaultBridge, FaultReceiver, ListenerConfig,
    LivenessSweep, RegistryConfig, SweepConfig, TcpContextListener, UdpContextListener,
};
use netcore_socket::{IpAddress, SocketEndpoint};
use netcore_storage::{open_key_store, StorageMode};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod echo;
mod keys;
mod logging;

use config::{ListenerProtocol, ListenerSettings, ServerConfig, TlsSettings};
use echo::{EchoHandler, EchoState};
use keys::GreetingKeys;
use logging::NetcoreLogFormatter;

#[cfg(feature = "tls")]
use netcore_session::{load_server_config, tls_acceptor, TlsServer};

/// Connection-management core for multi-protocol socket servers
#[derive(Parser, Debug)]
#[command(name = "netcore", version, about = "Multi-protocol socket server core")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "netcore.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Address every listener binds to, e.g. 0.0.0.0 or ::
    #[arg(long)]
    bind: Option<IpAddress>,

    /// Liveness sweep interval, e.g. 30s
    #[arg(long)]
    sweep_interval: Option<humantime::Duration>,

    /// Bound on each connection teardown, e.g. 5s
    #[arg(long)]
    close_timeout: Option<humantime::Duration>,

    /// Path to TLS certificate chain (PEM format)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Persist keys in this file instead of memory
    #[arg(long)]
    key_store: Option<PathBuf>,

    /// Lifetime of each generated greeting key
    #[arg(long, default_value = "24h")]
    key_lifetime: humantime::Duration,
}

impl Args {
    /// Command-line flags override file and environment
    fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(interval) = &self.sweep_interval {
            config.sweep_interval_secs = interval.as_secs().max(1);
        }
        if let Some(timeout) = &self.close_timeout {
            config.close_timeout_secs = timeout.as_secs();
        }
        if let (Some(cert_file), Some(key_file)) = (&self.tls_cert, &self.tls_key) {
            config.tls = Some(TlsSettings {
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
            });
        }
        if let Some(path) = &self.key_store {
            config.key_store = StorageMode::File { path: path.clone() };
        }
    }
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive(format!("netcore={}", log_level).parse()?)
            .add_directive(format!("redb_netcore={}", log_level).parse()?)
            .add_directive(format!("netcore_session={}", log_level).parse()?)
            .add_directive(format!("netcore_socket={}", log_level).parse()?)
            .add_directive(format!("netcore_storage={}", log_level).parse()?)
            .add_directive(format!("netcore_wire={}", log_level).parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(NetcoreLogFormatter::new("netcore"))
        .init();
    Ok(())
}

async fn log_faults(mut faults: FaultReceiver) {
    while let Some(fault) = faults.recv().await {
        component_warn!(
            "faults",
            "Connection {} failed during {:?} ({:?}, os error {:?}): {}",
            fault.context_id,
            fault.operation,
            fault.kind,
            fault.os_code,
            fault.message
        );
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<ContextEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ContextEvent::Registered { id, remote } => {
                component_debug!("registry", "Connection {} registered from {}", id, remote)
            }
            ContextEvent::Closed { id, reason } => {
                component_debug!("registry", "Connection {} closed ({:?})", id, reason)
            }
        }
    }
}

/// Everything a listener task needs besides its own settings
struct Runtime {
    config: ServerConfig,
    handler: Arc<EchoHandler>,
    faults: FaultBridge,
    events: mpsc::UnboundedSender<ContextEvent>,
    shutdown: watch::Receiver<bool>,
    #[cfg(feature = "tls")]
    tls: Option<TlsServer>,
}

impl Runtime {
    fn registry_for(&self, settings: &ListenerSettings) -> Arc<ContextRegistry<EchoState>> {
        let registry_config = RegistryConfig {
            server_name: settings.name.clone(),
            max_clients: settings.max_clients,
            close_timeout: self.config.close_timeout(),
        };
        Arc::new(
            ContextRegistry::new(registry_config, self.faults.clone()).with_events(self.events.clone()),
        )
    }

    /// Bind one listener and spawn it together with its sweep
    fn start(&self, settings: &ListenerSettings) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let registry = self.registry_for(settings);
        let listener_config = ListenerConfig {
            name: settings.name.clone(),
            endpoint: SocketEndpoint::new(self.config.bind_address, settings.port),
            tls_required: settings.tls_required,
        };

        let sweep = LivenessSweep::new(
            Arc::clone(&registry),
            SweepConfig {
                interval: self.config.sweep_interval(),
                client_timeout_minutes: settings.client_timeout_minutes,
            },
        );
        let mut tasks = vec![tokio::spawn(sweep.run(self.shutdown.clone()))];

        let name = settings.name.clone();
        let shutdown = self.shutdown.clone();
        match settings.protocol {
            ListenerProtocol::Tcp => {
                let listener =
                    TcpContextListener::bind(listener_config, registry, Arc::clone(&self.handler))
                        .with_context(|| format!("Failed to bind TCP listener {}", name))?;
                #[cfg(feature = "tls")]
                let listener = match &self.tls {
                    Some(acceptor) if settings.tls_required => listener.with_tls(acceptor.clone()),
                    _ => listener,
                };
                component_info!(
                    "listener",
                    "TCP listener {} on {} (client timeout {} min)",
                    name,
                    listener.local_endpoint()?,
                    settings.client_timeout_minutes
                );
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = listener.run(shutdown).await {
                        component_error!("listener", "Listener {} stopped: {}", name, e);
                    }
                }));
            }
            ListenerProtocol::Udp => {
                let listener =
                    UdpContextListener::bind(listener_config, registry, Arc::clone(&self.handler))
                        .with_context(|| format!("Failed to bind UDP listener {}", name))?;
                component_info!(
                    "listener",
                    "UDP listener {} on {} (client timeout {} min)",
                    name,
                    listener.local_endpoint()?,
                    settings.client_timeout_minutes
                );
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = listener.run(shutdown).await {
                        component_error!("listener", "Listener {} stopped: {}", name, e);
                    }
                }));
            }
        }
        Ok(tasks)
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT, shutting down");
        }
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    info!("Starting netcore v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.validate()?;

    let keys = open_key_store(&config.key_store)
        .await
        .with_context(|| format!("Failed to open key store {:?}", config.key_store))?;
    let lifetime = chrono::Duration::from_std(*args.key_lifetime)?;
    let greeting_keys = GreetingKeys::new(Arc::clone(&keys), lifetime);
    greeting_keys.ensure(Utc::now()).await?;

    #[cfg(feature = "tls")]
    let tls = match &config.tls {
        Some(tls) => {
            info!("Loading TLS configuration from cert={:?}, key={:?}", tls.cert_file, tls.key_file);
            Some(tls_acceptor(load_server_config(&tls.cert_file, &tls.key_file)?))
        }
        None => None,
    };
    #[cfg(not(feature = "tls"))]
    {
        if config.tls.is_some() {
            warn!("TLS material configured but netcore was built without the tls feature");
        }
    }

    let (faults, fault_rx) = fault_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(log_faults(fault_rx));
    tokio::spawn(log_events(events_rx));

    let runtime = Runtime {
        handler: Arc::new(EchoHandler::new(Arc::clone(&keys))),
        faults,
        events: events_tx,
        shutdown: shutdown_rx,
        #[cfg(feature = "tls")]
        tls,
        config,
    };

    let mut tasks = vec![tokio::spawn(
        greeting_keys.run(Utc::now, runtime.shutdown.clone()),
    )];
    for settings in &runtime.config.listeners {
        tasks.extend(runtime.start(settings)?);
    }
    if runtime.config.listeners.is_empty() {
        warn!("No listeners configured");
    }
    drop(runtime);

    wait_for_signal().await?;
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }

    info!("netcore stopped");
    Ok(())
}
