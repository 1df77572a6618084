//! Dialog multiplexing node binary.
//!
//! Accepts and/or opens TCP connections, serves the echo dialog type on every
//! connection and can drive a batch of echo dialogs against each peer it
//! connects to.

use clap::Parser;
use mux_session::{
    connect_tcp, listen_tcp, EndpointHandler, EndpointRegistry, PermitPool, TcpTransport,
    TokioExecutor,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod echo;

use config::MuxConfig;
use logging::MuxLogFormatter;

/// Dialog multiplexing node
#[derive(Parser, Debug)]
#[command(name = "redb-mux", version, about = "Dialog multiplexing node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 0.0.0.0:7400
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Connect to address, e.g. 127.0.0.1:7400 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Heartbeat interval, e.g. 10s
    #[arg(long)]
    heartbeat_interval: Option<humantime::Duration>,

    /// Idle timeout, e.g. 30s
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// Inbound dialog permits shared by all connections (0 = unlimited)
    #[arg(long)]
    permits: Option<u32>,

    /// Echo dialogs to run against each connected peer
    #[arg(long, default_value = "0")]
    dialogs: usize,

    /// Payload size of each echo dialog in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply_to(&self, config: &mut MuxConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = Some(listen);
        }
        if !self.connect.is_empty() {
            config.connect_addrs = self.connect.clone();
        }
        if let Some(interval) = &self.heartbeat_interval {
            config.heartbeat_interval = **interval;
        }
        if let Some(idle) = &self.idle_timeout {
            config.idle_timeout = crate::config::idle_timeout(**idle);
        }
        if let Some(permits) = self.permits {
            config.dialog_permits = permits;
        }
    }
}

/// Shared state for every connection of this node
struct Node {
    config: MuxConfig,
    registry: Arc<EndpointRegistry>,
    pool: Option<Arc<PermitPool>>,
}

impl Node {
    fn new(config: MuxConfig) -> Arc<Self> {
        let pool = (config.dialog_permits > 0).then(|| PermitPool::new(config.dialog_permits));
        Arc::new(Self {
            config,
            registry: EndpointRegistry::new(),
            pool,
        })
    }

    /// Wrap `stream` in an endpoint and start it
    fn attach(&self, stream: TcpStream, creator: bool) -> anyhow::Result<Arc<EndpointHandler>> {
        let (transport, driver) = TcpTransport::new(stream)?;
        let peer = transport.peer_addr();

        let mut builder =
            EndpointHandler::builder(self.config.endpoint_config(), TokioExecutor::new(), transport)
                .creator(creator)
                .factories(echo::factories())
                .listener(self.registry.clone());
        if let Some(pool) = &self.pool {
            builder = builder.permit_pool(pool.clone());
        }
        let endpoint = builder.build();

        self.registry.register(endpoint.clone());
        endpoint.start();
        driver.start(&endpoint);
        component_info!(
            "endpoint",
            "Endpoint {:016x} {} {}",
            endpoint.handler_id(),
            if creator { "connected to" } else { "accepted from" },
            peer
        );
        Ok(endpoint)
    }

    async fn accept_loop(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = listen_tcp(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        loop {
            let (stream, _) = listener.accept().await?;
            if let Err(err) = self.attach(stream, false) {
                component_warn!("endpoint", "Failed to set up inbound connection: {:#}", err);
            }
        }
    }

    /// Wait for open dialogs to drain, then force whatever is left
    async fn shutdown(&self) {
        self.registry.shutdown_all(false);
        let endpoints = self.registry.endpoints();
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            for endpoint in &endpoints {
                endpoint.await_terminated().await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} endpoints still open after {:?}, forcing shutdown",
                self.registry.len(),
                self.config.shutdown_grace
            );
            self.registry.shutdown_all(true);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("redb_mux={}", args.log_level).parse()?)
        .add_directive(format!("mux_session={}", args.log_level).parse()?)
        .add_directive(format!("mux_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(MuxLogFormatter::new("mux"))
        .init();

    info!("Starting reDB Mux Service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = MuxConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    let node = Node::new(config);

    if let Some(addr) = node.config.listen_addr {
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = node.accept_loop(addr).await {
                warn!("Listener on {} stopped: {:#}", addr, err);
            }
        });
    }

    let mut drivers = Vec::new();
    for addr in node.config.connect_addrs.clone() {
        let stream = connect_tcp(addr).await?;
        let endpoint = node.attach(stream, true)?;
        if args.dialogs > 0 {
            drivers.push(tokio::spawn(echo::drive(
                endpoint,
                args.dialogs,
                args.payload_size,
                node.config.dialog_timeout,
            )));
        }
    }

    let run_to_completion = node.config.listen_addr.is_none() && !drivers.is_empty();
    let drivers_done = async move {
        let mut failed = 0;
        for driver in drivers {
            if let Ok(summary) = driver.await {
                failed += summary.failed;
            }
        }
        failed
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
        failed = drivers_done, if run_to_completion => {
            component_info!("echo", "All echo runs completed ({} failed dialogs)", failed);
        }
    }

    node.shutdown().await;
    // let the transports flush their last frames
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("Mux service stopped");
    Ok(())
}
