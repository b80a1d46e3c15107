//! kas Router
//!
//! Serves agent APIs on the internal server, routing each call to the kas
//! instance that holds a tunnel to the target agent, and serves tunnels held
//! by this instance to sibling instances on the private API server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kas_core::config::{AgentApiConfig, load_config};
use kas_core::tracing_init::{default_filter, init_tracing};
use kas_router::grpctool::{MaxConnAge, ServiceDesc};
use kas_router::registry::{TunnelRegistry, TunnelTracker};
use kas_router::router::{DefaultKasPool, Router, RouterConfig, RouterDeps};
use kas_router::server::GrpcServer;

#[derive(Parser, Debug)]
#[command(name = "kas-router")]
#[command(version, about = "kas router - routes agent-bound gRPC calls through tunnels")]
struct Args {
    /// Config file path (JSON). Defaults to `<config dir>/kas/settings.json`.
    #[arg(long, env = "KAS_CONFIG")]
    config: Option<PathBuf>,

    /// Internal API listen address, overrides the config file
    #[arg(long, env = "KAS_INTERNAL_API_LISTEN")]
    internal_api_listen: Option<SocketAddr>,

    /// Private API listen address, overrides the config file
    #[arg(long, env = "KAS_PRIVATE_API_LISTEN")]
    private_api_listen: Option<SocketAddr>,

    /// Private API URL advertised to sibling instances (`tcp://host:port`)
    #[arg(long)]
    private_api_url: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.internal_api_listen {
        config.internal_api.listen = addr;
    }
    if let Some(addr) = args.private_api_listen {
        config.private_api.listen = addr;
    }
    if let Some(url) = args.private_api_url {
        config.private_api.url = url;
    }
    config.validate()?;

    init_tracing(
        &default_filter(&config.observability.log_level),
        args.log_json || config.observability.log_json,
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        internal_api = %config.internal_api.listen,
        private_api = %config.private_api.listen,
        "Starting kas-router"
    );
    if config.private_api.url.is_empty() {
        warn!("private_api.url is not set, tunnels held here are not routable from other instances");
    }

    let tracker = TunnelTracker::new();
    let registry = TunnelRegistry::new(Arc::new(tracker.clone()), config.private_api.url.clone());

    let internal_server = GrpcServer::new("internal");
    let private_server = GrpcServer::new("private")
        .with_max_conn_age(MaxConnAge::from_max_age(config.private_api.max_connection_age()));

    let router = Router::new(RouterDeps {
        kas_pool: Arc::new(DefaultKasPool::default()),
        tunnel_querier: Arc::new(tracker),
        tunnel_finder: Arc::new(registry.clone()),
        internal_server: internal_server.registrar(),
        private_api_server: private_server.registrar(),
        config: RouterConfig::from(&config.router),
    })?;
    for api in &config.agent_api {
        router.register_agent_api(&service_desc(api))?;
    }

    let internal_listener = GrpcServer::bind(config.internal_api.listen).await?;
    let private_listener = GrpcServer::bind(config.private_api.listen).await?;
    let shutdown = CancellationToken::new();
    let serving = async {
        tokio::try_join!(
            internal_server.serve(internal_listener, shutdown.clone()),
            private_server.serve(private_listener, shutdown.clone()),
        )
    };
    tokio::pin!(serving);

    tokio::select! {
        result = &mut serving => {
            result?;
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
            router.shutdown();
            registry.shutdown().await;
            shutdown.cancel();
            serving.await?;
        }
    }

    info!("kas-router stopped");
    Ok(())
}

fn service_desc(api: &AgentApiConfig) -> ServiceDesc {
    let desc = api
        .methods
        .iter()
        .fold(ServiceDesc::new(&api.service), |desc, m| desc.with_method(m));
    api.streams
        .iter()
        .fold(desc, |desc, s| desc.with_stream(s, true, true))
}
