//! Routes gRPC calls for agents to the kas instance holding the agent's
//! tunnel.
//!
//! Each agent API is served twice:
//! - on the internal server, by the routing handler ([`kas`]), which finds
//!   a sibling kas with a tunnel and forwards the call there;
//! - on the private API server, by the gateway handler ([`agent`]), which
//!   claims a local tunnel and forwards the call to the agent.

pub mod agent;
pub mod gateway_response;
pub mod kas;
pub mod kas_pool;


use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tonic::codegen::BoxFuture;
use tonic::{Request, Response, Status};
use tracing::info;

use kas_proto::GatewayKasResponse;

use crate::grpctool::context::RequestContext;
use crate::grpctool::descriptor::{
    FrameStream, FullMethod, ServiceDesc, StreamHandler, munge_descriptor,
};
use crate::grpctool::registrar::{RegistrarError, ServiceRegistrar};
use crate::grpctool::stream_visitor::{StreamVisitor, VisitorError};
use crate::registry::{Querier, TunnelFinder};

pub use kas_pool::{DefaultKasPool, KasPool, PoolError};

/// Polling periods of the routing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Pause between full routing attempts.
    pub route_attempt_period: Duration,
    /// Pause between tunnel tracker queries that failed.
    pub get_tunnels_attempt_period: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_attempt_period: Duration::from_secs(3),
            get_tunnels_attempt_period: Duration::from_secs(1),
        }
    }
}

impl From<&kas_core::config::RouterConfig> for RouterConfig {
    fn from(config: &kas_core::config::RouterConfig) -> Self {
        Self {
            route_attempt_period: config.route_attempt_period(),
            get_tunnels_attempt_period: config.get_tunnels_attempt_period(),
        }
    }
}

/// Collaborators of a [`Router`].
pub struct RouterDeps {
    pub kas_pool: Arc<dyn KasPool>,
    pub tunnel_querier: Arc<dyn Querier>,
    pub tunnel_finder: Arc<dyn TunnelFinder>,
    /// Server in-cluster callers use to reach agents.
    pub internal_server: Arc<dyn ServiceRegistrar>,
    /// Server sibling kas instances use to reach tunnels held here.
    pub private_api_server: Arc<dyn ServiceRegistrar>,
    pub config: RouterConfig,
}

pub struct Router {
    kas_pool: Arc<dyn KasPool>,
    tunnel_querier: Arc<dyn Querier>,
    tunnel_finder: Arc<dyn TunnelFinder>,
    internal_server: Arc<dyn ServiceRegistrar>,
    private_api_server: Arc<dyn ServiceRegistrar>,
    gateway_kas_visitor: StreamVisitor<GatewayKasResponse>,
    config: RouterConfig,
    /// Parent of every call context; canceled on shutdown.
    lifetime: RequestContext,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(deps: RouterDeps) -> Result<Arc<Self>, VisitorError> {
        Ok(Arc::new(Self {
            kas_pool: deps.kas_pool,
            tunnel_querier: deps.tunnel_querier,
            tunnel_finder: deps.tunnel_finder,
            internal_server: deps.internal_server,
            private_api_server: deps.private_api_server,
            gateway_kas_visitor: StreamVisitor::new()?,
            config: deps.config,
            lifetime: RequestContext::background(),
        }))
    }

    /// Serve `desc` on both servers: routing handlers on the internal
    /// server, gateway handlers on the private API server.
    pub fn register_agent_api(self: &Arc<Self>, desc: &ServiceDesc) -> Result<(), RegistrarError> {
        let routing = weak_handler(Arc::downgrade(self), Self::route_to_correct_kas_handler);
        let gateway = weak_handler(Arc::downgrade(self), Self::route_to_correct_agent_handler);
        self.internal_server
            .register_service(munge_descriptor(desc, &routing))?;
        self.private_api_server
            .register_service(munge_descriptor(desc, &gateway))?;
        info!(service = %desc.service_name, "Registered agent API");
        Ok(())
    }

    /// End every call that is still polling for a tunnel or forwarding.
    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }
}

/// Handler that holds the router weakly, so registrars do not keep it alive.
fn weak_handler<F, Fut>(router: Weak<Router>, handle: F) -> StreamHandler
where
    F: Fn(Arc<Router>, Request<FrameStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<FrameStream>, Status>> + Send + 'static,
{
    Arc::new(
        move |request: Request<FrameStream>| -> BoxFuture<Response<FrameStream>, Status> {
            match router.upgrade() {
                Some(router) => Box::pin(handle(router, request)),
                None => Box::pin(async { Err(Status::unavailable("Router is shutting down")) }),
            }
        },
    )
}

#[allow(clippy::result_large_err)]
fn full_method<T>(request: &Request<T>) -> Result<String, Status> {
    request
        .extensions()
        .get::<FullMethod>()
        .map(|m| m.0.clone())
        .ok_or_else(|| Status::internal("Full method name missing from request"))
}
