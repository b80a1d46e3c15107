//! Tunnels and where to find them.
//!
//! A tunnel is a long-lived stream opened by an agent to one kas instance.
//! The [`Querier`] answers which instances hold tunnels for an agent; the
//! [`TunnelFinder`] hands out a tunnel held by this instance.

pub mod tracker;
pub mod tunnel_registry;

use std::ops::ControlFlow;

use prost::bytes::Bytes;
use tokio_stream::StreamExt;
use tonic::Status;
use tonic::metadata::MetadataMap;

use kas_proto::TunnelInfo;

use crate::grpctool::context::{ContextError, RequestContext};
use crate::grpctool::descriptor::FrameStream;
use crate::grpctool::raw_codec::RawFrame;

pub use tracker::TunnelTracker;
pub use tunnel_registry::TunnelRegistry;

/// The caller's side of a call being forwarded through a tunnel.
pub struct IncomingStream {
    method: String,
    metadata: MetadataMap,
    frames: FrameStream,
}

impl IncomingStream {
    pub fn new(method: impl Into<String>, metadata: MetadataMap, frames: FrameStream) -> Self {
        Self {
            method: method.into(),
            metadata,
            frames,
        }
    }

    /// Full method name, `/pkg.Service/Method`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Call metadata, routing keys already removed.
    pub const fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Next request frame; `None` once the caller has half-closed.
    pub async fn recv(&mut self) -> Result<Option<RawFrame>, Status> {
        self.frames.next().await.transpose()
    }
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("method", &self.method)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Receives what the agent sends back for a forwarded call.
#[tonic::async_trait]
pub trait TunnelDataCallback: Send {
    async fn header(&mut self, metadata: MetadataMap) -> Result<(), Status>;
    async fn message(&mut self, data: Bytes) -> Result<(), Status>;
    async fn trailer(&mut self, metadata: MetadataMap) -> Result<(), Status>;
    async fn error(&mut self, status: Status) -> Result<(), Status>;
}

#[tonic::async_trait]
pub trait Tunnel: Send {
    /// Forward one call to the agent and relay its response to `cb`.
    async fn forward_stream(
        &mut self,
        incoming: IncomingStream,
        cb: &mut dyn TunnelDataCallback,
    ) -> Result<(), Status>;

    /// Release the tunnel. Consumes it, so it can only happen once.
    fn done(self: Box<Self>);
}

/// Owns a tunnel and releases it when dropped, on every exit path.
pub struct TunnelGuard {
    tunnel: Option<Box<dyn Tunnel>>,
}

impl TunnelGuard {
    pub fn new(tunnel: Box<dyn Tunnel>) -> Self {
        Self {
            tunnel: Some(tunnel),
        }
    }

    pub async fn forward_stream(
        &mut self,
        incoming: IncomingStream,
        cb: &mut dyn TunnelDataCallback,
    ) -> Result<(), Status> {
        match self.tunnel.as_mut() {
            Some(tunnel) => tunnel.forward_stream(incoming, cb).await,
            None => Err(Status::internal("tunnel already released")),
        }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.done();
        }
    }
}

#[tonic::async_trait]
pub trait TunnelFinder: Send + Sync {
    /// Wait for a tunnel to `agent_id` held by this instance. Fails only
    /// when the context ends or the finder is shutting down.
    async fn find_tunnel(
        &self,
        ctx: &RequestContext,
        agent_id: i64,
    ) -> Result<Box<dyn Tunnel>, ContextError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("tunnel tracker unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Callback invoked per tunnel; `Break` stops the iteration.
pub type TunnelInfoCallback<'a> = dyn FnMut(TunnelInfo) -> ControlFlow<()> + Send + 'a;

#[tonic::async_trait]
pub trait Querier: Send + Sync {
    /// Invoke `cb` for every known tunnel of `agent_id`, in no particular
    /// order, until it returns `Break`.
    async fn get_tunnels_by_agent_id(
        &self,
        ctx: &RequestContext,
        agent_id: i64,
        cb: &mut TunnelInfoCallback<'_>,
    ) -> Result<(), QueryError>;
}

#[tonic::async_trait]
pub trait Registerer: Send + Sync {
    async fn register_tunnel(&self, info: TunnelInfo);
    async fn unregister_tunnel(&self, info: &TunnelInfo);
}
