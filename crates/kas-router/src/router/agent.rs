//! Gateway side: serve a call routed here by a sibling kas through a tunnel
//! held by this instance.
//!
//! Stream protocol towards the routing kas: once a tunnel is claimed, send
//! `TunnelReady`; wait for `StartStreaming`; then relay the agent's
//! response as `Header`, `Message`, `Trailer` and `Error` frames.

use std::sync::Arc;

use prost::bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{Instrument, debug, info_span};

use kas_proto::StartStreaming;
use kas_proto::gateway_kas_response::{Error, Header, Message, Msg, Trailer};

use super::gateway_response::{tunnel_ready, wrap};
use super::{Router, full_method};
use crate::grpctool::context::{RequestContext, status_from_context_error};
use crate::grpctool::descriptor::FrameStream;
use crate::grpctool::metadata::{
    agent_id_from_meta, meta_to_values_map, remove_hop_meta, status_to_proto,
};
use crate::grpctool::raw_codec::RawFrame;
use crate::registry::{IncomingStream, TunnelDataCallback, TunnelGuard};

type FrameSender = mpsc::Sender<Result<RawFrame, Status>>;

impl Router {
    /// Handler for agent API calls on the private API server.
    pub(crate) async fn route_to_correct_agent_handler(
        self: Arc<Self>,
        request: Request<FrameStream>,
    ) -> Result<Response<FrameStream>, Status> {
        let agent_id = agent_id_from_meta(request.metadata())?;
        let method = full_method(&request)?;
        let ctx = self.lifetime.child_from_metadata(request.metadata());
        let span = info_span!("route_to_agent", agent_id, method = %method);
        let (metadata, _, inbound) = request.into_parts();
        let metadata = remove_hop_meta(&metadata);

        let tunnel = self
            .tunnel_finder
            .find_tunnel(&ctx, agent_id)
            .instrument(span.clone())
            .await
            .map_err(status_from_context_error)?;
        let guard = TunnelGuard::new(tunnel);

        let (out_tx, out_rx) = mpsc::channel(1);
        out_tx
            .send(Ok(RawFrame::from_message(&tunnel_ready())))
            .await
            .map_err(|_| Status::cancelled("Caller went away"))?;
        tokio::spawn(
            forward_via_tunnel(ctx, guard, method, metadata, inbound, out_tx).instrument(span),
        );
        Ok(Response::new(
            Box::pin(ReceiverStream::new(out_rx)) as FrameStream
        ))
    }
}

/// Wait for `StartStreaming`, then run the call through the tunnel. The
/// tunnel is released when `guard` drops at the end.
async fn forward_via_tunnel(
    ctx: RequestContext,
    mut guard: TunnelGuard,
    method: String,
    metadata: MetadataMap,
    mut inbound: FrameStream,
    out_tx: FrameSender,
) {
    let caller = out_tx.clone();
    let forwarding = async {
        match inbound.next().await {
            // Routing kas picked another tunnel; this one was never used.
            None => {
                debug!("Stream closed before StartStreaming, releasing tunnel");
                return Ok::<(), Status>(());
            }
            Some(frame) => {
                frame?.decode_message::<StartStreaming>()?;
            }
        }
        let incoming = IncomingStream::new(method, metadata, inbound);
        let mut cb = WrappingCallback { out_tx };
        guard.forward_stream(incoming, &mut cb).await
    };
    let result = tokio::select! {
        res = ctx.run(forwarding) => res.unwrap_or_else(|err| Err(status_from_context_error(err))),
        () = caller.closed() => Err(Status::cancelled("Caller went away")),
    };
    if let Err(status) = result {
        debug!(code = ?status.code(), "Forwarding via tunnel failed");
        let _ = caller.send(Err(status)).await;
    }
}

/// Wraps the agent's response into `GatewayKasResponse` frames.
struct WrappingCallback {
    out_tx: FrameSender,
}

impl WrappingCallback {
    async fn send(&self, msg: Msg) -> Result<(), Status> {
        self.out_tx
            .send(Ok(RawFrame::from_message(&wrap(msg))))
            .await
            .map_err(|_| Status::cancelled("Caller went away"))
    }
}

#[tonic::async_trait]
impl TunnelDataCallback for WrappingCallback {
    async fn header(&mut self, metadata: MetadataMap) -> Result<(), Status> {
        self.send(Msg::Header(Header {
            meta: meta_to_values_map(&metadata),
        }))
        .await
    }

    async fn message(&mut self, data: Bytes) -> Result<(), Status> {
        self.send(Msg::Message(Message {
            data: data.to_vec(),
        }))
        .await
    }

    async fn trailer(&mut self, metadata: MetadataMap) -> Result<(), Status> {
        self.send(Msg::Trailer(Trailer {
            meta: meta_to_values_map(&metadata),
        }))
        .await
    }

    async fn error(&mut self, status: Status) -> Result<(), Status> {
        self.send(Msg::Error(Error {
            status: Some(status_to_proto(&status)),
        }))
        .await
    }
}
