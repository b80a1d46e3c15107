//! Routing side: forward a call to a kas instance that holds a tunnel to
//! the target agent.
//!
//! Candidates come from the tunnel tracker. Each is dialed in random order
//! until one answers with `TunnelReady`; that one gets the call. The whole
//! search is retried every route period until the call's context ends.

use std::ops::ControlFlow;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{Instrument, debug, error, info_span, warn};

use kas_proto::gateway_kas_response::Msg;
use kas_proto::{GatewayKasResponse, StartStreaming, TunnelInfo};

use super::gateway_response::TUNNEL_READY;
use super::kas_pool::PoolError;
use super::{Router, full_method};
use crate::grpctool::context::{ContextError, RequestContext, status_from_context_error};
use crate::grpctool::descriptor::FrameStream;
use crate::grpctool::metadata::{
    agent_id_from_meta, merge_metadata, outgoing_metadata, status_from_proto, values_map_to_meta,
};
use crate::grpctool::raw_codec::{RawCodec, RawFrame};
use crate::grpctool::retry::{PollError, Poller, poll_immediate_until};
use crate::grpctool::stream_visitor::{StreamVisitor, VisitError, VisitHandler, VisitOptions};
use crate::registry::QueryError;

/// The caller's call, waiting to be handed to a gateway kas.
struct RoutedCall {
    method: String,
    metadata: MetadataMap,
    /// Taken by the attempt that gets `TunnelReady`.
    inbound: Option<FrameStream>,
}

type RoutedResult = Result<Response<FrameStream>, Status>;

enum AttemptOutcome {
    /// The call was handed to a gateway kas; its result is final.
    Routed(RoutedResult),
    /// The gateway kas ended the stream before a tunnel was ready.
    Skipped,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Context(ContextError),
    #[error("dial: {0}")]
    Dial(PoolError),
    #[error("NewStream(): {0}")]
    NewStream(Status),
    #[error("kas RecvMsg(): {0}")]
    Recv(Status),
    #[error("unexpected first message from gateway kas: {0}")]
    UnexpectedMessage(&'static str),
    #[error("SendMsg(StartStreaming): gateway kas closed the stream")]
    StartStreaming,
}

impl From<PoolError> for AttemptError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Context(err) => Self::Context(err),
            other => Self::Dial(other),
        }
    }
}

impl From<ContextError> for AttemptError {
    fn from(err: ContextError) -> Self {
        Self::Context(err)
    }
}

impl Router {
    /// Handler for agent API calls on the internal server.
    pub(crate) async fn route_to_correct_kas_handler(
        self: Arc<Self>,
        request: Request<FrameStream>,
    ) -> RoutedResult {
        let agent_id = agent_id_from_meta(request.metadata())?;
        let method = full_method(&request)?;
        let ctx = self.lifetime.child_from_metadata(request.metadata());
        let span = info_span!("route_to_kas", agent_id, method = %method);
        let (metadata, _, inbound) = request.into_parts();
        let call = RoutedCall {
            method,
            metadata: outgoing_metadata(&metadata),
            inbound: Some(inbound),
        };
        self.route_to_correct_kas(&ctx, agent_id, call)
            .instrument(span)
            .await
    }

    async fn route_to_correct_kas(
        &self,
        ctx: &RequestContext,
        agent_id: i64,
        mut call: RoutedCall,
    ) -> RoutedResult {
        let mut poller = Poller::new(ctx, self.config.route_attempt_period);
        let err = loop {
            if let Err(err) = poller.tick().await {
                break err;
            }
            match self.attempt_to_route(ctx, agent_id, &mut call).await {
                Ok(Some(routed)) => return routed,
                Ok(None) => {}
                Err(err) => break err,
            }
        };
        match err {
            PollError::WaitTimeout => Err(Status::unavailable("Unavailable")),
            PollError::Status(status) => Err(status),
        }
    }

    /// One pass over the current candidates. `Ok(None)` means try again
    /// after the route period.
    async fn attempt_to_route(
        &self,
        ctx: &RequestContext,
        agent_id: i64,
        call: &mut RoutedCall,
    ) -> Result<Option<RoutedResult>, PollError> {
        let mut tunnels = poll_immediate_until(ctx, self.config.get_tunnels_attempt_period, || {
            self.attempt_to_get_tunnels(ctx, agent_id)
        })
        .await?;
        tunnels.shuffle(&mut rand::rng());

        for tunnel in &tunnels {
            let span = info_span!(
                "attempt",
                connection_id = tunnel.connection_id,
                kas_url = %tunnel.kas_url
            );
            match self
                .attempt_to_route_via_tunnel(ctx, tunnel, call)
                .instrument(span.clone())
                .await
            {
                Ok(AttemptOutcome::Routed(result)) => return Ok(Some(result)),
                Ok(AttemptOutcome::Skipped) => {
                    debug!(parent: &span, "Gateway kas closed the stream before the tunnel was ready");
                }
                Err(AttemptError::Context(err)) => {
                    return Err(status_from_context_error(err).into());
                }
                Err(err) => {
                    warn!(parent: &span, error = %err, "Failed to route request via tunnel");
                }
            }
        }
        Ok(None)
    }

    /// Query the tracker once. `Ok(None)` means the query failed and should
    /// be retried after the get-tunnels period.
    async fn attempt_to_get_tunnels(
        &self,
        ctx: &RequestContext,
        agent_id: i64,
    ) -> Result<Option<Vec<TunnelInfo>>, PollError> {
        let mut infos = Vec::new();
        let res = {
            let mut collect = |info: TunnelInfo| {
                // Tunnels on instances without a private API are unreachable.
                if !info.kas_url.is_empty() {
                    infos.push(info);
                }
                ControlFlow::Continue(())
            };
            self.tunnel_querier
                .get_tunnels_by_agent_id(ctx, agent_id, &mut collect)
                .await
        };
        match res {
            Ok(()) => Ok(Some(infos)),
            Err(QueryError::Context(_)) => Ok(None),
            Err(err) => {
                error!(error = %err, "GetTunnelsByAgentId()");
                Ok(None)
            }
        }
    }

    async fn attempt_to_route_via_tunnel(
        &self,
        ctx: &RequestContext,
        tunnel: &TunnelInfo,
        call: &mut RoutedCall,
    ) -> Result<AttemptOutcome, AttemptError> {
        let channel = self.kas_pool.dial(ctx, &tunnel.kas_url).await?;
        let path: PathAndQuery = call
            .method
            .parse()
            .map_err(|e| {
                AttemptError::NewStream(Status::internal(format!("Invalid method path: {e}")))
            })?;

        let (kas_tx, kas_rx) = mpsc::channel::<RawFrame>(1);
        let mut request = Request::new(ReceiverStream::new(kas_rx));
        *request.metadata_mut() = call.metadata.clone();
        if let Some(remaining) = ctx.remaining() {
            request.set_timeout(remaining);
        }

        let mut client = tonic::client::Grpc::new(channel);
        ctx.run(client.ready())
            .await?
            .map_err(|e| {
                AttemptError::NewStream(Status::unknown(format!("Service was not ready: {e}")))
            })?;
        let codec = RawCodec::<RawFrame, GatewayKasResponse>::default();
        let response = ctx
            .run(client.streaming(request, path, codec))
            .await?
            .map_err(AttemptError::NewStream)?;
        let mut kas_stream = response.into_inner();

        // Wait for the gateway kas to claim a tunnel.
        match ctx.run(kas_stream.message()).await? {
            Ok(Some(GatewayKasResponse {
                msg: Some(Msg::TunnelReady(_)),
            })) => {}
            Ok(Some(other)) => {
                return Err(AttemptError::UnexpectedMessage(describe(&other)));
            }
            Ok(None) => return Ok(AttemptOutcome::Skipped),
            Err(status) => return Err(AttemptError::Recv(status)),
        }

        kas_tx
            .send(RawFrame::from_message(&StartStreaming {}))
            .await
            .map_err(|_| AttemptError::StartStreaming)?;
        let Some(inbound) = call.inbound.take() else {
            return Ok(AttemptOutcome::Routed(Err(Status::internal(
                "Call was already forwarded",
            ))));
        };
        debug!("Tunnel ready, forwarding");
        Ok(AttemptOutcome::Routed(
            self.forward_stream(ctx, kas_stream, kas_tx, inbound).await,
        ))
    }

    /// Pipe the call both ways until either direction finishes with an error
    /// or the response direction ends.
    ///
    /// Returns once the first response event is known: the agent's header
    /// metadata, or the final status if the call failed before any header.
    async fn forward_stream(
        &self,
        ctx: &RequestContext,
        kas_stream: Streaming<GatewayKasResponse>,
        kas_tx: mpsc::Sender<RawFrame>,
        inbound: FrameStream,
    ) -> RoutedResult {
        let (header_tx, header_rx) = oneshot::channel();
        let (out_tx, out_rx) = mpsc::channel(1);
        let sink = CallerSink {
            header_tx: Some(header_tx),
            out_tx,
            trailer: MetadataMap::new(),
            error: None,
        };
        tokio::spawn(
            forward(
                self.gateway_kas_visitor.clone(),
                ctx.clone(),
                kas_stream,
                kas_tx,
                inbound,
                sink,
            )
            .in_current_span(),
        );

        match header_rx.await {
            Ok(Ok(metadata)) => {
                let mut response =
                    Response::new(Box::pin(ReceiverStream::new(out_rx)) as FrameStream);
                *response.metadata_mut() = metadata;
                Ok(response)
            }
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Status::internal("Forwarding ended without a response")),
        }
    }
}

async fn forward(
    visitor: StreamVisitor<GatewayKasResponse>,
    ctx: RequestContext,
    mut kas_stream: Streaming<GatewayKasResponse>,
    kas_tx: mpsc::Sender<RawFrame>,
    inbound: FrameStream,
    mut sink: CallerSink,
) {
    let caller = sink.out_tx.clone();
    let result = {
        let from_kas = pipe_from_kas_to_stream(&visitor, &mut kas_stream, &mut sink);
        let to_kas = pipe_from_stream_to_kas(inbound, kas_tx);
        tokio::pin!(from_kas, to_kas);
        let mut to_kas_done = false;
        let both = async {
            loop {
                tokio::select! {
                    res = &mut from_kas => break res,
                    res = &mut to_kas, if !to_kas_done => match res {
                        Ok(()) => to_kas_done = true,
                        Err(status) => break Err(status),
                    },
                    () = caller.closed() => break Err(Status::cancelled("Caller went away")),
                }
            }
        };
        ctx.run(both)
            .await
            .unwrap_or_else(|err| Err(status_from_context_error(err)))
    };
    if let Err(status) = &result {
        debug!(code = ?status.code(), "Forwarding finished with error");
    }
    sink.finish(result).await;
}

async fn pipe_from_kas_to_stream(
    visitor: &StreamVisitor<GatewayKasResponse>,
    kas_stream: &mut Streaming<GatewayKasResponse>,
    sink: &mut CallerSink,
) -> Result<(), Status> {
    let options = VisitOptions::default().start_state(TUNNEL_READY);
    match visitor.visit(kas_stream, sink, options).await {
        Ok(()) => Ok(()),
        Err(VisitError::Status(status)) => Err(status),
        Err(err) => {
            error!(error = %err, "Invalid response from gateway kas");
            Err(Status::unavailable("unavailable"))
        }
    }
}

async fn pipe_from_stream_to_kas(
    mut inbound: FrameStream,
    kas_tx: mpsc::Sender<RawFrame>,
) -> Result<(), Status> {
    while let Some(frame) = inbound.next().await {
        if kas_tx.send(frame?).await.is_err() {
            // The gateway side is gone; the response direction reports why.
            return Ok(());
        }
    }
    // Dropping kas_tx half-closes the stream to the gateway kas.
    Ok(())
}

/// Writes gateway kas frames to the caller's response.
struct CallerSink {
    /// Resolves the handler's pending response. `None` once sent.
    header_tx: Option<oneshot::Sender<Result<MetadataMap, Status>>>,
    out_tx: mpsc::Sender<Result<RawFrame, Status>>,
    trailer: MetadataMap,
    /// Status from an `Error` frame, returned at end of stream.
    error: Option<Status>,
}

impl CallerSink {
    fn send_header(&mut self, metadata: MetadataMap) -> bool {
        match self.header_tx.take() {
            Some(tx) => {
                let _ = tx.send(Ok(metadata));
                true
            }
            None => false,
        }
    }

    async fn send_message(&mut self, frame: RawFrame) -> Result<(), Status> {
        self.send_header(MetadataMap::new());
        self.out_tx
            .send(Ok(frame))
            .await
            .map_err(|_| Status::cancelled("Caller went away"))
    }

    /// Deliver the final status, with any trailer metadata, to the caller.
    async fn finish(mut self, result: Result<(), Status>) {
        match result {
            Ok(()) => {
                self.send_header(MetadataMap::new());
                if !self.trailer.is_empty() {
                    let trailer = std::mem::take(&mut self.trailer);
                    let _ = self
                        .out_tx
                        .send(Err(Status::with_metadata(Code::Ok, "", trailer)))
                        .await;
                }
            }
            Err(mut status) => {
                merge_metadata(status.metadata_mut(), &self.trailer);
                match self.header_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(status));
                    }
                    None => {
                        let _ = self.out_tx.send(Err(status)).await;
                    }
                }
            }
        }
    }
}

#[tonic::async_trait]
impl VisitHandler<Msg> for CallerSink {
    async fn on_frame(&mut self, frame: Msg) -> Result<(), Status> {
        match frame {
            Msg::TunnelReady(_) => Err(Status::invalid_argument(
                "Unexpected TunnelReady message received",
            )),
            Msg::Header(header) => {
                if self.send_header(values_map_to_meta(&header.meta)) {
                    Ok(())
                } else {
                    Err(Status::internal("Header already sent"))
                }
            }
            Msg::Message(message) => self.send_message(RawFrame::new(message.data)).await,
            Msg::Trailer(trailer) => {
                merge_metadata(&mut self.trailer, &values_map_to_meta(&trailer.meta));
                Ok(())
            }
            Msg::Error(err) => {
                let status = err.status.map_or_else(
                    || Status::unknown("Gateway kas sent an error without a status"),
                    status_from_proto,
                );
                self.error = Some(status);
                Ok(())
            }
        }
    }

    async fn on_eof(&mut self) -> Result<(), Status> {
        self.error.take().map_or(Ok(()), Err)
    }
}

const fn describe(msg: &GatewayKasResponse) -> &'static str {
    match &msg.msg {
        Some(Msg::TunnelReady(_)) => "tunnel_ready",
        Some(Msg::Header(_)) => "header",
        Some(Msg::Message(_)) => "message",
        Some(Msg::Trailer(_)) => "trailer",
        Some(Msg::Error(_)) => "error",
        None => "empty",
    }
}
