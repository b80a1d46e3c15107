//! Ordered consumption of a stream of oneof-wrapped messages.
//!
//! A message type describes which oneof field may follow which (see
//! [`OneofMessage`]). [`StreamVisitor::visit`] reads the stream to the end,
//! rejects out-of-order frames, and hands each frame to a [`VisitHandler`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tonic::Status;

/// Pseudo-tag of a clean end of stream.
pub const EOF_TAG: i32 = -1;
/// Pseudo-tag of the state before the first message.
const START_TAG: i32 = -2;

/// A message wrapping exactly one oneof group, plus its ordering rules.
pub trait OneofMessage: Send + 'static {
    type Variant: Send + 'static;

    /// Name of the oneof group, for error messages.
    const ONEOF_NAME: &'static str;
    /// Field numbers of every member of the group.
    const TAGS: &'static [i32];
    /// Fields allowed as the first message.
    const FIRST: &'static [i32];

    /// Fields (or [`EOF_TAG`]) allowed after `tag`.
    fn next_allowed(tag: i32) -> &'static [i32];

    fn into_variant(self) -> Option<Self::Variant>;

    fn tag(variant: &Self::Variant) -> i32;
}

/// Receives the frames of a visited stream, in order.
#[tonic::async_trait]
pub trait VisitHandler<V: Send + 'static>: Send {
    async fn on_frame(&mut self, frame: V) -> Result<(), Status>;

    /// Called once on a clean end of stream.
    async fn on_eof(&mut self) -> Result<(), Status> {
        Ok(())
    }
}

/// Broken ordering rules, detected when the visitor is built.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VisitorError {
    #[error("{oneof}: transition table references unknown field {tag}")]
    UnknownTag { oneof: &'static str, tag: i32 },
    #[error("{oneof}: fields {tags:?} are unreachable")]
    Unreachable { oneof: &'static str, tags: Vec<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum VisitError {
    /// Error from the stream itself or from the handler.
    #[error(transparent)]
    Status(#[from] Status),
    #[error("transition from {from} to {to} is not allowed. Allowed: {allowed:?}")]
    InvalidTransition {
        from: TagName,
        to: TagName,
        allowed: Vec<TagName>,
    },
    #[error("no field in the oneof group {0} is set")]
    EmptyOneof(&'static str),
    #[error("unknown start state {0}")]
    UnknownStartState(i32),
}

/// Tag rendered for humans: field number, `start` or `EOF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagName(pub i32);

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            EOF_TAG => f.write_str("EOF"),
            START_TAG => f.write_str("start"),
            tag => write!(f, "{tag}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VisitOptions {
    start_state: Option<i32>,
}

impl VisitOptions {
    /// Behave as if a frame with `tag` had just been visited.
    #[must_use]
    pub const fn start_state(mut self, tag: i32) -> Self {
        self.start_state = Some(tag);
        self
    }
}

/// Validated transition table for `M`. Cheap to clone.
pub struct StreamVisitor<M> {
    transitions: Arc<HashMap<i32, Vec<i32>>>,
    _message: std::marker::PhantomData<fn() -> M>,
}

impl<M> Clone for StreamVisitor<M> {
    fn clone(&self) -> Self {
        Self {
            transitions: Arc::clone(&self.transitions),
            _message: std::marker::PhantomData,
        }
    }
}

impl<M> fmt::Debug for StreamVisitor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamVisitor")
            .field("transitions", &self.transitions)
            .finish()
    }
}

impl<M: OneofMessage> StreamVisitor<M> {
    pub fn new() -> Result<Self, VisitorError> {
        let known: HashSet<i32> = M::TAGS.iter().copied().collect();
        let mut transitions = HashMap::with_capacity(M::TAGS.len() + 1);
        transitions.insert(START_TAG, M::FIRST.to_vec());
        for &tag in M::TAGS {
            transitions.insert(tag, M::next_allowed(tag).to_vec());
        }
        for &next in transitions.values().flatten() {
            if next != EOF_TAG && !known.contains(&next) {
                return Err(VisitorError::UnknownTag {
                    oneof: M::ONEOF_NAME,
                    tag: next,
                });
            }
        }

        let mut reached = HashSet::new();
        let mut queue = VecDeque::from([START_TAG]);
        while let Some(tag) = queue.pop_front() {
            for &next in transitions.get(&tag).into_iter().flatten() {
                if next != EOF_TAG && reached.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut unreachable: Vec<i32> = M::TAGS
            .iter()
            .copied()
            .filter(|t| !reached.contains(t))
            .collect();
        if !unreachable.is_empty() {
            unreachable.sort_unstable();
            return Err(VisitorError::Unreachable {
                oneof: M::ONEOF_NAME,
                tags: unreachable,
            });
        }

        Ok(Self {
            transitions: Arc::new(transitions),
            _message: std::marker::PhantomData,
        })
    }

    /// Read `stream` to its end, dispatching each frame to `handler`.
    ///
    /// Returns the first error from the stream, the handler, or the ordering
    /// rules. `on_eof` runs only when the stream ends where EOF is allowed.
    pub async fn visit<S, H>(
        &self,
        stream: &mut S,
        handler: &mut H,
        options: VisitOptions,
    ) -> Result<(), VisitError>
    where
        S: Stream<Item = Result<M, Status>> + Unpin + Send + ?Sized,
        H: VisitHandler<M::Variant> + ?Sized,
    {
        let mut current = options.start_state.unwrap_or(START_TAG);
        if !self.transitions.contains_key(&current) {
            return Err(VisitError::UnknownStartState(current));
        }
        loop {
            let allowed = self.transitions.get(&current).map_or(&[][..], Vec::as_slice);
            let Some(msg) = stream.next().await else {
                if !allowed.contains(&EOF_TAG) {
                    return Err(invalid_transition(current, EOF_TAG, allowed));
                }
                handler.on_eof().await?;
                return Ok(());
            };
            let variant = msg?
                .into_variant()
                .ok_or(VisitError::EmptyOneof(M::ONEOF_NAME))?;
            let next = M::tag(&variant);
            if !allowed.contains(&next) {
                return Err(invalid_transition(current, next, allowed));
            }
            handler.on_frame(variant).await?;
            current = next;
        }
    }
}

fn invalid_transition(from: i32, to: i32, allowed: &[i32]) -> VisitError {
    VisitError::InvalidTransition {
        from: TagName(from),
        to: TagName(to),
        allowed: allowed.iter().copied().map(TagName).collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::router::gateway_response::{ERROR, HEADER, MESSAGE, TRAILER, TUNNEL_READY};
    use kas_proto::GatewayKasResponse;
    use kas_proto::gateway_kas_response::{Header, Message, Msg, Trailer, TunnelReady};
    use tonic::Code;

    #[derive(Default)]
    struct Recorder {
        tags: Vec<i32>,
        eof: usize,
        fail_on: Option<i32>,
    }

    #[tonic::async_trait]
    impl VisitHandler<Msg> for Recorder {
        async fn on_frame(&mut self, frame: Msg) -> Result<(), Status> {
            let tag = GatewayKasResponse::tag(&frame);
            if self.fail_on == Some(tag) {
                return Err(Status::aborted("handler failed"));
            }
            self.tags.push(tag);
            Ok(())
        }

        async fn on_eof(&mut self) -> Result<(), Status> {
            self.eof += 1;
            Ok(())
        }
    }

    fn frame(msg: Msg) -> Result<GatewayKasResponse, Status> {
        Ok(GatewayKasResponse { msg: Some(msg) })
    }

    fn ready() -> Result<GatewayKasResponse, Status> {
        frame(Msg::TunnelReady(TunnelReady {}))
    }

    fn header() -> Result<GatewayKasResponse, Status> {
        frame(Msg::Header(Header::default()))
    }

    fn message() -> Result<GatewayKasResponse, Status> {
        frame(Msg::Message(Message { data: vec![1] }))
    }

    fn trailer() -> Result<GatewayKasResponse, Status> {
        frame(Msg::Trailer(Trailer::default()))
    }

    async fn run(
        frames: Vec<Result<GatewayKasResponse, Status>>,
        options: VisitOptions,
        handler: &mut Recorder,
    ) -> Result<(), VisitError> {
        let visitor = StreamVisitor::<GatewayKasResponse>::new().unwrap();
        let mut stream = tokio_stream::iter(frames);
        visitor.visit(&mut stream, handler, options).await
    }

    #[tokio::test]
    async fn visits_frames_in_order_then_eof() {
        let mut rec = Recorder::default();
        run(
            vec![ready(), header(), message(), message(), trailer()],
            VisitOptions::default(),
            &mut rec,
        )
        .await
        .unwrap();
        assert_eq!(rec.tags, [TUNNEL_READY, HEADER, MESSAGE, MESSAGE, TRAILER]);
        assert_eq!(rec.eof, 1);
    }

    #[tokio::test]
    async fn rejects_out_of_order_first_frame() {
        let mut rec = Recorder::default();
        let err = run(vec![header()], VisitOptions::default(), &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VisitError::InvalidTransition { from: TagName(START_TAG), to: TagName(HEADER), .. }
        ));
        assert!(rec.tags.is_empty());
    }

    #[tokio::test]
    async fn rejects_eof_before_first_frame() {
        let mut rec = Recorder::default();
        let err = run(vec![], VisitOptions::default(), &mut rec).await.unwrap_err();
        assert!(matches!(err, VisitError::InvalidTransition { to: TagName(EOF_TAG), .. }));
        assert_eq!(rec.eof, 0);
    }

    #[tokio::test]
    async fn start_state_skips_first_frame() {
        let mut rec = Recorder::default();
        run(
            vec![header(), trailer()],
            VisitOptions::default().start_state(TUNNEL_READY),
            &mut rec,
        )
        .await
        .unwrap();
        assert_eq!(rec.tags, [HEADER, TRAILER]);
    }

    #[tokio::test]
    async fn second_tunnel_ready_is_rejected() {
        let mut rec = Recorder::default();
        let err = run(
            vec![ready()],
            VisitOptions::default().start_state(TUNNEL_READY),
            &mut rec,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VisitError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn nothing_may_follow_error() {
        let mut rec = Recorder::default();
        let err = run(
            vec![
                ready(),
                frame(Msg::Error(kas_proto::gateway_kas_response::Error::default())),
                message(),
            ],
            VisitOptions::default(),
            &mut rec,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            VisitError::InvalidTransition { from: TagName(ERROR), to: TagName(MESSAGE), .. }
        ));
    }

    #[tokio::test]
    async fn empty_oneof_is_rejected() {
        let mut rec = Recorder::default();
        let err = run(
            vec![Ok(GatewayKasResponse { msg: None })],
            VisitOptions::default(),
            &mut rec,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VisitError::EmptyOneof("msg")));
    }

    #[tokio::test]
    async fn stream_error_is_returned_as_is() {
        let mut rec = Recorder::default();
        let err = run(
            vec![ready(), Err(Status::unavailable("gone"))],
            VisitOptions::default(),
            &mut rec,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VisitError::Status(s) if s.code() == Code::Unavailable));
        assert_eq!(rec.eof, 0);
    }

    #[tokio::test]
    async fn handler_error_aborts_visit() {
        let mut rec = Recorder {
            fail_on: Some(HEADER),
            ..Recorder::default()
        };
        let err = run(
            vec![ready(), header(), message()],
            VisitOptions::default(),
            &mut rec,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VisitError::Status(s) if s.code() == Code::Aborted));
        assert_eq!(rec.tags, [TUNNEL_READY]);
    }

    #[tokio::test]
    async fn unknown_start_state_is_rejected() {
        let mut rec = Recorder::default();
        let err = run(vec![], VisitOptions::default().start_state(42), &mut rec)
            .await
            .unwrap_err();
        assert!(matches!(err, VisitError::UnknownStartState(42)));
    }

    struct Orphaned;

    impl OneofMessage for Orphaned {
        type Variant = i32;
        const ONEOF_NAME: &'static str = "orphaned";
        const TAGS: &'static [i32] = &[1, 2];
        const FIRST: &'static [i32] = &[1];

        fn next_allowed(_tag: i32) -> &'static [i32] {
            &[EOF_TAG]
        }

        fn into_variant(self) -> Option<i32> {
            None
        }

        fn tag(variant: &i32) -> i32 {
            *variant
        }
    }

    #[test]
    fn unreachable_fields_fail_construction() {
        let err = StreamVisitor::<Orphaned>::new().unwrap_err();
        assert_eq!(
            err,
            VisitorError::Unreachable {
                oneof: "orphaned",
                tags: vec![2]
            }
        );
    }

    struct Dangling;

    impl OneofMessage for Dangling {
        type Variant = i32;
        const ONEOF_NAME: &'static str = "dangling";
        const TAGS: &'static [i32] = &[1];
        const FIRST: &'static [i32] = &[1];

        fn next_allowed(_tag: i32) -> &'static [i32] {
            &[7, EOF_TAG]
        }

        fn into_variant(self) -> Option<i32> {
            None
        }

        fn tag(variant: &i32) -> i32 {
            *variant
        }
    }

    #[test]
    fn unknown_next_field_fails_construction() {
        let err = StreamVisitor::<Dangling>::new().unwrap_err();
        assert_eq!(
            err,
            VisitorError::UnknownTag {
                oneof: "dangling",
                tag: 7
            }
        );
    }
}
