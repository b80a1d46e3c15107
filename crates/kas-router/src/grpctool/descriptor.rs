//! Runtime descriptions of gRPC services and descriptor munging.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::codegen::BoxFuture;
use tonic::{Request, Response, Status};

use super::raw_codec::RawFrame;

/// A stream of raw frames, in either direction.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<RawFrame, Status>> + Send + 'static>>;

/// Handler serving a call as a bidirectional stream of raw frames.
pub type StreamHandler = Arc<
    dyn Fn(Request<FrameStream>) -> BoxFuture<Response<FrameStream>, Status> + Send + Sync,
>;

/// Name of the full method being served, e.g. `/pkg.Service/Method`.
/// Inserted into request extensions by the registrar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullMethod(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDesc {
    pub method_name: String,
}

#[derive(Clone)]
pub struct StreamDesc {
    pub stream_name: String,
    pub handler: Option<StreamHandler>,
    pub server_streams: bool,
    pub client_streams: bool,
}

impl fmt::Debug for StreamDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDesc")
            .field("stream_name", &self.stream_name)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .field("server_streams", &self.server_streams)
            .field("client_streams", &self.client_streams)
            .finish()
    }
}

/// A gRPC service: unary methods, streaming methods and the source file
/// it was declared in.
#[derive(Debug, Clone)]
pub struct ServiceDesc {
    pub service_name: String,
    pub methods: Vec<MethodDesc>,
    pub streams: Vec<StreamDesc>,
    pub metadata: String,
}

impl ServiceDesc {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            methods: Vec::new(),
            streams: Vec::new(),
            metadata: String::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(MethodDesc {
            method_name: name.into(),
        });
        self
    }

    #[must_use]
    pub fn with_stream(
        mut self,
        name: impl Into<String>,
        server_streams: bool,
        client_streams: bool,
    ) -> Self {
        self.streams.push(StreamDesc {
            stream_name: name.into(),
            handler: None,
            server_streams,
            client_streams,
        });
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Names of every method, unary and streaming.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods
            .iter()
            .map(|m| m.method_name.as_str())
            .chain(self.streams.iter().map(|s| s.stream_name.as_str()))
    }
}

/// Rewrite `desc` so that every method, unary or streaming, is served as a
/// bidirectional stream by `handler`. Service name and metadata are kept.
pub fn munge_descriptor(desc: &ServiceDesc, handler: &StreamHandler) -> ServiceDesc {
    let streams = desc
        .method_names()
        .map(|name| StreamDesc {
            stream_name: name.to_owned(),
            handler: Some(Arc::clone(handler)),
            server_streams: true,
            client_streams: true,
        })
        .collect();
    ServiceDesc {
        service_name: desc.service_name.clone(),
        methods: Vec::new(),
        streams,
        metadata: desc.metadata.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn noop_handler() -> StreamHandler {
        Arc::new(
            |_req: Request<FrameStream>| -> BoxFuture<Response<FrameStream>, Status> {
                Box::pin(async { Err(Status::unimplemented("noop")) })
            },
        )
    }

    #[test]
    fn munge_turns_all_methods_into_bidi_streams() {
        let desc = ServiceDesc::new("kas.test.v1.Testing")
            .with_method("RequestResponse")
            .with_stream("StreamingRequestResponse", true, true)
            .with_stream("ServerStream", true, false)
            .with_metadata("kas/test/v1/test.proto");

        let munged = munge_descriptor(&desc, &noop_handler());
        assert_eq!(munged.service_name, "kas.test.v1.Testing");
        assert_eq!(munged.metadata, "kas/test/v1/test.proto");
        assert!(munged.methods.is_empty());
        let names: Vec<_> = munged.streams.iter().map(|s| s.stream_name.as_str()).collect();
        assert_eq!(
            names,
            ["RequestResponse", "StreamingRequestResponse", "ServerStream"]
        );
        assert!(
            munged
                .streams
                .iter()
                .all(|s| s.server_streams && s.client_streams && s.handler.is_some())
        );
    }

    #[test]
    fn munge_shares_one_handler() {
        let handler = noop_handler();
        let desc = ServiceDesc::new("a.B").with_method("X").with_method("Y");
        let munged = munge_descriptor(&desc, &handler);
        for s in &munged.streams {
            assert!(Arc::ptr_eq(s.handler.as_ref().unwrap(), &handler));
        }
    }

    #[test]
    fn munge_of_empty_service_is_empty() {
        let munged = munge_descriptor(&ServiceDesc::new("a.B"), &noop_handler());
        assert!(munged.methods.is_empty());
        assert!(munged.streams.is_empty());
    }
}
