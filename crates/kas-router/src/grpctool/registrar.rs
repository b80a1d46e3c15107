//! Serving runtime [`ServiceDesc`]s on a tonic server.
//!
//! Munged descriptors have no generated server type, so [`RoutesRegistrar`]
//! builds a tower service per descriptor that dispatches on the request
//! path and serves every method over [`RawCodec`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tonic::codegen::{Body, BoxFuture, Service, StdError, http};
use tonic::server::{Grpc, StreamingService};
use tonic::service::Routes;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use super::descriptor::{FrameStream, FullMethod, ServiceDesc, StreamHandler};
use super::raw_codec::{RawCodec, RawFrame};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("service {0} is already registered")]
    Duplicate(String),
    #[error("method /{service}/{method} has no handler")]
    MissingHandler { service: String, method: String },
    #[error("service {0} has unary methods; only streams can be served")]
    UnaryMethod(String),
}

/// Accepts service descriptors to serve.
pub trait ServiceRegistrar: Send + Sync {
    fn register_service(&self, desc: ServiceDesc) -> Result<(), RegistrarError>;
}

/// Collects services and turns them into [`Routes`] for
/// `tonic::transport::Server`.
#[derive(Debug, Clone, Default)]
pub struct RoutesRegistrar {
    services: Arc<Mutex<Vec<DescService>>>,
}

impl RoutesRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the registered services, in registration order.
    pub fn service_names(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|s| s.service_name.as_ref().to_owned())
            .collect()
    }

    /// Routes serving every registered service. Services registered later
    /// are not picked up by routes built earlier.
    pub fn routes(&self) -> Routes {
        let mut router = axum::Router::new();
        for svc in self.lock().iter() {
            let path = format!("/{}/{{*method}}", svc.service_name);
            router = router.route_service(&path, svc.clone());
        }
        Routes::from(router)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DescService>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceRegistrar for RoutesRegistrar {
    fn register_service(&self, desc: ServiceDesc) -> Result<(), RegistrarError> {
        if !desc.methods.is_empty() {
            return Err(RegistrarError::UnaryMethod(desc.service_name));
        }
        let mut handlers = HashMap::with_capacity(desc.streams.len());
        for stream in desc.streams {
            let Some(handler) = stream.handler else {
                return Err(RegistrarError::MissingHandler {
                    service: desc.service_name,
                    method: stream.stream_name,
                });
            };
            handlers.insert(stream.stream_name, handler);
        }

        let mut services = self.lock();
        if services
            .iter()
            .any(|s| s.service_name.as_ref() == desc.service_name)
        {
            return Err(RegistrarError::Duplicate(desc.service_name));
        }
        debug!(service = %desc.service_name, methods = handlers.len(), "Registered service");
        services.push(DescService {
            service_name: desc.service_name.into(),
            handlers: Arc::new(handlers),
        });
        Ok(())
    }
}

/// Tower service for one registered descriptor.
#[derive(Clone)]
struct DescService {
    service_name: Arc<str>,
    handlers: Arc<HashMap<String, StreamHandler>>,
}

impl std::fmt::Debug for DescService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescService")
            .field("service_name", &self.service_name)
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<B> Service<http::Request<B>> for DescService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let path = req.uri().path().to_owned();
        let handler = path
            .strip_prefix('/')
            .and_then(|p| p.strip_prefix(self.service_name.as_ref()))
            .and_then(|p| p.strip_prefix('/'))
            .and_then(|method| self.handlers.get(method))
            .cloned();

        match handler {
            Some(handler) => {
                req.extensions_mut().insert(FullMethod(path));
                Box::pin(async move {
                    let mut grpc = Grpc::new(RawCodec::<RawFrame, RawFrame>::default());
                    Ok(grpc.streaming(HandlerSvc(handler), req).await)
                })
            }
            None => Box::pin(async move { Ok(unimplemented_response()) }),
        }
    }
}

struct HandlerSvc(StreamHandler);

impl StreamingService<RawFrame> for HandlerSvc {
    type Response = RawFrame;
    type ResponseStream = FrameStream;
    type Future = BoxFuture<Response<FrameStream>, Status>;

    fn call(&mut self, request: Request<Streaming<RawFrame>>) -> Self::Future {
        (self.0)(request.map(|s| Box::pin(s) as FrameStream))
    }
}

fn unimplemented_response() -> http::Response<tonic::body::Body> {
    let mut response = http::Response::new(tonic::body::Body::default());
    let headers = response.headers_mut();
    headers.insert(
        Status::GRPC_STATUS,
        (tonic::Code::Unimplemented as i32).into(),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::grpctool::descriptor::munge_descriptor;

    fn handler() -> StreamHandler {
        Arc::new(
            |req: Request<FrameStream>| -> BoxFuture<Response<FrameStream>, Status> {
                let method = req.extensions().get::<FullMethod>().cloned();
                Box::pin(async move {
                    let method = method.ok_or_else(|| Status::internal("no method"))?;
                    let frame = RawFrame::new(method.0.into_bytes());
                    Ok(Response::new(
                        Box::pin(tokio_stream::iter([Ok(frame)])) as FrameStream
                    ))
                })
            },
        )
    }

    fn testing_desc() -> ServiceDesc {
        ServiceDesc::new("kas.test.v1.Testing")
            .with_method("RequestResponse")
            .with_stream("StreamingRequestResponse", true, true)
    }

    #[test]
    fn registers_munged_service() {
        let registrar = RoutesRegistrar::new();
        registrar
            .register_service(munge_descriptor(&testing_desc(), &handler()))
            .unwrap();
        assert_eq!(registrar.service_names(), ["kas.test.v1.Testing"]);
    }

    #[test]
    fn rejects_duplicate_service() {
        let registrar = RoutesRegistrar::new();
        let munged = munge_descriptor(&testing_desc(), &handler());
        registrar.register_service(munged.clone()).unwrap();
        assert_eq!(
            registrar.register_service(munged),
            Err(RegistrarError::Duplicate("kas.test.v1.Testing".into()))
        );
    }

    #[test]
    fn rejects_unmunged_descriptor() {
        let registrar = RoutesRegistrar::new();
        assert!(matches!(
            registrar.register_service(testing_desc()),
            Err(RegistrarError::UnaryMethod(_))
        ));
        let streams_only = ServiceDesc::new("a.B").with_stream("S", true, true);
        assert!(matches!(
            registrar.register_service(streams_only),
            Err(RegistrarError::MissingHandler { .. })
        ));
        assert!(registrar.service_names().is_empty());
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let mut svc = DescService {
            service_name: "a.B".into(),
            handlers: Arc::new(HashMap::new()),
        };
        let req = http::Request::builder()
            .uri("/a.B/Missing")
            .body(tonic::body::Body::default())
            .unwrap();
        let resp = svc.call(req).await.unwrap();
        assert_eq!(
            resp.headers().get(Status::GRPC_STATUS).unwrap(),
            &(tonic::Code::Unimplemented as i32).to_string()
        );
    }
}
