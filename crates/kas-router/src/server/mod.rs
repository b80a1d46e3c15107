//! gRPC servers of a kas instance.
//!
//! Both the internal and the private API server are [`GrpcServer`]s: a
//! registrar the router registers munged agent APIs with, plus the standard
//! `grpc.health.v1.Health` service reporting every registered service.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tracing::info;

use crate::grpctool::max_conn_age::MaxConnAge;
use crate::grpctool::registrar::{RoutesRegistrar, ServiceRegistrar};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// gRPC server handle.
#[derive(Debug, Clone)]
pub struct GrpcServer {
    name: &'static str,
    registrar: RoutesRegistrar,
    max_conn_age: Option<MaxConnAge>,
}

impl GrpcServer {
    /// `name` only labels log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registrar: RoutesRegistrar::new(),
            max_conn_age: None,
        }
    }

    /// Recycle connections after roughly `max_conn_age`.
    #[must_use]
    pub const fn with_max_conn_age(mut self, max_conn_age: MaxConnAge) -> Self {
        self.max_conn_age = Some(max_conn_age);
        self
    }

    /// Registrar for services served by this server. Services must be
    /// registered before [`GrpcServer::serve`] is called.
    pub fn registrar(&self) -> Arc<dyn ServiceRegistrar> {
        Arc::new(self.registrar.clone())
    }

    /// Bind a TCP listener on `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Serve on `listener` until `shutdown` is canceled.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let (reporter, health_service) = tonic_health::server::health_reporter();
        let services = self.registrar.service_names();
        for service in &services {
            reporter
                .set_service_status(service, ServingStatus::Serving)
                .await;
        }

        let mut builder = Server::builder();
        if let Some(max_conn_age) = &self.max_conn_age {
            builder = max_conn_age.apply(builder);
        }
        let routes = self.registrar.routes().add_service(health_service);

        info!(server = self.name, %addr, services = ?services, "Starting gRPC server");
        builder
            .add_routes(routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await?;
        info!(server = self.name, "gRPC server stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::grpctool::descriptor::{FrameStream, ServiceDesc, StreamHandler, munge_descriptor};
    use tonic::codegen::BoxFuture;
    use tonic::transport::Channel;
    use tonic::{Request, Response, Status};
    use tonic_health::pb::HealthCheckRequest;
    use tonic_health::pb::health_client::HealthClient;

    async fn health_client(addr: SocketAddr) -> HealthClient<Channel> {
        let channel = Channel::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        HealthClient::new(channel)
    }

    fn unimplemented_handler() -> StreamHandler {
        Arc::new(
            |_req: Request<FrameStream>| -> BoxFuture<Response<FrameStream>, Status> {
                Box::pin(async { Err(Status::unimplemented("test")) })
            },
        )
    }

    #[tokio::test]
    async fn reports_registered_services_as_serving() {
        let server = GrpcServer::new("test");
        let desc = ServiceDesc::new("kas.test.v1.Testing").with_method("RequestResponse");
        server
            .registrar()
            .register_service(munge_descriptor(&desc, &unimplemented_handler()))
            .unwrap();

        let listener = GrpcServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(listener, shutdown.clone()));

        let mut client = health_client(addr).await;
        let response = client
            .check(HealthCheckRequest {
                service: "kas.test.v1.Testing".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            response.into_inner().status,
            tonic_health::pb::health_check_response::ServingStatus::Serving as i32
        );

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let server = GrpcServer::new("test")
            .with_max_conn_age(MaxConnAge::from_max_age(std::time::Duration::from_secs(60)));
        let listener = GrpcServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(listener, shutdown.clone()));

        let mut client = health_client(addr).await;
        let err = client
            .check(HealthCheckRequest {
                service: "kas.test.v1.Testing".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }
}
