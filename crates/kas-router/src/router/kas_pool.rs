//! Connections to sibling kas instances.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use url::Url;

use crate::grpctool::context::{ContextError, RequestContext};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid kas URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported kas URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("kas URL {0} has no host or port")]
    MissingAddress(String),
    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Opens connections to kas instances by private API URL.
#[tonic::async_trait]
pub trait KasPool: Send + Sync {
    /// Connect to `target`. The connection closes when the returned channel
    /// (and every clone of it) is dropped.
    async fn dial(&self, ctx: &RequestContext, target: &str) -> Result<Channel, PoolError>;
}

/// Dials a fresh connection per call. Only `tcp://host:port` URLs are
/// supported.
#[derive(Debug, Clone)]
pub struct DefaultKasPool {
    connect_timeout: Duration,
}

impl Default for DefaultKasPool {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DefaultKasPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn endpoint(&self, target: &str) -> Result<Endpoint, PoolError> {
        let url = Url::parse(target).map_err(|source| PoolError::InvalidUrl {
            url: target.to_owned(),
            source,
        })?;
        if url.scheme() != "tcp" {
            return Err(PoolError::UnsupportedScheme(url.scheme().to_owned()));
        }
        let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
            return Err(PoolError::MissingAddress(target.to_owned()));
        };
        let endpoint = Endpoint::from_shared(format!("http://{host}:{port}"))?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true);
        Ok(endpoint)
    }
}

#[tonic::async_trait]
impl KasPool for DefaultKasPool {
    async fn dial(&self, ctx: &RequestContext, target: &str) -> Result<Channel, PoolError> {
        let endpoint = self.endpoint(target)?;
        debug!(kas_url = target, "Dialing kas");
        Ok(ctx.run(endpoint.connect()).await??)
    }
}
