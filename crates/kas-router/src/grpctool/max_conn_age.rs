//! Server keepalive parameters derived from a maximum connection age.

use std::time::Duration;

use tonic::transport::Server;

/// Idle connections are pinged this often, well under typical load balancer
/// idle timeouts.
const KEEPALIVE_TIME: Duration = Duration::from_secs(50);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Keepalive parameters for a server whose connections should be recycled
/// after roughly `max_age`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxConnAge {
    /// Age at which the server starts closing a connection: 65% of `max_age`.
    pub max_connection_age: Duration,
    /// Time in-flight calls get to finish after that: 20% of `max_age`.
    pub max_connection_age_grace: Duration,
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
}

impl MaxConnAge {
    pub fn from_max_age(max_age: Duration) -> Self {
        Self {
            max_connection_age: max_age * 65 / 100,
            max_connection_age_grace: max_age * 20 / 100,
            keepalive_time: KEEPALIVE_TIME,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
        }
    }

    /// Apply the parameters to a server builder.
    ///
    /// tonic has no separate grace setting; the grace period is folded into
    /// the age so connections are not cut earlier than `max_age * 85%`.
    pub fn apply(&self, server: Server) -> Server {
        server
            .http2_keepalive_interval(Some(self.keepalive_time))
            .http2_keepalive_timeout(Some(self.keepalive_timeout))
            .max_connection_age(self.max_connection_age + self.max_connection_age_grace)
    }
}
