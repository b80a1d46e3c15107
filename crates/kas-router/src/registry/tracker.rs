//! In-memory tunnel tracker.
//!
//! Knows every tunnel registered with it, keyed by agent id and then by
//! connection id. Suitable for a single kas instance or for tests; a
//! multi-instance deployment shares this data through an external store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use kas_proto::TunnelInfo;

use super::{QueryError, Querier, Registerer, TunnelInfoCallback};
use crate::grpctool::context::RequestContext;

type ConnectionMap = HashMap<i64, TunnelInfo>;

#[derive(Debug, Clone, Default)]
pub struct TunnelTracker {
    tunnels: Arc<RwLock<HashMap<i64, ConnectionMap>>>,
}

impl TunnelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tunnels tracked for `agent_id`.
    pub async fn tunnel_count(&self, agent_id: i64) -> usize {
        self.tunnels
            .read()
            .await
            .get(&agent_id)
            .map_or(0, HashMap::len)
    }
}

#[tonic::async_trait]
impl Registerer for TunnelTracker {
    async fn register_tunnel(&self, info: TunnelInfo) {
        debug!(
            agent_id = info.agent_id,
            connection_id = info.connection_id,
            kas_url = %info.kas_url,
            "Tunnel registered"
        );
        self.tunnels
            .write()
            .await
            .entry(info.agent_id)
            .or_default()
            .insert(info.connection_id, info);
    }

    async fn unregister_tunnel(&self, info: &TunnelInfo) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(connections) = tunnels.get_mut(&info.agent_id) {
            connections.remove(&info.connection_id);
            if connections.is_empty() {
                tunnels.remove(&info.agent_id);
                info!(agent_id = info.agent_id, "No tunnels left for agent");
            }
        }
    }
}

#[tonic::async_trait]
impl Querier for TunnelTracker {
    async fn get_tunnels_by_agent_id(
        &self,
        ctx: &RequestContext,
        agent_id: i64,
        cb: &mut TunnelInfoCallback<'_>,
    ) -> Result<(), QueryError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        // Snapshot so the callback runs without the lock held.
        let infos: Vec<TunnelInfo> = self
            .tunnels
            .read()
            .await
            .get(&agent_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        for info in infos {
            if cb(info).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::grpctool::context::ContextError;
    use std::ops::ControlFlow;

    fn info(agent_id: i64, connection_id: i64) -> TunnelInfo {
        TunnelInfo {
            agent_descriptor: None,
            connection_id,
            agent_id,
            kas_url: format!("tcp://kas-{connection_id}:8155"),
        }
    }

    async fn collect(tracker: &TunnelTracker, agent_id: i64) -> Vec<i64> {
        let mut ids = Vec::new();
        tracker
            .get_tunnels_by_agent_id(&RequestContext::background(), agent_id, &mut |i| {
                ids.push(i.connection_id);
                ControlFlow::Continue(())
            })
            .await
            .unwrap();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn tracks_tunnels_per_agent() {
        let tracker = TunnelTracker::new();
        tracker.register_tunnel(info(1, 10)).await;
        tracker.register_tunnel(info(1, 11)).await;
        tracker.register_tunnel(info(2, 20)).await;

        assert_eq!(collect(&tracker, 1).await, [10, 11]);
        assert_eq!(collect(&tracker, 2).await, [20]);
        assert!(collect(&tracker, 3).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_removes_only_that_connection() {
        let tracker = TunnelTracker::new();
        tracker.register_tunnel(info(1, 10)).await;
        tracker.register_tunnel(info(1, 11)).await;
        tracker.unregister_tunnel(&info(1, 10)).await;
        assert_eq!(collect(&tracker, 1).await, [11]);

        tracker.unregister_tunnel(&info(1, 11)).await;
        assert_eq!(tracker.tunnel_count(1).await, 0);
    }

    #[tokio::test]
    async fn break_stops_iteration() {
        let tracker = TunnelTracker::new();
        for c in 0..5 {
            tracker.register_tunnel(info(1, c)).await;
        }
        let mut seen = 0;
        tracker
            .get_tunnels_by_agent_id(&RequestContext::background(), 1, &mut |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .await
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn ended_context_fails_query() {
        let tracker = TunnelTracker::new();
        let ctx = RequestContext::background();
        ctx.cancel();
        let err = tracker
            .get_tunnels_by_agent_id(&ctx, 1, &mut |_| ControlFlow::Continue(()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Context(ContextError::Canceled)));
    }
}
