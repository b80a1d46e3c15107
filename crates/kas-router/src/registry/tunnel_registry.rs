//! In-memory [`TunnelFinder`] for tunnels held by this kas instance.
//!
//! Idle tunnels wait in a per-agent pool. `find_tunnel` takes one out, or
//! waits until an agent connects. A tunnel released without being used goes
//! back to the pool; a used one is discarded, since the agent opens a fresh
//! tunnel per forwarded call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, oneshot};
use tonic::Status;
use tracing::{debug, info};

use kas_proto::{AgentDescriptor, TunnelInfo};

use super::{IncomingStream, Registerer, Tunnel, TunnelDataCallback, TunnelFinder};
use crate::grpctool::context::{ContextError, RequestContext};

struct PooledTunnel {
    info: TunnelInfo,
    tunnel: Box<dyn Tunnel>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<PooledTunnel>,
}

enum Claim {
    Idle(PooledTunnel),
    Wait(u64, oneshot::Receiver<PooledTunnel>),
}

#[derive(Default)]
struct Pool {
    idle: HashMap<i64, Vec<PooledTunnel>>,
    waiters: HashMap<i64, VecDeque<Waiter>>,
    shut_down: bool,
}

struct Shared {
    pool: Mutex<Pool>,
    registerer: Arc<dyn Registerer>,
    next_waiter_id: AtomicU64,
}

impl Shared {
    /// Hand `tunnel` to the oldest live waiter for its agent, or park it.
    async fn offer(&self, mut tunnel: PooledTunnel) {
        let agent_id = tunnel.info.agent_id;
        let mut pool = self.pool.lock().await;
        if pool.shut_down {
            drop(pool);
            tunnel.tunnel.done();
            return;
        }
        if let Some(waiters) = pool.waiters.get_mut(&agent_id) {
            while let Some(waiter) = waiters.pop_front() {
                match waiter.tx.send(tunnel) {
                    Ok(()) => {
                        debug!(agent_id, "Tunnel handed to waiting request");
                        return;
                    }
                    // The waiter gave up; try the next one.
                    Err(returned) => tunnel = returned,
                }
            }
            pool.waiters.remove(&agent_id);
        }
        self.registerer.register_tunnel(tunnel.info.clone()).await;
        pool.idle.entry(agent_id).or_default().push(tunnel);
    }
}

/// See the module documentation.
#[derive(Clone)]
pub struct TunnelRegistry {
    shared: Arc<Shared>,
    own_private_api_url: String,
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("own_private_api_url", &self.own_private_api_url)
            .finish_non_exhaustive()
    }
}

impl TunnelRegistry {
    /// `own_private_api_url` is recorded in every registered tunnel's info so
    /// sibling instances can route to it.
    pub fn new(registerer: Arc<dyn Registerer>, own_private_api_url: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: Mutex::new(Pool::default()),
                registerer,
                next_waiter_id: AtomicU64::new(0),
            }),
            own_private_api_url: own_private_api_url.into(),
        }
    }

    /// Make a newly connected agent tunnel available.
    pub async fn register_tunnel(
        &self,
        agent_id: i64,
        descriptor: AgentDescriptor,
        tunnel: Box<dyn Tunnel>,
    ) -> TunnelInfo {
        let info = TunnelInfo {
            agent_descriptor: Some(descriptor),
            connection_id: rand::random_range(0..i64::MAX),
            agent_id,
            kas_url: self.own_private_api_url.clone(),
        };
        self.shared
            .offer(PooledTunnel {
                info: info.clone(),
                tunnel,
            })
            .await;
        info
    }

    /// Number of idle tunnels for `agent_id`.
    pub async fn idle_count(&self, agent_id: i64) -> usize {
        self.shared
            .pool
            .lock()
            .await
            .idle
            .get(&agent_id)
            .map_or(0, Vec::len)
    }

    /// Release every idle tunnel and fail every pending `find_tunnel`.
    pub async fn shutdown(&self) {
        let mut pool = self.shared.pool.lock().await;
        pool.shut_down = true;
        pool.waiters.clear();
        let idle: Vec<PooledTunnel> = pool.idle.drain().flat_map(|(_, t)| t).collect();
        drop(pool);
        info!(released = idle.len(), "Tunnel registry shut down");
        for tunnel in idle {
            self.shared.registerer.unregister_tunnel(&tunnel.info).await;
            tunnel.tunnel.done();
        }
    }

    /// Take an idle tunnel, or queue a waiter. Both happen under one lock so
    /// a tunnel offered concurrently either is taken here or reaches the
    /// waiter.
    async fn claim(&self, agent_id: i64) -> Result<Claim, ContextError> {
        let mut pool = self.shared.pool.lock().await;
        if pool.shut_down {
            return Err(ContextError::Canceled);
        }
        let tunnel = pool.idle.get_mut(&agent_id).and_then(Vec::pop);
        if pool.idle.get(&agent_id).is_some_and(Vec::is_empty) {
            pool.idle.remove(&agent_id);
        }
        if let Some(t) = tunnel {
            self.shared.registerer.unregister_tunnel(&t.info).await;
            return Ok(Claim::Idle(t));
        }

        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let waiters = pool.waiters.entry(agent_id).or_default();
        waiters.retain(|w| !w.tx.is_closed());
        waiters.push_back(Waiter { id, tx });
        Ok(Claim::Wait(id, rx))
    }

    async fn remove_waiter(&self, agent_id: i64, id: u64) {
        let mut pool = self.shared.pool.lock().await;
        if let Some(waiters) = pool.waiters.get_mut(&agent_id) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                pool.waiters.remove(&agent_id);
            }
        }
    }

    fn lease(&self, tunnel: PooledTunnel) -> Box<dyn Tunnel> {
        Box::new(LeasedTunnel {
            tunnel: Some(tunnel),
            shared: Arc::clone(&self.shared),
            used: false,
        })
    }
}

#[tonic::async_trait]
impl TunnelFinder for TunnelRegistry {
    async fn find_tunnel(
        &self,
        ctx: &RequestContext,
        agent_id: i64,
    ) -> Result<Box<dyn Tunnel>, ContextError> {
        let (id, mut rx) = match self.claim(agent_id).await? {
            Claim::Idle(tunnel) => return Ok(self.lease(tunnel)),
            Claim::Wait(id, rx) => (id, rx),
        };
        match ctx.run(&mut rx).await {
            Ok(Ok(tunnel)) => Ok(self.lease(tunnel)),
            // Sender dropped: the registry is shutting down.
            Ok(Err(_)) => Err(ContextError::Canceled),
            Err(err) => {
                self.remove_waiter(agent_id, id).await;
                // A tunnel may have been handed over just before removal.
                if let Ok(tunnel) = rx.try_recv() {
                    self.shared.offer(tunnel).await;
                }
                Err(err)
            }
        }
    }
}

/// A tunnel taken out of the pool by `find_tunnel`.
struct LeasedTunnel {
    tunnel: Option<PooledTunnel>,
    shared: Arc<Shared>,
    used: bool,
}

#[tonic::async_trait]
impl Tunnel for LeasedTunnel {
    async fn forward_stream(
        &mut self,
        incoming: IncomingStream,
        cb: &mut dyn TunnelDataCallback,
    ) -> Result<(), Status> {
        if self.used {
            return Err(Status::internal("Tunnel has already been used"));
        }
        let pooled = self
            .tunnel
            .as_mut()
            .ok_or_else(|| Status::internal("Tunnel has already been released"))?;
        self.used = true;
        pooled.tunnel.forward_stream(incoming, cb).await
    }

    fn done(mut self: Box<Self>) {
        let Some(pooled) = self.tunnel.take() else {
            return;
        };
        if self.used {
            pooled.tunnel.done();
        } else {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move { shared.offer(pooled).await });
        }
    }
}
