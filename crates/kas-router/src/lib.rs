//! kas Router
//!
//! Routes gRPC calls for agents to the kas instance holding a tunnel to
//! the agent:
//! - gRPC plumbing: raw frame codec, stream visitor, runtime service
//!   descriptors
//! - Tunnel registry, tracker and finder interfaces
//! - Routing and gateway handlers
//! - Internal and private API servers

pub mod grpctool;
pub mod registry;
pub mod router;
pub mod server;
