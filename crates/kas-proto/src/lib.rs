//! kas Protocol Buffers
//!
//! Generated protobuf code for the kas private API.
//!
//! This crate contains:
//! - `GatewayKasResponse` / `StartStreaming` exchanged between kas instances
//! - `TunnelInfo` and the agent descriptor stored by the tunnel tracker
//! - the `Testing` service used by the router test suite

#![allow(clippy::derive_partial_eq_without_eq)]

/// kas v1 private API definitions.
pub mod v1 {
    tonic::include_proto!("kas.v1");
}

/// Test-only service definitions.
pub mod test {
    pub mod v1 {
        tonic::include_proto!("kas.test.v1");
    }
}

// Re-export v1 as the default API version for convenience
pub use v1::*;
