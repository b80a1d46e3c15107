//! Ordering rules of `GatewayKasResponse` frames.

use kas_proto::GatewayKasResponse;
use kas_proto::gateway_kas_response::{Msg, TunnelReady};

use crate::grpctool::stream_visitor::{EOF_TAG, OneofMessage};

pub const TUNNEL_READY: i32 = 1;
pub const HEADER: i32 = 2;
pub const MESSAGE: i32 = 3;
pub const TRAILER: i32 = 4;
pub const ERROR: i32 = 5;

impl OneofMessage for GatewayKasResponse {
    type Variant = Msg;

    const ONEOF_NAME: &'static str = "msg";
    const TAGS: &'static [i32] = &[TUNNEL_READY, HEADER, MESSAGE, TRAILER, ERROR];
    const FIRST: &'static [i32] = &[TUNNEL_READY];

    fn next_allowed(tag: i32) -> &'static [i32] {
        match tag {
            TUNNEL_READY => &[HEADER, MESSAGE, TRAILER, ERROR, EOF_TAG],
            HEADER => &[MESSAGE, TRAILER, ERROR, EOF_TAG],
            MESSAGE => &[MESSAGE, TRAILER, ERROR, EOF_TAG],
            TRAILER => &[ERROR, EOF_TAG],
            ERROR => &[EOF_TAG],
            _ => &[],
        }
    }

    fn into_variant(self) -> Option<Msg> {
        self.msg
    }

    fn tag(variant: &Msg) -> i32 {
        match variant {
            Msg::TunnelReady(_) => TUNNEL_READY,
            Msg::Header(_) => HEADER,
            Msg::Message(_) => MESSAGE,
            Msg::Trailer(_) => TRAILER,
            Msg::Error(_) => ERROR,
        }
    }
}

pub fn wrap(msg: Msg) -> GatewayKasResponse {
    GatewayKasResponse { msg: Some(msg) }
}

pub fn tunnel_ready() -> GatewayKasResponse {
    wrap(Msg::TunnelReady(TunnelReady {}))
}
