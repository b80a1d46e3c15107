//! Pass-through codec for forwarding gRPC frames without decoding them.
//!
//! [`RawFrame`] carries the serialized bytes of one gRPC message verbatim.
//! Any other type implementing [`prost::Message`] goes through the regular
//! protobuf path, so a single [`RawCodec`] can forward opaque frames in one
//! direction and decode typed messages in the other.

use std::marker::PhantomData;

use prost::bytes::{Buf, BufMut, Bytes};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// One gRPC message, still serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub data: Bytes,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Serialize a protobuf message into a frame.
    pub fn from_message<M: prost::Message>(msg: &M) -> Self {
        Self {
            data: msg.encode_to_vec().into(),
        }
    }

    /// Parse the frame as a protobuf message.
    #[allow(clippy::result_large_err)]
    pub fn decode_message<M: prost::Message + Default>(&self) -> Result<M, Status> {
        M::decode(self.data.clone()).map_err(|e| {
            Status::internal(format!(
                "Failed to decode {}: {e}",
                std::any::type_name::<M>()
            ))
        })
    }
}

/// A message the raw codec knows how to put on and take off the wire.
pub trait CodecMessage: Sized + Send + 'static {
    #[allow(clippy::result_large_err)]
    fn encode_frame(self, dst: &mut EncodeBuf<'_>) -> Result<(), Status>;

    #[allow(clippy::result_large_err)]
    fn decode_frame(src: &mut DecodeBuf<'_>) -> Result<Self, Status>;
}

impl CodecMessage for RawFrame {
    fn encode_frame(self, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(self.data);
        Ok(())
    }

    fn decode_frame(src: &mut DecodeBuf<'_>) -> Result<Self, Status> {
        let len = src.remaining();
        Ok(Self {
            data: src.copy_to_bytes(len),
        })
    }
}

impl<M> CodecMessage for M
where
    M: prost::Message + Default + Send + 'static,
{
    fn encode_frame(self, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        self.encode(dst)
            .map_err(|e| Status::internal(format!("Failed to encode message: {e}")))
    }

    fn decode_frame(src: &mut DecodeBuf<'_>) -> Result<Self, Status> {
        M::decode(src).map_err(|e| Status::internal(format!("Failed to decode message: {e}")))
    }
}

/// gRPC codec that encodes `E` and decodes `D`, both [`CodecMessage`]s.
///
/// `RawCodec<RawFrame, RawFrame>` is the opaque forwarding codec used by
/// the router's servers.
#[derive(Debug)]
pub struct RawCodec<E = RawFrame, D = RawFrame>(PhantomData<fn(E) -> D>);

impl<E, D> Default for RawCodec<E, D> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<E, D> Clone for RawCodec<E, D> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<E: CodecMessage, D: CodecMessage> Codec for RawCodec<E, D> {
    type Encode = E;
    type Decode = D;
    type Encoder = RawEncoder<E>;
    type Decoder = RawDecoder<D>;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder(PhantomData)
    }
}

#[derive(Debug)]
pub struct RawEncoder<E>(PhantomData<fn(E)>);

impl<E: CodecMessage> Encoder for RawEncoder<E> {
    type Item = E;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode_frame(dst)
    }
}

#[derive(Debug)]
pub struct RawDecoder<D>(PhantomData<fn() -> D>);

impl<D: CodecMessage> Decoder for RawDecoder<D> {
    type Item = D;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        D::decode_frame(src).map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use kas_proto::test::v1::{Request, Response, response};

    #[test]
    fn frame_bytes_decode_as_original_message() {
        let frame = RawFrame::from_message(&Request { s1: "123".into() });
        let decoded: Request = frame.decode_message().unwrap();
        assert_eq!(decoded.s1, "123");
    }

    #[test]
    fn frame_preserves_unknown_bytes() {
        // Bytes that are not a valid protobuf still pass through untouched.
        let frame = RawFrame::new(vec![0xff, 0xff, 0xff]);
        assert_eq!(&frame.data[..], &[0xff, 0xff, 0xff]);
        assert!(frame.decode_message::<Response>().is_err());
    }

    #[test]
    fn oneof_message_survives_frame() {
        let msg = Response {
            message: Some(response::Message::Scalar(42)),
        };
        let decoded: Response = RawFrame::from_message(&msg).decode_message().unwrap();
        assert_eq!(decoded, msg);
    }
}
