//! Length-delimited JSON framing over TCP, optionally wrapped in TLS.

pub mod tls;

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::RemoteError;
use crate::protocol::{Frame, Request, Response};

/// Upper bound for one framed message.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Byte stream a connection can run over: plain `TcpStream` or a rustls `TlsStream`.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Encodes `Out` and decodes `In` as JSON inside length-delimited frames.
pub struct JsonCodec<Out, In> {
    frames: LengthDelimitedCodec,
    _types: PhantomData<fn(Out) -> In>,
}

impl<Out, In> JsonCodec<Out, In> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _types: PhantomData,
        }
    }
}

impl<Out, In> Default for JsonCodec<Out, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Out, In: DeserializeOwned> Decoder for JsonCodec<Out, In> {
    type Item = In;
    type Error = RemoteError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, RemoteError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<Out: Serialize, In> Encoder<Out> for JsonCodec<Out, In> {
    type Error = RemoteError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), RemoteError> {
        let payload = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

/// Client side: sends requests, reads responses.
pub type ClientCodec = JsonCodec<Frame<Request>, Frame<Response>>;

/// Server side. Request bodies are decoded after the id so a malformed body can still
/// be answered.
pub type ServerCodec = JsonCodec<Frame<Response>, Frame<Value>>;
