//! Framed codec for the control channel.
//!
//! serde_json documents, framed either with a 4-byte length prefix or one per line.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LinesCodec, LinesCodecError};

/// How JSON documents are delimited on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Framing {
    #[default]
    LengthDelimited,
    /// Newline-delimited JSON, handy when debugging a worker by hand.
    Lines,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::LengthDelimited => "lengthDelimited",
            Framing::Lines => "lines",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lengthDelimited" => Some(Framing::LengthDelimited),
            "lines" => Some(Framing::Lines),
            _ => None,
        }
    }
}

enum Inner {
    LengthDelimited(LengthDelimitedCodec),
    Lines(LinesCodec),
}

/// Codec that frames messages and serializes them with JSON.
pub struct JsonCodec<T> {
    inner: Inner,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_framing(Framing::default())
    }

    pub fn with_framing(framing: Framing) -> Self {
        let inner = match framing {
            Framing::LengthDelimited => Inner::LengthDelimited(
                LengthDelimitedCodec::builder()
                    .length_field_length(4)
                    .new_codec(),
            ),
            Framing::Lines => Inner::Lines(LinesCodec::new()),
        };
        Self {
            inner,
            _phantom: PhantomData,
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let item = match &mut self.inner {
            Inner::LengthDelimited(codec) => match codec.decode(src)? {
                Some(bytes) => serde_json::from_slice(&bytes),
                None => return Ok(None),
            },
            Inner::Lines(codec) => loop {
                match codec.decode(src).map_err(lines_error)? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => break serde_json::from_str(&line),
                    None => return Ok(None),
                }
            },
        };
        item.map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.inner {
            Inner::Lines(codec) => match codec.decode_eof(src).map_err(lines_error)? {
                Some(line) if !line.trim().is_empty() => serde_json::from_str(&line)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
                _ => Ok(None),
            },
            Inner::LengthDelimited(_) => match self.decode(src)? {
                Some(item) => Ok(Some(item)),
                None if src.is_empty() => Ok(None),
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "bytes remaining on stream",
                )),
            },
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        match &mut self.inner {
            Inner::LengthDelimited(codec) => codec.encode(Bytes::from(json), dst),
            Inner::Lines(codec) => {
                // serde_json never emits a raw newline, so one document is one line.
                let line = String::from_utf8(json)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                codec.encode(line, dst).map_err(lines_error)
            }
        }
    }
}
