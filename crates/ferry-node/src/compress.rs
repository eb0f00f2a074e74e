//! Optional gzip layer
//!
//! When the handshake ack requests compression, both sides wrap
//! their stream halves here. Everything after the handshake travels
//! through the gzip layer; the handshake itself never does. Frame
//! writes flush the encoder, so each message is decodable as soon as
//! it is sent.

use std::io;

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use tokio::io::{AsyncWriteExt, BufReader};

use crate::stream::{BoxReader, BoxWriter};

/// Wrap the read half in a gzip decoder when `compress` is set.
pub fn wrap_reader(raw: BoxReader, compress: bool) -> BoxReader {
    if compress {
        Box::new(GzipDecoder::new(BufReader::new(raw)))
    } else {
        raw
    }
}

/// Wrap the write half in a gzip encoder when `compress` is set.
///
/// The encoder is flushed once so the stream header goes out ahead
/// of the first message.
pub async fn wrap_writer(raw: BoxWriter, compress: bool) -> io::Result<BoxWriter> {
    if compress {
        let mut encoder = GzipEncoder::new(raw);
        encoder.flush().await?;
        Ok(Box::new(encoder))
    } else {
        Ok(raw)
    }
}
