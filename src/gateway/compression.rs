//! Inbound frame decompression.
//!
//! Two modes exist on the wire and are mutually exclusive per
//! connection: `zlib-stream` transport compression, where every frame
//! belongs to one shared zlib context and a message is complete once the
//! `00 00 ff ff` sync flush suffix arrives, and per-payload compression,
//! where each binary frame is an independent zlib document. Both are
//! pure transforms applied before envelope parsing.

use miniz_oxide::inflate::stream::InflateState;
use miniz_oxide::inflate::{self, TINFLStatus};
use miniz_oxide::{DataFormat, MZFlush};
use snafu::prelude::*;

/// Error when decompressing a frame
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum DecompressError {
    /// a payload-compressed frame was not a valid zlib document
    #[snafu(display("decompress payload failed: {status:?}"))]
    Payload {
        /// decompress error status code
        status: TINFLStatus,
    },

    /// the shared zlib context rejected a transport frame
    #[snafu(display("inflate stream failed: {status:?}"))]
    Stream {
        /// decompress error status code
        status: miniz_oxide::MZError,
    },
}

const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const INFLATE_CHUNK: usize = 4096;

/// Stateful inflater for one `zlib-stream` connection.
pub(crate) struct Inflater {
    state: Box<InflateState>,
    pending: Vec<u8>,
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            state: InflateState::new_boxed(DataFormat::Zlib),
            pending: Vec::with_capacity(INFLATE_CHUNK),
        }
    }

    /// Feed one transport frame.
    ///
    /// Returns a complete decompressed message once the sync flush
    /// suffix arrives, `None` while a message is still split across
    /// frames.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, DecompressError> {
        self.pending.extend_from_slice(chunk);

        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut output = Vec::with_capacity(self.pending.len() * 2);
        let mut buffer = [0u8; INFLATE_CHUNK];
        let mut offset = 0;

        while offset < self.pending.len() {
            let result = inflate::stream::inflate(
                &mut self.state,
                &self.pending[offset..],
                &mut buffer,
                MZFlush::Sync,
            );

            offset += result.bytes_consumed;
            output.extend_from_slice(&buffer[..result.bytes_written]);

            match result.status {
                Ok(_) => {}
                Err(status) => {
                    self.pending.clear();
                    return error::Stream { status }.fail();
                }
            }

            if result.bytes_consumed == 0 && result.bytes_written == 0 {
                break;
            }
        }

        self.pending.clear();
        Ok(Some(output))
    }
}

/// One-shot zlib decompression for payload-compressed binary frames.
pub(crate) fn inflate_payload(data: &[u8]) -> Result<Vec<u8>, DecompressError> {
    inflate::decompress_to_vec_zlib(data).map_err(|status| DecompressError::Payload { status })
}

#[cfg(test)]
mod test {
    use miniz_oxide::deflate::core::CompressorOxide;
    use miniz_oxide::deflate::{self, stream::deflate};

    use super::*;

    fn sync_flush_chunk(compressor: &mut CompressorOxide, data: &[u8]) -> Vec<u8> {
        let mut output = vec![0u8; data.len() * 2 + 128];
        let result = deflate(compressor, data, &mut output, MZFlush::Sync);
        result.status.unwrap();
        output.truncate(result.bytes_written);
        output
    }

    #[test]
    fn test_push_waits_for_suffix() {
        let mut compressor = CompressorOxide::default();
        let chunk = sync_flush_chunk(&mut compressor, b"{\"op\":11}");
        let (head, tail) = chunk.split_at(chunk.len() / 2);

        let mut inflater = Inflater::new();

        assert!(inflater.push(head).unwrap().is_none());
        assert_eq!(inflater.push(tail).unwrap().unwrap(), b"{\"op\":11}");
    }

    #[test]
    fn test_push_shares_context_across_messages() {
        let mut compressor = CompressorOxide::default();
        let first = sync_flush_chunk(&mut compressor, b"first message");
        let second = sync_flush_chunk(&mut compressor, b"second message");

        let mut inflater = Inflater::new();

        assert_eq!(inflater.push(&first).unwrap().unwrap(), b"first message");
        assert_eq!(inflater.push(&second).unwrap().unwrap(), b"second message");
    }

    #[test]
    fn test_inflate_payload_round_trip() {
        let compressed = deflate::compress_to_vec_zlib(b"payload body", 6);

        assert_eq!(inflate_payload(&compressed).unwrap(), b"payload body");
    }

    #[test]
    fn test_inflate_payload_rejects_garbage() {
        assert!(matches!(
            inflate_payload(b"definitely not zlib"),
            Err(DecompressError::Payload { .. })
        ));
    }
}
