//! Chunked extended message support.
//!
//! USB PD 3.0+ supports extended messages that can exceed the maximum packet
//! size. These messages are split into chunks of up to 26 bytes each; the
//! receiver requests each following chunk explicitly.
//!
//! See USB PD Spec R3.2 Section 6.13.

use heapless::Vec;

use super::ExtendedHeader;
use crate::protocol_layer::message::ParseError;
use crate::protocol_layer::message::header::{ExtendedMessageType, Header};

/// Maximum data bytes in a single extended message chunk.
pub const MAX_EXTENDED_MSG_CHUNK_LEN: usize = 26;

/// Maximum total extended message length (data only, excluding headers).
pub const MAX_EXTENDED_MSG_LEN: usize = 260;

/// Maximum number of chunks (260 / 26 = 10).
pub const MAX_CHUNKS: usize = MAX_EXTENDED_MSG_LEN / MAX_EXTENDED_MSG_CHUNK_LEN;

/// Result of processing a received chunk.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkResult<T> {
    /// Message is complete and fully assembled.
    Complete(T),
    /// Need more chunks. Contains the chunk number to request next.
    NeedMoreChunks(u8),
    /// Received a chunk request from the other side.
    ChunkRequested(u8),
}

/// Assembler for chunked extended messages.
///
/// Accumulates chunks and reassembles the complete payload.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkedMessageAssembler {
    buffer: Vec<u8, MAX_EXTENDED_MSG_LEN>,
    expected_size: u16,
    message_type: Option<ExtendedMessageType>,
    next_chunk: u8,
    in_progress: bool,
}

impl Default for ChunkedMessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedMessageAssembler {
    /// Create a new chunked message assembler.
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            expected_size: 0,
            message_type: None,
            next_chunk: 0,
            in_progress: false,
        }
    }

    /// Reset the assembler state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Check if assembly is currently in progress.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Get the message type being assembled.
    pub fn message_type(&self) -> Option<ExtendedMessageType> {
        self.message_type
    }

    /// Process a received chunk.
    ///
    /// # Arguments
    /// * `header` - The PD message header
    /// * `ext_header` - The extended message header
    /// * `chunk_data` - The chunk payload data (without headers)
    ///
    /// # Returns
    /// * `ChunkResult::Complete` - All chunks received, returns assembled data
    /// * `ChunkResult::NeedMoreChunks` - Need to request more chunks
    /// * `ChunkResult::ChunkRequested` - This is a chunk request from the peer
    pub fn process_chunk(
        &mut self,
        header: Header,
        ext_header: ExtendedHeader,
        chunk_data: &[u8],
    ) -> Result<ChunkResult<Vec<u8, MAX_EXTENDED_MSG_LEN>>, ParseError> {
        let chunk_number = ext_header.chunk_number();
        let data_size = ext_header.data_size();

        // A chunk request carries no data of its own.
        if ext_header.request_chunk() {
            return Ok(ChunkResult::ChunkRequested(chunk_number));
        }

        if chunk_number == 0 {
            if self.in_progress {
                return Err(ParseError::ParserReuse);
            }
            self.expected_size = data_size;
            self.message_type = Some(header.message_type_raw().into());
            self.in_progress = true;
            self.next_chunk = 0;
        } else if !self.in_progress {
            return Err(ParseError::Other("received non-zero chunk without chunk 0"));
        } else if chunk_number != self.next_chunk {
            return Err(ParseError::Other("unexpected chunk number"));
        }

        // Chunks never exceed 26 bytes on the wire.
        if chunk_data.len() > MAX_EXTENDED_MSG_CHUNK_LEN {
            return Err(ParseError::ChunkOverflow(chunk_data.len(), MAX_EXTENDED_MSG_CHUNK_LEN));
        }

        if self.buffer.extend_from_slice(chunk_data).is_err() {
            return Err(ParseError::Other("chunk buffer overflow"));
        }
        self.next_chunk = chunk_number + 1;

        if self.buffer.len() >= self.expected_size as usize {
            self.in_progress = false;
            // Drop trailing padding beyond the advertised size.
            self.buffer.truncate(self.expected_size as usize);
            let assembled = self.buffer.clone();
            self.reset();
            Ok(ChunkResult::Complete(assembled))
        } else {
            Ok(ChunkResult::NeedMoreChunks(self.next_chunk))
        }
    }

    /// Build a chunk-request extended header for the given chunk number.
    pub fn chunk_request_header(chunk_number: u8) -> ExtendedHeader {
        ExtendedHeader::new(0)
            .with_chunked(true)
            .with_request_chunk(true)
            .with_chunk_number(chunk_number)
    }
}

/// Splits an extended payload into chunks for sending.
///
/// Iterating yields `(ExtendedHeader, chunk)` pairs in transmit order; the
/// sender must wait for the receiver's chunk request between them.
pub struct ChunkedMessageSender<'a> {
    data: &'a [u8],
    current_chunk: u8,
    total_chunks: u8,
}

impl<'a> ChunkedMessageSender<'a> {
    /// Create a new chunked message sender over the complete payload.
    pub fn new(data: &'a [u8]) -> Self {
        let total_chunks = if data.is_empty() {
            1
        } else {
            data.len().div_ceil(MAX_EXTENDED_MSG_CHUNK_LEN) as u8
        };

        Self {
            data,
            current_chunk: 0,
            total_chunks,
        }
    }

    /// Check if all chunks have been sent.
    pub fn is_complete(&self) -> bool {
        self.current_chunk >= self.total_chunks
    }

    /// Get the current chunk number.
    pub fn current_chunk(&self) -> u8 {
        self.current_chunk
    }

    /// Get the total number of chunks.
    pub fn total_chunks(&self) -> u8 {
        self.total_chunks
    }

    /// Get the total data size.
    pub fn data_size(&self) -> u16 {
        self.data.len() as u16
    }

    /// Get a specific chunk by number, e.g. when answering a chunk request.
    pub fn get_chunk(&self, chunk_number: u8) -> Option<(ExtendedHeader, &'a [u8])> {
        if chunk_number >= self.total_chunks {
            return None;
        }

        let start = chunk_number as usize * MAX_EXTENDED_MSG_CHUNK_LEN;
        let end = core::cmp::min(start + MAX_EXTENDED_MSG_CHUNK_LEN, self.data.len());
        let chunk_data = &self.data[start..end];

        let ext_header = ExtendedHeader::new(self.data.len() as u16)
            .with_chunked(true)
            .with_chunk_number(chunk_number);

        Some((ext_header, chunk_data))
    }
}

impl<'a> Iterator for ChunkedMessageSender<'a> {
    type Item = (ExtendedHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.get_chunk(self.current_chunk)?;
        self.current_chunk += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total_chunks - self.current_chunk) as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_single_chunk() {
        let data = [1u8, 2, 3, 4, 5];
        let mut sender = ChunkedMessageSender::new(&data);

        assert_eq!(sender.total_chunks(), 1);
        assert!(!sender.is_complete());

        let (ext_hdr, chunk) = sender.next().unwrap();
        assert_eq!(chunk, &data);
        assert_eq!(ext_hdr.data_size(), 5);
        assert_eq!(ext_hdr.chunk_number(), 0);
        assert!(ext_hdr.chunked());

        assert!(sender.is_complete());
        assert!(sender.next().is_none());
    }

    #[test]
    fn sender_splits_30_bytes_into_26_plus_4() {
        let data = [0u8; 30];
        let mut sender = ChunkedMessageSender::new(&data);

        assert_eq!(sender.total_chunks(), 2);

        let (ext_hdr, chunk) = sender.next().unwrap();
        assert_eq!(chunk.len(), 26);
        assert_eq!(ext_hdr.chunk_number(), 0);
        assert_eq!(ext_hdr.data_size(), 30);

        let (ext_hdr, chunk) = sender.next().unwrap();
        assert_eq!(chunk.len(), 4);
        assert_eq!(ext_hdr.chunk_number(), 1);
        assert_eq!(ext_hdr.data_size(), 30);

        assert!(sender.is_complete());
    }

    #[test]
    fn assembler_round_trip() {
        // Any payload up to 260 bytes, split by the sender and fed to the
        // assembler, reproduces the payload exactly.
        let payload: [u8; 77] = core::array::from_fn(|i| i as u8);
        let header = Header(0x9191); // Extended message header bits set.

        let sender = ChunkedMessageSender::new(&payload);
        let mut assembler = ChunkedMessageAssembler::new();
        let mut assembled = None;

        for (ext_header, chunk) in sender {
            match assembler.process_chunk(header, ext_header, chunk).unwrap() {
                ChunkResult::Complete(data) => assembled = Some(data),
                ChunkResult::NeedMoreChunks(_) => {}
                ChunkResult::ChunkRequested(_) => panic!("not a chunk request"),
            }
        }

        assert_eq!(&assembled.unwrap()[..], &payload);
    }

    #[test]
    fn assembler_single_chunk() {
        let mut assembler = ChunkedMessageAssembler::new();

        let header = Header(0x9191);
        let ext_header = ExtendedHeader::new(5).with_chunked(true).with_chunk_number(0);
        let data = [1u8, 2, 3, 4, 5];

        match assembler.process_chunk(header, ext_header, &data).unwrap() {
            ChunkResult::Complete(buf) => assert_eq!(&buf[..], &data),
            _ => panic!("Expected complete"),
        }
        assert!(!assembler.is_in_progress());
    }

    #[test]
    fn assembler_rejects_overlapping_messages() {
        let mut assembler = ChunkedMessageAssembler::new();

        let header = Header(0x9191);
        let ext_header = ExtendedHeader::new(30).with_chunked(true).with_chunk_number(0);
        let data = [1u8; 26];

        match assembler.process_chunk(header, ext_header, &data).unwrap() {
            ChunkResult::NeedMoreChunks(next) => assert_eq!(next, 1),
            _ => panic!("Expected NeedMoreChunks"),
        }

        // A second chunk 0 while assembly is in progress is a protocol error.
        let result = assembler.process_chunk(header, ext_header, &data);
        assert!(matches!(result, Err(ParseError::ParserReuse)));
    }

    #[test]
    fn assembler_rejects_out_of_order_chunks() {
        let mut assembler = ChunkedMessageAssembler::new();

        let header = Header(0x9191);
        let chunk_0 = ExtendedHeader::new(60).with_chunked(true).with_chunk_number(0);
        assembler.process_chunk(header, chunk_0, &[0u8; 26]).unwrap();

        let chunk_2 = ExtendedHeader::new(60).with_chunked(true).with_chunk_number(2);
        assert!(assembler.process_chunk(header, chunk_2, &[0u8; 26]).is_err());
    }

    #[test]
    fn assembler_rejects_oversized_chunks() {
        let mut assembler = ChunkedMessageAssembler::new();

        let header = Header(0x9191);
        let ext_header = ExtendedHeader::new(30).with_chunked(true).with_chunk_number(0);
        let oversized_chunk = [0u8; 27];

        let result = assembler.process_chunk(header, ext_header, &oversized_chunk);
        assert!(matches!(
            result,
            Err(ParseError::ChunkOverflow(27, MAX_EXTENDED_MSG_CHUNK_LEN))
        ));
    }

    #[test]
    fn chunk_requests_are_reported() {
        let mut assembler = ChunkedMessageAssembler::new();

        let header = Header(0x9191);
        let request = ChunkedMessageAssembler::chunk_request_header(3);
        match assembler.process_chunk(header, request, &[]).unwrap() {
            ChunkResult::ChunkRequested(chunk) => assert_eq!(chunk, 3),
            _ => panic!("Expected chunk request"),
        }
    }
}
