//! Framed codecs for worker communication.
//!
//! Job frames are chunked into fixed 512-byte packets: the first packet opens
//! with `[packet_count][payload_length]` (both u32 big-endian), the payload follows
//! and the last packet is padded with filler. Completion records are a single
//! 512-byte packet. Works over any AsyncRead/AsyncWrite (socket pairs, duplex pipes).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    CompletionRecord, CompletionStatus, FILLER, HEADER_SIZE, JobEnvelope, PACKET_SIZE, RECORD_SIZE,
};
use crate::error::EnvelopeError;

/// Number of packets needed to carry a payload of `payload_len` bytes.
///
/// Always at least one, even for an empty payload.
pub fn packet_count(payload_len: usize) -> usize {
    1 + (payload_len + HEADER_SIZE) / PACKET_SIZE
}

fn frame_length(payload_len: usize) -> io::Result<u32> {
    u32::try_from(payload_len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {payload_len} bytes exceeds the u32 length field"),
        )
    })
}

/// Raw packet framing: bytes in, bytes out.
///
/// Any payload that fits the u32 length field is encoded. `max_packets` only
/// guards decoding, and is unset by default.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packets: Option<u32>,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self { max_packets: None }
    }

    /// Treat incoming headers that announce more than `max_packets` as invalid.
    pub fn with_max_packets(mut self, max_packets: u32) -> Self {
        self.max_packets = Some(max_packets);
        self
    }

    fn header_is_valid(&self, count: u32, len: u32) -> bool {
        count != 0
            && self.max_packets.is_none_or(|max| count <= max)
            && u64::from(len) + HEADER_SIZE as u64 <= u64::from(count) * PACKET_SIZE as u64
    }
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < PACKET_SIZE {
                return Ok(None);
            }

            let count = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);

            if !self.header_is_valid(count, len) {
                tracing::warn!(
                    packet_count = count,
                    payload_length = len,
                    "Discarding packet with invalid frame header"
                );
                src.advance(PACKET_SIZE);
                continue;
            }

            let total = count as usize * PACKET_SIZE;
            if src.len() < total {
                // Remaining packets arrive on later readable events.
                return Ok(None);
            }

            let mut frame = src.split_to(total);
            frame.advance(HEADER_SIZE);
            frame.truncate(len as usize);
            return Ok(Some(frame.freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            tracing::warn!(
                buffered_bytes = src.len(),
                "Peer closed mid-frame, discarding partial message"
            );
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame_length(item.len())?;
        let packets = packet_count(item.len());
        // A u32 length never needs more than u32::MAX packets.
        let count = packets as u32;

        let total = packets * PACKET_SIZE;
        dst.reserve(total);
        dst.put_u32(count);
        dst.put_u32(len);
        dst.put_slice(&item);
        dst.put_bytes(FILLER, total - HEADER_SIZE - item.len());
        Ok(())
    }
}

/// Codec that frames jobs as packets and serializes them in a versioned JSON envelope.
///
/// Decoding yields `Ok(Err(_))` for a frame that arrived intact but held an
/// undecodable job, so the stream stays usable and the reader can move on.
pub struct JobCodec<J> {
    inner: PacketCodec,
    _phantom: PhantomData<J>,
}

impl<J> Default for JobCodec<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J> JobCodec<J> {
    pub fn new() -> Self {
        Self {
            inner: PacketCodec::new(),
            _phantom: PhantomData,
        }
    }

    /// Serialize `item` into the payload of one frame, ready for [`PacketCodec`].
    ///
    /// Fails without side effects when the job cannot be serialized or is too
    /// large for the frame header, so callers can check a job before claiming
    /// a worker for it.
    pub fn seal(item: &J) -> io::Result<Bytes>
    where
        J: Serialize,
    {
        let json = serde_json::to_vec(&JobEnvelope::new(item))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        frame_length(json_len)?;
        tracing::trace!(
            json_size_bytes = json_len,
            packets = packet_count(json_len),
            "Encoding job frame"
        );
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large job frame being encoded"
            );
        }
        Ok(Bytes::from(json))
    }

    fn open(bytes: &[u8]) -> Result<J, EnvelopeError>
    where
        J: DeserializeOwned,
    {
        serde_json::from_slice::<JobEnvelope<J>>(bytes)?.into_job()
    }
}

impl<J: DeserializeOwned> Decoder for JobCodec<J> {
    type Item = Result<J, EnvelopeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(|bytes| Self::open(&bytes)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode_eof(src)?.map(|bytes| Self::open(&bytes)))
    }
}

impl<J: Serialize> Encoder<J> for JobCodec<J> {
    type Error = io::Error;

    fn encode(&mut self, item: J, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = Self::seal(&item)?;
        self.inner.encode(frame, dst)
    }
}

/// Codec for the fixed-size completion records on the result channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionCodec;

impl CompletionCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for CompletionCodec {
    type Item = CompletionRecord;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < RECORD_SIZE {
            return Ok(None);
        }
        let mut record = src.split_to(RECORD_SIZE);
        let pid = record.get_u32();
        let status = CompletionStatus::from_code(record.get_u32());
        Ok(Some(CompletionRecord { pid, status }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }
        if !src.is_empty() {
            tracing::warn!(
                buffered_bytes = src.len(),
                "Result channel closed mid-record, discarding partial record"
            );
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<CompletionRecord> for CompletionCodec {
    type Error = io::Error;

    fn encode(&mut self, item: CompletionRecord, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(RECORD_SIZE);
        dst.put_u32(item.pid);
        dst.put_u32(item.status.code());
        dst.put_bytes(FILLER, RECORD_SIZE - HEADER_SIZE);
        Ok(())
    }
}
