//! Length-prefixed JSON frames
//!
//! A frame is a 4-byte unsigned length followed by that many bytes of JSON.
//! The stream transport writes the length big-endian; the messaging bridge
//! uses little-endian.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header length
pub const LENGTH_PREFIX: usize = 4;

/// Default largest accepted payload (16 MiB)
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Byte order of the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Codec turning frames into `T` values and back
#[derive(Debug)]
pub struct FrameCodec<T> {
    order: ByteOrder,
    max_frame: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    /// Codec with the given prefix byte order
    pub fn new(order: ByteOrder) -> Self {
        FrameCodec {
            order,
            max_frame: DEFAULT_MAX_FRAME,
            _marker: PhantomData,
        }
    }

    /// Big-endian codec used on the sync stream
    pub fn stream() -> Self {
        Self::new(ByteOrder::Big)
    }

    /// Little-endian codec used by the messaging bridge
    pub fn bridge() -> Self {
        Self::new(ByteOrder::Little)
    }

    /// Cap the payload size. The cap never exceeds what the prefix can encode.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.min(u32::MAX as usize);
        self
    }

    /// Wrap into a decoder that yields payload errors per frame
    pub fn tolerant(self) -> TolerantCodec<T> {
        TolerantCodec { inner: self }
    }

    /// Split one complete payload off `src`
    fn split_frame(&self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = self.read_len(src);
        if len > self.max_frame {
            return Err(Error::Format(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame
            )));
        }

        let total = LENGTH_PREFIX + len;
        if src.len() < total {
            // Wait for the rest of the frame
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(len)))
    }

    fn read_len(&self, prefix: &[u8]) -> usize {
        let mut bytes = [0u8; LENGTH_PREFIX];
        bytes.copy_from_slice(&prefix[..LENGTH_PREFIX]);
        match self.order {
            ByteOrder::Big => u32::from_be_bytes(bytes) as usize,
            ByteOrder::Little => u32::from_le_bytes(bytes) as usize,
        }
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        FrameCodec {
            order: self.order,
            max_frame: self.max_frame,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        match self.split_frame(src)? {
            Some(payload) => parse_payload(&payload).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Format(format!("malformed frame payload: {}", e)))
}

/// Decoder whose items carry their own parse result. A payload that is not
/// valid JSON for `T` is yielded as `Some(Err(..))` and the stream goes on;
/// only framing errors end it.
#[derive(Debug)]
pub struct TolerantCodec<T> {
    inner: FrameCodec<T>,
}

impl<T: DeserializeOwned> Decoder for TolerantCodec<T> {
    type Item = Result<T>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Result<T>>> {
        Ok(self
            .inner
            .split_frame(src)?
            .map(|payload| parse_payload(&payload)))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > self.max_frame {
            return Err(Error::Format(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_frame
            )));
        }

        dst.reserve(LENGTH_PREFIX + payload.len());
        match self.order {
            ByteOrder::Big => dst.put_u32(payload.len() as u32),
            ByteOrder::Little => dst.put_u32_le(payload.len() as u32),
        }
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn encoded(order: ByteOrder, value: Value) -> BytesMut {
        let mut codec = FrameCodec::<Value>::new(order);
        let mut buf = BytesMut::new();
        codec.encode(value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_big_endian_prefix() {
        let buf = encoded(ByteOrder::Big, json!({"type": "x"}));
        let len = buf.len() - LENGTH_PREFIX;
        assert_eq!(&buf[..4], &(len as u32).to_be_bytes());
    }

    #[test]
    fn test_little_endian_prefix() {
        let buf = encoded(ByteOrder::Little, json!({"type": "x"}));
        let len = buf.len() - LENGTH_PREFIX;
        assert_eq!(&buf[..4], &(len as u32).to_le_bytes());
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let value = json!({"type": "sync-request", "payload": {"deviceId": "a"}});
        let full = encoded(ByteOrder::Big, value.clone());
        let mut codec = FrameCodec::<Value>::stream();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; nothing decodes until the last one
        for (i, byte) in full.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none(), "decoded early at byte {}", i);
            } else {
                assert_eq!(decoded.unwrap(), value);
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut buf = encoded(ByteOrder::Little, json!(1));
        buf.extend_from_slice(&encoded(ByteOrder::Little, json!(2)));
        let mut codec = FrameCodec::<Value>::bridge();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!(2)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::<Value>::stream().with_max_frame(8);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Format(_))));

        let mut out = BytesMut::new();
        let result = codec.encode(json!("this is longer than eight bytes"), &mut out);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_malformed_json_is_format_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(b"{x}");
        let mut codec = FrameCodec::<Value>::stream();
        assert!(matches!(codec.decode(&mut buf), Err(Error::Format(_))));
    }

    #[test]
    fn test_tolerant_codec_keeps_going_after_bad_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(5);
        buf.extend_from_slice(b"{oops");
        buf.extend_from_slice(&encoded(ByteOrder::Little, json!({"type": "isUnlocked"})));
        let mut codec = FrameCodec::<Value>::bridge().tolerant();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(Error::Format(_))));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.unwrap(), json!({"type": "isUnlocked"}));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_max_frame_clamped_to_prefix_range() {
        let codec = FrameCodec::<Value>::stream().with_max_frame(usize::MAX);
        assert_eq!(codec.max_frame, u32::MAX as usize);
    }
}
