use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{GridError, Result};

/// Upper bound on a single frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Length-prefixed framing: a 4-byte big-endian length followed by that many bytes.
///
/// Partial reads are kept in the caller's buffer; a frame is yielded only once all of
/// its bytes have arrived.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    pending_len: Option<usize>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            pending_len: None,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = GridError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < LEN_PREFIX {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len > self.max_frame_len {
                    return Err(GridError::FrameTooLarge(len));
                }
                src.reserve(len);
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < len {
            return Ok(None);
        }
        self.pending_len = None;
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = GridError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_len {
            return Err(GridError::FrameTooLarge(item.len()));
        }
        dst.reserve(LEN_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn decode_json<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default()
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn decodes_whole_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = framed(b"hello");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"hello"[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_reads_are_buffered() {
        let mut codec = FrameCodec::default();
        let full = framed(b"partial frame");
        let mut buf = BytesMut::new();

        // Prefix split in the middle
        buf.extend_from_slice(&full[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[2..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[7..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            &b"partial frame"[..]
        );
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = framed(b"one");
        buf.extend_from_slice(&framed(b"two"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"one"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"two"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn empty_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = framed(b"");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 0);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(GridError::FrameTooLarge(9))
        ));

        let mut out = BytesMut::new();
        assert!(codec
            .encode(Bytes::from_static(b"123456789"), &mut out)
            .is_err());
    }
}
