use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Result;
use crate::protocol::{encode_json, ChannelKind, FrameCodec};
use crate::transport::state::ChannelId;

/// Per-connection state owned by a multiplexer.
pub struct ChannelContext<S, D> {
    id: ChannelId,
    kind: ChannelKind,
    peer: Option<SocketAddr>,
    pub state: S,
    pub data: D,
    codec: FrameCodec,
    /// Bytes received but not yet forming a whole frame.
    read_buf: BytesMut,
    /// Encoded frames not yet handed to the writer task.
    write_buf: BytesMut,
    writer: Option<mpsc::Sender<Bytes>>,
    closing: bool,
}

impl<S, D> ChannelContext<S, D> {
    /// A context with no socket behind it. Written frames stay buffered until a writer
    /// is attached.
    pub fn new(
        id: ChannelId,
        kind: ChannelKind,
        peer: Option<SocketAddr>,
        state: S,
        data: D,
        max_frame_len: usize,
    ) -> Self {
        Self {
            id,
            kind,
            peer,
            state,
            data,
            codec: FrameCodec::new(max_frame_len),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            writer: None,
            closing: false,
        }
    }

    pub(crate) fn attach(&mut self, writer: mpsc::Sender<Bytes>) {
        self.writer = Some(writer);
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        self.codec.encode(frame, &mut self.write_buf)
    }

    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.write_frame(encode_json(value)?)
    }

    pub fn ingest(&mut self, chunk: &[u8]) {
        self.read_buf.extend_from_slice(chunk);
    }

    /// Next complete frame in the read buffer, if any.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        self.codec.decode(&mut self.read_buf)
    }

    pub fn buffered_read_len(&self) -> usize {
        self.read_buf.len()
    }

    pub fn pending_write_len(&self) -> usize {
        self.write_buf.len()
    }

    /// Hand buffered writes to the writer task. Returns false when the writer is gone or
    /// its queue is full because the peer stopped reading.
    pub fn flush(&mut self) -> bool {
        if self.write_buf.is_empty() {
            return true;
        }
        let Some(writer) = &self.writer else {
            return true;
        };
        match writer.try_send(self.write_buf.split().freeze()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(channel = self.id, "Write queue full, peer is not reading");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Decode and drain the frames buffered for writing. Used by detached contexts.
    pub fn take_written_frames(&mut self) -> Result<Vec<Bytes>> {
        let mut codec = FrameCodec::new(self.codec.max_frame_len());
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut self.write_buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_LEN;

    fn ctx() -> ChannelContext<u8, ()> {
        ChannelContext::new(7, ChannelKind::NodeJob, None, 0, (), DEFAULT_MAX_FRAME_LEN)
    }

    #[test]
    fn frames_assembled_across_chunks() {
        let mut ctx = ctx();
        let mut wire = BytesMut::new();
        FrameCodec::default()
            .encode(Bytes::from_static(b"abcdef"), &mut wire)
            .unwrap();

        ctx.ingest(&wire[..3]);
        assert!(ctx.next_frame().unwrap().is_none());
        assert_eq!(ctx.buffered_read_len(), 3);
        ctx.ingest(&wire[3..]);
        assert_eq!(ctx.next_frame().unwrap().unwrap(), &b"abcdef"[..]);
    }

    #[test]
    fn detached_writes_stay_buffered() {
        let mut ctx = ctx();
        ctx.write_frame(Bytes::from_static(b"one")).unwrap();
        ctx.write_json(&serde_json::json!({"k": 1})).unwrap();
        assert!(ctx.flush());
        assert!(ctx.pending_write_len() > 0);

        let frames = ctx.take_written_frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], &b"one"[..]);
        assert_eq!(ctx.pending_write_len(), 0);
    }

    #[tokio::test]
    async fn flush_hands_bytes_to_writer() {
        let mut ctx = ctx();
        let (tx, mut rx) = mpsc::channel(4);
        ctx.attach(tx);
        ctx.write_frame(Bytes::from_static(b"xy")).unwrap();
        assert!(ctx.flush());
        assert_eq!(rx.recv().await.unwrap(), &[0, 0, 0, 2, b'x', b'y'][..]);

        drop(rx);
        ctx.write_frame(Bytes::from_static(b"z")).unwrap();
        assert!(!ctx.flush());
    }

    #[test]
    fn full_write_queue_fails_flush() {
        let mut ctx = ctx();
        let (tx, _rx) = mpsc::channel(2);
        ctx.attach(tx);
        for _ in 0..2 {
            ctx.write_frame(Bytes::from_static(b"queued")).unwrap();
            assert!(ctx.flush());
        }
        ctx.write_frame(Bytes::from_static(b"stuck")).unwrap();
        assert!(!ctx.flush());
    }
}
