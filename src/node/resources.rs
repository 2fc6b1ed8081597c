use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::protocol::{decode_json, encode_json, ChannelKind, FrameCodec, ResourceMessage};

/// Executor end of a resource channel. Requests are answered one at a time.
pub struct ResourceClient {
    conn: Mutex<Framed<TcpStream, FrameCodec>>,
    next_request: AtomicU64,
}

impl ResourceClient {
    pub async fn connect(addr: &str, node_uuid: Uuid, max_frame_len: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, FrameCodec::new(max_frame_len));
        framed
            .send(ChannelKind::NodeResource.identifier_frame())
            .await?;
        framed
            .send(encode_json(&ResourceMessage::Hello { uuid: node_uuid })?)
            .await?;
        Ok(Self {
            conn: Mutex::new(framed),
            next_request: AtomicU64::new(1),
        })
    }

    /// Ask the driver for a resource of the given submitter. `None` when nobody could
    /// provide it.
    pub async fn fetch(&self, submitter: Uuid, name: &str) -> Result<Option<Vec<u8>>> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.conn.lock().await;
        conn.send(encode_json(&ResourceMessage::Request {
            request_id,
            submitter,
            name: name.to_string(),
        })?)
        .await?;

        while let Some(frame) = conn.next().await {
            match decode_json::<ResourceMessage>(&frame?)? {
                ResourceMessage::Response {
                    request_id: id,
                    data,
                    ..
                } if id == request_id => return Ok(data),
                other => {
                    tracing::debug!(request_id, message = ?other, "Ignoring unexpected resource message");
                }
            }
        }
        Err(GridError::ChannelClosed)
    }
}
