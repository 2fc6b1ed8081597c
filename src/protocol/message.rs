use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::scheduler::job::{JobHeader, JobReport};

/// Identifies which multiplexer a freshly accepted connection belongs to.
///
/// Sent by the connecting side as the payload of its very first frame, as a 4-byte
/// big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    ClientJob,
    NodeJob,
    ClientResource,
    NodeResource,
}

impl ChannelKind {
    pub fn id(self) -> u32 {
        match self {
            ChannelKind::ClientJob => 1,
            ChannelKind::NodeJob => 2,
            ChannelKind::ClientResource => 3,
            ChannelKind::NodeResource => 4,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(ChannelKind::ClientJob),
            2 => Some(ChannelKind::NodeJob),
            3 => Some(ChannelKind::ClientResource),
            4 => Some(ChannelKind::NodeResource),
            _ => None,
        }
    }

    pub fn identifier_frame(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(self.id());
        buf.freeze()
    }

    pub fn parse_identifier(frame: &[u8]) -> Result<Self> {
        let raw: [u8; 4] = frame
            .try_into()
            .map_err(|_| GridError::protocol(format!("bad identifier length {}", frame.len())))?;
        let id = u32::from_be_bytes(raw);
        Self::from_id(id).ok_or_else(|| GridError::protocol(format!("unknown channel id {id}")))
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelKind::ClientJob => "client_job",
            ChannelKind::NodeJob => "node_job",
            ChannelKind::ClientResource => "client_resource",
            ChannelKind::NodeResource => "node_resource",
        };
        f.write_str(name)
    }
}

/// Capabilities an executor reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub processing_threads: usize,
    pub hostname: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl SystemInfo {
    pub fn collect(processing_threads: usize, properties: HashMap<String, String>) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            processing_threads,
            hostname,
            properties,
        }
    }
}

/// Protocol metadata attached to a bundle header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleParams {
    #[serde(rename = "IS_PEER", default, skip_serializing_if = "Option::is_none")]
    pub is_peer: Option<bool>,
    /// Error raised on the executor outside any single unit; fails the whole bundle.
    #[serde(rename = "NODE_EXCEPTION", default, skip_serializing_if = "Option::is_none")]
    pub node_exception: Option<String>,
    #[serde(rename = "SYSTEM_INFO", default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
    #[serde(rename = "JOB_EXPIRED", default, skip_serializing_if = "is_false")]
    pub job_expired: bool,
    /// The bundle carries units that were already dispatched once.
    #[serde(rename = "JOB_REQUEUE", default, skip_serializing_if = "is_false")]
    pub job_requeue: bool,
    /// The job was admitted but is held until its start time.
    #[serde(rename = "JOB_PENDING", default, skip_serializing_if = "is_false")]
    pub job_pending: bool,
    #[serde(rename = "NODE_UUID", default, skip_serializing_if = "Option::is_none")]
    pub node_uuid: Option<Uuid>,
    #[serde(rename = "DRIVER_UUID", default, skip_serializing_if = "Option::is_none")]
    pub driver_uuid: Option<Uuid>,
    #[serde(rename = "CLIENT_UUID", default, skip_serializing_if = "Option::is_none")]
    pub client_uuid: Option<Uuid>,
    /// Total wall time the executor spent on the bundle, in milliseconds.
    #[serde(
        rename = "NODE_BUNDLE_ELAPSED",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub node_bundle_elapsed: Option<u64>,
    #[serde(rename = "THREAD_POOL_SIZE", default, skip_serializing_if = "Option::is_none")]
    pub thread_pool_size: Option<usize>,
    /// Abort every unit of this job on the receiving executor.
    #[serde(rename = "CANCEL_JOB", default, skip_serializing_if = "Option::is_none")]
    pub cancel_job: Option<Uuid>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleKind {
    Handshake,
    /// Followed by a data-context frame and `unit_count` unit frames.
    Dispatch,
    /// Followed by `unit_count` result frames.
    Results,
    /// Out-of-band control or status update; expects no reply.
    Notification,
}

/// Upper bound on buffers preallocated from a peer-announced unit count.
pub const MAX_PREALLOCATED_UNITS: usize = 4096;

/// First frame of every exchange on a node job channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleHeader {
    pub kind: BundleKind,
    #[serde(default)]
    pub bundle_id: u64,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub unit_count: usize,
    #[serde(default)]
    pub params: BundleParams,
}

impl BundleHeader {
    pub fn new(kind: BundleKind) -> Self {
        Self {
            kind,
            bundle_id: 0,
            job_id: None,
            job_name: None,
            unit_count: 0,
            params: BundleParams::default(),
        }
    }

    pub fn with_params(mut self, params: BundleParams) -> Self {
        self.params = params;
        self
    }

    pub fn expect_kind(&self, kind: BundleKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(GridError::protocol(format!(
                "expected {kind:?} header, got {:?}",
                self.kind
            )))
        }
    }
}

/// Messages a submitter sends on a client job channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake { params: BundleParams },
    /// Followed by a data-context frame and `header.unit_count` unit frames.
    Submit { header: JobHeader },
    Cancel { job_id: Uuid },
}

/// Messages the driver sends on a client job channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    Handshake { params: BundleParams },
    Accepted { job_id: Uuid, params: BundleParams },
    Rejected { job_id: Uuid, reason: String },
    CancelAck { job_id: Uuid, found: bool },
    Report { report: JobReport },
}

/// Messages exchanged on resource channels, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceMessage {
    /// Opening message of either side; `uuid` is the provider's client uuid or the node uuid.
    Hello { uuid: Uuid },
    Request {
        request_id: u64,
        submitter: Uuid,
        name: String,
    },
    /// `data` is `None` when the resource could not be resolved.
    Response {
        request_id: u64,
        submitter: Uuid,
        name: String,
        data: Option<Vec<u8>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_identifier_round_trip() {
        for kind in [
            ChannelKind::ClientJob,
            ChannelKind::NodeJob,
            ChannelKind::ClientResource,
            ChannelKind::NodeResource,
        ] {
            let frame = kind.identifier_frame();
            assert_eq!(frame.len(), 4);
            assert_eq!(ChannelKind::parse_identifier(&frame).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_channel_identifier() {
        assert!(ChannelKind::parse_identifier(&9u32.to_be_bytes()).is_err());
        assert!(ChannelKind::parse_identifier(&[0, 1]).is_err());
    }

    #[test]
    fn params_use_upper_case_names() {
        let params = BundleParams {
            is_peer: Some(false),
            job_requeue: true,
            node_bundle_elapsed: Some(42),
            ..BundleParams::default()
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["IS_PEER"], false);
        assert_eq!(json["JOB_REQUEUE"], true);
        assert_eq!(json["NODE_BUNDLE_ELAPSED"], 42);
        // Unset flags are omitted
        assert!(json.get("JOB_EXPIRED").is_none());
        assert!(json.get("NODE_EXCEPTION").is_none());
    }

    #[test]
    fn header_defaults_missing_fields() {
        let header: BundleHeader = serde_json::from_str(r#"{"kind":"handshake"}"#).unwrap();
        assert_eq!(header.kind, BundleKind::Handshake);
        assert_eq!(header.unit_count, 0);
        assert_eq!(header.params, BundleParams::default());
        assert!(header.expect_kind(BundleKind::Dispatch).is_err());
    }
}
