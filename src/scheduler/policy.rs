use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::SystemInfo;

/// What the driver knows about a connected executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub uuid: Uuid,
    pub addr: Option<SocketAddr>,
    pub is_peer: bool,
    pub system_info: SystemInfo,
}

impl ExecutorInfo {
    pub fn new(uuid: Uuid, processing_threads: usize) -> Self {
        Self {
            uuid,
            addr: None,
            is_peer: false,
            system_info: SystemInfo {
                processing_threads,
                ..SystemInfo::default()
            },
        }
    }
}

/// Restricts which executors may receive units of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "args", rename_all = "snake_case")]
pub enum ExecutionPolicy {
    #[default]
    Any,
    Peer(bool),
    MinThreads(usize),
    PropertyEquals {
        key: String,
        value: String,
    },
    /// CIDR notation, e.g. `192.168.1.0/24`.
    Ipv4Subnet(String),
    And(Vec<ExecutionPolicy>),
    Or(Vec<ExecutionPolicy>),
    Not(Box<ExecutionPolicy>),
}

impl ExecutionPolicy {
    pub fn accepts(&self, executor: &ExecutorInfo) -> bool {
        match self {
            ExecutionPolicy::Any => true,
            ExecutionPolicy::Peer(peer) => executor.is_peer == *peer,
            ExecutionPolicy::MinThreads(n) => executor.system_info.processing_threads >= *n,
            ExecutionPolicy::PropertyEquals { key, value } => executor
                .system_info
                .properties
                .get(key)
                .is_some_and(|v| v == value),
            ExecutionPolicy::Ipv4Subnet(cidr) => match (parse_cidr(cidr), executor.addr) {
                (Ok((network, prefix)), Some(SocketAddr::V4(addr))) => {
                    in_subnet(*addr.ip(), network, prefix)
                }
                (Ok((network, prefix)), Some(SocketAddr::V6(addr))) => addr
                    .ip()
                    .to_ipv4_mapped()
                    .is_some_and(|ip| in_subnet(ip, network, prefix)),
                _ => false,
            },
            ExecutionPolicy::And(rules) => rules.iter().all(|r| r.accepts(executor)),
            ExecutionPolicy::Or(rules) => rules.iter().any(|r| r.accepts(executor)),
            ExecutionPolicy::Not(rule) => !rule.accepts(executor),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ExecutionPolicy::Ipv4Subnet(cidr) => parse_cidr(cidr).map(|_| ()),
            ExecutionPolicy::And(rules) | ExecutionPolicy::Or(rules) => {
                rules.iter().try_for_each(|r| r.validate())
            }
            ExecutionPolicy::Not(rule) => rule.validate(),
            _ => Ok(()),
        }
    }
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), String> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| format!("missing prefix length in {cidr}"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| format!("bad subnet address {addr}: {e}"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| format!("bad prefix length {prefix}: {e}"))?;
    if prefix > 32 {
        return Err(format!("prefix length {prefix} exceeds 32"));
    }
    Ok((addr, prefix))
}

fn in_subnet(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    u32::from(ip) & mask == u32::from(network) & mask
}
