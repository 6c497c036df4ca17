//! Peer wire messages
//!
//! One JSON object per line: `{"type": .., "from": "host:port", "data": ..}`.
//! Binary payloads travel as `0x` hex strings.

use crate::{Error, Result};
use ethers::types::Bytes;
use serde::{Deserialize, Serialize};

/// Liveness probe
pub const PING: &str = "PING";
/// Ask for the peer list
pub const REQ_PEERS: &str = "REQ:PEERS";
/// Peer list
pub const RES_PEERS: &str = "RES:PEERS";
/// Ask for blocks from a starting number
pub const REQ_BLOCKS: &str = "REQ:BLOCKS";
/// Encoded blocks
pub const RES_BLOCKS: &str = "RES:BLOCKS";
/// Encoded transaction
pub const ADD_TX: &str = "ADD:TX";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    from: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `PING`
    Ping,
    /// `REQ:PEERS`
    ReqPeers,
    /// `RES:PEERS` with peer identities
    ResPeers(Vec<String>),
    /// `REQ:BLOCKS` starting at this number
    ReqBlocks(u64),
    /// `RES:BLOCKS` with encoded blocks
    ResBlocks(Vec<Bytes>),
    /// `ADD:TX` with an encoded transaction
    AddTx(Bytes),
}

impl Payload {
    /// Wire type tag
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping => PING,
            Payload::ReqPeers => REQ_PEERS,
            Payload::ResPeers(_) => RES_PEERS,
            Payload::ReqBlocks(_) => REQ_BLOCKS,
            Payload::ResBlocks(_) => RES_BLOCKS,
            Payload::AddTx(_) => ADD_TX,
        }
    }
}

/// Message exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender identity (`externalHost:port`)
    pub from: String,
    /// Body
    pub payload: Payload,
}

impl Message {
    /// Create a message
    pub fn new(from: impl Into<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            payload,
        }
    }

    /// Serialize to one JSON line (without the newline)
    pub fn encode(&self) -> Result<String> {
        let data = match &self.payload {
            Payload::Ping | Payload::ReqPeers => serde_json::Value::Null,
            Payload::ResPeers(peers) => serde_json::to_value(peers)?,
            Payload::ReqBlocks(start) => serde_json::to_value(start)?,
            Payload::ResBlocks(blocks) => serde_json::to_value(blocks)?,
            Payload::AddTx(tx) => serde_json::to_value(tx)?,
        };
        let envelope = Envelope {
            kind: self.payload.kind().to_string(),
            from: self.from.clone(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse one JSON line
    pub fn decode(line: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(line)?;
        let payload = match envelope.kind.as_str() {
            PING => Payload::Ping,
            REQ_PEERS => Payload::ReqPeers,
            RES_PEERS => Payload::ResPeers(serde_json::from_value(envelope.data)?),
            REQ_BLOCKS => Payload::ReqBlocks(serde_json::from_value(envelope.data)?),
            RES_BLOCKS => Payload::ResBlocks(serde_json::from_value(envelope.data)?),
            ADD_TX => Payload::AddTx(serde_json::from_value(envelope.data)?),
            other => return Err(Error::Network(format!("Unknown message type: {}", other))),
        };
        Ok(Self {
            from: envelope.from,
            payload,
        })
    }
}
