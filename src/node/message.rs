use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blockchain::{Address, Block, Blockchain, Transaction};

/// Receiver of a message flooded to every node
pub const BROADCAST: &str = "broadcast";

/// Receiver used for freshly mined blocks; also flooded to every node
pub const ALL_NODES: &str = "allNodes";

/// Which handler a message is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Transaction,
    Block,
    DataRequest,
    DataResponse,
    PublicKey,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of a node's ledger sent in answer to a data request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub transaction_pool: Vec<Transaction>,
    pub wallets: HashMap<Address, String>,
    pub blockchain: Blockchain,
}

/// Body of a message, one variant per endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "endpoint", content = "payload")]
pub enum Payload {
    Transaction(Transaction),
    Block(Block),
    DataRequest,
    DataResponse(NodeData),
    /// Hex encoded public key of the sender
    PublicKey(String),
}

impl Payload {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Payload::Transaction(_) => Endpoint::Transaction,
            Payload::Block(_) => Endpoint::Block,
            Payload::DataRequest => Endpoint::DataRequest,
            Payload::DataResponse(_) => Endpoint::DataResponse,
            Payload::PublicKey(_) => Endpoint::PublicKey,
        }
    }
}

/// Envelope exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    /// Wallet address of the node that created the message
    pub sender: String,
    /// [`BROADCAST`], [`ALL_NODES`] or the wallet address of a single node
    pub receiver: String,
    pub payload: Payload,
}

impl Message {
    pub fn new(sender: &Address, receiver: impl Into<String>, payload: Payload) -> Self {
        Message {
            message_id: Uuid::new_v4(),
            sender: sender.to_string(),
            receiver: receiver.into(),
            payload,
        }
    }

    pub fn broadcast(sender: &Address, payload: Payload) -> Self {
        Self::new(sender, BROADCAST, payload)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.payload.endpoint()
    }

    /// True if the message is meant for every node
    pub fn is_flooded(&self) -> bool {
        self.receiver == BROADCAST || self.receiver == ALL_NODES
    }

    /// True if the message is flooded or addressed to `address`
    pub fn is_for(&self, address: &Address) -> bool {
        self.is_flooded() || self.receiver == address.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_per_payload() {
        let sender = Address::from("node");
        let tx = Transaction::new("a".into(), "b".into(), 1.0);

        assert_eq!(
            Message::broadcast(&sender, Payload::Transaction(tx)).endpoint(),
            Endpoint::Transaction
        );
        assert_eq!(
            Message::broadcast(&sender, Payload::Block(Block::genesis())).endpoint(),
            Endpoint::Block
        );
        assert_eq!(
            Message::broadcast(&sender, Payload::DataRequest).endpoint(),
            Endpoint::DataRequest
        );
        assert_eq!(
            Message::new(&sender, "other", Payload::DataResponse(NodeData::default())).endpoint(),
            Endpoint::DataResponse
        );
        assert_eq!(
            Message::broadcast(&sender, Payload::PublicKey("ab".into())).endpoint(),
            Endpoint::PublicKey
        );
    }

    #[test]
    fn test_receiver_matching() {
        let me = Address::from("me");
        let sender = Address::from("node");

        assert!(Message::broadcast(&sender, Payload::DataRequest).is_for(&me));
        assert!(Message::new(&sender, ALL_NODES, Payload::DataRequest).is_for(&me));
        assert!(Message::new(&sender, "me", Payload::DataRequest).is_for(&me));
        assert!(!Message::new(&sender, "someone", Payload::DataRequest).is_for(&me));
    }

    #[test]
    fn test_json_envelope() {
        let sender = Address::from("node");
        let mut data = NodeData::default();
        data.wallets.insert(Address::from("w"), "key".to_string());
        data.blockchain = Blockchain::from_blocks(vec![Block::genesis()]);
        let message = Message::new(&sender, "peer", Payload::DataResponse(data));

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["payload"]["endpoint"], "DataResponse");
        assert_eq!(json["receiver"], "peer");

        let decoded: Message = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, message);

        let request = Message::broadcast(&sender, Payload::DataRequest);
        let decoded: Message = serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }
}
