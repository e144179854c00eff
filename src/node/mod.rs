// Node module
//
// This module contains the consensus runtime:
// - Message envelope and payloads exchanged with peers
// - The transport contract and its UDP gossip implementation
// - Verification, conflict resolution and synchronization
// - The mining scheduler
//
// `Node` owns all of them and dispatches inbound messages.

pub mod message;
pub mod miner;
pub mod resolver;
pub mod sync;
pub mod transport;
pub mod verification;

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Semaphore};

pub use message::{Endpoint, Message, NodeData, Payload};
pub use miner::{Miner, MinerState, MiningOutcome};
pub use resolver::{ConflictResolver, Resolution};
pub use sync::{SyncCoordinator, SyncSettings};
pub use transport::{Transport, TransportError, UdpTransport};
pub use verification::Verifier;

use crate::blockchain::{Block, Ledger, ProofOfWork, Transaction, Wallet};

/// A running blockchain node
pub struct Node {
    ledger: Arc<Ledger>,
    transport: Arc<dyn Transport>,
    wallet: Arc<Wallet>,
    verifier: Verifier,
    resolver: Arc<ConflictResolver>,
    sync: Arc<SyncCoordinator>,
    miner: Arc<Miner>,
}

impl Node {
    /// Wires the verifier, resolver, sync coordinator and miner around a ledger
    ///
    /// # Arguments
    ///
    /// * `ledger` - The opened ledger
    /// * `transport` - How messages reach peers
    /// * `wallet` - This node's key pair; its address names the node
    /// * `pow` - Consensus parameters
    /// * `sync_settings` - Peer threshold and sync timeouts
    pub fn new(
        ledger: Arc<Ledger>,
        transport: Arc<dyn Transport>,
        wallet: Wallet,
        pow: ProofOfWork,
        sync_settings: SyncSettings,
    ) -> Self {
        let wallet = Arc::new(wallet);
        let resolver = Arc::new(ConflictResolver::new(
            ledger.clone(),
            transport.clone(),
            wallet.address().clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            ledger.clone(),
            transport.clone(),
            resolver.clone(),
            wallet.clone(),
            sync_settings,
        ));
        let miner = Arc::new(Miner::new(
            ledger.clone(),
            sync.clone(),
            resolver.clone(),
            wallet.address().clone(),
            pow.clone(),
        ));

        Node {
            verifier: Verifier::new(ledger.clone(), pow),
            ledger,
            transport,
            wallet,
            resolver,
            sync,
            miner,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn miner(&self) -> &Arc<Miner> {
        &self.miner
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    /// Runs the startup sync in the background and schedules mining
    pub fn start(self: &Arc<Self>) {
        info!("Node {} starting", self.wallet.address());

        let sync = self.sync.clone();
        tokio::spawn(async move { sync.run_startup_sync().await });

        self.miner.start();
    }

    /// Drains inbound messages until the channel closes
    ///
    /// Each message is handled on its own task. Concurrent handlers are bounded
    /// by the available parallelism.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>) {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let permits = Arc::new(Semaphore::new(workers));
        info!("Handling inbound messages with {} workers", workers);

        while let Some(message) = inbound.recv().await {
            let node = self.clone();
            let permits = permits.clone();
            tokio::spawn(async move {
                // Held messages must not occupy a worker the data response needs
                if matches!(message.endpoint(), Endpoint::Transaction | Endpoint::Block) {
                    node.sync.wait_until_synchronized().await;
                }

                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                node.handle_message(message).await;
            });
        }

        debug!("Inbound channel closed");
    }

    /// Dispatches one message to the handler of its endpoint
    pub async fn handle_message(&self, message: Message) {
        debug!(
            "Received {} message {} from {}",
            message.endpoint(),
            message.message_id,
            message.sender
        );

        let Message {
            sender,
            receiver,
            payload,
            ..
        } = message;

        match payload {
            Payload::Transaction(transaction) => self.handle_transaction(transaction),
            Payload::Block(block) => self.handle_block(block).await,
            Payload::DataRequest => self.handle_data_request(sender).await,
            Payload::DataResponse(data) => {
                if receiver == self.wallet.address().as_str() {
                    self.sync.apply_data_response(data).await;
                }
            }
            Payload::PublicKey(public_key) => self.handle_public_key(sender, public_key),
        }
    }

    fn handle_transaction(&self, transaction: Transaction) {
        if !self.verifier.verify_transaction(&transaction) {
            info!("Transaction {} rejected", transaction.id());
            return;
        }

        match self.ledger.insert_pool_transaction(&transaction) {
            Ok(true) => info!("Transaction {} added to the pool", transaction.id()),
            Ok(false) => debug!("Transaction {} already known", transaction.id()),
            Err(e) => error!("Failed to pool transaction {}: {}", transaction.id(), e),
        }
    }

    async fn handle_block(&self, block: Block) {
        if !self.verifier.verify_block(&block) {
            info!("Block with index {} rejected", block.index);
            return;
        }

        if self.miner.currently_mining_index() == Some(block.index) {
            self.miner.stop_current_miner();
        }

        self.resolver.resolve(block, false).await;
    }

    async fn handle_data_request(&self, requester: String) {
        let data = match self.sync.node_data() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to collect node data for {}: {}", requester, e);
                return;
            }
        };

        let response = Message::new(self.wallet.address(), requester, Payload::DataResponse(data));
        if let Err(e) = self.transport.broadcast(response).await {
            error!("Failed to send node data: {}", e);
        }
    }

    fn handle_public_key(&self, sender: String, public_key: String) {
        match self.ledger.insert_public_key(&sender.as_str().into(), &public_key) {
            Ok(true) => info!("Registered public key of {}", sender),
            Ok(false) => warn!("Ignoring new public key for already registered {}", sender),
            Err(e) => error!("Failed to register public key of {}: {}", sender, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::blockchain::{Address, BlockAssembler, SledStore};
    use crate::node::miner::hash_header;
    use crate::node::transport::testing::MemoryTransport;

    struct Fixture {
        node: Arc<Node>,
        transport: Arc<MemoryTransport>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(Ledger::open(Arc::new(SledStore::temporary().unwrap())).unwrap());
        let transport = MemoryTransport::with_peers(2);
        let node = Arc::new(Node::new(
            ledger,
            transport.clone(),
            Wallet::new(),
            ProofOfWork::with_difficulty(1),
            SyncSettings {
                min_connected_peers: 2,
                pool_sync_timeout: Duration::from_millis(200),
                startup_poll: Duration::from_millis(10),
            },
        ));
        Fixture { node, transport }
    }

    fn peer_message(payload: Payload) -> Message {
        Message::broadcast(&Address::from("peer"), payload)
    }

    fn signed_by_registered(node: &Node, amount: f64) -> Transaction {
        let wallet = Wallet::new();
        node.ledger()
            .insert_public_key(wallet.address(), &wallet.public_key_hex())
            .unwrap();
        let mut tx = Transaction::new(wallet.address().clone(), "b".into(), amount);
        tx.sign(&wallet).unwrap();
        tx
    }

    fn mined_next_block(node: &Node) -> Block {
        let assembler = BlockAssembler::new(1);
        let previous = node.ledger().last_block().unwrap();
        let transactions = vec![Transaction::new_coinbase("peer".into(), 50.0)];
        let mut header = assembler.build_header(previous.as_ref(), &transactions).unwrap();
        hash_header(&mut header, &ProofOfWork::with_difficulty(1), || false).unwrap();
        assembler.seal_block(node.ledger().tip_index() + 1, header, transactions)
    }

    #[tokio::test]
    async fn test_valid_transaction_enters_pool() {
        let f = fixture();
        let good = signed_by_registered(&f.node, 10.0);
        let too_big = signed_by_registered(&f.node, 5000.0);

        f.node.handle_message(peer_message(Payload::Transaction(good.clone()))).await;
        f.node.handle_message(peer_message(Payload::Transaction(too_big))).await;

        assert_eq!(f.node.ledger().all_pool_transactions().unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn test_valid_block_is_resolved() {
        let f = fixture();
        let block = mined_next_block(&f.node);

        let mut corrupted = block.clone();
        corrupted.transactions.clear();
        f.node.handle_message(peer_message(Payload::Block(corrupted))).await;
        assert_eq!(f.node.ledger().tip_index(), 0);

        f.node.handle_message(peer_message(Payload::Block(block.clone()))).await;
        assert_eq!(f.node.ledger().block_at(1).unwrap(), Some(block));
        // Blocks from peers are not re-broadcast by the node itself
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_data_request_is_answered_to_sender() {
        let f = fixture();

        f.node.handle_message(peer_message(Payload::DataRequest)).await;

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].receiver, "peer");
        match &sent[0].payload {
            Payload::DataResponse(data) => assert_eq!(data.blockchain.len(), 1),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_response_applied_only_when_addressed_to_us() {
        let f = fixture();
        let mut data = NodeData::default();
        data.wallets.insert("w".into(), "key".to_string());

        let elsewhere = Message::new(&Address::from("peer"), "someone", Payload::DataResponse(data.clone()));
        f.node.handle_message(elsewhere).await;
        assert!(!f.node.sync().is_synchronized());

        let ours = Message::new(
            &Address::from("peer"),
            f.node.wallet().address().as_str(),
            Payload::DataResponse(data),
        );
        f.node.handle_message(ours).await;
        assert!(f.node.sync().is_synchronized());
        assert_eq!(
            f.node.ledger().public_key_for(&"w".into()).unwrap(),
            Some("key".to_string())
        );
    }

    #[tokio::test]
    async fn test_public_key_is_registered() {
        let f = fixture();

        f.node
            .handle_message(peer_message(Payload::PublicKey("abcd".into())))
            .await;

        assert_eq!(
            f.node.ledger().public_key_for(&"peer".into()).unwrap(),
            Some("abcd".to_string())
        );
    }

    #[tokio::test]
    async fn test_public_key_message_cannot_take_over_registered_address() {
        let f = fixture();
        let owner = Wallet::new();
        let intruder = Wallet::new();
        f.node
            .ledger()
            .insert_public_key(owner.address(), &owner.public_key_hex())
            .unwrap();

        let claim = Message::broadcast(owner.address(), Payload::PublicKey(intruder.public_key_hex()));
        f.node.handle_message(claim).await;

        assert_eq!(
            f.node.ledger().public_key_for(owner.address()).unwrap(),
            Some(owner.public_key_hex())
        );

        let unsigned = Transaction::new(owner.address().clone(), "b".into(), 10.0);
        let signed_with = |wallet: &Wallet| {
            Transaction::from_parts(
                unsigned.id().to_string(),
                unsigned.from().clone(),
                unsigned.to().clone(),
                unsigned.amount(),
                unsigned.timestamp(),
                Some(wallet.sign(unsigned.id().as_bytes())),
            )
        };
        assert!(!f.node.verifier.verify_transaction(&signed_with(&intruder)));
        assert!(f.node.verifier.verify_transaction(&signed_with(&owner)));
    }

    #[tokio::test]
    async fn test_block_for_height_being_mined_restarts_miner() {
        let f = fixture();
        let block = mined_next_block(&f.node);
        f.node.miner().mark_attempt(block.index);
        assert!(!f.node.miner().is_scheduled());

        f.node.handle_message(peer_message(Payload::Block(block.clone()))).await;

        assert_eq!(f.node.miner().state(), MinerState::Cancelled);
        assert_eq!(f.node.miner().currently_mining_index(), None);
        assert!(f.node.miner().is_scheduled());
        assert_eq!(f.node.ledger().block_at(1).unwrap(), Some(block));
    }

    #[tokio::test]
    async fn test_block_for_other_height_leaves_miner_alone() {
        let f = fixture();
        let block = mined_next_block(&f.node);
        f.node.miner().mark_attempt(block.index + 1);

        f.node.handle_message(peer_message(Payload::Block(block.clone()))).await;

        assert_eq!(f.node.miner().state(), MinerState::Hashing);
        assert_eq!(f.node.miner().currently_mining_index(), Some(block.index + 1));
        assert!(!f.node.miner().is_scheduled());
        assert_eq!(f.node.ledger().block_at(1).unwrap(), Some(block));
    }

    #[tokio::test]
    async fn test_run_holds_transactions_until_synchronized() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(f.node.clone().run(rx));

        let transaction = signed_by_registered(&f.node, 1.0);
        tx.send(peer_message(Payload::Transaction(transaction.clone())))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.node.ledger().all_pool_transactions().unwrap().is_empty());

        let response = Message::new(
            &Address::from("peer"),
            f.node.wallet().address().as_str(),
            Payload::DataResponse(NodeData::default()),
        );
        tx.send(response).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.node.ledger().all_pool_transactions().unwrap(), vec![transaction]);
    }
}
