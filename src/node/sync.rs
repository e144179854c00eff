use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::watch;

use super::message::{Message, NodeData, Payload};
use super::resolver::ConflictResolver;
use super::transport::Transport;
use crate::blockchain::transaction::now;
use crate::blockchain::{Ledger, StorageError, Wallet};

/// Settings of the synchronization flows
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub min_connected_peers: usize,
    pub pool_sync_timeout: Duration,
    pub startup_poll: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            min_connected_peers: 2,
            pool_sync_timeout: Duration::from_secs(15),
            startup_poll: Duration::from_millis(500),
        }
    }
}

/// Keeps this node's ledger in step with its peers
///
/// Every applied data response bumps a counter published on a watch channel.
/// Waiting for "a response processed after X" is subscribing before X and
/// waiting for the next change.
pub struct SyncCoordinator {
    ledger: Arc<Ledger>,
    transport: Arc<dyn Transport>,
    resolver: Arc<ConflictResolver>,
    wallet: Arc<Wallet>,
    settings: SyncSettings,
    applied_responses: watch::Sender<u64>,
}

impl SyncCoordinator {
    pub fn new(
        ledger: Arc<Ledger>,
        transport: Arc<dyn Transport>,
        resolver: Arc<ConflictResolver>,
        wallet: Arc<Wallet>,
        settings: SyncSettings,
    ) -> Self {
        let (applied_responses, _) = watch::channel(0);
        SyncCoordinator {
            ledger,
            transport,
            resolver,
            wallet,
            settings,
            applied_responses,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// True if enough peers are connected to send to
    pub fn enough_peers(&self) -> bool {
        self.transport.connected_peer_count() >= self.settings.min_connected_peers
    }

    /// Waits for enough peers, then announces our key and asks for their data once
    pub async fn run_startup_sync(&self) {
        match self
            .ledger
            .insert_public_key(self.wallet.address(), &self.wallet.public_key_hex())
        {
            Ok(true) => info!("Registered own public key"),
            Ok(false) => {}
            Err(e) => error!("Failed to register own public key: {}", e),
        }

        let mut poll = tokio::time::interval(self.settings.startup_poll);
        while !self.enough_peers() {
            poll.tick().await;
        }

        info!(
            "{} peers connected, requesting node data",
            self.transport.connected_peer_count()
        );

        self.broadcast(Payload::PublicKey(self.wallet.public_key_hex())).await;
        self.broadcast(Payload::DataRequest).await;
    }

    /// True once a data response was applied since this node started
    pub fn is_synchronized(&self) -> bool {
        *self.applied_responses.borrow() > 0
    }

    /// Holds the caller until the first data response was applied
    pub async fn wait_until_synchronized(&self) {
        let mut responses = self.applied_responses.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = responses.wait_for(|applied| *applied > 0).await;
    }

    /// Requests fresh data before a mining attempt
    ///
    /// Returns the request time if a response was applied within the timeout.
    /// Only pool transactions older than that time may go into the block.
    pub async fn sync_pool_before_mining(&self) -> Option<DateTime<Utc>> {
        let mut responses = self.applied_responses.subscribe();
        let requested_at = now();
        self.broadcast(Payload::DataRequest).await;

        match tokio::time::timeout(self.settings.pool_sync_timeout, responses.changed()).await {
            Ok(Ok(())) => Some(requested_at),
            _ => {
                warn!(
                    "No data response within {:?} of the request sent at {}",
                    self.settings.pool_sync_timeout, requested_at
                );
                None
            }
        }
    }

    /// Merges a peer's pool, key registry and blocks into the ledger
    ///
    /// Registered public keys and occupied heights are left untouched. Applying
    /// a response releases everything waiting for the first sync.
    ///
    /// # Arguments
    ///
    /// * `data` - The snapshot a peer sent in answer to our data request
    pub async fn apply_data_response(&self, data: NodeData) {
        let mut new_transactions = 0;
        for transaction in &data.transaction_pool {
            match self.ledger.insert_pool_transaction(transaction) {
                Ok(true) => new_transactions += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to pool transaction {}: {}", transaction.id(), e),
            }
        }

        let mut new_wallets = 0;
        for (address, public_key) in &data.wallets {
            match self.ledger.insert_public_key(address, public_key) {
                Ok(true) => new_wallets += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to register public key of {}: {}", address, e),
            }
        }

        let mut new_blocks = 0;
        for block in data.blockchain.blocks() {
            if self.resolver.insert_if_absent(block).await {
                new_blocks += 1;
            }
        }

        if let Err(e) = self.ledger.flush() {
            error!("Failed to flush ledger: {}", e);
        }

        info!(
            "Applied node data: {} new transactions, {} new wallets, {} new blocks",
            new_transactions,
            new_wallets,
            new_blocks
        );

        self.applied_responses.send_modify(|applied| *applied += 1);
    }

    /// Snapshot of this node's pool, key registry and chain
    pub fn node_data(&self) -> Result<NodeData, StorageError> {
        Ok(NodeData {
            transaction_pool: self.ledger.all_pool_transactions()?,
            wallets: self.ledger.all_public_keys()?,
            blockchain: self.ledger.all_blocks()?,
        })
    }

    async fn broadcast(&self, payload: Payload) {
        let endpoint = payload.endpoint();
        let message = Message::broadcast(self.wallet.address(), payload);
        if let Err(e) = self.transport.broadcast(message).await {
            error!("Failed to broadcast {} message: {}", endpoint, e);
        }
    }
}
