use std::sync::Arc;

use log::{error, info};
use tokio::sync::Mutex;

use super::message::{Message, Payload, ALL_NODES};
use super::transport::Transport;
use crate::blockchain::{Address, Block, Ledger, StorageError};

/// What happened to a block handed to the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The height was free and the block now occupies it
    Inserted,
    /// The block was sealed earlier than the one at its height and displaced it
    Replaced,
    /// The height is held by a block sealed no later than this one
    Discarded,
}

/// Decides the fate of every block proposed for a height
///
/// Decisions are serialized by one lock, so a locally mined block and a
/// peer's block for the same height can never both be inserted.
pub struct ConflictResolver {
    ledger: Arc<Ledger>,
    transport: Arc<dyn Transport>,
    address: Address,
    lock: Mutex<()>,
}

impl ConflictResolver {
    pub fn new(ledger: Arc<Ledger>, transport: Arc<dyn Transport>, address: Address) -> Self {
        ConflictResolver {
            ledger,
            transport,
            address,
            lock: Mutex::new(()),
        }
    }

    /// Inserts, replaces or discards `block`; the earlier seal timestamp wins
    ///
    /// A locally mined block that ends up in the ledger is broadcast to every
    /// node once the decision is made. A store failure leaves the ledger as it
    /// was and counts as a discard.
    ///
    /// # Arguments
    ///
    /// * `block` - A verified block
    /// * `mined_locally` - Whether this node sealed the block
    ///
    /// # Returns
    ///
    /// Whether the block was inserted, replaced the block at its height, or was discarded
    pub async fn resolve(&self, block: Block, mined_locally: bool) -> Resolution {
        let resolution = {
            let _guard = self.lock.lock().await;
            match self.decide(&block) {
                Ok(resolution) => resolution,
                Err(e) => {
                    error!("Failed to resolve block with index {}: {}", block.index, e);
                    Resolution::Discarded
                }
            }
        };

        if mined_locally && resolution != Resolution::Discarded {
            let message = Message::new(&self.address, ALL_NODES, Payload::Block(block));
            if let Err(e) = self.transport.broadcast(message).await {
                error!("Failed to broadcast mined block: {}", e);
            }
        }

        resolution
    }

    /// Inserts a block received through synchronization if its height is free
    ///
    /// Unlike [`resolve`](Self::resolve) an occupied height is never
    /// contested here.
    pub async fn insert_if_absent(&self, block: &Block) -> bool {
        let _guard = self.lock.lock().await;

        self.insert_free_height(block).unwrap_or_else(|e| {
            error!("Failed to insert synchronized block {}: {}", block.index, e);
            false
        })
    }

    fn insert_free_height(&self, block: &Block) -> Result<bool, StorageError> {
        if self.ledger.block_at(block.index)?.is_some() || !self.ledger.insert_block(block)? {
            return Ok(false);
        }
        self.ledger.move_mined_transactions(block)?;
        Ok(true)
    }

    fn decide(&self, block: &Block) -> Result<Resolution, StorageError> {
        match self.ledger.block_at(block.index)? {
            None => {
                if !self.ledger.insert_block(block)? {
                    return Ok(Resolution::Discarded);
                }
                self.ledger.move_mined_transactions(block)?;
                info!(
                    "Block with index {} sealed at {} added to blockchain",
                    block.index, block.timestamp
                );
                Ok(Resolution::Inserted)
            }
            Some(existing) if block.timestamp < existing.timestamp => {
                self.ledger.replace_block(block)?;
                info!(
                    "Block with index {} sealed at {} replaced the one sealed at {}",
                    block.index, block.timestamp, existing.timestamp
                );
                Ok(Resolution::Replaced)
            }
            Some(existing) => {
                info!(
                    "Block with index {} sealed at {} discarded, kept the one sealed at {}",
                    block.index, block.timestamp, existing.timestamp
                );
                Ok(Resolution::Discarded)
            }
        }
    }
}
