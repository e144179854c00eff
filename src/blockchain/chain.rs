use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::block::Block;
use super::crypto::Address;
use super::storage::{LedgerStore, StorageError};
use super::transaction::Transaction;

/// Ordered list of blocks, index `i` at position `i`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blockchain {
    blocks: Vec<Block>,
}

impl Blockchain {
    pub fn new() -> Self {
        Blockchain { blocks: Vec::new() }
    }

    /// Builds a chain from blocks sorted by index
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        Blockchain { blocks }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn get(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    /// Appends a block if it is the next height; returns whether it was appended
    pub fn push(&mut self, block: Block) -> bool {
        if block.index != self.blocks.len() as u64 {
            return false;
        }
        self.blocks.push(block);
        true
    }

    /// Replaces the block at the same height; returns whether a block was replaced
    pub fn replace(&mut self, block: Block) -> bool {
        match usize::try_from(block.index).ok().and_then(|i| self.blocks.get_mut(i)) {
            Some(slot) => {
                *slot = block;
                true
            }
            None => false,
        }
    }

    /// Validates that every block links to the hash of its predecessor
    pub fn is_valid(&self) -> bool {
        self.blocks.windows(2).all(|pair| {
            let (previous, current) = (&pair[0], &pair[1]);
            current.index == previous.index + 1
                && current.header.previous_block_hash == previous.hash()
        })
    }
}

/// The ledger: durable store plus the in-memory chain cache
///
/// The cache is written only after the store accepted the same write, so it
/// never holds a block the store does not have.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    chain: RwLock<Blockchain>,
    tip: AtomicU64,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("tip", &self.tip_index())
            .finish()
    }
}

impl Ledger {
    /// Opens the ledger, inserting the genesis block into an empty store
    ///
    /// # Arguments
    ///
    /// * `store` - The durable store backing the ledger
    ///
    /// # Returns
    ///
    /// A ledger whose in-memory chain and tip mirror the store
    pub fn open(store: Arc<dyn LedgerStore>) -> Result<Self, StorageError> {
        let mut blocks = store.all_blocks()?;

        if blocks.is_empty() {
            let genesis = Block::genesis();
            store.insert_block(&genesis)?;
            store.flush()?;
            info!("Genesis block with index {} added to blockchain", genesis.index);
            blocks.push(genesis);
        } else {
            info!("Loaded {} blocks from storage", blocks.len());
        }

        let mut chain = Blockchain::new();
        for block in blocks {
            let index = block.index;
            if !chain.push(block) {
                warn!("Stored block {} does not extend the cached chain; ignoring it", index);
            }
        }

        if !chain.is_valid() {
            warn!("Stored chain has broken links");
        }

        let tip = chain.last().map(|b| b.index).unwrap_or_default();

        Ok(Ledger {
            store,
            chain: RwLock::new(chain),
            tip: AtomicU64::new(tip),
        })
    }

    /// Height of the last cached block; cheap enough to poll from the hash loop
    pub fn tip_index(&self) -> u64 {
        self.tip.load(Ordering::Acquire)
    }

    /// Runs `f` against the cached canonical chain
    pub fn with_chain<R>(&self, f: impl FnOnce(&Blockchain) -> R) -> R {
        let chain = self.chain.read().unwrap_or_else(PoisonError::into_inner);
        f(&chain)
    }

    pub fn chain_snapshot(&self) -> Blockchain {
        self.with_chain(Blockchain::clone)
    }

    pub fn last_block(&self) -> Result<Option<Block>, StorageError> {
        self.store.last_block()
    }

    pub fn block_at(&self, index: u64) -> Result<Option<Block>, StorageError> {
        self.store.block_at(index)
    }

    /// Inserts a block at a free height and appends it to the cache
    pub fn insert_block(&self, block: &Block) -> Result<bool, StorageError> {
        if !self.store.insert_block(block)? {
            return Ok(false);
        }

        let mut chain = self.chain.write().unwrap_or_else(PoisonError::into_inner);
        if chain.push(block.clone()) {
            self.tip.fetch_max(block.index, Ordering::AcqRel);
        } else {
            warn!(
                "Block {} stored but not cached: cache tip is {:?}",
                block.index,
                chain.last().map(|b| b.index)
            );
        }
        Ok(true)
    }

    /// Replaces the block at `block.index` in the store and the cache
    pub fn replace_block(&self, block: &Block) -> Result<(), StorageError> {
        self.store.replace_block(block)?;

        let mut chain = self.chain.write().unwrap_or_else(PoisonError::into_inner);
        if !chain.replace(block.clone()) {
            warn!("Replaced block {} is not in the cache", block.index);
        }
        Ok(())
    }

    pub fn move_mined_transactions(&self, block: &Block) -> Result<(), StorageError> {
        self.store.move_mined_transactions(block)
    }

    pub fn insert_pool_transaction(&self, transaction: &Transaction) -> Result<bool, StorageError> {
        self.store.insert_pool_transaction(transaction)
    }

    pub fn pool_transactions_before(&self, timestamp: DateTime<Utc>) -> Result<Vec<Transaction>, StorageError> {
        self.store.pool_transactions_before(timestamp)
    }

    pub fn all_pool_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        self.store.all_pool_transactions()
    }

    /// Registers a public key; an already registered address keeps its key
    ///
    /// # Arguments
    ///
    /// * `address` - The wallet address the key belongs to
    /// * `public_key` - Hex encoded Ed25519 public key
    ///
    /// # Returns
    ///
    /// `true` if the key was stored, `false` if the address already had one
    pub fn insert_public_key(&self, address: &Address, public_key: &str) -> Result<bool, StorageError> {
        self.store.insert_public_key(address, public_key)
    }

    pub fn public_key_for(&self, address: &Address) -> Result<Option<String>, StorageError> {
        self.store.public_key_for(address)
    }

    pub fn all_public_keys(&self) -> Result<HashMap<Address, String>, StorageError> {
        self.store.all_public_keys()
    }

    pub fn all_blocks(&self) -> Result<Blockchain, StorageError> {
        Ok(Blockchain::from_blocks(self.store.all_blocks()?))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.store.flush()
    }
}
