use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::crypto::Address;
use super::transaction::Transaction;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Durable storage the consensus core depends on
///
/// Blocks are keyed by height, pool and mined transactions by id, public keys
/// by wallet address.
pub trait LedgerStore: Send + Sync {
    /// Block with the greatest index
    fn last_block(&self) -> Result<Option<Block>, StorageError>;

    fn block_at(&self, index: u64) -> Result<Option<Block>, StorageError>;

    /// Inserts a block at a free height; returns false if the height is taken
    fn insert_block(&self, block: &Block) -> Result<bool, StorageError>;

    /// Replaces the block at `block.index` and drops the mined-transaction
    /// records of the block it displaces
    fn replace_block(&self, block: &Block) -> Result<(), StorageError>;

    /// Moves the block's transactions from the pool to mined storage
    fn move_mined_transactions(&self, block: &Block) -> Result<(), StorageError>;

    /// Adds a transaction to the pool; returns false if it is already pooled or mined
    fn insert_pool_transaction(&self, transaction: &Transaction) -> Result<bool, StorageError>;

    fn pool_transactions_before(&self, timestamp: DateTime<Utc>) -> Result<Vec<Transaction>, StorageError>;

    fn all_pool_transactions(&self) -> Result<Vec<Transaction>, StorageError>;

    /// Registers the public key of an address unless one is already registered
    ///
    /// # Arguments
    ///
    /// * `address` - The wallet address the key belongs to
    /// * `public_key` - Hex encoded Ed25519 public key
    ///
    /// # Returns
    ///
    /// `true` if the key was stored, `false` if the address already had a key.
    /// The first registered key is never overwritten.
    fn insert_public_key(&self, address: &Address, public_key: &str) -> Result<bool, StorageError>;

    fn public_key_for(&self, address: &Address) -> Result<Option<String>, StorageError>;

    fn all_public_keys(&self) -> Result<HashMap<Address, String>, StorageError>;

    /// All blocks sorted by index
    fn all_blocks(&self) -> Result<Vec<Block>, StorageError>;

    /// Flushes all pending writes to disk
    fn flush(&self) -> Result<(), StorageError>;
}

/// sled backed [`LedgerStore`]
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Tree for blocks, keyed by big-endian index
    blocks: Tree,

    /// Tree for transactions waiting to be mined
    pool: Tree,

    /// Tree for mined transactions, value is `(block index, transaction)`
    mined: Tree,

    /// Tree for the address to public key registry
    public_keys: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("blocks", &self.blocks.len())
            .field("pool", &self.pool.len())
            .finish()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

impl SledStore {
    /// Opens (or creates) a store in the given directory
    ///
    /// # Arguments
    ///
    /// * `path` - Directory of the sled database
    ///
    /// # Returns
    ///
    /// A store with the blocks, pool, mined and public key trees opened
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a store that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let pool = db.open_tree("transaction_pool")?;
        let mined = db.open_tree("mined_transactions")?;
        let public_keys = db.open_tree("public_keys")?;

        Ok(Self {
            db,
            blocks,
            pool,
            mined,
            public_keys,
        })
    }

    /// Decodes every value of a tree, skipping entries that fail to decode
    fn decode_all<T: DeserializeOwned>(tree: &Tree, what: &str) -> Result<Vec<T>, StorageError> {
        let mut items = Vec::new();
        let mut deserialization_errors = Vec::new();

        for result in tree.iter() {
            let (key, value) = result?;
            match decode::<T>(&value) {
                Ok(item) => items.push(item),
                Err(e) => {
                    let key_str = String::from_utf8_lossy(key.as_ref()).to_string();
                    deserialization_errors.push(format!("{} {}: {}", what, key_str, e));
                }
            }
        }

        if !deserialization_errors.is_empty() {
            warn!(
                "Some entries could not be deserialized: {}",
                deserialization_errors.join(", ")
            );
        }

        Ok(items)
    }

    fn record_mined(&self, index: u64, transactions: &[Transaction]) -> Result<(), StorageError> {
        for transaction in transactions {
            let key = transaction.id().as_bytes();
            self.pool.remove(key)?;
            self.mined.insert(key, encode(&(index, transaction))?)?;
        }
        Ok(())
    }
}

impl LedgerStore for SledStore {
    fn last_block(&self) -> Result<Option<Block>, StorageError> {
        match self.blocks.last()? {
            Some((_, value)) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn block_at(&self, index: u64) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(index.to_be_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn insert_block(&self, block: &Block) -> Result<bool, StorageError> {
        let value = encode(block)?;
        let swapped = self
            .blocks
            .compare_and_swap(block.index.to_be_bytes(), None as Option<&[u8]>, Some(value))?;
        Ok(swapped.is_ok())
    }

    fn replace_block(&self, block: &Block) -> Result<(), StorageError> {
        let displaced: Vec<sled::IVec> = self
            .mined
            .iter()
            .filter_map(|entry| entry.ok())
            .filter(|(_, value)| {
                decode::<(u64, Transaction)>(value)
                    .map(|(index, _)| index == block.index)
                    .unwrap_or(false)
            })
            .map(|(key, _)| key)
            .collect();

        for key in displaced {
            self.mined.remove(key)?;
        }

        self.blocks.insert(block.index.to_be_bytes(), encode(block)?)?;
        self.record_mined(block.index, &block.transactions)
    }

    fn move_mined_transactions(&self, block: &Block) -> Result<(), StorageError> {
        self.record_mined(block.index, &block.transactions)
    }

    fn insert_pool_transaction(&self, transaction: &Transaction) -> Result<bool, StorageError> {
        let key = transaction.id().as_bytes();
        if self.mined.contains_key(key)? {
            return Ok(false);
        }

        let swapped = self
            .pool
            .compare_and_swap(key, None as Option<&[u8]>, Some(encode(transaction)?))?;
        Ok(swapped.is_ok())
    }

    fn pool_transactions_before(&self, timestamp: DateTime<Utc>) -> Result<Vec<Transaction>, StorageError> {
        let mut transactions = self.all_pool_transactions()?;
        transactions.retain(|tx| tx.timestamp() < timestamp);
        Ok(transactions)
    }

    fn all_pool_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        let mut transactions: Vec<Transaction> = Self::decode_all(&self.pool, "transaction")?;
        transactions.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(transactions)
    }

    fn insert_public_key(&self, address: &Address, public_key: &str) -> Result<bool, StorageError> {
        let swapped = self.public_keys.compare_and_swap(
            address.as_str().as_bytes(),
            None as Option<&[u8]>,
            Some(public_key.as_bytes()),
        )?;
        Ok(swapped.is_ok())
    }

    fn public_key_for(&self, address: &Address) -> Result<Option<String>, StorageError> {
        Ok(self
            .public_keys
            .get(address.as_str().as_bytes())?
            .map(|value| String::from_utf8_lossy(&value).to_string()))
    }

    fn all_public_keys(&self) -> Result<HashMap<Address, String>, StorageError> {
        let mut keys = HashMap::new();
        for result in self.public_keys.iter() {
            let (address, key) = result?;
            keys.insert(
                Address(String::from_utf8_lossy(&address).to_string()),
                String::from_utf8_lossy(&key).to_string(),
            );
        }
        Ok(keys)
    }

    fn all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        // Big-endian keys iterate in index order
        Self::decode_all(&self.blocks, "block")
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
