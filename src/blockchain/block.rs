use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::crypto::{sha256_hex, Address};
use super::merkle::merkle_root;
use super::transaction::{canonical_timestamp, now, Transaction, BALANCE_MARKER};

/// Sender of the genesis allocation
pub const GENESIS_ADDRESS: &str = "95f43a460e0135a5f8a26031d663c956f02cf01429b1812bd33769862af7611b";

/// Amount every address is credited with by the genesis allocation
pub const GENESIS_ALLOCATION: f64 = 1000.0;

/// Header of a block; its hash is what proof of work is computed over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the previous block's header
    pub previous_block_hash: String,

    /// Merkle root of the block's transactions
    pub merkle_root: String,

    /// Time the header was built, before mining started
    pub timestamp: DateTime<Utc>,

    /// Difficulty the header was mined at
    pub difficulty: usize,

    /// The only field changed while mining
    pub nonce: u64,
}

impl BlockHeader {
    pub fn new(previous_block_hash: String, merkle_root: String, difficulty: usize) -> Self {
        BlockHeader {
            previous_block_hash,
            merkle_root,
            timestamp: now(),
            difficulty,
            nonce: 0,
        }
    }

    /// Concatenation of all five fields in their fixed order
    pub fn hash_input(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.previous_block_hash,
            self.merkle_root,
            canonical_timestamp(&self.timestamp),
            self.difficulty,
            self.nonce
        )
    }

    /// Calculates the SHA-256 hash of the header
    pub fn calculate_hash(&self) -> String {
        sha256_hex(&self.hash_input())
    }
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Height of the block in the chain
    pub index: u64,

    pub header: BlockHeader,

    /// Transactions in the order they were committed to by the Merkle root
    pub transactions: Vec<Transaction>,

    pub transaction_count: usize,

    /// Time the block was sealed; decides which of two blocks at one height wins
    pub timestamp: DateTime<Utc>,
}

impl Block {
    /// Creates a block sealed now
    pub fn new(index: u64, header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self::with_timestamp(index, header, transactions, now())
    }

    /// Creates a block with an explicit seal time
    pub fn with_timestamp(
        index: u64,
        header: BlockHeader,
        transactions: Vec<Transaction>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Block {
            index,
            header,
            transaction_count: transactions.len(),
            transactions,
            timestamp,
        }
    }

    /// Hash of this block's header
    pub fn hash(&self) -> String {
        self.header.calculate_hash()
    }

    /// The hard-coded first block of every chain
    pub fn genesis() -> Self {
        // 2009-01-03T19:15:00Z
        let timestamp = DateTime::<Utc>::from(UNIX_EPOCH + Duration::from_secs(1_231_010_100));

        let allocation = Transaction::with_timestamp(
            Address::from(GENESIS_ADDRESS),
            Address::from(BALANCE_MARKER),
            GENESIS_ALLOCATION,
            timestamp,
        );
        let transactions = vec![allocation];

        let header = BlockHeader {
            previous_block_hash: "0".to_string(),
            merkle_root: merkle_root(&transactions),
            timestamp,
            difficulty: 0,
            nonce: 0,
        };

        Block::with_timestamp(0, header, transactions, timestamp)
    }
}
