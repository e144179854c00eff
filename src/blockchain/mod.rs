// Blockchain module
//
// This module contains the ledger core:
// - Hashing, wallets and signatures
// - Transactions, block headers and blocks
// - The Merkle engine and the proof-of-work rule
// - Block assembly
// - The ledger (store contract plus in-memory chain cache)

pub mod assembler;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod merkle;
pub mod pow;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use assembler::{BlockAssembler, BlockError};
pub use block::{Block, BlockHeader};
pub use chain::{Blockchain, Ledger};
pub use crypto::{Address, DigitalSignature, Wallet};
pub use merkle::{merkle_root, EMPTY_MERKLE_ROOT};
pub use pow::ProofOfWork;
pub use storage::{LedgerStore, SledStore, StorageError};
pub use transaction::Transaction;
