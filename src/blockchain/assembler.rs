use thiserror::Error;

use super::block::{Block, BlockHeader};
use super::merkle::merkle_root;
use super::transaction::Transaction;

/// Errors that can occur while assembling a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("No previous block to build on")]
    MissingPreviousBlock,
}

/// Builds headers and blocks; never checks proof of work
#[derive(Debug, Clone)]
pub struct BlockAssembler {
    difficulty: usize,
}

impl BlockAssembler {
    pub fn new(difficulty: usize) -> Self {
        BlockAssembler { difficulty }
    }

    /// Builds the header of the block following `previous_block`
    ///
    /// # Arguments
    ///
    /// * `previous_block` - The current tip, if the ledger has one
    /// * `transactions` - The transactions the new block will commit to
    pub fn build_header(
        &self,
        previous_block: Option<&Block>,
        transactions: &[Transaction],
    ) -> Result<BlockHeader, BlockError> {
        let previous_block = previous_block.ok_or(BlockError::MissingPreviousBlock)?;

        Ok(BlockHeader::new(
            previous_block.hash(),
            merkle_root(transactions),
            self.difficulty,
        ))
    }

    /// Wraps a header and its transactions into a block sealed now
    pub fn seal_block(&self, index: u64, header: BlockHeader, transactions: Vec<Transaction>) -> Block {
        Block::new(index, header, transactions)
    }
}
