use std::sync::Arc;

use log::{error, info};

use crate::blockchain::crypto::{public_key_from_hex, verify_signature};
use crate::blockchain::transaction::BALANCE_MARKER;
use crate::blockchain::{merkle_root, Address, Block, Ledger, ProofOfWork, Transaction};

/// Checks inbound transactions and blocks against the ledger
///
/// Every check is read-only. Failures are logged and reported as `false`.
pub struct Verifier {
    ledger: Arc<Ledger>,
    pow: ProofOfWork,
}

impl Verifier {
    pub fn new(ledger: Arc<Ledger>, pow: ProofOfWork) -> Self {
        Verifier { ledger, pow }
    }

    /// Verifies id, spendable balance and signature of a transaction
    ///
    /// # Arguments
    ///
    /// * `transaction` - The transaction to check
    ///
    /// # Returns
    ///
    /// `true` if every check passes; each failed check is logged
    pub fn verify_transaction(&self, transaction: &Transaction) -> bool {
        let id_valid = self.verify_transaction_id(transaction);
        let balance_sufficient = self.has_enough_balance(transaction);
        let signature_valid = id_valid && self.verify_transaction_signature(transaction);

        if !id_valid {
            info!("Transaction {} has a corrupted id", transaction.id());
        }

        if !balance_sufficient {
            info!(
                "Sender of transaction {} has not enough balance",
                transaction.id()
            );
        }

        if id_valid && !signature_valid {
            info!("Signature of transaction {} is not valid", transaction.id());
        }

        id_valid && balance_sufficient && signature_valid
    }

    /// Verifies proof of work, chain linkage and Merkle root of a block
    ///
    /// # Arguments
    ///
    /// * `block` - The block to check
    ///
    /// # Returns
    ///
    /// `true` if every check passes; each failed check is logged
    pub fn verify_block(&self, block: &Block) -> bool {
        let hash_valid = self.validate_block_hash(block);
        let previous_hash_valid = self.validate_previous_block_hash(block);
        let merkle_root_valid = self.validate_merkle_root(block);

        if !hash_valid {
            info!(
                "Block hash for block with index {} sealed at {} does not meet the difficulty",
                block.index, block.timestamp
            );
        }

        if !previous_hash_valid {
            info!(
                "Previous block hash for block with index {} sealed at {} not valid",
                block.index, block.timestamp
            );
        }

        if !merkle_root_valid {
            info!(
                "Merkle root for block with index {} sealed at {} corrupted",
                block.index, block.timestamp
            );
        }

        hash_valid && previous_hash_valid && merkle_root_valid
    }

    fn verify_transaction_id(&self, transaction: &Transaction) -> bool {
        transaction.recalculate_id() == transaction.id()
    }

    fn verify_transaction_signature(&self, transaction: &Transaction) -> bool {
        let Some(signature) = transaction.signature() else {
            return false;
        };

        let encoded_key = match self.ledger.public_key_for(transaction.from()) {
            Ok(Some(key)) => key,
            Ok(None) => {
                info!("No public key registered for wallet {}", transaction.from());
                return false;
            }
            Err(e) => {
                error!("Failed to look up public key for {}: {}", transaction.from(), e);
                return false;
            }
        };

        public_key_from_hex(&encoded_key)
            .and_then(|key| verify_signature(transaction.id().as_bytes(), signature, &key))
            .unwrap_or_else(|e| {
                error!("Signature verification error for {}: {}", transaction.id(), e);
                false
            })
    }

    fn has_enough_balance(&self, transaction: &Transaction) -> bool {
        let balance = self.chain_balance(transaction.from());
        let pending = match self.pending_amount(transaction.from()) {
            Some(pending) => pending,
            None => return false,
        };

        transaction.amount() <= balance - pending
    }

    /// Balance of `address` derived by scanning every block of the cached chain
    ///
    /// Transactions to the genesis balance marker credit every address.
    pub fn chain_balance(&self, address: &Address) -> f64 {
        self.ledger.with_chain(|chain| {
            let (mut incoming, mut outgoing) = (0.0, 0.0);

            for tx in chain.blocks().iter().flat_map(|b| b.transactions.iter()) {
                if tx.to().as_str() == BALANCE_MARKER || tx.to() == address {
                    incoming += tx.amount();
                }
                if tx.from() == address {
                    outgoing += tx.amount();
                }
            }

            incoming - outgoing
        })
    }

    /// Sum of pooled amounts sent by `address`; None if the pool is unreadable
    pub fn pending_amount(&self, address: &Address) -> Option<f64> {
        match self.ledger.all_pool_transactions() {
            Ok(pool) => Some(
                pool.iter()
                    .filter(|tx| tx.from() == address)
                    .map(Transaction::amount)
                    .sum(),
            ),
            Err(e) => {
                error!("Failed to read transaction pool: {}", e);
                None
            }
        }
    }

    fn validate_block_hash(&self, block: &Block) -> bool {
        self.pow.meets_target(&block.hash())
    }

    fn validate_previous_block_hash(&self, block: &Block) -> bool {
        let Some(previous_index) = block.index.checked_sub(1) else {
            return false;
        };

        match self.ledger.block_at(previous_index) {
            Ok(Some(previous)) => previous.hash() == block.header.previous_block_hash,
            Ok(None) => {
                info!("No block with index {} to link block {} to", previous_index, block.index);
                false
            }
            Err(e) => {
                error!("Failed to read block {}: {}", previous_index, e);
                false
            }
        }
    }

    fn validate_merkle_root(&self, block: &Block) -> bool {
        merkle_root(&block.transactions) == block.header.merkle_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{BlockAssembler, SledStore, Wallet};
    use crate::node::miner::hash_header;

    fn ledger() -> Arc<Ledger> {
        Arc::new(Ledger::open(Arc::new(SledStore::temporary().unwrap())).unwrap())
    }

    fn registered_wallet(ledger: &Ledger) -> Wallet {
        let wallet = Wallet::new();
        ledger
            .insert_public_key(wallet.address(), &wallet.public_key_hex())
            .unwrap();
        wallet
    }

    fn signed(wallet: &Wallet, to: &Address, amount: f64) -> Transaction {
        let mut tx = Transaction::new(wallet.address().clone(), to.clone(), amount);
        tx.sign(wallet).unwrap();
        tx
    }

    fn mined_block(ledger: &Ledger, pow: &ProofOfWork, transactions: Vec<Transaction>) -> Block {
        let assembler = BlockAssembler::new(pow.difficulty);
        let previous = ledger.last_block().unwrap();
        let mut header = assembler.build_header(previous.as_ref(), &transactions).unwrap();
        assert!(hash_header(&mut header, pow, || false).is_some());
        assembler.seal_block(ledger.tip_index() + 1, header, transactions)
    }

    #[test]
    fn test_genesis_allocation_scenario() {
        let ledger = ledger();
        let verifier = Verifier::new(ledger.clone(), ProofOfWork::with_difficulty(1));
        let a = registered_wallet(&ledger);
        let b = Wallet::new();

        assert_eq!(verifier.chain_balance(a.address()), 1000.0);
        assert!(verifier.verify_transaction(&signed(&a, b.address(), 100.0)));
        assert!(verifier.verify_transaction(&signed(&a, b.address(), 1000.0)));
        assert!(!verifier.verify_transaction(&signed(&a, b.address(), 1001.0)));
    }

    #[test]
    fn test_pending_pool_amount_is_reserved() {
        let ledger = ledger();
        let verifier = Verifier::new(ledger.clone(), ProofOfWork::with_difficulty(1));
        let a = registered_wallet(&ledger);
        let b = Wallet::new();

        ledger
            .insert_pool_transaction(&signed(&a, b.address(), 600.0))
            .unwrap();

        assert_eq!(verifier.pending_amount(a.address()), Some(600.0));
        assert!(verifier.verify_transaction(&signed(&a, b.address(), 400.0)));
        assert!(!verifier.verify_transaction(&signed(&a, b.address(), 400.5)));
    }

    #[test]
    fn test_mined_transactions_move_balance() {
        let ledger = ledger();
        let pow = ProofOfWork::with_difficulty(1);
        let verifier = Verifier::new(ledger.clone(), pow.clone());
        let a = registered_wallet(&ledger);
        let b = registered_wallet(&ledger);

        let block = mined_block(&ledger, &pow, vec![signed(&a, b.address(), 250.0)]);
        ledger.insert_block(&block).unwrap();

        assert_eq!(verifier.chain_balance(a.address()), 750.0);
        assert_eq!(verifier.chain_balance(b.address()), 1250.0);
        assert!(verifier.verify_transaction(&signed(&b, a.address(), 1250.0)));
        assert!(!verifier.verify_transaction(&signed(&a, b.address(), 751.0)));
    }

    #[test]
    fn test_tampered_transaction_is_rejected() {
        let ledger = ledger();
        let verifier = Verifier::new(ledger.clone(), ProofOfWork::with_difficulty(1));
        let a = registered_wallet(&ledger);

        let tx = signed(&a, &Address::from("b"), 10.0);
        let tampered = Transaction::from_parts(
            tx.id().to_string(),
            tx.from().clone(),
            tx.to().clone(),
            20.0,
            tx.timestamp(),
            tx.signature().cloned(),
        );

        assert!(verifier.verify_transaction(&tx));
        assert!(!verifier.verify_transaction(&tampered));
    }

    #[test]
    fn test_signature_requires_registered_matching_key() {
        let ledger = ledger();
        let verifier = Verifier::new(ledger.clone(), ProofOfWork::with_difficulty(1));

        let unregistered = Wallet::new();
        assert!(!verifier.verify_transaction(&signed(&unregistered, &Address::from("b"), 1.0)));

        let unsigned = Transaction::new(registered_wallet(&ledger).address().clone(), "b".into(), 1.0);
        assert!(!verifier.verify_transaction(&unsigned));

        // Registry entry points at a key the address was not derived from
        let impostor = Wallet::new();
        let victim = Wallet::new();
        ledger
            .insert_public_key(victim.address(), &impostor.public_key_hex())
            .unwrap();
        let unsigned = Transaction::new(victim.address().clone(), "b".into(), 1.0);
        let forged = Transaction::from_parts(
            unsigned.id().to_string(),
            unsigned.from().clone(),
            unsigned.to().clone(),
            unsigned.amount(),
            unsigned.timestamp(),
            Some(impostor.sign(unsigned.id().as_bytes())),
        );
        // The registry is trusted: whatever key it holds for an address decides
        assert!(verifier.verify_transaction(&forged));

        let honest_signature = Transaction::from_parts(
            unsigned.id().to_string(),
            unsigned.from().clone(),
            unsigned.to().clone(),
            unsigned.amount(),
            unsigned.timestamp(),
            Some(victim.sign(unsigned.id().as_bytes())),
        );
        assert!(!verifier.verify_transaction(&honest_signature));
    }

    #[test]
    fn test_verify_block_accepts_mined_block() {
        let ledger = ledger();
        let pow = ProofOfWork::with_difficulty(2);
        let verifier = Verifier::new(ledger.clone(), pow.clone());

        let block = mined_block(&ledger, &pow, vec![Transaction::new_coinbase("m".into(), 50.0)]);
        assert!(verifier.verify_block(&block));
    }

    #[test]
    fn test_verify_block_rejects_each_corruption() {
        let ledger = ledger();
        let pow = ProofOfWork::with_difficulty(2);
        let verifier = Verifier::new(ledger.clone(), pow.clone());
        let block = mined_block(&ledger, &pow, vec![Transaction::new_coinbase("m".into(), 50.0)]);

        // Transactions no longer match the Merkle root
        let mut swapped = block.clone();
        swapped.transactions = vec![Transaction::new_coinbase("thief".into(), 50.0)];
        assert!(!verifier.verify_block(&swapped));

        // Header without proof of work
        let mut unmined = block.clone();
        while pow.meets_target(&unmined.hash()) {
            unmined.header.nonce += 1;
        }
        assert!(!verifier.verify_block(&unmined));

        // Points to a height the ledger does not have
        let mut orphan = block.clone();
        orphan.index = 7;
        assert!(!verifier.verify_block(&orphan));

        let mut genesis_height = block;
        genesis_height.index = 0;
        assert!(!verifier.verify_block(&genesis_height));
    }
}
