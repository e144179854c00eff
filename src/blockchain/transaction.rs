use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{sha256_hex, Address, CryptoError, DigitalSignature, Wallet};

/// Sender of every coinbase transaction
pub const SYSTEM_WALLET: &str = "systemWallet";

/// Recipient marker of the genesis allocation; credits every address during the balance scan
pub const BALANCE_MARKER: &str = "balance";

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Current time truncated to the millisecond precision used in hash inputs
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Renders a timestamp the way it enters hash inputs
pub fn canonical_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Represents a transfer between two wallets
///
/// The id is computed once, at creation. Fields are private so a transaction
/// can only change through [`Transaction::sign`] or by being rebuilt from the
/// wire with [`Transaction::from_parts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    id: String,
    from: Address,
    to: Address,
    amount: f64,
    timestamp: DateTime<Utc>,
    signature: Option<DigitalSignature>,
}

impl Transaction {
    /// Creates a new unsigned transaction stamped with the current time
    pub fn new(from: Address, to: Address, amount: f64) -> Self {
        Self::with_timestamp(from, to, amount, now())
    }

    /// Creates a new unsigned transaction with an explicit timestamp
    pub fn with_timestamp(from: Address, to: Address, amount: f64, timestamp: DateTime<Utc>) -> Self {
        let timestamp = timestamp.trunc_subsecs(3);
        let id = Self::calculate_id(&from, &to, amount, &timestamp);

        Transaction {
            id,
            from,
            to,
            amount,
            timestamp,
            signature: None,
        }
    }

    /// Reproduces a transaction exactly as it was received from a peer
    ///
    /// Nothing is recomputed: a tampered id survives here and is caught by
    /// verification.
    pub fn from_parts(
        id: String,
        from: Address,
        to: Address,
        amount: f64,
        timestamp: DateTime<Utc>,
        signature: Option<DigitalSignature>,
    ) -> Self {
        Transaction {
            id,
            from,
            to,
            amount,
            timestamp,
            signature,
        }
    }

    /// Creates the coinbase transaction rewarding a miner
    pub fn new_coinbase(miner: Address, reward: f64) -> Self {
        Self::new(Address::from(SYSTEM_WALLET), miner, reward)
    }

    /// Signs the transaction id with the sender's wallet
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        if wallet.address() != &self.from {
            return Err(TransactionError::InvalidSenderAddress(
                "Wallet address does not match sender address".to_string(),
            ));
        }

        self.signature = Some(wallet.sign(self.id.as_bytes()));

        Ok(())
    }

    /// Hash of `from ‖ to ‖ amount ‖ timestamp`
    pub fn calculate_id(from: &Address, to: &Address, amount: f64, timestamp: &DateTime<Utc>) -> String {
        sha256_hex(&format!(
            "{}{}{}{}",
            from,
            to,
            amount,
            canonical_timestamp(timestamp)
        ))
    }

    /// Recomputes the id from the current fields
    pub fn recalculate_id(&self) -> String {
        Self::calculate_id(&self.from, &self.to, self.amount, &self.timestamp)
    }

    /// Full serialization hashed into a Merkle leaf, id and signature included
    pub fn transaction_data(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            self.from,
            self.to,
            self.amount,
            canonical_timestamp(&self.timestamp),
            self.id,
            self.signature.as_ref().map(|s| s.as_str()).unwrap_or_default()
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from(&self) -> &Address {
        &self.from
    }

    pub fn to(&self) -> &Address {
        &self.to
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn signature(&self) -> Option<&DigitalSignature> {
        self.signature.as_ref()
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.from.as_str() == SYSTEM_WALLET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_transaction() {
        let sender_wallet = Wallet::new();
        let recipient_wallet = Wallet::new();

        let transaction = Transaction::new(
            sender_wallet.address().clone(),
            recipient_wallet.address().clone(),
            10.5,
        );

        assert_eq!(transaction.from(), sender_wallet.address());
        assert_eq!(transaction.to(), recipient_wallet.address());
        assert_eq!(transaction.amount(), 10.5);
        assert_eq!(transaction.id(), transaction.recalculate_id());
        assert!(transaction.signature().is_none());
    }

    #[test]
    fn test_id_depends_on_every_field() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let base = Transaction::with_timestamp("a".into(), "b".into(), 1.0, ts);

        let other_to = Transaction::with_timestamp("a".into(), "c".into(), 1.0, ts);
        let other_amount = Transaction::with_timestamp("a".into(), "b".into(), 2.0, ts);
        let other_time = Transaction::with_timestamp(
            "a".into(),
            "b".into(),
            1.0,
            ts + chrono::Duration::milliseconds(1),
        );

        assert_ne!(base.id(), other_to.id());
        assert_ne!(base.id(), other_amount.id());
        assert_ne!(base.id(), other_time.id());
    }

    #[test]
    fn test_sign_transaction() {
        let sender_wallet = Wallet::new();
        let recipient_wallet = Wallet::new();

        let mut transaction = Transaction::new(
            sender_wallet.address().clone(),
            recipient_wallet.address().clone(),
            10.5,
        );

        transaction.sign(&sender_wallet).unwrap();
        assert!(transaction.signature().is_some());

        // Signing twice is rejected
        assert!(matches!(
            transaction.sign(&sender_wallet),
            Err(TransactionError::AlreadySigned)
        ));
    }

    #[test]
    fn test_sign_with_foreign_wallet_fails() {
        let sender_wallet = Wallet::new();
        let other_wallet = Wallet::new();

        let mut transaction = Transaction::new(sender_wallet.address().clone(), "b".into(), 1.0);

        assert!(matches!(
            transaction.sign(&other_wallet),
            Err(TransactionError::InvalidSenderAddress(_))
        ));
    }

    #[test]
    fn test_coinbase_transaction() {
        let miner_wallet = Wallet::new();
        let transaction = Transaction::new_coinbase(miner_wallet.address().clone(), 50.0);

        assert_eq!(transaction.from().as_str(), SYSTEM_WALLET);
        assert_eq!(transaction.to(), miner_wallet.address());
        assert_eq!(transaction.amount(), 50.0);
        assert!(transaction.is_coinbase());
    }

    #[test]
    fn test_wire_round_trip_keeps_id() {
        let wallet = Wallet::new();
        let mut transaction = Transaction::new(wallet.address().clone(), "b".into(), 3.25);
        transaction.sign(&wallet).unwrap();

        let json = serde_json::to_string(&transaction).unwrap();
        let received: Transaction = serde_json::from_str(&json).unwrap();

        assert_eq!(received, transaction);
        assert_eq!(received.recalculate_id(), received.id());
        assert_eq!(received.transaction_data(), transaction.transaction_data());
    }
}
