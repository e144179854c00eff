use std::time::Duration;

pub const DEFAULT_DIFFICULTY: usize = 4;
pub const DEFAULT_MINING_CADENCE: Duration = Duration::from_secs(60);
pub const DEFAULT_MINER_STARTUP_DELAY: Duration = Duration::from_secs(120);
pub const DEFAULT_MINING_REWARD: f64 = 50.0;

/// Proof-of-work parameters shared by mining and verification
#[derive(Debug, Clone, PartialEq)]
pub struct ProofOfWork {
    /// Number of leading `'0'` hex characters a header hash must have
    pub difficulty: usize,

    /// Wall-clock period between two mining attempts
    pub mining_cadence: Duration,

    /// Time after node start before the first attempt may begin
    pub miner_startup_delay: Duration,

    /// Amount credited to the miner by the coinbase transaction
    pub mining_reward: f64,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        ProofOfWork {
            difficulty: DEFAULT_DIFFICULTY,
            mining_cadence: DEFAULT_MINING_CADENCE,
            miner_startup_delay: DEFAULT_MINER_STARTUP_DELAY,
            mining_reward: DEFAULT_MINING_REWARD,
        }
    }
}

impl ProofOfWork {
    pub fn with_difficulty(difficulty: usize) -> Self {
        ProofOfWork {
            difficulty,
            ..Self::default()
        }
    }

    /// True iff the first `difficulty` characters of `hash` are all `'0'`
    pub fn meets_target(&self, hash: &str) -> bool {
        hash.len() >= self.difficulty && hash.bytes().take(self.difficulty).all(|b| b == b'0')
    }
}
