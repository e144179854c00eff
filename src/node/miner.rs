use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::resolver::{ConflictResolver, Resolution};
use super::sync::SyncCoordinator;
use crate::blockchain::transaction::now;
use crate::blockchain::{Address, BlockAssembler, BlockHeader, Ledger, ProofOfWork, Transaction};

/// Where the current mining attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Assembling,
    Hashing,
    Sealed,
    /// Another block for the target height landed while hashing
    Superseded,
    /// The schedule was stopped from outside
    Cancelled,
}

/// Result of one mining cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningOutcome {
    /// Not enough peers, or the pool sync timed out
    Skipped,
    Sealed(Resolution),
    Superseded,
    Failed,
}

/// Searches for a nonce whose header hash meets the difficulty
///
/// Starts at the header's current nonce. `superseded` is polled before each
/// attempt; once it returns true the search gives up and returns None.
pub fn hash_header(
    header: &mut BlockHeader,
    pow: &ProofOfWork,
    superseded: impl Fn() -> bool,
) -> Option<String> {
    loop {
        if superseded() {
            return None;
        }

        let hash = header.calculate_hash();
        if pow.meets_target(&hash) {
            return Some(hash);
        }

        header.nonce = header.nonce.wrapping_add(1);
    }
}

/// Time from `now` until the first cadence boundary at or after `earliest_start`
///
/// Boundaries are multiples of `cadence` since the Unix epoch.
pub fn delay_until_next_boundary(
    now: DateTime<Utc>,
    earliest_start: DateTime<Utc>,
    cadence: Duration,
) -> Duration {
    let start = earliest_start.max(now).timestamp_millis();
    let cadence = cadence.as_millis() as i64;

    let boundary = if cadence == 0 {
        start
    } else {
        start.div_euclid(cadence) * cadence + if start % cadence == 0 { 0 } else { cadence }
    };

    Duration::from_millis((boundary - now.timestamp_millis()).max(0) as u64)
}

/// Runs a mining attempt on every cadence boundary
pub struct Miner {
    ledger: Arc<Ledger>,
    sync: Arc<SyncCoordinator>,
    resolver: Arc<ConflictResolver>,
    address: Address,
    pow: ProofOfWork,
    assembler: BlockAssembler,
    started_at: DateTime<Utc>,
    /// Height of the block being mined, 0 when idle
    mining_index: AtomicU64,
    state: Mutex<MinerState>,
    schedule: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    /// Creates an idle miner; nothing runs until [`Miner::start`]
    ///
    /// # Arguments
    ///
    /// * `ledger` - The ledger blocks are built on
    /// * `sync` - Peer count and pool sync before each attempt
    /// * `resolver` - Decides the fate of sealed blocks
    /// * `address` - Receiver of the coinbase reward
    /// * `pow` - Difficulty, cadence, startup delay and reward
    pub fn new(
        ledger: Arc<Ledger>,
        sync: Arc<SyncCoordinator>,
        resolver: Arc<ConflictResolver>,
        address: Address,
        pow: ProofOfWork,
    ) -> Self {
        Miner {
            ledger,
            sync,
            resolver,
            address,
            assembler: BlockAssembler::new(pow.difficulty),
            pow,
            started_at: now(),
            mining_index: AtomicU64::new(0),
            state: Mutex::new(MinerState::Idle),
            schedule: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MinerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Height currently being mined, if an attempt is under way
    pub fn currently_mining_index(&self) -> Option<u64> {
        match self.mining_index.load(Ordering::Acquire) {
            0 => None,
            index => Some(index),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Schedules mining on the next cadence boundary after the startup delay
    pub fn start(self: &Arc<Self>) {
        let earliest_start = self.started_at
            + chrono::Duration::from_std(self.pow.miner_startup_delay).unwrap_or_else(|_| chrono::Duration::zero());
        let delay = delay_until_next_boundary(Utc::now(), earliest_start, self.pow.mining_cadence);

        info!(
            "Mining every {:?}, first attempt in {:?}",
            self.pow.mining_cadence, delay
        );

        let miner = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, miner.pow.mining_cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let outcome = miner.run_cycle().await;
                debug!("Mining cycle finished: {:?}", outcome);
            }
        });

        let previous = self
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancels the scheduled attempt and schedules the next one
    ///
    /// A hash loop already running keeps going until it sees the new tip. A
    /// block that is already sealed is resolved on its own task and is still
    /// broadcast.
    pub fn stop_current_miner(self: &Arc<Self>) {
        let current = self
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = current {
            handle.abort();
        }

        info!(
            "Stopped mining block with index {:?}",
            self.currently_mining_index()
        );
        self.mining_index.store(0, Ordering::Release);
        self.set_state(MinerState::Cancelled);

        self.start();
    }

    /// One attempt: sync the pool, assemble, hash, seal and resolve
    pub async fn run_cycle(&self) -> MiningOutcome {
        self.set_state(MinerState::Idle);

        if !self.sync.enough_peers() {
            debug!("Not enough peers connected, skipping mining cycle");
            return MiningOutcome::Skipped;
        }

        let Some(requested_at) = self.sync.sync_pool_before_mining().await else {
            warn!("Transaction pool not synchronized, skipping mining cycle");
            return MiningOutcome::Skipped;
        };

        let outcome = self.mine(requested_at).await;
        self.mining_index.store(0, Ordering::Release);
        outcome
    }

    async fn mine(&self, requested_at: DateTime<Utc>) -> MiningOutcome {
        self.set_state(MinerState::Assembling);

        let previous = match self.ledger.last_block() {
            Ok(previous) => previous,
            Err(e) => {
                error!("Failed to read last block: {}", e);
                return MiningOutcome::Failed;
            }
        };

        let mut transactions = match self.ledger.pool_transactions_before(requested_at) {
            Ok(transactions) => transactions,
            Err(e) => {
                error!("Failed to read transaction pool: {}", e);
                return MiningOutcome::Failed;
            }
        };
        transactions.push(Transaction::new_coinbase(
            self.address.clone(),
            self.pow.mining_reward,
        ));

        let mut header = match self.assembler.build_header(previous.as_ref(), &transactions) {
            Ok(header) => header,
            Err(e) => {
                error!("Failed to assemble block: {}", e);
                return MiningOutcome::Failed;
            }
        };
        let target_index = previous.map(|b| b.index + 1).unwrap_or_default();
        self.mining_index.store(target_index, Ordering::Release);

        info!(
            "Mining block with index {} over {} transactions",
            target_index,
            transactions.len()
        );
        self.set_state(MinerState::Hashing);

        let ledger = self.ledger.clone();
        let pow = self.pow.clone();
        let hashing = tokio::task::spawn_blocking(move || {
            hash_header(&mut header, &pow, || ledger.tip_index() >= target_index).map(|_| header)
        });

        let header = match hashing.await {
            Ok(Some(header)) if self.ledger.tip_index() < target_index => header,
            Ok(_) => {
                info!("Block with index {} was mined elsewhere first", target_index);
                self.set_state(MinerState::Superseded);
                return MiningOutcome::Superseded;
            }
            Err(e) => {
                error!("Hash loop failed: {}", e);
                return MiningOutcome::Failed;
            }
        };

        let block = self.assembler.seal_block(target_index, header, transactions);
        info!(
            "Mined block with index {} and hash {}",
            block.index,
            block.hash()
        );
        // A sealed block is no longer cancellable: stop the miner from
        // matching it, and resolve on a task the schedule handle does not own
        self.mining_index.store(0, Ordering::Release);
        self.set_state(MinerState::Sealed);

        let resolver = self.resolver.clone();
        let resolving = tokio::spawn(async move { resolver.resolve(block, true).await });
        match resolving.await {
            Ok(resolution) => MiningOutcome::Sealed(resolution),
            Err(e) => {
                error!("Resolving mined block {} failed: {}", target_index, e);
                MiningOutcome::Failed
            }
        }
    }

    /// Pretends an attempt at `index` is hashing
    #[cfg(test)]
    pub(crate) fn mark_attempt(&self, index: u64) {
        self.mining_index.store(index, Ordering::Release);
        self.set_state(MinerState::Hashing);
    }

    fn set_state(&self, state: MinerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}
