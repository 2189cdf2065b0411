//! Persistence collaborator.
//!
//! The orchestrator only writes side effects (submissions, user stats,
//! battle results) and reads one thing: a random problem for a new battle.
//! Writes go through a background worker that retries with exponential
//! backoff; a failed write is logged and never feeds back into a battle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::battle::{EndReason, Outcome};
use crate::config::PersistenceConfig;
use crate::judge::JudgeStatus;
use crate::protocol::{BattleId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub battle_id: BattleId,
    pub user_id: UserId,
    pub problem_id: String,
    pub language: String,
    pub code: String,
    pub attempt: u32,
    pub status: JudgeStatus,
    pub passed: u32,
    pub total: u32,
    pub runtime_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    /// Verdict arrived after the battle outcome was fixed.
    pub after_outcome: bool,
    pub recorded_at: u64,
}

/// Increments applied to a user's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub user_id: UserId,
    pub submissions: u32,
    pub accepted: u32,
    pub battles_played: u32,
    pub battles_won: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub submissions: u64,
    pub accepted: u64,
    pub battles_played: u64,
    pub battles_won: u64,
}

impl UserStats {
    fn apply(&mut self, delta: &StatsDelta) {
        self.submissions += delta.submissions as u64;
        self.accepted += delta.accepted as u64;
        self.battles_played += delta.battles_played as u64;
        self.battles_won += delta.battles_won as u64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleRecord {
    pub battle_id: BattleId,
    pub problem_id: String,
    pub participants: [UserId; 2],
    pub outcome: Outcome,
    pub reason: EndReason,
    pub winner: Option<UserId>,
    pub ended_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no problems available")]
    NoProblems,
}

/// Data store used by the orchestrator.
#[async_trait]
pub trait BattleStore: Send + Sync + 'static {
    /// Pick a problem for a new battle.
    async fn random_problem_id(&self) -> Result<String, StoreError>;

    async fn record_submission(&self, record: &SubmissionRecord) -> Result<(), StoreError>;

    async fn update_user_stats(&self, delta: &StatsDelta) -> Result<(), StoreError>;

    async fn record_battle(&self, record: &BattleRecord) -> Result<(), StoreError>;
}

/// In-memory store.
pub struct MemoryStore {
    problems: RwLock<Vec<String>>,
    submissions: DashMap<BattleId, Vec<SubmissionRecord>>,
    stats: DashMap<UserId, UserStats>,
    battles: DashMap<BattleId, BattleRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            problems: RwLock::new(Vec::new()),
            submissions: DashMap::new(),
            stats: DashMap::new(),
            battles: DashMap::new(),
        }
    }

    pub fn with_problems<I, S>(problems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        store
            .problems
            .write()
            .extend(problems.into_iter().map(Into::into));
        store
    }

    pub fn add_problem(&self, problem_id: impl Into<String>) {
        self.problems.write().push(problem_id.into());
    }

    pub fn submissions(&self, battle_id: &str) -> Vec<SubmissionRecord> {
        self.submissions
            .get(battle_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn stats(&self, user_id: &str) -> UserStats {
        self.stats
            .get(user_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn battle(&self, battle_id: &str) -> Option<BattleRecord> {
        self.battles.get(battle_id).map(|r| r.value().clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BattleStore for MemoryStore {
    async fn random_problem_id(&self) -> Result<String, StoreError> {
        self.problems
            .read()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(StoreError::NoProblems)
    }

    async fn record_submission(&self, record: &SubmissionRecord) -> Result<(), StoreError> {
        self.submissions
            .entry(record.battle_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn update_user_stats(&self, delta: &StatsDelta) -> Result<(), StoreError> {
        self.stats
            .entry(delta.user_id.clone())
            .or_default()
            .apply(delta);
        Ok(())
    }

    async fn record_battle(&self, record: &BattleRecord) -> Result<(), StoreError> {
        self.battles.insert(record.battle_id.clone(), record.clone());
        Ok(())
    }
}

/// A queued write.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistJob {
    Submission(SubmissionRecord),
    Stats(StatsDelta),
    Battle(BattleRecord),
}

impl PersistJob {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submission(_) => "submission",
            Self::Stats(_) => "stats",
            Self::Battle(_) => "battle",
        }
    }

    async fn apply(&self, store: &dyn BattleStore) -> Result<(), StoreError> {
        match self {
            Self::Submission(record) => store.record_submission(record).await,
            Self::Stats(delta) => store.update_user_stats(delta).await,
            Self::Battle(record) => store.record_battle(record).await,
        }
    }
}

/// Fire-and-forget sender for persistence jobs.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl PersistenceHandle {
    pub fn submit(&self, job: PersistJob) {
        if let Err(e) = self.tx.send(job) {
            tracing::error!(job = e.0.kind(), "persistence worker gone, job dropped");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

/// Start the worker. It exits once every handle is dropped and all
/// outstanding jobs have finished or given up.
pub fn spawn_persistence_worker(
    store: Arc<dyn BattleStore>,
    config: &PersistenceConfig,
) -> (PersistenceHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
    let policy = RetryPolicy {
        max_attempts: config.max_attempts.max(1),
        backoff: config.backoff(),
    };

    let task = tokio::spawn(async move {
        let mut jobs = JoinSet::new();
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => {
                        jobs.spawn(run_with_retry(Arc::clone(&store), job, policy));
                    }
                    None => break,
                },
                Some(_) = jobs.join_next(), if !jobs.is_empty() => {}
            }
        }
        while jobs.join_next().await.is_some() {}
    });

    (PersistenceHandle { tx }, task)
}

async fn run_with_retry(store: Arc<dyn BattleStore>, job: PersistJob, policy: RetryPolicy) {
    let mut delay = policy.backoff;
    for attempt in 1..=policy.max_attempts {
        match job.apply(store.as_ref()).await {
            Ok(()) => return,
            Err(e) if attempt == policy.max_attempts => {
                tracing::error!(
                    job = job.kind(),
                    attempts = attempt,
                    error = %e,
                    "persistence job dropped"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    job = job.kind(),
                    attempt,
                    error = %e,
                    retry_in = ?delay,
                    "persistence job failed"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}
