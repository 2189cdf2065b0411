//! Store that fails or stalls on demand, delegating to [`MemoryStore`] otherwise.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use duelnet::persistence::{BattleRecord, StatsDelta, SubmissionRecord};
use duelnet::{BattleStore, MemoryStore, StoreError};

pub struct FailingStore {
    inner: MemoryStore,
    write_failures: AtomicU32,
    problems_down: AtomicBool,
    problem_latency_ms: AtomicU64,
    attempts: AtomicU32,
}

impl FailingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            write_failures: AtomicU32::new(0),
            problems_down: AtomicBool::new(false),
            problem_latency_ms: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` writes of any kind.
    pub fn fail_writes(&self, count: u32) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_problems_down(&self, down: bool) {
        self.problems_down.store(down, Ordering::SeqCst);
    }

    /// Delay every problem lookup, holding a popped pair open.
    pub fn set_problem_latency(&self, latency: Duration) {
        self.problem_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Write attempts seen, failed ones included.
    pub fn write_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Unavailable("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BattleStore for FailingStore {
    async fn random_problem_id(&self) -> Result<String, StoreError> {
        let latency = self.problem_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.problems_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("problem catalog down".into()));
        }
        self.inner.random_problem_id().await
    }

    async fn record_submission(&self, record: &SubmissionRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.record_submission(record).await
    }

    async fn update_user_stats(&self, delta: &StatsDelta) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.update_user_stats(delta).await
    }

    async fn record_battle(&self, record: &BattleRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.record_battle(record).await
    }
}
