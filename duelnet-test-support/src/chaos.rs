//! Chaos judge - random latency and sandbox failures around a real judge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duelnet::judge::{JudgeError, JudgeReport, JudgeRequest};
use duelnet::Judge;
use rand::Rng;

/// Judge wrapper that injects failures.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use duelnet_test_support::{ChaosJudge, ScriptedJudge};
///
/// let judge = ChaosJudge::new(Arc::new(ScriptedJudge::new()))
///     .with_failure_probability(0.1)
///     .with_delay_range(10, 500);
/// ```
pub struct ChaosJudge {
    inner: Arc<dyn Judge>,
    failure_probability: f64,
    delay_min_ms: u64,
    delay_max_ms: u64,
    failures: AtomicUsize,
}

impl ChaosJudge {
    pub fn new(inner: Arc<dyn Judge>) -> Self {
        Self {
            inner,
            failure_probability: 0.0,
            delay_min_ms: 0,
            delay_max_ms: 0,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn with_failure_probability(mut self, prob: f64) -> Self {
        self.failure_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay_range(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.delay_min_ms = min_ms;
        self.delay_max_ms = max_ms.max(min_ms);
        self
    }

    /// Number of injected failures so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Judge for ChaosJudge {
    async fn execute(&self, request: &JudgeRequest) -> Result<JudgeReport, JudgeError> {
        let (fail, delay) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen::<f64>() < self.failure_probability,
                Duration::from_millis(rng.gen_range(self.delay_min_ms..=self.delay_max_ms)),
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(JudgeError::Sandbox("chaos: injected failure".into()));
        }
        self.inner.execute(request).await
    }
}
